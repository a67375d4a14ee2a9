//! Default recipe set: a kubeadm cluster on Debian/Ubuntu hosts.
//!
//! Every command is safe to re-run. Steps that would be destructive on a
//! converged node are guarded by a marker file kubeadm itself writes.

use super::{Phase, RecipeRegistry, RecipeSpec, RemoteCommand, Step};
use crate::inventory::Role;

pub const KUBE_VERSION: &str = "v1.30";
pub const POD_CIDR: &str = "10.244.0.0/16";
pub const CNI_MANIFEST: &str =
    "https://github.com/flannel-io/flannel/releases/latest/download/kube-flannel.yml";
pub const ADMIN_CONF: &str = "/etc/kubernetes/admin.conf";
pub const KUBELET_CONF: &str = "/etc/kubernetes/kubelet.conf";

fn preparation() -> Vec<RemoteCommand> {
    vec![
        RemoteCommand::critical("swapoff -a"),
        RemoteCommand::best_effort("sed -i '/\\sswap\\s/ s/^#*/#/' /etc/fstab"),
        RemoteCommand::critical(
            "printf 'overlay\\nbr_netfilter\\n' > /etc/modules-load.d/k8s.conf && modprobe overlay && modprobe br_netfilter",
        ),
        RemoteCommand::critical(
            "printf 'net.bridge.bridge-nf-call-iptables = 1\\nnet.bridge.bridge-nf-call-ip6tables = 1\\nnet.ipv4.ip_forward = 1\\n' > /etc/sysctl.d/k8s.conf && sysctl --system",
        ),
        RemoteCommand::critical(
            "DEBIAN_FRONTEND=noninteractive apt-get update -q && DEBIAN_FRONTEND=noninteractive apt-get install -y -q apt-transport-https ca-certificates curl gpg containerd",
        ),
        RemoteCommand::critical(
            "mkdir -p /etc/containerd && containerd config default | sed 's/SystemdCgroup = false/SystemdCgroup = true/' > /etc/containerd/config.toml && systemctl restart containerd && systemctl enable containerd",
        ),
        RemoteCommand::critical(&format!(
            "mkdir -p /etc/apt/keyrings && curl -fsSL https://pkgs.k8s.io/core:/stable:/{v}/deb/Release.key | gpg --batch --yes --dearmor -o /etc/apt/keyrings/kubernetes-apt-keyring.gpg && echo 'deb [signed-by=/etc/apt/keyrings/kubernetes-apt-keyring.gpg] https://pkgs.k8s.io/core:/stable:/{v}/deb/ /' > /etc/apt/sources.list.d/kubernetes.list",
            v = KUBE_VERSION
        )),
        RemoteCommand::critical(
            "DEBIAN_FRONTEND=noninteractive apt-get update -q && DEBIAN_FRONTEND=noninteractive apt-get install -y -q kubelet kubeadm kubectl && apt-mark hold kubelet kubeadm kubectl",
        ),
        RemoteCommand::critical("systemctl enable --now kubelet"),
    ]
}

fn master_init() -> Vec<RemoteCommand> {
    vec![
        RemoteCommand::critical(&format!(
            "test -f {} || kubeadm init --pod-network-cidr={}",
            ADMIN_CONF, POD_CIDR
        )),
        RemoteCommand::critical(&format!(
            "mkdir -p $HOME/.kube && cp -f {} $HOME/.kube/config",
            ADMIN_CONF
        )),
        RemoteCommand::critical(&format!(
            "kubectl --kubeconfig {} apply -f {}",
            ADMIN_CONF, CNI_MANIFEST
        )),
        // Prints a fresh join command on every run, converged or not.
        RemoteCommand::critical("kubeadm token create --print-join-command"),
    ]
}

fn reset() -> Vec<RemoteCommand> {
    vec![
        RemoteCommand::best_effort("kubeadm reset -f"),
        RemoteCommand::best_effort("systemctl stop kubelet"),
        RemoteCommand::best_effort(
            "DEBIAN_FRONTEND=noninteractive apt-mark unhold kubelet kubeadm kubectl && apt-get purge -y -q kubelet kubeadm kubectl",
        ),
        RemoteCommand::best_effort("rm -rf /etc/kubernetes /var/lib/kubelet /var/lib/etcd /etc/cni/net.d $HOME/.kube"),
        RemoteCommand::best_effort("ip link delete cni0; ip link delete flannel.1"),
    ]
}

/// The full default registry.
pub fn registry() -> RecipeRegistry {
    let mut reg = RecipeRegistry::new();
    reg.register(Phase::Preparation, Role::Master, RecipeSpec::commands(preparation()))
        .register(Phase::Preparation, Role::Worker, RecipeSpec::commands(preparation()))
        .register(Phase::MasterInit, Role::Master, RecipeSpec::commands(master_init()))
        .register(
            Phase::WorkerJoin,
            Role::Worker,
            RecipeSpec::new(vec![Step::Join {
                skip_if_exists: Some(KUBELET_CONF.to_string()),
            }]),
        )
        .register(
            Phase::Verification,
            Role::Master,
            RecipeSpec::commands(vec![RemoteCommand::critical("systemctl is-active --quiet kubelet")]),
        )
        .register(
            Phase::Verification,
            Role::Worker,
            RecipeSpec::commands(vec![RemoteCommand::critical("systemctl is-active --quiet kubelet")]),
        )
        .register(Phase::Reset, Role::Master, RecipeSpec::commands(reset()))
        .register(Phase::Reset, Role::Worker, RecipeSpec::commands(reset()));
    reg
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_phase_has_recipes() {
        let reg = registry();
        for role in [Role::Master, Role::Worker] {
            assert!(reg.get(Phase::Preparation, role).is_some());
            assert!(reg.get(Phase::Reset, role).is_some());
            assert!(reg.get(Phase::Verification, role).is_some());
        }
        assert!(reg.get(Phase::MasterInit, Role::Master).is_some());
        assert!(reg.get(Phase::MasterInit, Role::Worker).is_none());
    }

    #[test]
    fn master_init_ends_with_join_command() {
        let cmds = master_init();
        assert!(cmds[0].text.starts_with("test -f /etc/kubernetes/admin.conf ||"));
        assert_eq!(
            cmds.last().map(|c| c.text.as_str()),
            Some("kubeadm token create --print-join-command")
        );
    }

    #[test]
    fn worker_join_needs_credential() {
        let reg = registry();
        assert!(reg.get(Phase::WorkerJoin, Role::Worker).unwrap().needs_credential());
    }

    #[test]
    fn reset_never_aborts() {
        assert!(reset().iter().all(|c| !c.critical));
    }
}

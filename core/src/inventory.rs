//! Inventory: the hosts a run targets and how to reach them.
//!
//! The YAML document has a `defaults:` block and a `hosts:` list. Defaults
//! fill any host field left unset. Loading validates everything up front so
//! that a malformed inventory fails before a single connection is opened.
//!
//! ```yaml
//! defaults:
//!   user: root
//!   private_key_path: ~/.ssh/id_ed25519
//! hosts:
//!   - { name: m1, address: 10.0.0.10, role: master }
//!   - { name: w1, address: 10.0.0.11, role: worker, password: hunter2 }
//! ```

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::InventoryError;

pub const DEFAULT_PORT: u16 = 22;
pub const DEFAULT_INTERPRETER: &str = "/bin/sh";


// ---------------------------------------------------------------------------
// Role / Credentials / Host
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Master,
    Worker,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Master => f.pad("master"),
            Role::Worker => f.pad("worker"),
        }
    }
}

/// How to authenticate to a host.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    PrivateKey(PathBuf),
    Password(String),
    /// Neither given: whatever the local ssh agent and default keys offer.
    Agent,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::PrivateKey(p) => f.debug_tuple("PrivateKey").field(p).finish(),
            Credentials::Password(_) => f.write_str("Password(<redacted>)"),
            Credentials::Agent => f.write_str("Agent"),
        }
    }
}

/// A fully resolved target host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Host {
    pub name: String,
    pub address: String,
    pub port: u16,
    pub user: String,
    pub credentials: Credentials,
    pub role: Role,
    /// Remote shell used to run each command.
    pub interpreter: String,
}

impl Host {
    /// Build the `user@address` destination used by ssh.
    pub fn user_at_host(&self) -> String {
        format!("{}@{}", self.user, self.address)
    }
}


// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// A host tagged with the behavior it gets from the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Node<'a> {
    Master(&'a Host),
    Worker(&'a Host),
}

impl<'a> Node<'a> {
    pub fn of(host: &'a Host) -> Self {
        match host.role {
            Role::Master => Node::Master(host),
            Role::Worker => Node::Worker(host),
        }
    }

    pub fn host(&self) -> &'a Host {
        match self {
            Node::Master(h) | Node::Worker(h) => h,
        }
    }

    pub fn role(&self) -> Role {
        match self {
            Node::Master(_) => Role::Master,
            Node::Worker(_) => Role::Worker,
        }
    }

    pub fn name(&self) -> &'a str {
        &self.host().name
    }

    pub fn is_master(&self) -> bool {
        matches!(self, Node::Master(_))
    }
}


// ---------------------------------------------------------------------------
// HostSelection
// ---------------------------------------------------------------------------

/// Which hosts of the inventory a run touches.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum HostSelection {
    #[default]
    All,
    Named(Vec<String>),
}

impl HostSelection {
    /// Parse a comma-separated list; empty means all.
    pub fn parse(list: &str) -> Self {
        let names: Vec<String> = list
            .split(',')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        if names.is_empty() {
            HostSelection::All
        } else {
            HostSelection::Named(names)
        }
    }

    pub fn includes(&self, name: &str) -> bool {
        match self {
            HostSelection::All => true,
            HostSelection::Named(names) => names.iter().any(|n| n == name),
        }
    }
}


// ---------------------------------------------------------------------------
// Document shape
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct Defaults {
    user: Option<String>,
    password: Option<String>,
    private_key_path: Option<PathBuf>,
    port: Option<u16>,
    interpreter: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct HostEntry {
    name: String,
    address: String,
    role: Role,
    user: Option<String>,
    password: Option<String>,
    private_key_path: Option<PathBuf>,
    port: Option<u16>,
    interpreter: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct InventoryDoc {
    #[serde(default)]
    defaults: Defaults,
    #[serde(default)]
    hosts: Vec<HostEntry>,
}

fn pick_credentials(
    name: &str,
    key: Option<PathBuf>,
    password: Option<String>,
) -> Option<Credentials> {
    match (key, password) {
        (Some(key), Some(_)) => {
            warn!(host = name, "both private_key_path and password set; using the key");
            Some(Credentials::PrivateKey(key))
        }
        (Some(key), None) => Some(Credentials::PrivateKey(key)),
        (None, Some(pw)) => Some(Credentials::Password(pw)),
        (None, None) => None,
    }
}

fn resolve(entry: HostEntry, defaults: &Defaults) -> Result<Host, InventoryError> {
    let invalid = |reason: &str| InventoryError::InvalidHost {
        host: entry.name.clone(),
        reason: reason.to_string(),
    };
    if entry.name.trim().is_empty() {
        return Err(InventoryError::InvalidHost {
            host: entry.address.clone(),
            reason: "empty name".into(),
        });
    }
    if entry.address.trim().is_empty() {
        return Err(invalid("empty address"));
    }
    let user = entry
        .user
        .clone()
        .or_else(|| defaults.user.clone())
        .filter(|u| !u.trim().is_empty())
        .ok_or_else(|| invalid("no user and no default user"))?;
    let port = entry.port.or(defaults.port).unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(invalid("port 0"));
    }
    if matches!(&entry.private_key_path, Some(p) if p.as_os_str().is_empty()) {
        return Err(invalid("empty private_key_path"));
    }
    let interpreter = entry
        .interpreter
        .clone()
        .or_else(|| defaults.interpreter.clone())
        .unwrap_or_else(|| DEFAULT_INTERPRETER.to_string());

    // Host-level credentials replace the defaults as a unit.
    let credentials = pick_credentials(&entry.name, entry.private_key_path, entry.password)
        .or_else(|| {
            pick_credentials(
                &entry.name,
                defaults.private_key_path.clone(),
                defaults.password.clone(),
            )
        })
        .unwrap_or(Credentials::Agent);

    Ok(Host {
        name: entry.name,
        address: entry.address,
        port,
        user,
        credentials,
        role: entry.role,
        interpreter,
    })
}


// ---------------------------------------------------------------------------
// Inventory
// ---------------------------------------------------------------------------

/// Validated host list. Exactly one master; workers in document order.
#[derive(Debug, Clone)]
pub struct Inventory {
    hosts: Vec<Host>,
}

impl Inventory {
    pub fn load(path: &Path) -> Result<Self, InventoryError> {
        let text = std::fs::read_to_string(path).map_err(|source| InventoryError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> Result<Self, InventoryError> {
        let doc: InventoryDoc = serde_yaml::from_str(text)?;
        let defaults = doc.defaults;
        let hosts = doc
            .hosts
            .into_iter()
            .map(|entry| resolve(entry, &defaults))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(hosts)
    }

    /// Validate an already-resolved host list.
    pub fn new(hosts: Vec<Host>) -> Result<Self, InventoryError> {
        if hosts.is_empty() {
            return Err(InventoryError::Empty);
        }
        let mut seen = HashSet::new();
        for host in &hosts {
            if !seen.insert(host.name.as_str()) {
                return Err(InventoryError::DuplicateHost(host.name.clone()));
            }
        }
        let masters = hosts.iter().filter(|h| h.role == Role::Master).count();
        if masters != 1 {
            return Err(InventoryError::MasterCount(masters));
        }
        Ok(Inventory { hosts })
    }

    pub fn master(&self) -> &Host {
        // `new` guarantees exactly one.
        self.hosts
            .iter()
            .find(|h| h.role == Role::Master)
            .unwrap_or(&self.hosts[0])
    }

    pub fn workers(&self) -> Vec<&Host> {
        self.hosts.iter().filter(|h| h.role == Role::Worker).collect()
    }

    pub fn hosts(&self) -> &[Host] {
        &self.hosts
    }

    pub fn get(&self, name: &str) -> Option<&Host> {
        self.hosts.iter().find(|h| h.name == name)
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    /// Hosts matching the selection, as tagged nodes in inventory order.
    /// Naming a host that does not exist is an error.
    pub fn select(&self, selection: &HostSelection) -> Result<Vec<Node<'_>>, InventoryError> {
        if let HostSelection::Named(names) = selection {
            for name in names {
                if self.get(name).is_none() {
                    return Err(InventoryError::UnknownHost(name.clone()));
                }
            }
        }
        Ok(self
            .hosts
            .iter()
            .filter(|h| selection.includes(&h.name))
            .map(Node::of)
            .collect())
    }
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const BASIC: &str = r#"
defaults:
  user: ubuntu
  password: secret
  interpreter: /bin/bash
hosts:
  - { name: m1, address: 10.0.0.10, role: master }
  - { name: w1, address: 10.0.0.11, role: worker, port: 2222 }
  - { name: w2, address: 10.0.0.12, role: worker, user: admin, private_key_path: /keys/w2 }
"#;

    #[test]
    fn defaults_fill_unset_fields() {
        let inv = Inventory::from_yaml(BASIC).unwrap();
        let m1 = inv.get("m1").unwrap();
        assert_eq!(m1.user, "ubuntu");
        assert_eq!(m1.port, DEFAULT_PORT);
        assert_eq!(m1.interpreter, "/bin/bash");
        assert_eq!(m1.credentials, Credentials::Password("secret".into()));

        let w1 = inv.get("w1").unwrap();
        assert_eq!(w1.port, 2222);
        assert_eq!(w1.user_at_host(), "ubuntu@10.0.0.11");
    }

    #[test]
    fn host_credentials_replace_defaults() {
        let inv = Inventory::from_yaml(BASIC).unwrap();
        let w2 = inv.get("w2").unwrap();
        assert_eq!(w2.user, "admin");
        assert_eq!(w2.credentials, Credentials::PrivateKey(PathBuf::from("/keys/w2")));
    }

    #[test]
    fn key_wins_over_password() {
        let inv = Inventory::from_yaml(
            r#"
hosts:
  - { name: m1, address: a, role: master, user: root, password: pw, private_key_path: /k }
"#,
        )
        .unwrap();
        assert_eq!(
            inv.master().credentials,
            Credentials::PrivateKey(PathBuf::from("/k"))
        );
    }

    #[test]
    fn no_credentials_means_agent() {
        let inv = Inventory::from_yaml(
            "hosts:\n  - { name: m1, address: a, role: master, user: root }\n",
        )
        .unwrap();
        assert_eq!(inv.master().credentials, Credentials::Agent);
        assert_eq!(inv.master().interpreter, DEFAULT_INTERPRETER);
    }

    #[test]
    fn password_is_redacted_in_debug() {
        let creds = Credentials::Password("hunter2".into());
        assert!(!format!("{:?}", creds).contains("hunter2"));
    }

    #[test]
    fn master_and_workers_partition() {
        let inv = Inventory::from_yaml(BASIC).unwrap();
        assert_eq!(inv.master().name, "m1");
        let workers: Vec<&str> = inv.workers().iter().map(|h| h.name.as_str()).collect();
        assert_eq!(workers, vec!["w1", "w2"]);
        assert_eq!(inv.len(), 3);
    }

    #[test]
    fn empty_inventory_rejected() {
        assert!(matches!(
            Inventory::from_yaml("hosts: []").unwrap_err(),
            InventoryError::Empty
        ));
    }

    #[test]
    fn two_masters_rejected() {
        let err = Inventory::from_yaml(
            r#"
defaults: { user: root }
hosts:
  - { name: m1, address: a, role: master }
  - { name: m2, address: b, role: master }
"#,
        )
        .unwrap_err();
        assert!(matches!(err, InventoryError::MasterCount(2)));
    }

    #[test]
    fn no_master_rejected() {
        let err = Inventory::from_yaml(
            "defaults: { user: root }\nhosts:\n  - { name: w1, address: a, role: worker }\n",
        )
        .unwrap_err();
        assert!(matches!(err, InventoryError::MasterCount(0)));
    }

    #[test]
    fn duplicate_names_rejected() {
        let err = Inventory::from_yaml(
            r#"
defaults: { user: root }
hosts:
  - { name: m1, address: a, role: master }
  - { name: m1, address: b, role: worker }
"#,
        )
        .unwrap_err();
        assert!(matches!(err, InventoryError::DuplicateHost(n) if n == "m1"));
    }

    #[test]
    fn missing_user_rejected() {
        let err = Inventory::from_yaml("hosts:\n  - { name: m1, address: a, role: master }\n")
            .unwrap_err();
        assert!(matches!(err, InventoryError::InvalidHost { .. }));
    }

    #[test]
    fn empty_address_rejected() {
        let err = Inventory::from_yaml(
            "defaults: { user: root }\nhosts:\n  - { name: m1, address: '', role: master }\n",
        )
        .unwrap_err();
        assert!(matches!(err, InventoryError::InvalidHost { .. }));
    }

    #[test]
    fn unknown_role_is_parse_error() {
        let err = Inventory::from_yaml(
            "defaults: { user: root }\nhosts:\n  - { name: m1, address: a, role: etcd }\n",
        )
        .unwrap_err();
        assert!(matches!(err, InventoryError::Parse(_)));
    }

    #[test]
    fn select_named_hosts_keeps_order() {
        let inv = Inventory::from_yaml(BASIC).unwrap();
        let nodes = inv
            .select(&HostSelection::Named(vec!["w2".into(), "m1".into()]))
            .unwrap();
        let names: Vec<&str> = nodes.iter().map(|n| n.name()).collect();
        assert_eq!(names, vec!["m1", "w2"]);
        assert!(nodes[0].is_master());
        assert_eq!(nodes[1].role(), Role::Worker);
    }

    #[test]
    fn select_unknown_host_fails() {
        let inv = Inventory::from_yaml(BASIC).unwrap();
        let err = inv
            .select(&HostSelection::Named(vec!["w9".into()]))
            .unwrap_err();
        assert!(matches!(err, InventoryError::UnknownHost(n) if n == "w9"));
    }

    #[test]
    fn selection_parse() {
        assert_eq!(HostSelection::parse(""), HostSelection::All);
        assert_eq!(
            HostSelection::parse("w1, w2,"),
            HostSelection::Named(vec!["w1".into(), "w2".into()])
        );
    }
}

//! OpenSSH transport with connection multiplexing.
//!
//! Each `SshConnection` owns a control master (`ssh -M -S <socket> -fN`).
//! Commands travel over the control socket, so a host is authenticated once
//! per session no matter how many commands a recipe runs. Password hosts
//! authenticate through `sshpass -e`; the password only ever lives in the
//! child's environment.

use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::{CommandOutput, Connection, Transport};
use crate::error::TransportError;
use crate::inventory::{Credentials, Host};

/// ssh's own failures exit with 255, but so can the remote command.
const SSH_FAILURE: i32 = 255;
const SSHPASS_BAD_PASSWORD: i32 = 5;
const SSHPASS_HOST_KEY_UNKNOWN: i32 = 6;
const CONTROL_TIMEOUT: Duration = Duration::from_secs(5);
const POLL: Duration = Duration::from_millis(25);


// ---------------------------------------------------------------------------
// Argument building
// ---------------------------------------------------------------------------

/// Quote `s` for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

fn auth_args(host: &Host) -> Vec<String> {
    match &host.credentials {
        Credentials::PrivateKey(key) => vec![
            "-i".into(),
            key.display().to_string(),
            "-o".into(),
            "IdentitiesOnly=yes".into(),
            "-o".into(),
            "BatchMode=yes".into(),
        ],
        Credentials::Password(_) => vec![
            "-o".into(),
            "PubkeyAuthentication=no".into(),
            "-o".into(),
            "PreferredAuthentications=password,keyboard-interactive".into(),
            "-o".into(),
            "NumberOfPasswordPrompts=1".into(),
        ],
        Credentials::Agent => vec!["-o".into(), "BatchMode=yes".into()],
    }
}

/// Options shared by every invocation against `host`.
pub fn base_args(host: &Host, socket: &Path, connect_timeout: Duration) -> Vec<String> {
    let mut args = vec![
        "-p".to_string(),
        host.port.to_string(),
        "-S".to_string(),
        socket.display().to_string(),
        "-o".to_string(),
        "StrictHostKeyChecking=no".to_string(),
        "-o".to_string(),
        "UserKnownHostsFile=/dev/null".to_string(),
        "-o".to_string(),
        "LogLevel=ERROR".to_string(),
        "-o".to_string(),
        format!("ConnectTimeout={}", connect_timeout.as_secs().max(1)),
        "-o".to_string(),
        "ServerAliveInterval=15".to_string(),
        "-o".to_string(),
        "ServerAliveCountMax=3".to_string(),
    ];
    args.extend(auth_args(host));
    args
}

/// Remote argument for running `command` under the host's interpreter.
pub fn remote_invocation(host: &Host, command: &str) -> String {
    format!("{} -c {}", host.interpreter, shell_quote(command))
}


// ---------------------------------------------------------------------------
// Failure classification
// ---------------------------------------------------------------------------

fn last_line(stderr: &str) -> String {
    stderr
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("ssh failed without output")
        .to_string()
}

/// Turn an ssh-level failure into the retryable/terminal taxonomy.
pub fn classify(host: &str, stderr: &str) -> TransportError {
    let lower = stderr.to_lowercase();
    // A dead control socket makes ssh fall back to a direct login, whose
    // auth failure says nothing about the credentials.
    let mux_failure = lower.contains("control socket") || lower.contains("mux_client");
    let auth_failure = lower.contains("permission denied")
        || lower.contains("host key verification failed")
        || lower.contains("too many authentication failures")
        || lower.contains("no supported authentication methods");
    if auth_failure && !mux_failure {
        TransportError::Authentication {
            host: host.to_string(),
            reason: last_line(stderr),
        }
    } else {
        TransportError::Transient {
            host: host.to_string(),
            reason: last_line(stderr),
        }
    }
}

/// stderr fragments only the ssh client itself prints.
const SSH_MARKERS: &[&str] = &[
    "ssh:",
    "mux_client",
    "control socket",
    "permission denied",
    "host key verification failed",
    "connection closed by",
    "connection reset by",
    "kex_exchange_identification",
    "broken pipe",
];

/// Whether a 255 exit came from ssh rather than from the remote command.
pub fn ssh_origin(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    SSH_MARKERS.iter().any(|m| lower.contains(m))
}

fn classify_sshpass(host: &str, code: i32, stderr: &str) -> TransportError {
    match code {
        SSHPASS_BAD_PASSWORD => TransportError::Authentication {
            host: host.to_string(),
            reason: "password rejected".into(),
        },
        SSHPASS_HOST_KEY_UNKNOWN => TransportError::Authentication {
            host: host.to_string(),
            reason: "host key unknown".into(),
        },
        _ => classify(host, stderr),
    }
}


// ---------------------------------------------------------------------------
// Process helpers
// ---------------------------------------------------------------------------

fn wait_child(child: &mut Child, timeout: Duration) -> std::io::Result<Option<ExitStatus>> {
    // An unrepresentable deadline means no deadline.
    let deadline = Instant::now().checked_add(timeout);
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            let _ = child.kill();
            let _ = child.wait();
            return Ok(None);
        }
        thread::sleep(POLL);
    }
}

fn spawn_reader<R: Read + Send + 'static>(mut stream: R) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = stream.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    })
}

/// Run to completion capturing both streams. `None` means the timeout hit.
fn run_captured(mut cmd: Command, timeout: Duration) -> std::io::Result<Option<CommandOutput>> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = cmd.spawn()?;
    let stdout = child.stdout.take().map(spawn_reader);
    let stderr = child.stderr.take().map(spawn_reader);
    let status = wait_child(&mut child, timeout)?;
    let stdout = stdout.and_then(|h| h.join().ok()).unwrap_or_default();
    let stderr = stderr.and_then(|h| h.join().ok()).unwrap_or_default();
    Ok(status.map(|s| CommandOutput {
        exit_code: s.code().unwrap_or(-1),
        stdout,
        stderr,
    }))
}


// ---------------------------------------------------------------------------
// SshTransport
// ---------------------------------------------------------------------------

/// File-name-safe form of a host name. Anything outside `[A-Za-z0-9-]` is
/// hex-escaped as `_xx`, so distinct names never share a socket.
pub fn file_stem(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for b in name.bytes() {
        if b.is_ascii_alphanumeric() || b == b'-' {
            out.push(b as char);
        } else {
            out.push_str(&format!("_{:02x}", b));
        }
    }
    out
}

pub struct SshTransport {
    control_dir: PathBuf,
    connect_timeout: Duration,
    program: String,
}

impl SshTransport {
    /// Create a transport whose control sockets live in a private directory
    /// under the system temp dir.
    pub fn new(connect_timeout: Duration) -> std::io::Result<Self> {
        let control_dir = std::env::temp_dir().join(format!("clusterkit-{}", std::process::id()));
        Self::in_dir(control_dir, connect_timeout)
    }

    /// Keep control sockets in `control_dir`, which is removed on drop.
    pub fn in_dir(control_dir: PathBuf, connect_timeout: Duration) -> std::io::Result<Self> {
        fs::create_dir_all(&control_dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&control_dir, fs::Permissions::from_mode(0o700))?;
        }
        Ok(SshTransport {
            control_dir,
            connect_timeout,
            program: "ssh".to_string(),
        })
    }

    /// Use a different ssh binary.
    pub fn with_program(mut self, program: &str) -> Self {
        self.program = program.to_string();
        self
    }

    fn socket_path(&self, host: &Host) -> PathBuf {
        self.control_dir.join(format!("{}.sock", file_stem(&host.name)))
    }
}

impl Drop for SshTransport {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.control_dir);
    }
}

impl Transport for SshTransport {
    fn connect(&self, host: &Host) -> Result<Box<dyn Connection>, TransportError> {
        let socket = self.socket_path(host);
        let _ = fs::remove_file(&socket);

        let mut cmd = match &host.credentials {
            Credentials::Password(pw) => {
                let mut c = Command::new("sshpass");
                c.arg("-e").arg(&self.program).env("SSHPASS", pw);
                c
            }
            _ => Command::new(&self.program),
        };
        cmd.args(base_args(host, &socket, self.connect_timeout))
            .args(["-o", "ControlMaster=yes", "-f", "-N"])
            .arg(host.user_at_host());

        // The backgrounded master inherits our stdio, so stderr goes to a
        // file instead of a pipe that would never reach EOF.
        let log_path = self.control_dir.join(format!("{}.connect.log", file_stem(&host.name)));
        let transient = |reason: String| TransportError::Transient {
            host: host.name.clone(),
            reason,
        };
        let log = File::create(&log_path).map_err(|e| transient(e.to_string()))?;
        cmd.stdin(Stdio::null()).stdout(Stdio::null()).stderr(log);

        debug!(host = %host.name, address = %host.address, "opening control master");
        let mut child = cmd
            .spawn()
            .map_err(|e| transient(format!("cannot spawn ssh: {}", e)))?;
        let limit = self.connect_timeout.saturating_add(CONTROL_TIMEOUT);
        let status = wait_child(&mut child, limit).map_err(|e| transient(e.to_string()))?;
        let stderr = fs::read_to_string(&log_path).unwrap_or_default();
        let _ = fs::remove_file(&log_path);

        let status = match status {
            Some(s) => s,
            None => {
                return Err(TransportError::Timeout {
                    host: host.name.clone(),
                    after: limit,
                })
            }
        };
        if !status.success() {
            let code = status.code().unwrap_or(-1);
            return Err(match host.credentials {
                Credentials::Password(_) => classify_sshpass(&host.name, code, &stderr),
                _ => classify(&host.name, &stderr),
            });
        }

        Ok(Box::new(SshConnection {
            host: host.clone(),
            socket,
            program: self.program.clone(),
            connect_timeout: self.connect_timeout,
            closed: false,
        }))
    }
}


// ---------------------------------------------------------------------------
// SshConnection
// ---------------------------------------------------------------------------

pub struct SshConnection {
    host: Host,
    socket: PathBuf,
    program: String,
    connect_timeout: Duration,
    closed: bool,
}

impl SshConnection {
    fn control(&self, op: &str) -> std::io::Result<Option<CommandOutput>> {
        let mut cmd = Command::new(&self.program);
        cmd.arg("-p")
            .arg(self.host.port.to_string())
            .arg("-S")
            .arg(&self.socket)
            .args(["-O", op])
            .arg(self.host.user_at_host());
        run_captured(cmd, CONTROL_TIMEOUT)
    }

    fn master_alive(&self) -> bool {
        matches!(self.control("check"), Ok(Some(out)) if out.success())
    }
}

impl Connection for SshConnection {
    fn execute(&mut self, command: &str, timeout: Duration) -> Result<CommandOutput, TransportError> {
        if self.closed || !self.socket.exists() {
            return Err(TransportError::Transient {
                host: self.host.name.clone(),
                reason: "control socket is gone".into(),
            });
        }
        let mut cmd = Command::new(&self.program);
        cmd.args(base_args(&self.host, &self.socket, self.connect_timeout))
            .args(["-o", "ControlMaster=no", "-o", "BatchMode=yes"])
            .arg(self.host.user_at_host())
            .arg("--")
            .arg(remote_invocation(&self.host, command));

        let output = run_captured(cmd, timeout)
            .map_err(|e| TransportError::Transient {
                host: self.host.name.clone(),
                reason: format!("cannot spawn ssh: {}", e),
            })?
            .ok_or_else(|| TransportError::Timeout {
                host: self.host.name.clone(),
                after: timeout,
            })?;

        // With the master still up, a 255 without ssh's own diagnostics is
        // the remote command's exit status and must not be retried.
        if output.exit_code == SSH_FAILURE && (ssh_origin(&output.stderr) || !self.master_alive()) {
            return Err(classify(&self.host.name, &output.stderr));
        }
        Ok(output)
    }

    fn is_alive(&mut self) -> bool {
        if self.closed || !self.socket.exists() {
            return false;
        }
        self.master_alive()
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        match self.control("exit") {
            Ok(Some(out)) if out.success() => {}
            Ok(_) | Err(_) => warn!(host = %self.host.name, "control master did not exit cleanly"),
        }
        let _ = fs::remove_file(&self.socket);
    }
}

impl Drop for SshConnection {
    fn drop(&mut self) {
        self.close();
    }
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::Role;

    fn host(credentials: Credentials) -> Host {
        Host {
            name: "w1".into(),
            address: "10.0.0.11".into(),
            port: 2222,
            user: "ubuntu".into(),
            credentials,
            role: Role::Worker,
            interpreter: "/bin/bash".into(),
        }
    }

    #[test]
    fn quote_handles_single_quotes() {
        assert_eq!(shell_quote("echo hi"), "'echo hi'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn remote_invocation_wraps_interpreter() {
        let h = host(Credentials::Agent);
        assert_eq!(
            remote_invocation(&h, "swapoff -a && echo 'ok'"),
            r"/bin/bash -c 'swapoff -a && echo '\''ok'\'''"
        );
    }

    #[test]
    fn key_auth_args() {
        let h = host(Credentials::PrivateKey("/keys/id".into()));
        let args = base_args(&h, Path::new("/tmp/s.sock"), Duration::from_secs(10));
        let joined = args.join(" ");
        assert!(joined.starts_with("-p 2222 -S /tmp/s.sock"));
        assert!(joined.contains("-i /keys/id"));
        assert!(joined.contains("IdentitiesOnly=yes"));
        assert!(joined.contains("BatchMode=yes"));
        assert!(joined.contains("ConnectTimeout=10"));
    }

    #[test]
    fn password_auth_disables_pubkey() {
        let h = host(Credentials::Password("pw".into()));
        let joined = base_args(&h, Path::new("/s"), Duration::from_secs(5)).join(" ");
        assert!(joined.contains("PubkeyAuthentication=no"));
        assert!(!joined.contains("BatchMode=yes"));
        assert!(!joined.contains("pw "));
    }

    #[test]
    fn classify_permission_denied_is_terminal() {
        let e = classify("w1", "ubuntu@10.0.0.11: Permission denied (publickey).\n");
        assert!(matches!(e, TransportError::Authentication { .. }));
        assert!(!e.is_retryable());
    }

    #[test]
    fn classify_refused_is_transient() {
        let e = classify(
            "w1",
            "ssh: connect to host 10.0.0.11 port 22: Connection refused\n",
        );
        match e {
            TransportError::Transient { reason, .. } => {
                assert!(reason.contains("Connection refused"))
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn classify_mux_fallback_is_transient() {
        let e = classify(
            "w1",
            "Control socket connect(/tmp/x.sock): Connection refused\nPermission denied (publickey).",
        );
        assert!(e.is_retryable());
    }

    #[test]
    fn sshpass_codes() {
        assert!(matches!(
            classify_sshpass("w1", 5, ""),
            TransportError::Authentication { .. }
        ));
        assert!(matches!(
            classify_sshpass("w1", 6, ""),
            TransportError::Authentication { .. }
        ));
        assert!(classify_sshpass("w1", 255, "Connection timed out").is_retryable());
    }

    #[test]
    fn run_captured_collects_streams() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo out; echo err 1>&2; exit 3"]);
        let out = run_captured(cmd, Duration::from_secs(5)).unwrap().unwrap();
        assert_eq!(out.exit_code, 3);
        assert_eq!(out.stdout.trim(), "out");
        assert_eq!(out.stderr.trim(), "err");
    }

    #[test]
    fn run_captured_without_representable_deadline() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo done"]);
        let out = run_captured(cmd, Duration::MAX).unwrap().unwrap();
        assert_eq!(out.stdout.trim(), "done");
    }

    #[test]
    fn ssh_markers() {
        assert!(ssh_origin("ssh: connect to host 10.0.0.11 port 22: No route to host"));
        assert!(ssh_origin("mux_client_request_session: read from master failed"));
        assert!(!ssh_origin("tool: fatal error"));
        assert!(!ssh_origin(""));
    }

    #[test]
    fn socket_names_are_distinct() {
        assert_eq!(file_stem("worker-1"), "worker-1");
        assert_eq!(file_stem("a.b"), "a_2eb");
        assert_eq!(file_stem("a_b"), "a_5fb");
        assert_ne!(file_stem("a.b"), file_stem("a_b"));
    }

    /// Stand-in for the ssh client. Connect creates the control socket,
    /// `-O check` reports whether it exists, and remote commands exit 255.
    /// A command containing `drop-master` also kills the master.
    const FAKE_SSH: &str = r#"#!/bin/sh
dir=$(dirname "$0")
sock=""; op=""; prev=""
for a in "$@"; do
  case "$prev" in
    -S) sock="$a" ;;
    -O) op="$a" ;;
  esac
  prev="$a"
done
case " $* " in
  *" -N "*) : > "$sock"; exit 0 ;;
esac
case "$op" in
  check) [ -e "$sock" ]; exit $? ;;
  exit) rm -f "$sock"; exit 0 ;;
esac
echo run >> "$dir/calls"
case "$*" in
  *drop-master*) rm -f "$sock"; exit 255 ;;
esac
echo "tool: fatal error" >&2
exit 255
"#;

    fn fake_transport(dir: &Path) -> SshTransport {
        use std::os::unix::fs::PermissionsExt;
        let program = dir.join("ssh");
        fs::write(&program, FAKE_SSH).unwrap();
        fs::set_permissions(&program, fs::Permissions::from_mode(0o755)).unwrap();
        SshTransport::in_dir(dir.join("ctl"), Duration::from_secs(1))
            .unwrap()
            .with_program(&program.display().to_string())
    }

    fn remote_runs(dir: &Path) -> usize {
        fs::read_to_string(dir.join("calls"))
            .map(|s| s.lines().count())
            .unwrap_or(0)
    }

    #[test]
    fn remote_exit_255_is_not_retried() {
        use crate::config::BackoffStrategy;
        use crate::engine::NodeExecutor;
        use crate::session::{RetryPolicy, SessionPool};
        use std::sync::Arc;

        let dir = tempfile::tempdir().unwrap();
        let pool = SessionPool::new(
            Arc::new(fake_transport(dir.path())),
            RetryPolicy::new(0, BackoffStrategy::Fixed, 1),
        );
        let h = host(Credentials::Agent);
        let session = pool.acquire(&h).unwrap();
        let executor = NodeExecutor::new(
            RetryPolicy::new(2, BackoffStrategy::Fixed, 1),
            Duration::from_secs(5),
        );

        let attempt = executor.run_command(&session, "tool --strict");
        assert_eq!(attempt.attempts, 1);
        let out = attempt.result.unwrap();
        assert_eq!(out.exit_code, 255);
        assert_eq!(out.stderr.trim(), "tool: fatal error");
        assert_eq!(remote_runs(dir.path()), 1);
        drop(session);
        pool.release_all();
    }

    #[test]
    fn exit_255_with_dead_master_is_transport_failure() {
        let dir = tempfile::tempdir().unwrap();
        let transport = fake_transport(dir.path());
        let mut conn = transport.connect(&host(Credentials::Agent)).unwrap();
        let err = conn.execute("drop-master", Duration::from_secs(5)).unwrap_err();
        assert!(err.is_retryable());
        assert!(!conn.is_alive());
    }

    #[test]
    fn run_captured_times_out() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "exec sleep 5"]);
        let out = run_captured(cmd, Duration::from_millis(100)).unwrap();
        assert!(out.is_none());
    }
}

//! The remote-shell boundary.
//!
//! `Transport` opens a `Connection` to a host; a `Connection` runs command
//! text and reports exit code, stdout and stderr. `SshTransport` drives the
//! OpenSSH client in production; `ScriptedTransport` stands in for it in
//! tests and answers from a script.

pub mod mock;
pub mod ssh;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::TransportError;
use crate::inventory::Host;

pub use mock::ScriptedTransport;
pub use ssh::SshTransport;

/// What a remote command produced. A non-zero `exit_code` is an application
/// result, not a transport failure.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: &str) -> Self {
        CommandOutput {
            exit_code: 0,
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    pub fn exit(exit_code: i32, stderr: &str) -> Self {
        CommandOutput {
            exit_code,
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// stdout followed by stderr, for diagnostics.
    pub fn combined(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => {
                let sep = if self.stdout.ends_with('\n') { "" } else { "\n" };
                format!("{}{}{}", self.stdout, sep, self.stderr)
            }
        }
    }
}

/// Opens authenticated channels to hosts.
pub trait Transport: Send + Sync {
    fn connect(&self, host: &Host) -> Result<Box<dyn Connection>, TransportError>;
}

/// One live channel to one host.
pub trait Connection: Send {
    fn execute(&mut self, command: &str, timeout: Duration) -> Result<CommandOutput, TransportError>;

    /// Cheap liveness check; `false` makes the pool reconnect.
    fn is_alive(&mut self) -> bool;

    fn close(&mut self);
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combined_joins_streams() {
        let out = CommandOutput {
            exit_code: 1,
            stdout: "installing".into(),
            stderr: "E: lock held".into(),
        };
        assert_eq!(out.combined(), "installing\nE: lock held");
        assert!(!out.success());
    }

    #[test]
    fn combined_with_one_stream() {
        assert_eq!(CommandOutput::ok("done\n").combined(), "done\n");
        assert_eq!(CommandOutput::exit(2, "boom").combined(), "boom");
    }
}

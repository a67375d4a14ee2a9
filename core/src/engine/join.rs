//! Join credential: extracted from the master's init output, persisted for
//! later workers-only runs, and rendered into the worker join command.

use std::fmt;
use std::fs;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::executor::ExecutionResult;
use crate::error::JoinError;

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}


// ---------------------------------------------------------------------------
// JoinCredential
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinCredential {
    /// `address:port` of the API server.
    pub endpoint: String,
    pub token: String,
    pub ca_cert_hash: Option<String>,
    /// Host the credential came from.
    pub master: String,
    pub created_ms: u64,
}

impl fmt::Debug for JoinCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let token_id = self.token.split('.').next().unwrap_or("");
        f.debug_struct("JoinCredential")
            .field("endpoint", &self.endpoint)
            .field("token", &format_args!("{}.{}", token_id, REDACTED))
            .field("ca_cert_hash", &self.ca_cert_hash)
            .field("master", &self.master)
            .field("created_ms", &self.created_ms)
            .finish()
    }
}

impl JoinCredential {
    pub fn new(endpoint: &str, token: &str, ca_cert_hash: Option<&str>, master: &str) -> Self {
        JoinCredential {
            endpoint: endpoint.to_string(),
            token: token.to_string(),
            ca_cert_hash: ca_cert_hash.map(str::to_string),
            master: master.to_string(),
            created_ms: now_ms(),
        }
    }

    pub fn join_command(&self) -> String {
        let discovery = match &self.ca_cert_hash {
            Some(hash) => format!("--discovery-token-ca-cert-hash {}", hash),
            None => "--discovery-token-unsafe-skip-ca-verification".to_string(),
        };
        format!("kubeadm join {} --token {} {}", self.endpoint, self.token, discovery)
    }

    /// Find the last worker join command in `output`. Backslash line
    /// continuations are folded first; control-plane join lines are ignored.
    pub fn parse(output: &str, master: &str) -> Option<JoinCredential> {
        let folded = output.replace("\\\r\n", " ").replace("\\\n", " ");
        folded
            .lines()
            .filter_map(|line| parse_line(line, master))
            .last()
    }
}

fn parse_line(line: &str, master: &str) -> Option<JoinCredential> {
    let words: Vec<&str> = line.split_whitespace().collect();
    let start = words
        .windows(2)
        .position(|w| w[0] == "kubeadm" && w[1] == "join")?;
    let args = &words[start + 2..];
    if args.contains(&"--control-plane") {
        return None;
    }

    let endpoint = args.first().filter(|a| !a.starts_with("--"))?;
    let token = flag_value(args, "--token").filter(|t| valid_token(t))?;
    let hash = flag_value(args, "--discovery-token-ca-cert-hash");
    Some(JoinCredential::new(endpoint, token, hash, master))
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> JoinError {
    let path = path.to_path_buf();
    move |source| JoinError::Io { path, source }
}

fn flag_value<'a>(args: &[&'a str], flag: &str) -> Option<&'a str> {
    let prefix = format!("{}=", flag);
    args.iter().enumerate().find_map(|(i, &a)| {
        if a == flag {
            args.get(i + 1).copied()
        } else {
            a.strip_prefix(prefix.as_str())
        }
    })
}

/// Bootstrap tokens are `[a-z0-9]{6}.[a-z0-9]{16}`.
fn valid_token(token: &str) -> bool {
    let ok = |s: &str, len: usize| {
        s.len() == len && s.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
    };
    match token.split_once('.') {
        Some((id, secret)) => ok(id, 6) && ok(secret, 16),
        None => false,
    }
}

/// Mask the secret half of every bootstrap token in `text`, leaving the
/// public token id so records can still be told apart.
pub fn redact_tokens(text: &str) -> String {
    const LEN: usize = 6 + 1 + 16;
    let bytes = text.as_bytes();
    let tok = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    let mut out = String::with_capacity(text.len());
    let mut copied = 0;
    let mut i = 0;
    while i + LEN <= bytes.len() {
        let bounded = (i == 0 || !tok(bytes[i - 1])) && bytes.get(i + LEN).map_or(true, |&b| !tok(b));
        let shaped = bytes[i..i + 6].iter().all(|&b| tok(b))
            && bytes[i + 6] == b'.'
            && bytes[i + 7..i + LEN].iter().all(|&b| tok(b));
        if bounded && shaped {
            out.push_str(&text[copied..i + 7]);
            out.push_str(REDACTED);
            i += LEN;
            copied = i;
        } else {
            i += 1;
        }
    }
    out.push_str(&text[copied..]);
    out
}

const REDACTED: &str = "<redacted>";


// ---------------------------------------------------------------------------
// JoinCoordinator
// ---------------------------------------------------------------------------

/// Owns the on-disk join artifact.
#[derive(Debug, Clone)]
pub struct JoinCoordinator {
    artifact: PathBuf,
}

impl JoinCoordinator {
    pub fn new(artifact: impl Into<PathBuf>) -> Self {
        JoinCoordinator {
            artifact: artifact.into(),
        }
    }

    pub fn artifact(&self) -> &Path {
        &self.artifact
    }

    pub fn extract(&self, master_init: &ExecutionResult) -> Result<JoinCredential, JoinError> {
        let extraction = || JoinError::Extraction {
            host: master_init.host.clone(),
        };
        if !master_init.succeeded() {
            return Err(extraction());
        }
        let credential =
            JoinCredential::parse(&master_init.output(), &master_init.host).ok_or_else(extraction)?;
        debug!(master = %credential.master, endpoint = %credential.endpoint, "join credential extracted");
        Ok(credential)
    }

    /// Write the artifact atomically with owner-only permissions.
    pub fn persist(&self, credential: &JoinCredential) -> Result<(), JoinError> {
        if let Some(parent) = self.artifact.parent() {
            fs::create_dir_all(parent).map_err(io_error(parent))?;
        }
        let json = serde_json::to_string_pretty(credential)?;

        let tmp = self.artifact.with_extension("json.tmp");
        let mut file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .mode(0o600)
            .open(&tmp)
            .map_err(io_error(&tmp))?;
        file.write_all(json.as_bytes()).map_err(io_error(&tmp))?;
        file.sync_all().map_err(io_error(&tmp))?;
        fs::rename(&tmp, &self.artifact).map_err(io_error(&self.artifact))?;

        info!(path = %self.artifact.display(), "join credential persisted");
        Ok(())
    }

    pub fn load(&self) -> Result<JoinCredential, JoinError> {
        let text = match fs::read_to_string(&self.artifact) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(JoinError::NotFound(self.artifact.clone()))
            }
            Err(source) => {
                return Err(JoinError::Io {
                    path: self.artifact.clone(),
                    source,
                })
            }
        };
        Ok(serde_json::from_str(&text)?)
    }

    /// Remove the artifact. A missing file is not an error.
    pub fn clear(&self) -> Result<(), JoinError> {
        match fs::remove_file(&self.artifact) {
            Ok(()) => {
                info!(path = %self.artifact.display(), "join credential cleared");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(JoinError::Io {
                path: self.artifact.clone(),
                source,
            }),
        }
    }

    /// Extract from the master's result and persist in one step.
    pub fn coordinate(&self, master_init: &ExecutionResult) -> Result<JoinCredential, JoinError> {
        let credential = self.extract(master_init)?;
        self.persist(&credential)?;
        Ok(credential)
    }
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

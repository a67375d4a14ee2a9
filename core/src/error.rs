//! Error taxonomy for the engine.
//!
//! Host-level problems (a command exiting non-zero, a worker refusing the
//! connection) are recorded in that host's `ExecutionResult` and never
//! surface here. The types below cover loading inputs, the transport
//! boundary, and the run-level conditions that make a whole run meaningless.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Failures at the remote-shell boundary.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Connection refused, reset, broken pipe, dead control socket.
    #[error("transient transport error on {host}: {reason}")]
    Transient { host: String, reason: String },

    /// The local ssh process did not finish in time.
    #[error("transport timeout on {host} after {after:?}")]
    Timeout { host: String, after: Duration },

    /// Credentials rejected or host key refused. Never retried.
    #[error("authentication failed on {host}: {reason}")]
    Authentication { host: String, reason: String },
}

impl TransportError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::Transient { .. } | TransportError::Timeout { .. }
        )
    }

    pub fn host(&self) -> &str {
        match self {
            TransportError::Transient { host, .. }
            | TransportError::Timeout { host, .. }
            | TransportError::Authentication { host, .. } => host,
        }
    }
}

/// Problems with the inventory document or the host selection.
#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("cannot read inventory {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed inventory: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("inventory is empty")]
    Empty,

    #[error("inventory must contain exactly one master, found {0}")]
    MasterCount(usize),

    #[error("a full run needs at least one worker")]
    NoWorkers,

    #[error("duplicate host name '{0}'")]
    DuplicateHost(String),

    #[error("host '{host}': {reason}")]
    InvalidHost { host: String, reason: String },

    #[error("unknown host '{0}' in selection")]
    UnknownHost(String),
}

/// Problems with the engine configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Join credential extraction and persistence.
#[derive(Debug, Error)]
pub enum JoinError {
    /// The master init output carried no join command.
    #[error("no join credential in output of {host}")]
    Extraction { host: String },

    #[error("no join credential at {0}")]
    NotFound(PathBuf),

    #[error("join credential I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt join credential: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// A cluster status query that produced no node list.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StatusError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("status query on {host} exited with {exit_code}: {stderr}")]
    Command {
        host: String,
        exit_code: i32,
        stderr: String,
    },
}

/// Run lock acquisition.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("another run holds {0}")]
    Held(PathBuf),

    #[error("cannot open lock {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Crate-wide error.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Inventory(#[from] InventoryError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Join(#[from] JoinError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Status(#[from] StatusError),

    #[error("recipe file: {0}")]
    Recipe(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

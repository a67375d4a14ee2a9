//! Engine configuration.
//!
//! Every field has a default, so an empty YAML document (or no file at all)
//! yields a usable configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Exponential,
    Linear,
    Fixed,
}

pub const DEFAULT_STATUS_COMMAND: &str =
    "kubectl --kubeconfig /etc/kubernetes/admin.conf get nodes --no-headers";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound on hosts worked on at once within a phase.
    pub max_concurrency: usize,
    pub connect_retries: u32,
    pub connect_backoff_ms: u64,
    pub backoff_strategy: BackoffStrategy,
    pub max_backoff_ms: u64,
    /// Retries per command on transient transport errors.
    pub command_retries: u32,
    pub command_backoff_ms: u64,
    pub command_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub readiness_timeout_secs: u64,
    pub readiness_poll_interval_secs: u64,
    pub state_dir: PathBuf,
    /// Run on the master to list nodes, one per line, status in column 2.
    pub status_command: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            max_concurrency: 10,
            connect_retries: 3,
            connect_backoff_ms: 1000,
            backoff_strategy: BackoffStrategy::Exponential,
            max_backoff_ms: 30_000,
            command_retries: 2,
            command_backoff_ms: 1000,
            command_timeout_secs: 900,
            connect_timeout_secs: 10,
            readiness_timeout_secs: 600,
            readiness_poll_interval_secs: 10,
            state_dir: PathBuf::from(".clusterkit"),
            status_command: DEFAULT_STATUS_COMMAND.to_string(),
        }
    }
}

impl EngineConfig {
    /// Load from a YAML file and validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = if text.trim().is_empty() {
            EngineConfig::default()
        } else {
            serde_yaml::from_str(text)?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrency == 0 {
            return Err(ConfigError::Invalid("max_concurrency must be at least 1".into()));
        }
        if self.readiness_poll_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "readiness_poll_interval_secs must be at least 1".into(),
            ));
        }
        if self.status_command.trim().is_empty() {
            return Err(ConfigError::Invalid("status_command is empty".into()));
        }
        Ok(())
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_secs(self.readiness_timeout_secs)
    }

    pub fn readiness_poll_interval(&self) -> Duration {
        Duration::from_secs(self.readiness_poll_interval_secs)
    }

    pub fn join_artifact_path(&self) -> PathBuf {
        self.state_dir.join("join.json")
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.state_dir.join("reports")
    }
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_gives_defaults() {
        let config = EngineConfig::from_yaml("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.max_concurrency, 10);
    }

    #[test]
    fn partial_document_keeps_other_defaults() {
        let config = EngineConfig::from_yaml(
            "max_concurrency: 4\nbackoff_strategy: linear\nstate_dir: /var/lib/ck\n",
        )
        .unwrap();
        assert_eq!(config.max_concurrency, 4);
        assert_eq!(config.backoff_strategy, BackoffStrategy::Linear);
        assert_eq!(config.join_artifact_path(), PathBuf::from("/var/lib/ck/join.json"));
        assert_eq!(config.connect_retries, 3);
    }

    #[test]
    fn zero_concurrency_rejected() {
        let err = EngineConfig::from_yaml("max_concurrency: 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn zero_poll_interval_rejected() {
        let err = EngineConfig::from_yaml("readiness_poll_interval_secs: 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn unknown_strategy_is_parse_error() {
        let err = EngineConfig::from_yaml("backoff_strategy: random").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn backoff_strategy_serde() {
        let json = serde_json::to_string(&BackoffStrategy::Exponential).unwrap();
        assert_eq!(json, "\"exponential\"");
    }
}

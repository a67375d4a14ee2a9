//! Readiness polling against the master's view of the cluster.

use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::StatusError;
use crate::inventory::Host;
use crate::session::SessionPool;


// ---------------------------------------------------------------------------
// Status boundary
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub name: String,
    pub ready: bool,
}

/// Anything that can list the cluster's nodes.
pub trait StatusSource {
    /// One query, abandoned after `limit`.
    fn list_node_status(&self, limit: Duration) -> Result<Vec<NodeStatus>, StatusError>;
}

/// Parse `kubectl get nodes --no-headers` output. The second column is the
/// status; `Ready,SchedulingDisabled` still counts as ready.
pub fn parse_node_table(output: &str) -> Vec<NodeStatus> {
    output
        .lines()
        .filter_map(|line| {
            let mut cols = line.split_whitespace();
            let name = cols.next()?;
            let status = cols.next()?;
            Some(NodeStatus {
                name: name.to_string(),
                ready: status.split(',').next() == Some("Ready"),
            })
        })
        .collect()
}

/// Queries node status by running a command on the master over the pool.
pub struct KubectlStatus<'p> {
    pool: &'p SessionPool,
    master: &'p Host,
    command: String,
    timeout: Duration,
}

impl<'p> KubectlStatus<'p> {
    pub fn new(pool: &'p SessionPool, master: &'p Host, command: &str, timeout: Duration) -> Self {
        KubectlStatus {
            pool,
            master,
            command: command.to_string(),
            timeout,
        }
    }
}

impl StatusSource for KubectlStatus<'_> {
    fn list_node_status(&self, limit: Duration) -> Result<Vec<NodeStatus>, StatusError> {
        let session = self.pool.acquire(self.master)?;
        let out = session.execute(&self.command, self.timeout.min(limit))?;
        if !out.success() {
            return Err(StatusError::Command {
                host: self.master.name.clone(),
                exit_code: out.exit_code,
                stderr: out.stderr.trim().to_string(),
            });
        }
        Ok(parse_node_table(&out.stdout))
    }
}


// ---------------------------------------------------------------------------
// ReadinessPoller
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ReadinessResult {
    Ready {
        expected: usize,
        observed: usize,
        polls: u32,
    },
    /// `last_observed` is `None` when no query ever succeeded.
    TimedOut {
        expected: usize,
        last_observed: Option<usize>,
        polls: u32,
    },
}

impl ReadinessResult {
    pub fn is_ready(&self) -> bool {
        matches!(self, ReadinessResult::Ready { .. })
    }

    pub fn expected(&self) -> usize {
        match self {
            ReadinessResult::Ready { expected, .. } | ReadinessResult::TimedOut { expected, .. } => {
                *expected
            }
        }
    }

    pub fn polls(&self) -> u32 {
        match self {
            ReadinessResult::Ready { polls, .. } | ReadinessResult::TimedOut { polls, .. } => *polls,
        }
    }
}

pub struct ReadinessPoller<'s> {
    source: &'s dyn StatusSource,
}

impl<'s> ReadinessPoller<'s> {
    pub fn new(source: &'s dyn StatusSource) -> Self {
        ReadinessPoller { source }
    }

    /// Poll until at least `expected` nodes are ready or `timeout` elapses.
    /// A failed query is retried at the next interval and never counts as
    /// zero ready nodes. No single query may run past the deadline.
    pub fn wait_for_ready(&self, expected: usize, timeout: Duration, interval: Duration) -> ReadinessResult {
        // An unrepresentable deadline means waiting without one.
        let deadline = Instant::now().checked_add(timeout);
        let mut polls = 0;
        let mut last_observed = None;

        loop {
            polls += 1;
            let limit = deadline.map_or(Duration::MAX, |d| d.saturating_duration_since(Instant::now()));
            match self.source.list_node_status(limit) {
                Ok(nodes) => {
                    let ready = nodes.iter().filter(|n| n.ready).count();
                    debug!(poll = polls, ready, total = nodes.len(), expected, "node status");
                    last_observed = Some(ready);
                    if ready >= expected {
                        info!(ready, expected, polls, "cluster ready");
                        return ReadinessResult::Ready {
                            expected,
                            observed: ready,
                            polls,
                        };
                    }
                }
                Err(err) => {
                    warn!(poll = polls, error = %err, "status query failed");
                }
            }

            let expired = match deadline {
                Some(d) => Instant::now().checked_add(interval).map_or(true, |next| next > d),
                None => false,
            };
            if expired {
                warn!(expected, last_observed = ?last_observed, polls, "readiness deadline reached");
                return ReadinessResult::TimedOut {
                    expected,
                    last_observed,
                    polls,
                };
            }
            thread::sleep(interval);
        }
    }
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

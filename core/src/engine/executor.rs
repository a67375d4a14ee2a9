//! Node executor: runs one recipe on one host.
//!
//! Commands run strictly in order over the host's session. Transport flakes
//! are retried per command; a non-zero exit never is, since re-running a
//! command that completed with a wrong result breaks the idempotence the
//! recipes rely on. Critical failures end the recipe, best-effort failures
//! are logged and skipped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::join::redact_tokens;
use crate::error::TransportError;
use crate::inventory::{Host, Role};
use crate::recipe::{Phase, Recipe, RemoteCommand};
use crate::session::{RetryPolicy, Session};
use crate::transport::CommandOutput;


// ---------------------------------------------------------------------------
// CancelToken
// ---------------------------------------------------------------------------

/// Shared flag that stops host tasks before their next command.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}


// ---------------------------------------------------------------------------
// Result types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    Failed,
    /// Stopped by a run-level abort before finishing.
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandOutcome {
    Succeeded,
    /// Best-effort command exited non-zero; the recipe went on.
    Ignored,
    Failed,
    TransportError,
    Skipped,
}

/// Command text and output keep their join secrets in memory, where the
/// credential is extracted from them, and lose them when serialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRecord {
    #[serde(serialize_with = "serialize_redacted")]
    pub text: String,
    pub critical: bool,
    pub outcome: CommandOutcome,
    pub exit_code: Option<i32>,
    /// stdout and stderr combined.
    #[serde(serialize_with = "serialize_redacted")]
    pub output: String,
    pub attempts: u32,
    pub duration_ms: u64,
}

fn serialize_redacted<S: serde::Serializer>(text: &str, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&redact_tokens(text))
}

impl CommandRecord {
    fn skipped(cmd: &RemoteCommand) -> Self {
        CommandRecord {
            text: cmd.text.clone(),
            critical: cmd.critical,
            outcome: CommandOutcome::Skipped,
            exit_code: None,
            output: String::new(),
            attempts: 0,
            duration_ms: 0,
        }
    }
}

/// Outcome of one phase on one host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub host: String,
    pub role: Role,
    pub phase: Phase,
    pub status: ExecutionStatus,
    pub commands: Vec<CommandRecord>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl ExecutionResult {
    pub fn succeeded(&self) -> bool {
        self.status == ExecutionStatus::Success
    }

    pub fn exit_codes(&self) -> Vec<i32> {
        self.commands.iter().filter_map(|c| c.exit_code).collect()
    }

    /// Output of every command that ran, in order.
    pub fn output(&self) -> String {
        self.commands
            .iter()
            .filter(|c| c.outcome != CommandOutcome::Skipped)
            .map(|c| c.output.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// The host could not be reached at all.
    pub fn unreachable(host: &Host, recipe: &Recipe, err: &TransportError, elapsed: Duration) -> Self {
        ExecutionResult {
            host: host.name.clone(),
            role: host.role,
            phase: recipe.phase,
            status: ExecutionStatus::Failed,
            commands: recipe.commands.iter().map(CommandRecord::skipped).collect(),
            error: Some(err.to_string()),
            duration_ms: elapsed.as_millis() as u64,
        }
    }

    /// The recipe could not even be built for the host.
    pub fn rejected(host: &Host, phase: Phase, reason: &str) -> Self {
        ExecutionResult {
            host: host.name.clone(),
            role: host.role,
            phase,
            status: ExecutionStatus::Failed,
            commands: Vec::new(),
            error: Some(reason.to_string()),
            duration_ms: 0,
        }
    }

    /// Nothing registered for this phase and role.
    pub fn empty(host: &Host, phase: Phase) -> Self {
        ExecutionResult {
            host: host.name.clone(),
            role: host.role,
            phase,
            status: ExecutionStatus::Success,
            commands: Vec::new(),
            error: None,
            duration_ms: 0,
        }
    }

    /// Never started because the run was aborted.
    pub fn cancelled(host: &Host, recipe: &Recipe) -> Self {
        ExecutionResult {
            host: host.name.clone(),
            role: host.role,
            phase: recipe.phase,
            status: ExecutionStatus::Cancelled,
            commands: recipe.commands.iter().map(CommandRecord::skipped).collect(),
            error: Some("run cancelled".into()),
            duration_ms: 0,
        }
    }
}

/// One command after retries: the final result and how many tries it took.
#[derive(Debug, Clone)]
pub struct CommandAttempt {
    pub result: Result<CommandOutput, TransportError>,
    pub attempts: u32,
}


// ---------------------------------------------------------------------------
// NodeExecutor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct NodeExecutor {
    policy: RetryPolicy,
    timeout: Duration,
    cancel: CancelToken,
}

impl NodeExecutor {
    pub fn new(policy: RetryPolicy, timeout: Duration) -> Self {
        NodeExecutor {
            policy,
            timeout,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run one command, retrying transport errors only.
    pub fn run_command(&self, session: &Session<'_>, text: &str) -> CommandAttempt {
        let host = &session.host().name;
        let mut retry = 0;
        loop {
            let attempts = retry + 1;
            match session.execute(text, self.timeout) {
                Ok(output) => return CommandAttempt { result: Ok(output), attempts },
                Err(err) => {
                    let give_up = !err.is_retryable()
                        || !self.policy.should_retry(retry)
                        || self.cancel.is_cancelled();
                    if give_up {
                        return CommandAttempt { result: Err(err), attempts };
                    }
                    let delay = self.policy.delay(retry);
                    warn!(
                        host = %host,
                        attempt = attempts,
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        "transport error, retrying command"
                    );
                    thread::sleep(delay);
                    retry += 1;
                }
            }
        }
    }

    pub fn run(&self, session: &Session<'_>, recipe: &Recipe) -> ExecutionResult {
        let host = session.host();
        let started = Instant::now();
        let mut status = ExecutionStatus::Success;
        let mut error = None;
        let mut records = Vec::with_capacity(recipe.commands.len());

        info!(host = %host.name, phase = %recipe.phase, commands = recipe.commands.len(), "recipe started");

        for cmd in &recipe.commands {
            if status != ExecutionStatus::Success {
                records.push(CommandRecord::skipped(cmd));
                continue;
            }
            if self.cancel.is_cancelled() {
                status = ExecutionStatus::Cancelled;
                error = Some("run cancelled".to_string());
                records.push(CommandRecord::skipped(cmd));
                continue;
            }

            let shown = redact_tokens(&cmd.text);
            debug!(host = %host.name, phase = %recipe.phase, command = %shown, "running");
            let cmd_started = Instant::now();
            let attempt = self.run_command(session, &cmd.text);
            let duration_ms = cmd_started.elapsed().as_millis() as u64;

            let record = match attempt.result {
                Ok(out) => {
                    let outcome = if out.success() {
                        CommandOutcome::Succeeded
                    } else if !cmd.critical {
                        warn!(
                            host = %host.name,
                            phase = %recipe.phase,
                            command = %shown,
                            exit_code = out.exit_code,
                            "best-effort command failed, continuing"
                        );
                        CommandOutcome::Ignored
                    } else {
                        warn!(
                            host = %host.name,
                            phase = %recipe.phase,
                            command = %shown,
                            exit_code = out.exit_code,
                            "critical command failed"
                        );
                        status = ExecutionStatus::Failed;
                        error = Some(format!("`{}` exited with {}", shown, out.exit_code));
                        CommandOutcome::Failed
                    };
                    CommandRecord {
                        text: cmd.text.clone(),
                        critical: cmd.critical,
                        outcome,
                        exit_code: Some(out.exit_code),
                        output: out.combined(),
                        attempts: attempt.attempts,
                        duration_ms,
                    }
                }
                Err(err) => {
                    warn!(host = %host.name, phase = %recipe.phase, error = %err, "transport failure");
                    status = ExecutionStatus::Failed;
                    error = Some(err.to_string());
                    CommandRecord {
                        text: cmd.text.clone(),
                        critical: cmd.critical,
                        outcome: CommandOutcome::TransportError,
                        exit_code: None,
                        output: err.to_string(),
                        attempts: attempt.attempts,
                        duration_ms,
                    }
                }
            };
            records.push(record);
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        info!(host = %host.name, phase = %recipe.phase, status = ?status, duration_ms, "recipe finished");

        ExecutionResult {
            host: host.name.clone(),
            role: host.role,
            phase: recipe.phase,
            status,
            commands: records,
            error,
            duration_ms,
        }
    }
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

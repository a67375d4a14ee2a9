//! Run reports: the per-run ledger of host results, the state trail, and
//! the final readiness outcome.

use std::fmt;
use std::fs;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{error, info};

use super::executor::{ExecutionResult, ExecutionStatus};
use super::readiness::ReadinessResult;
use crate::error::Result;
use crate::inventory::Role;
use crate::recipe::Phase;
use crate::session::ConnectionInfo;

pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}


// ---------------------------------------------------------------------------
// RunState / RunMode
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Preparing,
    MasterInitializing,
    JoinDistributing,
    WorkerJoining,
    Verifying,
    Converged,
    PartiallyFailed,
    Failed,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Converged | RunState::PartiallyFailed | RunState::Failed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Idle => "idle",
            RunState::Preparing => "preparing",
            RunState::MasterInitializing => "master_initializing",
            RunState::JoinDistributing => "join_distributing",
            RunState::WorkerJoining => "worker_joining",
            RunState::Verifying => "verifying",
            RunState::Converged => "converged",
            RunState::PartiallyFailed => "partially_failed",
            RunState::Failed => "failed",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Prepare everything, init the master, join the workers.
    Full,
    /// Join workers to an existing master using the persisted credential.
    WorkersOnly,
    /// Prepare and init the master alone.
    MasterOnly,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunMode::Full => "full",
            RunMode::WorkersOnly => "workers_only",
            RunMode::MasterOnly => "master_only",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub from: RunState,
    pub to: RunState,
    pub at_ms: u64,
}

/// Where a host ended up across all phases of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostOutcome {
    pub host: String,
    pub role: Role,
    pub status: ExecutionStatus,
    /// First phase that did not succeed.
    pub failed_phase: Option<Phase>,
    pub error: Option<String>,
}

fn host_outcomes(results: &[ExecutionResult]) -> Vec<HostOutcome> {
    let mut outcomes: Vec<HostOutcome> = Vec::new();
    for r in results {
        let idx = match outcomes.iter().position(|o| o.host == r.host) {
            Some(i) => i,
            None => {
                outcomes.push(HostOutcome {
                    host: r.host.clone(),
                    role: r.role,
                    status: ExecutionStatus::Success,
                    failed_phase: None,
                    error: None,
                });
                outcomes.len() - 1
            }
        };
        let outcome = &mut outcomes[idx];
        if outcome.failed_phase.is_none() && !r.succeeded() {
            outcome.status = r.status;
            outcome.failed_phase = Some(r.phase);
            outcome.error = r.error.clone();
        }
    }
    outcomes
}

fn write_report<T: Serialize>(dir: &Path, kind: &str, report: &T) -> Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let path = dir.join(format!("{}-{}.json", kind, now_ms()));
    let json = serde_json::to_string_pretty(report)?;
    // Command output can carry cluster secrets; keep reports owner-only.
    let mut file = fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .mode(0o600)
        .open(&path)?;
    file.write_all(json.as_bytes())?;
    info!(path = %path.display(), "report written");
    Ok(path)
}

fn phase_cell(results: &[ExecutionResult], host: &str, phase: Phase) -> &'static str {
    match results.iter().find(|r| r.host == host && r.phase == phase) {
        None => "-",
        Some(r) => match r.status {
            ExecutionStatus::Success => "ok",
            ExecutionStatus::Failed => "FAILED",
            ExecutionStatus::Cancelled => "cancelled",
        },
    }
}


// ---------------------------------------------------------------------------
// ClusterReport
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterReport {
    pub mode: RunMode,
    pub state: RunState,
    pub transitions: Vec<Transition>,
    /// Append-only, in the order results were recorded.
    pub results: Vec<ExecutionResult>,
    pub readiness: Option<ReadinessResult>,
    /// Run-level failure reason, set only when the run ends `Failed`.
    pub failure: Option<String>,
    pub connections: Vec<ConnectionInfo>,
    pub started_ms: u64,
    pub finished_ms: Option<u64>,
}

impl ClusterReport {
    pub fn new(mode: RunMode) -> Self {
        ClusterReport {
            mode,
            state: RunState::Idle,
            transitions: Vec::new(),
            results: Vec::new(),
            readiness: None,
            failure: None,
            connections: Vec::new(),
            started_ms: now_ms(),
            finished_ms: None,
        }
    }

    pub(crate) fn transition(&mut self, to: RunState) {
        let from = self.state;
        if from == to {
            return;
        }
        info!(from = %from, to = %to, "run state");
        self.transitions.push(Transition {
            from,
            to,
            at_ms: now_ms(),
        });
        self.state = to;
    }

    pub(crate) fn record(&mut self, result: ExecutionResult) {
        self.results.push(result);
    }

    pub(crate) fn fail(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        error!(reason = %reason, "run failed");
        self.failure = Some(reason);
        self.transition(RunState::Failed);
    }

    pub(crate) fn finish(&mut self, connections: Vec<ConnectionInfo>) {
        self.connections = connections;
        self.finished_ms = Some(now_ms());
    }

    pub fn results_for(&self, phase: Phase) -> Vec<&ExecutionResult> {
        self.results.iter().filter(|r| r.phase == phase).collect()
    }

    pub fn result(&self, host: &str, phase: Phase) -> Option<&ExecutionResult> {
        self.results.iter().find(|r| r.host == host && r.phase == phase)
    }

    pub fn host_outcomes(&self) -> Vec<HostOutcome> {
        host_outcomes(&self.results)
    }

    /// Hosts that failed in some phase.
    pub fn failed_hosts(&self) -> Vec<String> {
        self.host_outcomes()
            .into_iter()
            .filter(|o| o.status != ExecutionStatus::Success)
            .map(|o| o.host)
            .collect()
    }

    pub fn save(&self, dir: &Path) -> Result<PathBuf> {
        write_report(dir, "up", self)
    }

    pub fn render_text(&self) -> String {
        let phases = [
            Phase::Preparation,
            Phase::MasterInit,
            Phase::WorkerJoin,
            Phase::Verification,
        ];
        let mut out = String::new();
        out.push_str(&format!(
            "{:<20} {:<7} {:<10} {:<10} {:<10} {:<10} {}\n",
            "HOST", "ROLE", "PREPARE", "INIT", "JOIN", "VERIFY", "ERROR"
        ));
        for o in self.host_outcomes() {
            let cells: Vec<&str> = phases
                .iter()
                .map(|p| phase_cell(&self.results, &o.host, *p))
                .collect();
            out.push_str(&format!(
                "{:<20} {:<7} {:<10} {:<10} {:<10} {:<10} {}\n",
                o.host,
                o.role,
                cells[0],
                cells[1],
                cells[2],
                cells[3],
                o.error.as_deref().unwrap_or("")
            ));
        }
        out.push('\n');
        match &self.readiness {
            Some(ReadinessResult::Ready { expected, observed, polls }) => out.push_str(&format!(
                "readiness: {}/{} nodes ready after {} poll(s)\n",
                observed, expected, polls
            )),
            Some(ReadinessResult::TimedOut { expected, last_observed, polls }) => {
                let seen = last_observed.map_or("?".to_string(), |n| n.to_string());
                out.push_str(&format!(
                    "readiness: timed out at {}/{} after {} poll(s)\n",
                    seen, expected, polls
                ))
            }
            None => out.push_str("readiness: not checked\n"),
        }
        if let Some(reason) = &self.failure {
            out.push_str(&format!("failure: {}\n", reason));
        }
        out.push_str(&format!("result: {}\n", self.state));
        out
    }
}


// ---------------------------------------------------------------------------
// ResetReport
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResetReport {
    pub results: Vec<ExecutionResult>,
    /// Whether the persisted join credential was removed.
    pub credential_cleared: bool,
    pub connections: Vec<ConnectionInfo>,
    pub started_ms: u64,
    pub finished_ms: Option<u64>,
}

impl ResetReport {
    pub fn new() -> Self {
        ResetReport {
            results: Vec::new(),
            credential_cleared: false,
            connections: Vec::new(),
            started_ms: now_ms(),
            finished_ms: None,
        }
    }

    pub fn host_outcomes(&self) -> Vec<HostOutcome> {
        host_outcomes(&self.results)
    }

    pub fn all_succeeded(&self) -> bool {
        self.results.iter().all(|r| r.succeeded())
    }

    pub fn save(&self, dir: &Path) -> Result<PathBuf> {
        write_report(dir, "reset", self)
    }

    pub fn render_text(&self) -> String {
        let mut out = format!("{:<20} {:<7} {:<10} {}\n", "HOST", "ROLE", "RESET", "ERROR");
        for o in self.host_outcomes() {
            out.push_str(&format!(
                "{:<20} {:<7} {:<10} {}\n",
                o.host,
                o.role,
                phase_cell(&self.results, &o.host, Phase::Reset),
                o.error.as_deref().unwrap_or("")
            ));
        }
        if self.credential_cleared {
            out.push_str("\njoin credential cleared\n");
        }
        out
    }
}

impl Default for ResetReport {
    fn default() -> Self {
        ResetReport::new()
    }
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn result(host: &str, role: Role, phase: Phase, status: ExecutionStatus) -> ExecutionResult {
        ExecutionResult {
            host: host.into(),
            role,
            phase,
            status,
            commands: Vec::new(),
            error: match status {
                ExecutionStatus::Success => None,
                _ => Some(format!("{} broke", phase)),
            },
            duration_ms: 1,
        }
    }

    #[test]
    fn transitions_are_recorded_once() {
        let mut report = ClusterReport::new(RunMode::Full);
        report.transition(RunState::Preparing);
        report.transition(RunState::Preparing);
        report.transition(RunState::MasterInitializing);
        assert_eq!(report.transitions.len(), 2);
        assert_eq!(report.transitions[0].from, RunState::Idle);
        assert_eq!(report.state, RunState::MasterInitializing);
        assert!(!report.state.is_terminal());
    }

    #[test]
    fn fail_sets_reason_and_state() {
        let mut report = ClusterReport::new(RunMode::Full);
        report.transition(RunState::Preparing);
        report.fail("master preparation failed");
        assert_eq!(report.state, RunState::Failed);
        assert!(report.state.is_terminal());
        assert_eq!(report.failure.as_deref(), Some("master preparation failed"));
    }

    #[test]
    fn host_outcome_keeps_first_failure() {
        let mut report = ClusterReport::new(RunMode::Full);
        report.record(result("m1", Role::Master, Phase::Preparation, ExecutionStatus::Success));
        report.record(result("w1", Role::Worker, Phase::Preparation, ExecutionStatus::Success));
        report.record(result("w2", Role::Worker, Phase::Preparation, ExecutionStatus::Failed));
        report.record(result("w1", Role::Worker, Phase::WorkerJoin, ExecutionStatus::Failed));
        report.record(result("w1", Role::Worker, Phase::Verification, ExecutionStatus::Cancelled));

        let outcomes = report.host_outcomes();
        assert_eq!(outcomes.len(), 3);
        assert_eq!(outcomes[0].host, "m1");
        assert_eq!(outcomes[0].status, ExecutionStatus::Success);
        assert_eq!(outcomes[1].failed_phase, Some(Phase::WorkerJoin));
        assert_eq!(outcomes[2].failed_phase, Some(Phase::Preparation));
        assert_eq!(report.failed_hosts(), vec!["w1", "w2"]);
        assert_eq!(report.results_for(Phase::Preparation).len(), 3);
    }

    #[test]
    fn render_text_table() {
        let mut report = ClusterReport::new(RunMode::Full);
        report.record(result("m1", Role::Master, Phase::Preparation, ExecutionStatus::Success));
        report.record(result("w1", Role::Worker, Phase::WorkerJoin, ExecutionStatus::Failed));
        report.readiness = Some(ReadinessResult::Ready {
            expected: 1,
            observed: 1,
            polls: 2,
        });
        report.transition(RunState::PartiallyFailed);
        let text = report.render_text();
        assert!(text.starts_with("HOST"));
        assert!(text.contains("worker_join broke"));
        assert!(text.contains("1/1 nodes ready after 2 poll(s)"));
        assert!(text.ends_with("result: partially_failed\n"));
    }

    #[test]
    fn save_writes_json() {
        let dir = tempfile::tempdir().unwrap();
        let mut report = ClusterReport::new(RunMode::WorkersOnly);
        report.record(result("w1", Role::Worker, Phase::WorkerJoin, ExecutionStatus::Success));
        report.transition(RunState::Converged);
        let path = report.save(&dir.path().join("reports")).unwrap();
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("up-") && name.ends_with(".json"));
        let back: ClusterReport = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(back.state, RunState::Converged);
        assert_eq!(back.mode, RunMode::WorkersOnly);
        assert_eq!(back.results.len(), 1);
    }

    #[test]
    fn saved_report_hides_join_secret() {
        use crate::engine::executor::{CommandOutcome, CommandRecord};
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let mut join = result("w1", Role::Worker, Phase::WorkerJoin, ExecutionStatus::Success);
        join.commands.push(CommandRecord {
            text: "kubeadm join 10.0.0.10:6443 --token abcdef.0123456789abcdef".into(),
            critical: true,
            outcome: CommandOutcome::Succeeded,
            exit_code: Some(0),
            output: "token abcdef.0123456789abcdef accepted".into(),
            attempts: 1,
            duration_ms: 3,
        });
        let mut report = ClusterReport::new(RunMode::Full);
        report.record(join);

        let path = report.save(dir.path()).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert!(!text.contains("0123456789abcdef"));
        assert!(text.contains("--token abcdef.<redacted>"));
        assert!(!serde_json::to_string(&report).unwrap().contains("0123456789abcdef"));
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
        // In memory the secret is intact for credential extraction.
        assert!(report.results[0].output().contains("abcdef.0123456789abcdef"));
    }

    #[test]
    fn reset_report() {
        let dir = tempfile::tempdir().unwrap();
        let mut report = ResetReport::new();
        report.results.push(result("m1", Role::Master, Phase::Reset, ExecutionStatus::Success));
        report.results.push(result("w1", Role::Worker, Phase::Reset, ExecutionStatus::Failed));
        assert!(!report.all_succeeded());
        assert!(report.render_text().contains("FAILED"));
        let path = report.save(dir.path()).unwrap();
        assert!(path.file_name().unwrap().to_string_lossy().starts_with("reset-"));
    }
}

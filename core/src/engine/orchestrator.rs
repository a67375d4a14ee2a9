//! Orchestration engine: sequences the phases of a run over the inventory.
//!
//! Each phase fans out one task per host, bounded by `max_concurrency`, and
//! ends with a barrier. Host failures are recorded and isolated; only
//! run-level conditions (bad selection, master unusable, no credential) end a
//! run as `Failed`. Every path through `run` and `reset` releases the pool.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::executor::{CancelToken, ExecutionResult, NodeExecutor};
use super::fanout::fan_out;
use super::join::{JoinCoordinator, JoinCredential};
use super::readiness::{KubectlStatus, NodeStatus, ReadinessPoller, StatusSource};
use super::report::{now_ms, ClusterReport, ResetReport, RunMode, RunState};
use crate::config::EngineConfig;
use crate::error::{InventoryError, Result, StatusError};
use crate::inventory::{HostSelection, Inventory, Node, Role};
use crate::recipe::{Phase, RecipeRegistry};
use crate::session::{RetryPolicy, SessionPool};
use crate::transport::Transport;

pub struct Orchestrator {
    inventory: Inventory,
    registry: RecipeRegistry,
    config: EngineConfig,
    pool: SessionPool,
    joins: JoinCoordinator,
}

impl Orchestrator {
    pub fn new(
        inventory: Inventory,
        registry: RecipeRegistry,
        config: EngineConfig,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let pool = SessionPool::new(transport, RetryPolicy::for_connect(&config));
        let joins = JoinCoordinator::new(config.join_artifact_path());
        Orchestrator {
            inventory,
            registry,
            config,
            pool,
            joins,
        }
    }

    pub fn inventory(&self) -> &Inventory {
        &self.inventory
    }

    pub fn pool(&self) -> &SessionPool {
        &self.pool
    }

    pub fn joins(&self) -> &JoinCoordinator {
        &self.joins
    }

    /// Drive one run to a terminal state. Never returns early without a
    /// report; run-level failures are recorded in it.
    pub fn run(&self, mode: RunMode, selection: &HostSelection) -> ClusterReport {
        let mut report = ClusterReport::new(mode);
        let cancel = CancelToken::new();
        info!(mode = %mode, hosts = self.inventory.len(), "run started");

        self.drive(mode, selection, &cancel, &mut report);

        let conns = self.pool.summary();
        debug!(total = conns.total, connected = conns.connected, failed = conns.failed, "sessions before release");
        self.pool.release_all();
        report.finish(self.pool.connections());
        info!(state = %report.state, failed = report.failed_hosts().len(), "run finished");
        report
    }

    fn drive(&self, mode: RunMode, selection: &HostSelection, cancel: &CancelToken, report: &mut ClusterReport) {
        let nodes = match self.inventory.select(selection) {
            Ok(nodes) => nodes,
            Err(e) => return report.fail(e.to_string()),
        };
        let master = nodes.iter().copied().find(|n| n.is_master());
        let workers: Vec<Node<'_>> = nodes.iter().copied().filter(|n| !n.is_master()).collect();

        let master = match (mode, master) {
            (RunMode::WorkersOnly, _) => None,
            (_, Some(m)) => Some(m),
            (_, None) => return report.fail("master is not in the host selection"),
        };
        let workers = match mode {
            RunMode::MasterOnly => {
                if !workers.is_empty() {
                    info!(skipped = workers.len(), "master-only run, ignoring selected workers");
                }
                Vec::new()
            }
            _ if workers.is_empty() => return report.fail(InventoryError::NoWorkers.to_string()),
            _ => workers,
        };

        let persisted = match mode {
            RunMode::WorkersOnly => match self.joins.load() {
                Ok(c) => {
                    info!(master = %c.master, endpoint = %c.endpoint, "using persisted join credential");
                    Some(c)
                }
                Err(e) => return report.fail(e.to_string()),
            },
            _ => None,
        };

        // Preparation
        report.transition(RunState::Preparing);
        let prep_nodes: Vec<Node<'_>> = master.iter().copied().chain(workers.iter().copied()).collect();
        let prep = self.run_phase(Phase::Preparation, &prep_nodes, None, cancel, true);
        let prepared: Vec<Node<'_>> = workers
            .iter()
            .copied()
            .filter(|w| prep.iter().any(|r| r.host == w.name() && r.succeeded()))
            .collect();
        let master_prep_error = master.and_then(|m| {
            prep.iter()
                .find(|r| r.host == m.name() && !r.succeeded())
                .map(|r| r.error.clone().unwrap_or_default())
        });
        for r in prep {
            report.record(r);
        }
        if let Some(err) = master_prep_error {
            return report.fail(format!("master preparation failed: {}", err));
        }

        // Credential
        let credential = match (master, persisted) {
            (Some(m), _) => {
                report.transition(RunState::MasterInitializing);
                match self.init_master(m, cancel, report) {
                    Some(c) => c,
                    None => return,
                }
            }
            (None, Some(c)) => c,
            (None, None) => return report.fail("no join credential available"),
        };

        // Nodes already in the cluster, so old members cannot stand in for
        // the workers joined now.
        let baseline = match mode {
            RunMode::WorkersOnly => self.baseline(),
            _ => None,
        };

        // Worker join
        let mut joined: Vec<Node<'_>> = Vec::new();
        if mode != RunMode::MasterOnly {
            report.transition(RunState::JoinDistributing);
            info!(workers = prepared.len(), endpoint = %credential.endpoint, "distributing join credential");
            report.transition(RunState::WorkerJoining);
            let results = self.run_phase(Phase::WorkerJoin, &prepared, Some(&credential), cancel, false);
            joined = prepared
                .iter()
                .copied()
                .filter(|w| results.iter().any(|r| r.host == w.name() && r.succeeded()))
                .collect();
            for r in results {
                report.record(r);
            }
            if joined.is_empty() {
                warn!("no worker joined");
                return report.transition(RunState::PartiallyFailed);
            }
        }

        // Verification
        report.transition(RunState::Verifying);
        let verify_nodes: Vec<Node<'_>> = master.iter().copied().chain(joined.iter().copied()).collect();
        for r in self.run_phase(Phase::Verification, &verify_nodes, None, cancel, false) {
            report.record(r);
        }

        let joined_names: Vec<&str> = joined.iter().map(|w| w.name()).collect();
        let expected = expected_ready(&joined_names, baseline.as_deref());
        let master_host = self.inventory.master();
        let status = KubectlStatus::new(
            &self.pool,
            master_host,
            &self.config.status_command,
            self.config.command_timeout(),
        );
        let readiness = ReadinessPoller::new(&status).wait_for_ready(
            expected,
            self.config.readiness_timeout(),
            self.config.readiness_poll_interval(),
        );
        let ready = readiness.is_ready();
        report.readiness = Some(readiness);

        if ready && report.failed_hosts().is_empty() {
            report.transition(RunState::Converged);
        } else {
            report.transition(RunState::PartiallyFailed);
        }
    }

    /// One best-effort node listing before a workers-only join.
    fn baseline(&self) -> Option<Vec<NodeStatus>> {
        let status = KubectlStatus::new(
            &self.pool,
            self.inventory.master(),
            &self.config.status_command,
            self.config.command_timeout(),
        );
        match status.list_node_status(self.config.command_timeout()) {
            Ok(nodes) => {
                let ready = nodes.iter().filter(|n| n.ready).count();
                debug!(ready, total = nodes.len(), "node baseline before join");
                Some(nodes)
            }
            Err(e) => {
                warn!(error = %e, "no node baseline, expecting master plus joined workers");
                None
            }
        }
    }

    /// Run master init and turn its output into a persisted credential.
    /// Records the result; on failure marks the run failed and returns `None`.
    fn init_master(&self, master: Node<'_>, cancel: &CancelToken, report: &mut ClusterReport) -> Option<JoinCredential> {
        let result = self.run_on(master, Phase::MasterInit, None, cancel);
        let outcome = if result.succeeded() {
            self.joins.coordinate(&result).map_err(|e| e.to_string())
        } else {
            Err(format!(
                "master init failed: {}",
                result.error.clone().unwrap_or_default()
            ))
        };
        report.record(result);
        match outcome {
            Ok(c) => Some(c),
            Err(reason) => {
                report.fail(reason);
                None
            }
        }
    }

    /// Fan one phase out across `nodes`. With `master_fatal`, a master
    /// failure cancels the other hosts before their next command.
    fn run_phase(
        &self,
        phase: Phase,
        nodes: &[Node<'_>],
        credential: Option<&JoinCredential>,
        cancel: &CancelToken,
        master_fatal: bool,
    ) -> Vec<ExecutionResult> {
        info!(phase = %phase, hosts = nodes.len(), "phase started");
        let results = fan_out(nodes, self.config.max_concurrency, |node| {
            let result = self.run_on(*node, phase, credential, cancel);
            if master_fatal && node.is_master() && !result.succeeded() {
                warn!(host = %node.name(), phase = %phase, "master failed, cancelling run");
                cancel.cancel();
            }
            result
        });
        let failed = results.iter().filter(|r| !r.succeeded()).count();
        info!(phase = %phase, ok = results.len() - failed, failed, "phase finished");
        results
    }

    fn run_on(
        &self,
        node: Node<'_>,
        phase: Phase,
        credential: Option<&JoinCredential>,
        cancel: &CancelToken,
    ) -> ExecutionResult {
        let host = node.host();
        let recipe = match self.registry.resolve(phase, host, credential) {
            Ok(recipe) => recipe,
            Err(e) => return ExecutionResult::rejected(host, phase, &e.to_string()),
        };
        if recipe.is_empty() {
            return ExecutionResult::empty(host, phase);
        }
        if cancel.is_cancelled() {
            return ExecutionResult::cancelled(host, &recipe);
        }

        let started = std::time::Instant::now();
        let session = match self.pool.acquire(host) {
            Ok(session) => session,
            Err(e) => {
                warn!(host = %host.name, phase = %phase, error = %e, "host unreachable");
                return ExecutionResult::unreachable(host, &recipe, &e, started.elapsed());
            }
        };
        NodeExecutor::new(RetryPolicy::for_commands(&self.config), self.config.command_timeout())
            .with_cancel(cancel.clone())
            .run(&session, &recipe)
    }

    /// Tear down the selected hosts. Failures are per host; the persisted
    /// credential is cleared once the master has been reset.
    pub fn reset(&self, selection: &HostSelection) -> Result<ResetReport> {
        let nodes = self.inventory.select(selection)?;
        let mut report = ResetReport::new();
        info!(hosts = nodes.len(), "reset started");

        let cancel = CancelToken::new();
        report.results = self.run_phase(Phase::Reset, &nodes, None, &cancel, false);

        let master_reset = report
            .results
            .iter()
            .any(|r| r.role == Role::Master && r.succeeded());
        if master_reset {
            self.joins.clear()?;
            report.credential_cleared = true;
        }

        self.pool.release_all();
        report.connections = self.pool.connections();
        report.finished_ms = Some(now_ms());
        Ok(report)
    }

    /// One status query against the master.
    pub fn status(&self) -> std::result::Result<Vec<NodeStatus>, StatusError> {
        let status = KubectlStatus::new(
            &self.pool,
            self.inventory.master(),
            &self.config.status_command,
            self.config.command_timeout(),
        );
        let nodes = status.list_node_status(self.config.command_timeout());
        self.pool.release_all();
        nodes
    }
}

/// Ready nodes to wait for: the master plus every joined worker, or, given a
/// listing taken before the join, the nodes ready then plus joined workers
/// that were not.
fn expected_ready(joined: &[&str], baseline: Option<&[NodeStatus]>) -> usize {
    let floor = 1 + joined.len();
    match baseline {
        Some(nodes) => {
            let ready = nodes.iter().filter(|n| n.ready).count();
            let fresh = joined
                .iter()
                .filter(|w| !nodes.iter().any(|n| n.ready && n.name == **w))
                .count();
            floor.max(ready + fresh)
        }
        None => floor,
    }
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

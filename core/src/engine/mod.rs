//! The orchestration engine and the pieces it sequences.

pub mod executor;
pub mod fanout;
pub mod join;
pub mod orchestrator;
pub mod readiness;
pub mod report;

pub use executor::{CancelToken, CommandOutcome, CommandRecord, ExecutionResult, ExecutionStatus, NodeExecutor};
pub use join::{JoinCoordinator, JoinCredential};
pub use orchestrator::Orchestrator;
pub use readiness::{NodeStatus, ReadinessPoller, ReadinessResult, StatusSource};
pub use report::{ClusterReport, HostOutcome, ResetReport, RunMode, RunState};

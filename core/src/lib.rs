//! clusterkit: bootstrap a cluster over SSH from a declarative inventory.
//!
//! The engine prepares every host, initializes the master, hands the join
//! credential to the workers and polls until the cluster reports ready.
//! Remote commands come from a recipe registry; the transport is OpenSSH
//! in production and a scripted stand-in under test.

pub mod config;
pub mod engine;
pub mod error;
pub mod inventory;
pub mod lock;
pub mod logging;
pub mod recipe;
pub mod session;
pub mod transport;

pub use config::EngineConfig;
pub use engine::{ClusterReport, Orchestrator, ResetReport, RunMode, RunState};
pub use error::{Error, Result};
pub use inventory::{HostSelection, Inventory};

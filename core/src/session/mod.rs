//! Sessions: pooled per-host connections, their retry policy and bookkeeping.

pub mod pool;
pub mod retry;
pub mod tracker;

pub use pool::{Session, SessionPool};
pub use retry::RetryPolicy;
pub use tracker::{ConnState, ConnectionInfo, ConnectionSummary, ConnectionTracker};

//! Work distribution across worker processes.
//!
//! Implements the lease protocol that lets workers exclusively acquire ready
//! tasks, the liveness tracking used to recover tasks from crashed workers,
//! and the control loop that drives both.
//!
//! # Main types
//!
//! - [`ClaimManager`]: Lease-based exclusive task acquisition ([`SqliteClaimManager`]).
//! - [`WorkerRegistry`]: Worker registration and heartbeat liveness ([`SqliteWorkerRegistry`]).
//! - [`OrchestratorStateStore`]: The singleton control-loop row ([`SqliteOrchestratorStateStore`]).
//! - [`Reconciler`]: Periodic dead-worker sweep, orphan reclaim and lease expiry.

/// Lease-based claims.
pub mod claims;
/// Reconciliation control loop.
pub mod reconciler;
/// Singleton orchestrator state.
pub mod state;
/// Shared orchestration types (Worker, Claim, OrchestratorState, etc.).
pub mod types;
/// Worker registry and heartbeats.
pub mod workers;

pub use claims::{ClaimManager, SqliteClaimManager, DEFAULT_STALE_THRESHOLD_SECONDS};
pub use reconciler::{ReconcileReport, Reconciler};
pub use state::{OrchestratorStateStore, SqliteOrchestratorStateStore};
pub use types::{
    Claim, ClaimStatus, NewWorker, OrchestratorState, OrchestratorStatePatch,
    OrchestratorStatus, Worker, WorkerStatus,
};
pub use workers::{SqliteWorkerRegistry, WorkerRegistry};

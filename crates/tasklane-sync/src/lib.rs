//! JSONL synchronisation for tasklane.
//!
//! The log is an append-friendly history of task and dependency operations,
//! one JSON object per line. Importing merges it into the database under
//! last-writer-wins; exporting and compacting rewrite it atomically.
//!
//! # Main types
//!
//! - [`SyncEngine`]: Export, import, compact and status against one database.
//! - [`SyncOp`]: One line of the log.
//! - [`AutoExportHook`]: [`tasklane_store::MutationHook`] that keeps the log current.

/// Import, export, compaction and status.
pub mod engine;
/// Change detection for the log file.
pub mod fingerprint;
/// Auto-export after committed mutations.
pub mod hook;
/// Wire format.
pub mod ops;
/// Collapsing histories to per-entity winners.
pub mod replay;

pub use engine::{CompactResult, ExportResult, ImportResult, SyncEngine, SyncStatus};
pub use hook::AutoExportHook;
pub use ops::{OpKind, SyncOp, TaskData, OP_VERSION};

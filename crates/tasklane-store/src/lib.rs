//! Task storage for tasklane.
//!
//! Owns the SQLite schema shared by every tasklane component, the task and
//! dependency repository, and the readiness computation over the graph.
//!
//! # Main types
//!
//! - [`Database`]: Cloneable handle to the SQLite file (schema, pragmas, transactions).
//! - [`TaskStore`]: Repository trait for tasks and dependency edges; [`SqliteTaskStore`] implements it.
//! - [`Task`], [`TaskStatus`], [`Dependency`]: The task graph data model.
//! - [`MutationHook`]: Observer called after committed changes (auto-sync trigger point).

/// SQLite handle, schema and column helpers.
pub mod db;
/// Pure readiness and cycle checks over the dependency graph.
pub mod readiness;
/// Row-level SQL shared with the sync importer.
pub mod rows;
/// Task data model.
pub mod task;
/// Repository trait and its SQLite implementation.
pub mod task_store;

pub use db::Database;
pub use task::{Dependency, Metadata, NewTask, Task, TaskFilter, TaskPatch, TaskStatus};
pub use task_store::{Mutation, MutationHook, NoopHook, SqliteTaskStore, TaskStore};

//! Core types and error definitions for tasklane.
//!
//! This crate provides the foundational types shared across all tasklane crates:
//! the unified error type, strongly-typed identifiers, and the clock abstraction
//! every time-dependent component is constructed with.
//!
//! # Main types
//!
//! - [`TasklaneError`]: Unified error enum for all tasklane subsystems.
//! - [`TasklaneResult`]: Convenience alias for `Result<T, TasklaneError>`.
//! - [`TaskId`], [`WorkerId`], [`ClaimId`]: Namespaced identifiers with validated formats.
//! - [`Clock`]: Injected time source ([`SystemClock`] in production, [`ManualClock`] in tests).

/// Time sources.
pub mod clock;
/// Namespaced identifiers.
pub mod ids;
/// Timestamp encoding shared by the database and the JSONL log.
pub mod time;

pub use clock::{Clock, ManualClock, SystemClock};
pub use ids::{ClaimId, TaskId, WorkerId};

// --- Error types ---

/// Top-level error type for tasklane.
///
/// Sync conflicts are deliberately absent: they are counted in import results,
/// not raised.
#[derive(Debug, thiserror::Error)]
pub enum TasklaneError {
    /// A malformed record, argument or state transition request.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A failure reported by the SQLite store, propagated unchanged.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A referenced task, worker or claim does not exist.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Kind of entity that was looked up (`task`, `worker`, `claim`).
        entity: &'static str,
        /// Identifier that failed to resolve.
        id: String,
    },

    /// Another worker holds a live lease on the task.
    #[error("Task {task_id} is already claimed by {worker_id} ({claim_id})")]
    AlreadyClaimed {
        /// Task that was requested.
        task_id: String,
        /// Active claim blocking the request.
        claim_id: String,
        /// Worker holding the active claim.
        worker_id: String,
    },

    /// The claim exists but is no longer active.
    #[error("Claim {claim_id} is not active (status: {status})")]
    ClaimNotActive {
        /// Claim that was addressed.
        claim_id: String,
        /// Its current status.
        status: String,
    },

    /// The claim is still marked active but its lease has run out.
    #[error("Lease for claim {claim_id} has expired")]
    LeaseExpired {
        /// Claim whose lease ran out.
        claim_id: String,
    },

    /// A file changed underneath an in-flight sync operation.
    #[error("Concurrent modification: {0}")]
    ConcurrentModification(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TasklaneError {
    /// Shorthand for [`TasklaneError::NotFound`].
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Shorthand for [`TasklaneError::Validation`].
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// True for [`TasklaneError::NotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// A convenience `Result` alias using [`TasklaneError`].
pub type TasklaneResult<T> = Result<T, TasklaneError>;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_display() {
        let err = TasklaneError::not_found("task", "tx-abc123");
        assert_eq!(err.to_string(), "task not found: tx-abc123");
        assert!(err.is_not_found());
    }

    #[test]
    fn test_already_claimed_is_distinct_from_not_found() {
        let err = TasklaneError::AlreadyClaimed {
            task_id: "tx-abc123".into(),
            claim_id: "claim-aaaa1111".into(),
            worker_id: "worker-bbbb2222".into(),
        };
        assert!(!err.is_not_found());
        assert!(err.to_string().contains("worker-bbbb2222"));
    }

    #[test]
    fn test_database_error_keeps_source() {
        let err: TasklaneError = rusqlite::Error::QueryReturnedNoRows.into();
        assert!(matches!(
            err,
            TasklaneError::Database(rusqlite::Error::QueryReturnedNoRows)
        ));
    }
}

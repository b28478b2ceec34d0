use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tasklane_core::{TaskId, TasklaneError};

/// Opaque per-task key/value data.
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Backlog,
    Ready,
    Planning,
    Active,
    Blocked,
    Review,
    HumanNeedsToReview,
    Done,
}

impl TaskStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [TaskStatus; 8] = [
        TaskStatus::Backlog,
        TaskStatus::Ready,
        TaskStatus::Planning,
        TaskStatus::Active,
        TaskStatus::Blocked,
        TaskStatus::Review,
        TaskStatus::HumanNeedsToReview,
        TaskStatus::Done,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Backlog => "backlog",
            TaskStatus::Ready => "ready",
            TaskStatus::Planning => "planning",
            TaskStatus::Active => "active",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Review => "review",
            TaskStatus::HumanNeedsToReview => "human_needs_to_review",
            TaskStatus::Done => "done",
        }
    }

    /// Statuses from which a task may be picked up by a worker.
    pub fn is_workable(self) -> bool {
        matches!(
            self,
            TaskStatus::Backlog | TaskStatus::Ready | TaskStatus::Planning
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = TasklaneError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| TasklaneError::Validation(format!("unknown task status '{s}'")))
    }
}

/// A unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    /// Priority rank; higher is more urgent.
    pub score: f64,
    pub parent_id: Option<TaskId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: Metadata,
}

/// Input for [`crate::TaskStore::create`].
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    /// Explicit id; generated when absent.
    pub id: Option<TaskId>,
    pub title: String,
    pub description: String,
    pub status: Option<TaskStatus>,
    pub score: f64,
    pub parent_id: Option<TaskId>,
    pub metadata: Metadata,
}

impl NewTask {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: TaskId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_score(mut self, score: f64) -> Self {
        self.score = score;
        self
    }

    pub fn with_parent(mut self, parent: TaskId) -> Self {
        self.parent_id = Some(parent);
        self
    }
}

/// Partial update for a task. `None` leaves a field untouched.
///
/// `parent` is doubly optional: `Some(None)` detaches the task from its parent.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub status: Option<TaskStatus>,
    pub score: Option<f64>,
    pub parent: Option<Option<TaskId>>,
    pub metadata: Option<Metadata>,
}

impl TaskPatch {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.status.is_none()
            && self.score.is_none()
            && self.parent.is_none()
            && self.metadata.is_none()
    }
}

/// Selection criteria for [`crate::TaskStore::list`].
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    /// `Some(None)` selects root tasks only.
    pub parent: Option<Option<TaskId>>,
}

/// Directed edge: `blocked_id` cannot be worked until `blocker_id` is done.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub blocker_id: TaskId,
    pub blocked_id: TaskId,
    pub created_at: DateTime<Utc>,
}

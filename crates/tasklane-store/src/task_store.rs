use crate::db::Database;
use crate::readiness;
use crate::rows;
use crate::task::{Dependency, NewTask, Task, TaskFilter, TaskPatch, TaskStatus};
use std::sync::Arc;
use tasklane_core::{Clock, TaskId, TasklaneError, TasklaneResult};

/// A committed change to the task graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    TaskCreated(TaskId),
    TaskUpdated(TaskId),
    TaskRemoved(TaskId),
    DependencyAdded { blocker: TaskId, blocked: TaskId },
    DependencyRemoved { blocker: TaskId, blocked: TaskId },
}

/// Observer notified after each committed mutation.
///
/// Called outside the database lock. Implementations must not fail the
/// mutation that triggered them.
pub trait MutationHook: Send + Sync {
    fn on_mutation(&self, mutation: &Mutation);
}

/// Hook that does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHook;

impl MutationHook for NoopHook {
    fn on_mutation(&self, _mutation: &Mutation) {}
}

/// CRUD and hierarchy over tasks and dependency edges.
pub trait TaskStore: Send + Sync {
    fn create(&self, new: NewTask) -> TasklaneResult<Task>;
    fn get(&self, id: &TaskId) -> TasklaneResult<Option<Task>>;
    fn list(&self, filter: &TaskFilter) -> TasklaneResult<Vec<Task>>;
    fn update(&self, id: &TaskId, patch: TaskPatch) -> TasklaneResult<Task>;
    fn remove(&self, id: &TaskId) -> TasklaneResult<()>;

    fn children(&self, id: &TaskId) -> TasklaneResult<Vec<Task>>;
    fn ancestors(&self, id: &TaskId) -> TasklaneResult<Vec<Task>>;

    fn add_dependency(&self, blocker: &TaskId, blocked: &TaskId) -> TasklaneResult<bool>;
    fn remove_dependency(&self, blocker: &TaskId, blocked: &TaskId) -> TasklaneResult<bool>;
    fn blockers(&self, id: &TaskId) -> TasklaneResult<Vec<Task>>;
    fn dependents(&self, id: &TaskId) -> TasklaneResult<Vec<Task>>;
    fn dependencies(&self) -> TasklaneResult<Vec<Dependency>>;

    /// Like [`TaskStore::get`], but a missing task is an error.
    fn get_required(&self, id: &TaskId) -> TasklaneResult<Task> {
        self.get(id)?
            .ok_or_else(|| TasklaneError::not_found("task", id))
    }

    /// Ready tasks, most urgent first.
    fn get_ready(&self) -> TasklaneResult<Vec<Task>> {
        let tasks = self.list(&TaskFilter::default())?;
        let edges = self.dependencies()?;
        Ok(readiness::compute_ready(&tasks, &edges)
            .into_iter()
            .cloned()
            .collect())
    }
}

/// [`TaskStore`] backed by the shared SQLite database.
pub struct SqliteTaskStore {
    db: Database,
    clock: Arc<dyn Clock>,
    hook: Arc<dyn MutationHook>,
}

impl SqliteTaskStore {
    pub fn new(db: Database, clock: Arc<dyn Clock>) -> Self {
        Self {
            db,
            clock,
            hook: Arc::new(NoopHook),
        }
    }

    /// Replace the mutation hook.
    pub fn with_hook(mut self, hook: Arc<dyn MutationHook>) -> Self {
        self.hook = hook;
        self
    }

    fn notify(&self, mutation: Mutation) {
        self.hook.on_mutation(&mutation);
    }
}

fn require_task(conn: &rusqlite::Connection, id: &TaskId) -> TasklaneResult<Task> {
    rows::load_task(conn, id)?.ok_or_else(|| TasklaneError::not_found("task", id))
}

fn validate_title(title: &str) -> TasklaneResult<()> {
    if title.trim().is_empty() {
        return Err(TasklaneError::validation("task title must not be empty"));
    }
    Ok(())
}

impl TaskStore for SqliteTaskStore {
    fn create(&self, new: NewTask) -> TasklaneResult<Task> {
        validate_title(&new.title)?;
        let now = self.clock.now();
        let status = new.status.unwrap_or(TaskStatus::Backlog);
        let task = Task {
            id: new.id.unwrap_or_else(TaskId::generate),
            title: new.title,
            description: new.description,
            status,
            score: new.score,
            parent_id: new.parent_id,
            created_at: now,
            updated_at: now,
            completed_at: (status == TaskStatus::Done).then_some(now),
            metadata: new.metadata,
        };

        self.db.immediate(|tx| {
            if rows::task_exists(tx, &task.id)? {
                return Err(TasklaneError::Validation(format!(
                    "task {} already exists",
                    task.id
                )));
            }
            if let Some(parent) = &task.parent_id {
                if !rows::task_exists(tx, parent)? {
                    return Err(TasklaneError::not_found("task", parent));
                }
            }
            rows::insert_task(tx, &task)
        })?;

        tracing::info!(task_id = %task.id, status = %task.status, "Task created");
        self.notify(Mutation::TaskCreated(task.id.clone()));
        Ok(task)
    }

    fn get(&self, id: &TaskId) -> TasklaneResult<Option<Task>> {
        self.db.with_conn(|conn| rows::load_task(conn, id))
    }

    fn list(&self, filter: &TaskFilter) -> TasklaneResult<Vec<Task>> {
        self.db.with_conn(|conn| {
            rows::load_tasks_filtered(conn, filter.status, filter.parent.as_ref().map(Option::as_ref))
        })
    }

    fn update(&self, id: &TaskId, patch: TaskPatch) -> TasklaneResult<Task> {
        if patch.is_empty() {
            return self.get_required(id);
        }
        let now = self.clock.now();

        let task = self.db.immediate(|tx| {
            let mut task = require_task(tx, id)?;

            if let Some(title) = patch.title {
                validate_title(&title)?;
                task.title = title;
            }
            if let Some(description) = patch.description {
                task.description = description;
            }
            if let Some(score) = patch.score {
                task.score = score;
            }
            if let Some(metadata) = patch.metadata {
                task.metadata = metadata;
            }
            if let Some(parent) = patch.parent {
                if let Some(parent_id) = &parent {
                    if parent_id == id {
                        return Err(TasklaneError::validation("a task cannot be its own parent"));
                    }
                    if !rows::task_exists(tx, parent_id)? {
                        return Err(TasklaneError::not_found("task", parent_id));
                    }
                    if rows::ancestors(tx, parent_id)?.iter().any(|a| &a.id == id) {
                        return Err(TasklaneError::Validation(format!(
                            "setting parent {parent_id} on {id} would create a cycle"
                        )));
                    }
                }
                task.parent_id = parent;
            }
            if let Some(status) = patch.status {
                if status == TaskStatus::Done {
                    // Re-completing keeps the original completion time.
                    if task.status != TaskStatus::Done || task.completed_at.is_none() {
                        task.completed_at = Some(now);
                    }
                } else {
                    task.completed_at = None;
                }
                task.status = status;
            }

            task.updated_at = now;
            rows::write_task(tx, &task)?;
            Ok(task)
        })?;

        tracing::debug!(task_id = %task.id, status = %task.status, "Task updated");
        self.notify(Mutation::TaskUpdated(task.id.clone()));
        Ok(task)
    }

    fn remove(&self, id: &TaskId) -> TasklaneResult<()> {
        let removed = self.db.immediate(|tx| rows::delete_task(tx, id))?;
        if !removed {
            return Err(TasklaneError::not_found("task", id));
        }
        tracing::info!(task_id = %id, "Task removed");
        self.notify(Mutation::TaskRemoved(id.clone()));
        Ok(())
    }

    fn children(&self, id: &TaskId) -> TasklaneResult<Vec<Task>> {
        self.db.with_conn(|conn| rows::children(conn, id))
    }

    fn ancestors(&self, id: &TaskId) -> TasklaneResult<Vec<Task>> {
        self.db.with_conn(|conn| {
            require_task(conn, id)?;
            rows::ancestors(conn, id)
        })
    }

    fn add_dependency(&self, blocker: &TaskId, blocked: &TaskId) -> TasklaneResult<bool> {
        let now = self.clock.now();
        let added = self.db.immediate(|tx| {
            require_task(tx, blocker)?;
            require_task(tx, blocked)?;
            if blocker == blocked {
                return Err(TasklaneError::validation("a task cannot block itself"));
            }
            if rows::dependency_exists(tx, blocker, blocked)? {
                return Ok(false);
            }
            let edges = rows::load_dependencies(tx)?;
            if readiness::would_create_cycle(&edges, blocker, blocked) {
                return Err(TasklaneError::Validation(format!(
                    "dependency {blocker} -> {blocked} would create a cycle"
                )));
            }
            rows::insert_dependency(tx, blocker, blocked, now)
        })?;

        if added {
            tracing::debug!(%blocker, %blocked, "Dependency added");
            self.notify(Mutation::DependencyAdded {
                blocker: blocker.clone(),
                blocked: blocked.clone(),
            });
        } else {
            tracing::debug!(%blocker, %blocked, "Dependency already present");
        }
        Ok(added)
    }

    fn remove_dependency(&self, blocker: &TaskId, blocked: &TaskId) -> TasklaneResult<bool> {
        let removed = self
            .db
            .immediate(|tx| rows::delete_dependency(tx, blocker, blocked))?;
        if removed {
            tracing::debug!(%blocker, %blocked, "Dependency removed");
            self.notify(Mutation::DependencyRemoved {
                blocker: blocker.clone(),
                blocked: blocked.clone(),
            });
        }
        Ok(removed)
    }

    fn blockers(&self, id: &TaskId) -> TasklaneResult<Vec<Task>> {
        self.db.with_conn(|conn| rows::blockers(conn, id))
    }

    fn dependents(&self, id: &TaskId) -> TasklaneResult<Vec<Task>> {
        self.db.with_conn(|conn| rows::dependents(conn, id))
    }

    fn dependencies(&self) -> TasklaneResult<Vec<Dependency>> {
        self.db.with_conn(rows::load_dependencies)
    }

    fn get_ready(&self) -> TasklaneResult<Vec<Task>> {
        // Both reads under one lock so the edge set matches the task set.
        self.db.with_conn(|conn| {
            let tasks = rows::load_tasks(conn)?;
            let edges = rows::load_dependencies(conn)?;
            Ok(readiness::compute_ready(&tasks, &edges)
                .into_iter()
                .cloned()
                .collect())
        })
    }
}

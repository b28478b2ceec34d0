#![allow(clippy::unwrap_used, clippy::expect_used)]

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tasklane_core::{SystemClock, TaskId, TasklaneError, TasklaneResult};
use tasklane_store::{
    Database, Dependency, NewTask, SqliteTaskStore, Task, TaskFilter, TaskPatch, TaskStatus,
    TaskStore,
};

/// Helper: create a SqliteTaskStore backed by a file in a temp directory.
fn temp_store() -> (SqliteTaskStore, Database, tempfile::TempDir) {
    let tmp = tempfile::tempdir().unwrap();
    let db = Database::open(&tmp.path().join("tasklane.db")).unwrap();
    let store = SqliteTaskStore::new(db.clone(), Arc::new(SystemClock));
    (store, db, tmp)
}

#[test]
fn test_two_handles_share_one_file() {
    let (store, _db, tmp) = temp_store();
    let task = store.create(NewTask::new("shared")).unwrap();

    let other_db = Database::open(&tmp.path().join("tasklane.db")).unwrap();
    let other = SqliteTaskStore::new(other_db, Arc::new(SystemClock));
    assert_eq!(other.get_required(&task.id).unwrap().title, "shared");
}

#[test]
fn test_hierarchy_children_and_ancestors() {
    let (store, _db, _tmp) = temp_store();
    let root = store.create(NewTask::new("root")).unwrap();
    let mid = store
        .create(NewTask::new("mid").with_parent(root.id.clone()))
        .unwrap();
    let leaf = store
        .create(NewTask::new("leaf").with_parent(mid.id.clone()))
        .unwrap();

    let kids = store.children(&root.id).unwrap();
    assert_eq!(kids.len(), 1);
    assert_eq!(kids[0].id, mid.id);

    let chain: Vec<_> = store
        .ancestors(&leaf.id)
        .unwrap()
        .into_iter()
        .map(|t| t.id)
        .collect();
    assert_eq!(chain, vec![mid.id.clone(), root.id.clone()]);

    let roots = store
        .list(&TaskFilter {
            parent: Some(None),
            ..TaskFilter::default()
        })
        .unwrap();
    assert_eq!(roots.len(), 1);
}

#[test]
fn test_remove_detaches_children_and_drops_edges() {
    let (store, _db, _tmp) = temp_store();
    let parent = store.create(NewTask::new("parent")).unwrap();
    let child = store
        .create(NewTask::new("child").with_parent(parent.id.clone()))
        .unwrap();
    store.add_dependency(&parent.id, &child.id).unwrap();

    store.remove(&parent.id).unwrap();

    assert!(store.get(&parent.id).unwrap().is_none());
    assert!(store.get_required(&child.id).unwrap().parent_id.is_none());
    assert!(store.dependencies().unwrap().is_empty());
    assert!(store.remove(&parent.id).unwrap_err().is_not_found());
}

#[test]
fn test_list_filters_by_status_and_orders_by_score() {
    let (store, _db, _tmp) = temp_store();
    store
        .create(NewTask::new("low").with_score(1.0))
        .unwrap();
    store
        .create(NewTask::new("high").with_score(9.0))
        .unwrap();
    store
        .create(NewTask::new("done").with_status(TaskStatus::Done))
        .unwrap();

    let all = store.list(&TaskFilter::default()).unwrap();
    assert_eq!(all[0].title, "high");

    let done = store
        .list(&TaskFilter {
            status: Some(TaskStatus::Done),
            ..TaskFilter::default()
        })
        .unwrap();
    assert_eq!(done.len(), 1);
    assert!(done[0].completed_at.is_some());
}

#[test]
fn test_readiness_property_over_mixed_graph() {
    let (store, _db, _tmp) = temp_store();
    let mut ids = Vec::new();
    for (i, status) in TaskStatus::ALL.into_iter().enumerate() {
        let t = store
            .create(NewTask::new(format!("t{i}")).with_status(status))
            .unwrap();
        ids.push(t.id);
    }
    // Chain every task behind the previous one.
    for pair in ids.windows(2) {
        store.add_dependency(&pair[0], &pair[1]).unwrap();
    }

    let ready: Vec<TaskId> = store.get_ready().unwrap().into_iter().map(|t| t.id).collect();
    for task in store.list(&TaskFilter::default()).unwrap() {
        let blockers_done = store
            .blockers(&task.id)
            .unwrap()
            .iter()
            .all(|b| b.status == TaskStatus::Done);
        let expected = task.status.is_workable() && blockers_done;
        assert_eq!(ready.contains(&task.id), expected, "{}", task.title);
    }
}

#[test]
fn test_dependency_on_unknown_task_is_not_found() {
    let (store, _db, _tmp) = temp_store();
    let a = store.create(NewTask::new("a")).unwrap();
    let ghost = TaskId::parse("tx-ghost1").unwrap();
    assert!(store.add_dependency(&a.id, &ghost).unwrap_err().is_not_found());
    assert!(store.add_dependency(&ghost, &a.id).unwrap_err().is_not_found());
}

#[test]
fn test_update_patch_only_touches_given_fields() {
    let (store, _db, _tmp) = temp_store();
    let task = store
        .create(NewTask::new("title").with_description("desc").with_score(3.0))
        .unwrap();
    let updated = store
        .update(
            &task.id,
            TaskPatch {
                title: Some("renamed".into()),
                ..TaskPatch::default()
            },
        )
        .unwrap();
    assert_eq!(updated.title, "renamed");
    assert_eq!(updated.description, "desc");
    assert_eq!(updated.score, 3.0);
}

// ---------------------------------------------------------------------------
// In-memory fake: exercises the trait's provided methods
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FakeTaskStore {
    tasks: Mutex<HashMap<TaskId, Task>>,
    edges: Mutex<Vec<Dependency>>,
}

impl TaskStore for FakeTaskStore {
    fn create(&self, new: NewTask) -> TasklaneResult<Task> {
        let now = chrono::Utc::now();
        let task = Task {
            id: new.id.unwrap_or_else(TaskId::generate),
            title: new.title,
            description: new.description,
            status: new.status.unwrap_or(TaskStatus::Backlog),
            score: new.score,
            parent_id: new.parent_id,
            created_at: now,
            updated_at: now,
            completed_at: None,
            metadata: new.metadata,
        };
        self.tasks.lock().insert(task.id.clone(), task.clone());
        Ok(task)
    }

    fn get(&self, id: &TaskId) -> TasklaneResult<Option<Task>> {
        Ok(self.tasks.lock().get(id).cloned())
    }

    fn list(&self, _filter: &TaskFilter) -> TasklaneResult<Vec<Task>> {
        let mut tasks: Vec<Task> = self.tasks.lock().values().cloned().collect();
        tasks.sort_by(|a, b| b.score.total_cmp(&a.score));
        Ok(tasks)
    }

    fn update(&self, id: &TaskId, patch: TaskPatch) -> TasklaneResult<Task> {
        let mut tasks = self.tasks.lock();
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| TasklaneError::not_found("task", id))?;
        if let Some(status) = patch.status {
            task.status = status;
        }
        Ok(task.clone())
    }

    fn remove(&self, id: &TaskId) -> TasklaneResult<()> {
        self.tasks.lock().remove(id);
        Ok(())
    }

    fn children(&self, _id: &TaskId) -> TasklaneResult<Vec<Task>> {
        Ok(Vec::new())
    }

    fn ancestors(&self, _id: &TaskId) -> TasklaneResult<Vec<Task>> {
        Ok(Vec::new())
    }

    fn add_dependency(&self, blocker: &TaskId, blocked: &TaskId) -> TasklaneResult<bool> {
        self.edges.lock().push(Dependency {
            blocker_id: blocker.clone(),
            blocked_id: blocked.clone(),
            created_at: chrono::Utc::now(),
        });
        Ok(true)
    }

    fn remove_dependency(&self, _blocker: &TaskId, _blocked: &TaskId) -> TasklaneResult<bool> {
        Ok(false)
    }

    fn blockers(&self, _id: &TaskId) -> TasklaneResult<Vec<Task>> {
        Ok(Vec::new())
    }

    fn dependents(&self, _id: &TaskId) -> TasklaneResult<Vec<Task>> {
        Ok(Vec::new())
    }

    fn dependencies(&self) -> TasklaneResult<Vec<Dependency>> {
        Ok(self.edges.lock().clone())
    }
}

#[test]
fn test_fake_store_uses_provided_readiness() {
    let fake = FakeTaskStore::default();
    let a = fake.create(NewTask::new("a")).unwrap();
    let b = fake.create(NewTask::new("b").with_score(2.0)).unwrap();
    fake.add_dependency(&a.id, &b.id).unwrap();

    let ready: Vec<_> = fake.get_ready().unwrap().into_iter().map(|t| t.id).collect();
    assert_eq!(ready, vec![a.id.clone()]);

    fake.update(&a.id, TaskPatch::status(TaskStatus::Done)).unwrap();
    let ready: Vec<_> = fake.get_ready().unwrap().into_iter().map(|t| t.id).collect();
    assert_eq!(ready, vec![b.id]);

    let ghost = TaskId::parse("tx-ghost1").unwrap();
    assert!(fake.get_required(&ghost).unwrap_err().is_not_found());
}

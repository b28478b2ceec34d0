#![allow(clippy::unwrap_used, clippy::expect_used)]

use chrono::Duration;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tasklane_core::{Clock, ManualClock, TaskId, TasklaneError};
use tasklane_store::{
    Database, NewTask, SqliteTaskStore, TaskFilter, TaskPatch, TaskStatus, TaskStore,
};
use tasklane_sync::ops::render_ops;
use tasklane_sync::{AutoExportHook, ImportResult, SyncEngine, SyncOp};

/// One side of a sync: its own database file, store, engine and clock.
struct Side {
    store: SqliteTaskStore,
    engine: SyncEngine,
    clock: Arc<ManualClock>,
    _tmp: tempfile::TempDir,
}

fn side() -> Side {
    let tmp = tempfile::tempdir().unwrap();
    let db = Database::open(&tmp.path().join("tasklane.db")).unwrap();
    let clock = Arc::new(ManualClock::starting_now());
    Side {
        store: SqliteTaskStore::new(db.clone(), clock.clone()),
        engine: SyncEngine::new(db, clock.clone()),
        clock,
        _tmp: tmp,
    }
}

fn log_path(dir: &tempfile::TempDir) -> PathBuf {
    dir.path().join("tasks.jsonl")
}

fn id(raw: &str) -> TaskId {
    TaskId::parse(raw).unwrap()
}

fn all_tasks(side: &Side) -> Vec<tasklane_store::Task> {
    side.store.list(&TaskFilter::default()).unwrap()
}

/// A small graph: root with two children, and one edge between the children.
fn seed(side: &Side) -> (TaskId, TaskId, TaskId) {
    let root = side.store.create(NewTask::new("root").with_score(3.0)).unwrap();
    side.clock.advance(Duration::seconds(1));
    let a = side
        .store
        .create(NewTask::new("a").with_parent(root.id.clone()))
        .unwrap();
    side.clock.advance(Duration::seconds(1));
    let b = side
        .store
        .create(
            NewTask::new("b")
                .with_parent(root.id.clone())
                .with_description("second child"),
        )
        .unwrap();
    side.clock.advance(Duration::seconds(1));
    side.store.add_dependency(&a.id, &b.id).unwrap();
    side.clock.advance(Duration::seconds(1));
    side.store
        .update(&a.id, TaskPatch::status(TaskStatus::Done))
        .unwrap();
    (root.id, a.id, b.id)
}

#[test]
fn test_export_import_reproduces_graph() {
    let dir = tempfile::tempdir().unwrap();
    let path = log_path(&dir);
    let src = side();
    seed(&src);

    let exported = src.engine.export(&path).unwrap();
    assert_eq!(exported.op_count, 4);

    let dst = side();
    let result = dst.engine.import(&path).unwrap();
    assert_eq!(result.imported, 3);
    assert_eq!(result.deps_added, 1);
    assert_eq!(result.conflicts, 0);

    assert_eq!(all_tasks(&dst), all_tasks(&src));
    assert_eq!(
        dst.store.dependencies().unwrap(),
        src.store.dependencies().unwrap()
    );
    assert!(!dst.engine.status(&path).unwrap().is_dirty);
}

#[test]
fn test_reimport_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let path = log_path(&dir);
    let src = side();
    seed(&src);
    src.engine.export(&path).unwrap();

    let dst = side();
    dst.engine.import(&path).unwrap();
    let before = all_tasks(&dst);

    let again = dst.engine.import(&path).unwrap();
    assert_eq!(
        again,
        ImportResult {
            imported: 0,
            skipped: 3,
            conflicts: 0,
            deps_added: 0,
            deps_removed: 0,
            deps_skipped: 1,
        }
    );
    assert_eq!(all_tasks(&dst), before);
}

#[test]
fn test_last_writer_wins_both_directions() {
    let dir = tempfile::tempdir().unwrap();
    let path = log_path(&dir);
    let src = side();
    let task = src.store.create(NewTask::new("original")).unwrap();
    src.engine.export(&path).unwrap();

    let dst = side();
    dst.engine.import(&path).unwrap();

    // Local edit newer than the log: the log loses.
    dst.clock.set(task.updated_at + Duration::seconds(10));
    dst.store
        .update(
            &task.id,
            TaskPatch {
                title: Some("local edit".into()),
                ..TaskPatch::default()
            },
        )
        .unwrap();
    let result = dst.engine.import(&path).unwrap();
    assert_eq!(result.conflicts, 1);
    assert_eq!(result.imported, 0);
    assert_eq!(dst.store.get_required(&task.id).unwrap().title, "local edit");

    // Remote edit newer than the local one: the log wins.
    src.clock.advance(Duration::seconds(60));
    src.store
        .update(
            &task.id,
            TaskPatch {
                title: Some("remote edit".into()),
                ..TaskPatch::default()
            },
        )
        .unwrap();
    src.engine.export(&path).unwrap();
    let result = dst.engine.import(&path).unwrap();
    assert_eq!(result.imported, 1);
    assert_eq!(result.conflicts, 0);
    assert_eq!(dst.store.get_required(&task.id).unwrap().title, "remote edit");
}

#[test]
fn test_child_line_before_parent_line() {
    let dir = tempfile::tempdir().unwrap();
    let path = log_path(&dir);
    std::fs::write(
        &path,
        concat!(
            r#"{"v":1,"op":"upsert","ts":"2024-05-01T10:00:00Z","id":"tx-child1","data":{"title":"child","status":"backlog","parentId":"tx-parent1"}}"#,
            "\n",
            r#"{"v":1,"op":"upsert","ts":"2024-05-01T10:05:00Z","id":"tx-parent1","data":{"title":"parent","status":"ready"}}"#,
            "\n",
        ),
    )
    .unwrap();

    let dst = side();
    let result = dst.engine.import(&path).unwrap();
    assert_eq!(result.imported, 2);

    let child = dst.store.get_required(&id("tx-child1")).unwrap();
    assert_eq!(child.parent_id, Some(id("tx-parent1")));
    assert_eq!(dst.store.children(&id("tx-parent1")).unwrap().len(), 1);
}

#[test]
fn test_unknown_parent_imports_as_root() {
    let dir = tempfile::tempdir().unwrap();
    let path = log_path(&dir);
    std::fs::write(
        &path,
        concat!(
            r#"{"v":1,"op":"upsert","ts":"2024-05-01T10:00:00Z","id":"tx-orphan1","data":{"title":"orphan","status":"backlog","parentId":"tx-gone99"}}"#,
            "\n",
        ),
    )
    .unwrap();

    let dst = side();
    let result = dst.engine.import(&path).unwrap();
    assert_eq!(result.imported, 1);
    let task = dst.store.get_required(&id("tx-orphan1")).unwrap();
    assert_eq!(task.parent_id, None);
}

#[test]
fn test_parent_already_in_database() {
    let dir = tempfile::tempdir().unwrap();
    let path = log_path(&dir);
    let dst = side();
    let parent = dst.store.create(NewTask::new("local parent")).unwrap();
    std::fs::write(
        &path,
        format!(
            r#"{{"v":1,"op":"upsert","ts":"2030-01-01T00:00:00Z","id":"tx-kid001","data":{{"title":"kid","status":"backlog","parentId":"{}"}}}}"#,
            parent.id
        ) + "\n",
    )
    .unwrap();

    dst.engine.import(&path).unwrap();
    let kid = dst.store.get_required(&id("tx-kid001")).unwrap();
    assert_eq!(kid.parent_id, Some(parent.id));
}

#[test]
fn test_dependency_on_missing_task_rolls_back_everything() {
    let dir = tempfile::tempdir().unwrap();
    let path = log_path(&dir);
    std::fs::write(
        &path,
        concat!(
            r#"{"v":1,"op":"upsert","ts":"2024-05-01T10:00:00Z","id":"tx-real01","data":{"title":"real","status":"backlog"}}"#,
            "\n",
            r#"{"v":1,"op":"dep_add","ts":"2024-05-01T10:00:00Z","blockerId":"tx-real01","blockedId":"tx-ghost1"}"#,
            "\n",
        ),
    )
    .unwrap();

    let dst = side();
    let err = dst.engine.import(&path).unwrap_err();
    assert!(err.is_not_found(), "unexpected error: {err}");
    assert!(all_tasks(&dst).is_empty());
    assert!(dst.store.dependencies().unwrap().is_empty());
}

#[test]
fn test_lone_dep_remove_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let path = log_path(&dir);
    let dst = side();
    let a = dst.store.create(NewTask::new("a")).unwrap();
    let b = dst.store.create(NewTask::new("b")).unwrap();

    // One removal of an edge that never existed, one between unknown tasks.
    let at = dst.clock.now();
    std::fs::write(
        &path,
        render_ops(&[
            SyncOp::dep_remove(a.id.clone(), b.id.clone(), at),
            SyncOp::dep_remove(id("tx-ghost1"), id("tx-ghost2"), at),
        ])
        .unwrap(),
    )
    .unwrap();

    let result = dst.engine.import(&path).unwrap();
    assert_eq!(
        result,
        ImportResult {
            deps_skipped: 2,
            ..ImportResult::default()
        }
    );
    assert!(dst.store.dependencies().unwrap().is_empty());
    assert_eq!(all_tasks(&dst).len(), 2);
}

#[test]
fn test_invalid_line_aborts_without_partial_apply() {
    let dir = tempfile::tempdir().unwrap();
    let path = log_path(&dir);
    std::fs::write(
        &path,
        concat!(
            r#"{"v":1,"op":"upsert","ts":"2024-05-01T10:00:00Z","id":"tx-good01","data":{"title":"good","status":"backlog"}}"#,
            "\n",
            r#"{"v":1,"op":"upsert","ts":"2024-05-01T10:00:00Z","id":"tx-bad001","data":{"title":"bad","status":"someday"}}"#,
            "\n",
        ),
    )
    .unwrap();

    let dst = side();
    let err = dst.engine.import(&path).unwrap_err();
    match err {
        TasklaneError::Validation(msg) => assert!(msg.contains("line 2"), "{msg}"),
        other => panic!("unexpected error: {other}"),
    }
    assert!(all_tasks(&dst).is_empty());
}

#[test]
fn test_missing_or_blank_file_is_noop() {
    let dir = tempfile::tempdir().unwrap();
    let dst = side();

    let missing = dst.engine.import(&dir.path().join("absent.jsonl")).unwrap();
    assert_eq!(missing, ImportResult::default());

    let blank = dir.path().join("blank.jsonl");
    std::fs::write(&blank, "\n  \n").unwrap();
    assert_eq!(dst.engine.import(&blank).unwrap(), ImportResult::default());
}

#[test]
fn test_newer_delete_removes_task_and_edges() {
    let dir = tempfile::tempdir().unwrap();
    let path = log_path(&dir);
    let dst = side();
    let (_root, a, b) = seed(&dst);

    let later = dst.clock.now() + Duration::seconds(30);
    std::fs::write(&path, render_ops(&[SyncOp::delete(b.clone(), later)]).unwrap()).unwrap();

    let result = dst.engine.import(&path).unwrap();
    assert_eq!(result.imported, 1);
    assert!(dst.store.get(&b).unwrap().is_none());
    assert!(dst.store.dependents(&a).unwrap().is_empty());

    // Deleting what is already gone is skipped.
    assert_eq!(dst.engine.import(&path).unwrap().skipped, 1);
}

#[test]
fn test_older_delete_is_a_conflict() {
    let dir = tempfile::tempdir().unwrap();
    let path = log_path(&dir);
    let dst = side();
    let task = dst.store.create(NewTask::new("keep me")).unwrap();

    let earlier = task.updated_at - Duration::seconds(30);
    std::fs::write(&path, render_ops(&[SyncOp::delete(task.id.clone(), earlier)]).unwrap()).unwrap();

    assert_eq!(dst.engine.import(&path).unwrap().conflicts, 1);
    assert!(dst.store.get(&task.id).unwrap().is_some());
}

fn write_history(path: &Path) {
    let lines = [
        r#"{"v":1,"op":"upsert","ts":"2024-05-01T10:00:00Z","id":"tx-aaaaaa","data":{"title":"v1","status":"backlog"}}"#,
        r#"{"v":1,"op":"upsert","ts":"2024-05-01T10:01:00Z","id":"tx-aaaaaa","data":{"title":"v2","status":"ready"}}"#,
        r#"{"v":1,"op":"upsert","ts":"2024-05-01T10:00:00Z","id":"tx-bbbbbb","data":{"title":"b","status":"backlog"}}"#,
        r#"{"v":1,"op":"upsert","ts":"2024-05-01T10:00:00Z","id":"tx-cccccc","data":{"title":"c","status":"backlog"}}"#,
        r#"{"v":1,"op":"delete","ts":"2024-05-01T10:02:00Z","id":"tx-bbbbbb"}"#,
        r#"{"v":1,"op":"dep_add","ts":"2024-05-01T10:00:00Z","blockerId":"tx-aaaaaa","blockedId":"tx-cccccc"}"#,
        r#"{"v":1,"op":"dep_add","ts":"2024-05-01T10:00:00Z","blockerId":"tx-cccccc","blockedId":"tx-aaaaaa"}"#,
        r#"{"v":1,"op":"dep_remove","ts":"2024-05-01T10:03:00Z","blockerId":"tx-cccccc","blockedId":"tx-aaaaaa"}"#,
    ];
    std::fs::write(path, lines.join("\n") + "\n").unwrap();
}

#[test]
fn test_compact_keeps_net_effect() {
    let dir = tempfile::tempdir().unwrap();
    let history = dir.path().join("history.jsonl");
    let compacted = dir.path().join("compacted.jsonl");
    write_history(&history);
    write_history(&compacted);

    let engine = side().engine;
    let result = engine.compact(&compacted).unwrap();
    assert_eq!(result.before, 8);
    assert_eq!(result.after, 3);

    let from_history = side();
    from_history.engine.import(&history).unwrap();
    let from_compacted = side();
    from_compacted.engine.import(&compacted).unwrap();

    assert_eq!(all_tasks(&from_history), all_tasks(&from_compacted));
    assert_eq!(
        from_history.store.dependencies().unwrap(),
        from_compacted.store.dependencies().unwrap()
    );
    let titles: Vec<String> = all_tasks(&from_compacted)
        .into_iter()
        .map(|t| t.title)
        .collect();
    assert!(titles.contains(&"v2".to_string()));
    assert!(!titles.contains(&"b".to_string()));

    // Compacting again changes nothing.
    assert_eq!(engine.compact(&compacted).unwrap().before, 3);
    assert_eq!(engine.compact(&compacted).unwrap().after, 3);
}

#[test]
fn test_compact_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let engine = side().engine;
    let result = engine.compact(&dir.path().join("absent.jsonl")).unwrap();
    assert_eq!((result.before, result.after), (0, 0));
    assert!(!dir.path().join("absent.jsonl").exists());
}

#[test]
fn test_status_compares_effective_state() {
    let dir = tempfile::tempdir().unwrap();
    let path = log_path(&dir);
    let src = side();
    let (_root, a, _b) = seed(&src);

    // Nothing exported yet.
    let status = src.engine.status(&path).unwrap();
    assert!(status.is_dirty);
    assert_eq!(status.jsonl_task_count, 0);
    assert!(status.last_export.is_none());

    src.engine.export(&path).unwrap();
    let status = src.engine.status(&path).unwrap();
    assert!(!status.is_dirty);
    assert_eq!((status.db_task_count, status.db_dep_count), (3, 1));
    assert_eq!((status.jsonl_task_count, status.jsonl_dep_count), (3, 1));
    assert_eq!(status.last_export, Some(src.clock.now()));

    // Repeated history does not make the log look different.
    let text = std::fs::read_to_string(&path).unwrap();
    std::fs::write(&path, format!("{text}{text}")).unwrap();
    let status = src.engine.status(&path).unwrap();
    assert!(!status.is_dirty);
    assert_eq!(status.jsonl_task_count, 3);

    src.clock.advance(Duration::seconds(1));
    src.store
        .update(
            &a,
            TaskPatch {
                score: Some(9.0),
                ..TaskPatch::default()
            },
        )
        .unwrap();
    assert!(src.engine.status(&path).unwrap().is_dirty);
}

#[test]
fn test_empty_database_and_missing_file_are_clean() {
    let dir = tempfile::tempdir().unwrap();
    let status = side().engine.status(&log_path(&dir)).unwrap();
    assert!(!status.is_dirty);
    assert!(!status.auto_sync_enabled);
}

#[test]
fn test_auto_export_hook_follows_flag() {
    let dir = tempfile::tempdir().unwrap();
    let path = log_path(&dir);
    let tmp = tempfile::tempdir().unwrap();
    let db = Database::open(&tmp.path().join("tasklane.db")).unwrap();
    let clock = Arc::new(ManualClock::starting_now());
    let engine = Arc::new(SyncEngine::new(db.clone(), clock.clone()));
    let store = SqliteTaskStore::new(db, clock)
        .with_hook(Arc::new(AutoExportHook::new(engine.clone(), path.clone())));

    store.create(NewTask::new("before")).unwrap();
    assert!(!path.exists());

    engine.enable_auto_sync().unwrap();
    let second = store.create(NewTask::new("after")).unwrap();
    let text = std::fs::read_to_string(&path).unwrap();
    assert_eq!(text.lines().count(), 2);
    assert!(text.contains(second.id.as_str()));

    engine.disable_auto_sync().unwrap();
    store.remove(&second.id).unwrap();
    let text = std::fs::read_to_string(&path).unwrap();
    assert!(text.contains(second.id.as_str()));
}

use crate::fingerprint::Snapshot;
use crate::ops::{parse_ops, render_ops, OpKind, SyncOp, TaskData};
use crate::replay::{collapse, compact_ops, parent_first_order, EffectiveState};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tasklane_core::time::{format_ts, parse_ts};
use tasklane_core::{Clock, TaskId, TasklaneError, TasklaneResult};
use tasklane_store::{rows, Database, Dependency, Task, TaskStatus};

const AUTO_SYNC_KEY: &str = "auto_sync";
const LAST_EXPORT_KEY: &str = "last_export_at";

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Counts from one import. Conflicts are reported here, never raised.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportResult {
    /// Task upserts and deletes applied.
    pub imported: u64,
    /// Task ops with the same timestamp as the local row, or deletes of absent tasks.
    pub skipped: u64,
    /// Task ops older than the local row; the local row was kept.
    pub conflicts: u64,
    pub deps_added: u64,
    pub deps_removed: u64,
    /// Additions of existing edges and removals of absent ones.
    pub deps_skipped: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportResult {
    pub path: PathBuf,
    pub op_count: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CompactResult {
    pub before: u64,
    pub after: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub db_task_count: u64,
    pub db_dep_count: u64,
    /// Live tasks after replaying the log, not raw line counts.
    pub jsonl_task_count: u64,
    pub jsonl_dep_count: u64,
    pub is_dirty: bool,
    pub auto_sync_enabled: bool,
    pub last_export: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// sync_config helpers
// ---------------------------------------------------------------------------

fn get_config(conn: &Connection, key: &str) -> TasklaneResult<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT value FROM sync_config WHERE key = ?1",
            [key],
            |row| row.get(0),
        )
        .optional()?)
}

fn set_config(conn: &Connection, key: &str, value: &str) -> TasklaneResult<()> {
    conn.execute(
        "INSERT INTO sync_config (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;
    Ok(())
}

/// Replace `path` with `contents` via a temp file in the same directory.
fn write_atomically(path: &Path, contents: &str) -> TasklaneResult<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(contents.as_bytes())?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

fn decode(snapshot: &Snapshot, path: &Path) -> TasklaneResult<Vec<SyncOp>> {
    let text = std::str::from_utf8(&snapshot.bytes).map_err(|e| {
        TasklaneError::Validation(format!("{} is not valid UTF-8: {e}", path.display()))
    })?;
    parse_ops(text)
}

fn db_differs(effective: &EffectiveState, tasks: &[Task], deps: &[Dependency]) -> bool {
    if effective.tasks.len() != tasks.len() {
        return true;
    }
    let tasks_match = tasks.iter().all(|task| {
        effective
            .tasks
            .get(&task.id)
            .is_some_and(|data| data.same_content(task))
    });
    let edges: BTreeSet<(TaskId, TaskId)> = deps
        .iter()
        .map(|d| (d.blocker_id.clone(), d.blocked_id.clone()))
        .collect();
    !tasks_match || edges != effective.edges
}

// ---------------------------------------------------------------------------
// SyncEngine
// ---------------------------------------------------------------------------

/// Moves task and dependency state between the database and a JSONL log.
pub struct SyncEngine {
    db: Database,
    clock: Arc<dyn Clock>,
    #[cfg(test)]
    before_commit: Option<Box<dyn Fn(&Path) + Send + Sync>>,
}

impl SyncEngine {
    pub fn new(db: Database, clock: Arc<dyn Clock>) -> Self {
        Self {
            db,
            clock,
            #[cfg(test)]
            before_commit: None,
        }
    }

    /// Write every task as an `upsert` and every edge as a `dep_add`.
    pub fn export(&self, path: &Path) -> TasklaneResult<ExportResult> {
        let (tasks, deps) = self.db.with_conn(|conn| {
            Ok((rows::load_tasks(conn)?, rows::load_dependencies(conn)?))
        })?;

        let mut ops: Vec<SyncOp> = tasks.iter().map(SyncOp::upsert).collect();
        ops.extend(deps.iter().map(SyncOp::dep_add));
        write_atomically(path, &render_ops(&ops)?)?;

        let now = self.clock.now();
        self.db
            .with_conn(|conn| set_config(conn, LAST_EXPORT_KEY, &format_ts(now)))?;

        tracing::info!(
            path = %path.display(),
            tasks = tasks.len(),
            dependencies = deps.len(),
            "Exported"
        );
        Ok(ExportResult {
            path: path.to_path_buf(),
            op_count: ops.len() as u64,
        })
    }

    /// Merge a JSONL log into the database.
    ///
    /// Runs as one `BEGIN IMMEDIATE` transaction: either every op is applied
    /// or, on a validation failure, a dependency on an unknown task, or a
    /// change to the file while the import was running, nothing is.
    pub fn import(&self, path: &Path) -> TasklaneResult<ImportResult> {
        let snapshot = Snapshot::read(path)?;
        if snapshot.bytes.iter().all(u8::is_ascii_whitespace) {
            tracing::debug!(path = %path.display(), "Nothing to import");
            return Ok(ImportResult::default());
        }
        let winners = collapse(decode(&snapshot, path)?);

        let outcome = self.db.immediate(|tx| {
            let result = apply_batch(tx, winners)?;
            #[cfg(test)]
            if let Some(hook) = &self.before_commit {
                hook(path);
            }
            snapshot.ensure_unchanged(path)?;
            Ok(result)
        });

        match &outcome {
            Ok(r) => tracing::info!(
                path = %path.display(),
                imported = r.imported,
                skipped = r.skipped,
                conflicts = r.conflicts,
                deps_added = r.deps_added,
                deps_removed = r.deps_removed,
                deps_skipped = r.deps_skipped,
                "Imported"
            ),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "Import rolled back"),
        }
        outcome
    }

    /// Rewrite the log as its net effect: latest upsert per task, live edges only.
    pub fn compact(&self, path: &Path) -> TasklaneResult<CompactResult> {
        let snapshot = Snapshot::read(path)?;
        if !snapshot.exists() {
            return Ok(CompactResult::default());
        }
        let ops = decode(&snapshot, path)?;
        let before = ops.len() as u64;
        let kept = compact_ops(ops);
        let after = kept.len() as u64;

        snapshot.ensure_unchanged(path)?;
        write_atomically(path, &render_ops(&kept)?)?;
        tracing::info!(path = %path.display(), before, after, "Compacted");
        Ok(CompactResult { before, after })
    }

    pub fn status(&self, path: &Path) -> TasklaneResult<SyncStatus> {
        let (tasks, deps, auto_sync, last_export) = self.db.with_conn(|conn| {
            Ok((
                rows::load_tasks(conn)?,
                rows::load_dependencies(conn)?,
                get_config(conn, AUTO_SYNC_KEY)?,
                get_config(conn, LAST_EXPORT_KEY)?,
            ))
        })?;

        let snapshot = Snapshot::read(path)?;
        let effective = if snapshot.exists() {
            EffectiveState::from_ops(decode(&snapshot, path)?)
        } else {
            EffectiveState::default()
        };

        Ok(SyncStatus {
            db_task_count: tasks.len() as u64,
            db_dep_count: deps.len() as u64,
            jsonl_task_count: effective.tasks.len() as u64,
            jsonl_dep_count: effective.edges.len() as u64,
            is_dirty: db_differs(&effective, &tasks, &deps),
            auto_sync_enabled: auto_sync.as_deref() == Some("true"),
            last_export: last_export.as_deref().map(parse_ts).transpose()?,
        })
    }

    pub fn enable_auto_sync(&self) -> TasklaneResult<()> {
        self.db
            .with_conn(|conn| set_config(conn, AUTO_SYNC_KEY, "true"))?;
        tracing::info!("Auto-sync enabled");
        Ok(())
    }

    pub fn disable_auto_sync(&self) -> TasklaneResult<()> {
        self.db
            .with_conn(|conn| set_config(conn, AUTO_SYNC_KEY, "false"))?;
        tracing::info!("Auto-sync disabled");
        Ok(())
    }

    pub fn is_auto_sync_enabled(&self) -> TasklaneResult<bool> {
        let value = self
            .db
            .with_conn(|conn| get_config(conn, AUTO_SYNC_KEY))?;
        Ok(value.as_deref() == Some("true"))
    }
}

// ---------------------------------------------------------------------------
// Import application
// ---------------------------------------------------------------------------

struct PendingUpsert {
    ts: DateTime<Utc>,
    data: TaskData,
    local: Option<Task>,
}

/// Apply collapsed ops: upserts parent-first, then deletes, then edges.
fn apply_batch(conn: &Connection, winners: Vec<SyncOp>) -> TasklaneResult<ImportResult> {
    let mut result = ImportResult::default();
    let mut upserts: BTreeMap<TaskId, PendingUpsert> = BTreeMap::new();
    let mut deletes: Vec<(TaskId, DateTime<Utc>)> = Vec::new();
    let mut edge_ops: Vec<(OpKind, DateTime<Utc>)> = Vec::new();

    for op in winners {
        match op.kind {
            OpKind::Upsert { id, data } => {
                let local = rows::load_task(conn, &id)?;
                match local.as_ref().map(|l| op.ts.cmp(&l.updated_at)) {
                    None | Some(Ordering::Greater) => {
                        upserts.insert(
                            id,
                            PendingUpsert {
                                ts: op.ts,
                                data,
                                local,
                            },
                        );
                    }
                    Some(Ordering::Less) => {
                        tracing::debug!(task_id = %id, "Local row is newer, keeping it");
                        result.conflicts += 1;
                    }
                    Some(Ordering::Equal) => result.skipped += 1,
                }
            }
            OpKind::Delete { id } => deletes.push((id, op.ts)),
            kind @ (OpKind::DepAdd { .. } | OpKind::DepRemove { .. }) => {
                edge_ops.push((kind, op.ts));
            }
        }
    }

    // Parent references are foreign keys: insert parents before children.
    let parents: BTreeMap<TaskId, Option<TaskId>> = upserts
        .iter()
        .map(|(id, p)| (id.clone(), p.data.parent_id.clone()))
        .collect();
    for id in parent_first_order(&parents)? {
        let Some(pending) = upserts.remove(&id) else {
            continue;
        };
        let PendingUpsert { ts, data, local } = pending;

        let parent_id = match data.parent_id {
            Some(parent) if parents.contains_key(&parent) || rows::task_exists(conn, &parent)? => {
                Some(parent)
            }
            Some(parent) => {
                tracing::warn!(task_id = %id, parent_id = %parent, "Unknown parent, importing as root");
                None
            }
            None => None,
        };
        let completed_at = if data.status == TaskStatus::Done {
            data.completed_at
                .or_else(|| local.as_ref().and_then(|l| l.completed_at))
                .or(Some(ts))
        } else {
            None
        };
        let task = Task {
            created_at: data
                .created_at
                .or_else(|| local.as_ref().map(|l| l.created_at))
                .unwrap_or(ts),
            id,
            title: data.title,
            description: data.description,
            status: data.status,
            score: data.score,
            parent_id,
            updated_at: ts,
            completed_at,
            metadata: data.metadata,
        };
        rows::upsert_task(conn, &task)?;
        result.imported += 1;
    }

    for (id, ts) in deletes {
        match rows::load_task(conn, &id)? {
            None => result.skipped += 1,
            Some(local) => match ts.cmp(&local.updated_at) {
                Ordering::Greater => {
                    rows::delete_task(conn, &id)?;
                    result.imported += 1;
                }
                Ordering::Less => result.conflicts += 1,
                Ordering::Equal => result.skipped += 1,
            },
        }
    }

    for (kind, ts) in edge_ops {
        match kind {
            OpKind::DepAdd {
                blocker_id,
                blocked_id,
            } => {
                for endpoint in [&blocker_id, &blocked_id] {
                    if !rows::task_exists(conn, endpoint)? {
                        return Err(TasklaneError::not_found("task", endpoint));
                    }
                }
                if rows::insert_dependency(conn, &blocker_id, &blocked_id, ts)? {
                    result.deps_added += 1;
                } else {
                    result.deps_skipped += 1;
                }
            }
            OpKind::DepRemove {
                blocker_id,
                blocked_id,
            } => {
                if rows::delete_dependency(conn, &blocker_id, &blocked_id)? {
                    result.deps_removed += 1;
                } else {
                    result.deps_skipped += 1;
                }
            }
            OpKind::Upsert { .. } | OpKind::Delete { .. } => {}
        }
    }

    Ok(result)
}

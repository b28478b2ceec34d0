//! Row-level SQL for tasks, dependency edges and the claim cleanup a task delete needs.
//!
//! These functions take a plain `&Connection` so they can run either in
//! autocommit mode or inside a caller-owned transaction (the sync importer
//! applies a whole batch through them under one `BEGIN IMMEDIATE`).

use crate::db::{json_column, opt_ts_column, ts_column};
use crate::task::{Dependency, Task, TaskStatus};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashSet;
use tasklane_core::time::format_ts;
use tasklane_core::{TaskId, TasklaneResult, WorkerId};

const TASK_COLUMNS: &str = "id, title, description, status, parent_id, score, \
                            created_at, updated_at, completed_at, metadata";

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    let status: String = row.get(3)?;
    let status = status
        .parse::<TaskStatus>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))?;
    Ok(Task {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        status,
        parent_id: row.get(4)?,
        score: row.get(5)?,
        created_at: ts_column(row, 6)?,
        updated_at: ts_column(row, 7)?,
        completed_at: opt_ts_column(row, 8)?,
        metadata: json_column(row, 9)?,
    })
}

fn dependency_from_row(row: &Row<'_>) -> rusqlite::Result<Dependency> {
    Ok(Dependency {
        blocker_id: row.get(0)?,
        blocked_id: row.get(1)?,
        created_at: ts_column(row, 2)?,
    })
}

fn query_tasks(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> TasklaneResult<Vec<Task>> {
    let mut stmt = conn.prepare(sql)?;
    let tasks = stmt
        .query_map(params, task_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(tasks)
}

// --- Tasks ---

pub fn load_task(conn: &Connection, id: &TaskId) -> TasklaneResult<Option<Task>> {
    let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1");
    Ok(conn.query_row(&sql, [id], task_from_row).optional()?)
}

/// All tasks, most urgent first.
pub fn load_tasks(conn: &Connection) -> TasklaneResult<Vec<Task>> {
    let sql = format!(
        "SELECT {TASK_COLUMNS} FROM tasks ORDER BY score DESC, created_at ASC, id ASC"
    );
    query_tasks(conn, &sql, [])
}

/// Tasks matching an optional status and an optional parent constraint.
pub fn load_tasks_filtered(
    conn: &Connection,
    status: Option<TaskStatus>,
    parent: Option<Option<&TaskId>>,
) -> TasklaneResult<Vec<Task>> {
    let mut clauses = Vec::new();
    let mut args: Vec<String> = Vec::new();
    if let Some(status) = status {
        args.push(status.as_str().to_string());
        clauses.push(format!("status = ?{}", args.len()));
    }
    match parent {
        Some(Some(parent)) => {
            args.push(parent.to_string());
            clauses.push(format!("parent_id = ?{}", args.len()));
        }
        Some(None) => clauses.push("parent_id IS NULL".to_string()),
        None => {}
    }
    let where_sql = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };
    let sql = format!(
        "SELECT {TASK_COLUMNS} FROM tasks {where_sql} \
         ORDER BY score DESC, created_at ASC, id ASC"
    );
    query_tasks(conn, &sql, rusqlite::params_from_iter(args))
}

pub fn task_exists(conn: &Connection, id: &TaskId) -> TasklaneResult<bool> {
    let found: Option<i64> = conn
        .query_row("SELECT 1 FROM tasks WHERE id = ?1", [id], |row| row.get(0))
        .optional()?;
    Ok(found.is_some())
}

pub fn count_tasks(conn: &Connection) -> TasklaneResult<u64> {
    let n: i64 = conn.query_row("SELECT COUNT(*) FROM tasks", [], |row| row.get(0))?;
    Ok(n.max(0) as u64)
}

pub fn insert_task(conn: &Connection, task: &Task) -> TasklaneResult<()> {
    conn.execute(
        "INSERT INTO tasks (id, title, description, status, parent_id, score,
                            created_at, updated_at, completed_at, metadata)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            task.id,
            task.title,
            task.description,
            task.status.as_str(),
            task.parent_id,
            task.score,
            format_ts(task.created_at),
            format_ts(task.updated_at),
            task.completed_at.map(format_ts),
            serde_json::to_string(&task.metadata)?,
        ],
    )?;
    Ok(())
}

/// Insert the task, or overwrite every column of an existing row with the same id.
pub fn upsert_task(conn: &Connection, task: &Task) -> TasklaneResult<()> {
    conn.execute(
        "INSERT INTO tasks (id, title, description, status, parent_id, score,
                            created_at, updated_at, completed_at, metadata)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
         ON CONFLICT(id) DO UPDATE SET
            title = excluded.title,
            description = excluded.description,
            status = excluded.status,
            parent_id = excluded.parent_id,
            score = excluded.score,
            created_at = excluded.created_at,
            updated_at = excluded.updated_at,
            completed_at = excluded.completed_at,
            metadata = excluded.metadata",
        params![
            task.id,
            task.title,
            task.description,
            task.status.as_str(),
            task.parent_id,
            task.score,
            format_ts(task.created_at),
            format_ts(task.updated_at),
            task.completed_at.map(format_ts),
            serde_json::to_string(&task.metadata)?,
        ],
    )?;
    Ok(())
}

/// Overwrite the mutable columns of an existing task. Returns false if no row matched.
pub fn write_task(conn: &Connection, task: &Task) -> TasklaneResult<bool> {
    let changed = conn.execute(
        "UPDATE tasks SET title = ?2, description = ?3, status = ?4, parent_id = ?5,
                score = ?6, updated_at = ?7, completed_at = ?8, metadata = ?9
         WHERE id = ?1",
        params![
            task.id,
            task.title,
            task.description,
            task.status.as_str(),
            task.parent_id,
            task.score,
            format_ts(task.updated_at),
            task.completed_at.map(format_ts),
            serde_json::to_string(&task.metadata)?,
        ],
    )?;
    Ok(changed > 0)
}

/// Hard-delete a task.
///
/// Children are detached and edges cascade. Claim rows are history and stay;
/// an active claim on the task is expired and its holder goes idle if that
/// was its last claim.
pub fn delete_task(conn: &Connection, id: &TaskId) -> TasklaneResult<bool> {
    let holders: Vec<WorkerId> = {
        let mut stmt = conn.prepare(
            "SELECT worker_id FROM task_claims WHERE task_id = ?1 AND status = 'active'",
        )?;
        let rows = stmt.query_map([id], |row| row.get(0))?;
        rows.collect::<Result<_, _>>()?
    };
    let changed = conn.execute("DELETE FROM tasks WHERE id = ?1", [id])?;
    if changed == 0 {
        return Ok(false);
    }
    conn.execute(
        "UPDATE task_claims SET status = 'expired' WHERE task_id = ?1 AND status = 'active'",
        [id],
    )?;
    for worker in &holders {
        idle_if_unclaimed(conn, worker)?;
    }
    Ok(true)
}

/// Flip a busy worker back to idle once it holds no active claims.
pub fn idle_if_unclaimed(conn: &Connection, worker: &WorkerId) -> TasklaneResult<()> {
    conn.execute(
        "UPDATE workers SET status = 'idle'
         WHERE id = ?1 AND status = 'busy'
           AND NOT EXISTS (
               SELECT 1 FROM task_claims WHERE worker_id = ?1 AND status = 'active'
           )",
        [worker],
    )?;
    Ok(())
}

pub fn children(conn: &Connection, id: &TaskId) -> TasklaneResult<Vec<Task>> {
    let sql = format!(
        "SELECT {TASK_COLUMNS} FROM tasks WHERE parent_id = ?1 \
         ORDER BY score DESC, created_at ASC, id ASC"
    );
    query_tasks(conn, &sql, [id])
}

/// Parent chain of `id`, nearest first. Stops if the chain loops.
pub fn ancestors(conn: &Connection, id: &TaskId) -> TasklaneResult<Vec<Task>> {
    let mut out = Vec::new();
    let mut seen = HashSet::from([id.clone()]);
    let mut next = load_task(conn, id)?.and_then(|t| t.parent_id);
    while let Some(parent_id) = next {
        if !seen.insert(parent_id.clone()) {
            break;
        }
        match load_task(conn, &parent_id)? {
            Some(parent) => {
                next = parent.parent_id.clone();
                out.push(parent);
            }
            None => break,
        }
    }
    Ok(out)
}

// --- Dependencies ---

pub fn load_dependencies(conn: &Connection) -> TasklaneResult<Vec<Dependency>> {
    let mut stmt = conn.prepare(
        "SELECT blocker_id, blocked_id, created_at FROM task_dependencies
         ORDER BY created_at ASC, blocker_id ASC, blocked_id ASC",
    )?;
    let deps = stmt
        .query_map([], dependency_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(deps)
}

pub fn count_dependencies(conn: &Connection) -> TasklaneResult<u64> {
    let n: i64 = conn.query_row("SELECT COUNT(*) FROM task_dependencies", [], |row| {
        row.get(0)
    })?;
    Ok(n.max(0) as u64)
}

pub fn dependency_exists(
    conn: &Connection,
    blocker: &TaskId,
    blocked: &TaskId,
) -> TasklaneResult<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM task_dependencies WHERE blocker_id = ?1 AND blocked_id = ?2",
            params![blocker, blocked],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

/// Insert an edge. Returns false when it already existed.
pub fn insert_dependency(
    conn: &Connection,
    blocker: &TaskId,
    blocked: &TaskId,
    at: DateTime<Utc>,
) -> TasklaneResult<bool> {
    let changed = conn.execute(
        "INSERT OR IGNORE INTO task_dependencies (blocker_id, blocked_id, created_at)
         VALUES (?1, ?2, ?3)",
        params![blocker, blocked, format_ts(at)],
    )?;
    Ok(changed > 0)
}

/// Remove an edge. Returns false when it did not exist.
pub fn delete_dependency(
    conn: &Connection,
    blocker: &TaskId,
    blocked: &TaskId,
) -> TasklaneResult<bool> {
    let changed = conn.execute(
        "DELETE FROM task_dependencies WHERE blocker_id = ?1 AND blocked_id = ?2",
        params![blocker, blocked],
    )?;
    Ok(changed > 0)
}

/// Tasks that block `id`.
pub fn blockers(conn: &Connection, id: &TaskId) -> TasklaneResult<Vec<Task>> {
    let sql = format!(
        "SELECT {} FROM tasks t JOIN task_dependencies d ON d.blocker_id = t.id \
         WHERE d.blocked_id = ?1 ORDER BY t.score DESC, t.created_at ASC, t.id ASC",
        prefixed_columns("t")
    );
    query_tasks(conn, &sql, [id])
}

/// Tasks blocked by `id`.
pub fn dependents(conn: &Connection, id: &TaskId) -> TasklaneResult<Vec<Task>> {
    let sql = format!(
        "SELECT {} FROM tasks t JOIN task_dependencies d ON d.blocked_id = t.id \
         WHERE d.blocker_id = ?1 ORDER BY t.score DESC, t.created_at ASC, t.id ASC",
        prefixed_columns("t")
    );
    query_tasks(conn, &sql, [id])
}

fn prefixed_columns(alias: &str) -> String {
    TASK_COLUMNS
        .split(',')
        .map(|c| format!("{alias}.{}", c.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

use crate::types::{NewWorker, Worker, WorkerStatus};
use chrono::{DateTime, Duration, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::Arc;
use tasklane_core::time::format_ts;
use tasklane_core::{Clock, TasklaneError, TasklaneResult, WorkerId};
use tasklane_store::db::{json_column, ts_column};
use tasklane_store::Database;

/// Tracks worker processes and their liveness.
pub trait WorkerRegistry: Send + Sync {
    fn register_worker(&self, new: NewWorker) -> TasklaneResult<Worker>;
    fn get_worker(&self, id: &WorkerId) -> TasklaneResult<Option<Worker>>;
    fn list_workers(&self) -> TasklaneResult<Vec<Worker>>;

    /// Stamp `last_heartbeat_at = now`. A worker marked dead comes back as idle.
    fn heartbeat(&self, id: &WorkerId) -> TasklaneResult<()>;

    fn set_status(&self, id: &WorkerId, status: WorkerStatus) -> TasklaneResult<()>;

    /// Transition to dead. Returns false if the worker was already dead.
    fn mark_dead(&self, id: &WorkerId) -> TasklaneResult<bool>;

    /// Transition to dead only if the last heartbeat is still older than
    /// `stale_threshold`, checked in the same transaction as the update.
    /// Returns false if the worker heartbeated since it was found or is
    /// already dead.
    fn mark_dead_if_stale(&self, id: &WorkerId, stale_threshold: Duration) -> TasklaneResult<bool>;

    /// Live workers whose last heartbeat is older than `stale_threshold`.
    fn find_dead_workers(&self, stale_threshold: Duration) -> TasklaneResult<Vec<Worker>>;
}

const WORKER_COLUMNS: &str = "id, name, hostname, pid, status, registered_at, \
                              last_heartbeat_at, capabilities, metadata";

fn worker_from_row(row: &Row<'_>) -> rusqlite::Result<Worker> {
    let status: String = row.get(4)?;
    let status = status
        .parse::<WorkerStatus>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(e)))?;
    let pid: Option<i64> = row.get(3)?;
    Ok(Worker {
        id: row.get(0)?,
        name: row.get(1)?,
        hostname: row.get(2)?,
        pid: pid.and_then(|p| u32::try_from(p).ok()),
        status,
        registered_at: ts_column(row, 5)?,
        last_heartbeat_at: ts_column(row, 6)?,
        capabilities: json_column(row, 7)?,
        metadata: json_column(row, 8)?,
    })
}

pub(crate) fn load_worker(conn: &Connection, id: &WorkerId) -> TasklaneResult<Option<Worker>> {
    let sql = format!("SELECT {WORKER_COLUMNS} FROM workers WHERE id = ?1");
    Ok(conn.query_row(&sql, [id], worker_from_row).optional()?)
}

/// Heartbeats strictly before the returned instant are stale.
fn stale_cutoff(now: DateTime<Utc>, stale_threshold: Duration) -> TasklaneResult<String> {
    now.checked_sub_signed(stale_threshold)
        .map(format_ts)
        .ok_or_else(|| {
            TasklaneError::validation(format!(
                "stale threshold of {}s is out of range",
                stale_threshold.num_seconds()
            ))
        })
}

/// [`WorkerRegistry`] over the `workers` table.
pub struct SqliteWorkerRegistry {
    db: Database,
    clock: Arc<dyn Clock>,
}

impl SqliteWorkerRegistry {
    pub fn new(db: Database, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }
}

impl WorkerRegistry for SqliteWorkerRegistry {
    fn register_worker(&self, new: NewWorker) -> TasklaneResult<Worker> {
        if new.name.trim().is_empty() {
            return Err(TasklaneError::validation("worker name must not be empty"));
        }
        let now = self.clock.now();
        let worker = Worker {
            id: WorkerId::generate(),
            name: new.name,
            hostname: new.hostname,
            pid: new.pid,
            status: WorkerStatus::Idle,
            registered_at: now,
            last_heartbeat_at: now,
            capabilities: new.capabilities,
            metadata: new.metadata,
        };
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO workers (id, name, hostname, pid, status, registered_at,
                                      last_heartbeat_at, capabilities, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    worker.id,
                    worker.name,
                    worker.hostname,
                    worker.pid,
                    worker.status.as_str(),
                    format_ts(worker.registered_at),
                    format_ts(worker.last_heartbeat_at),
                    serde_json::to_string(&worker.capabilities)?,
                    serde_json::to_string(&worker.metadata)?,
                ],
            )?;
            Ok(())
        })?;
        tracing::info!(worker_id = %worker.id, name = %worker.name, "Worker registered");
        Ok(worker)
    }

    fn get_worker(&self, id: &WorkerId) -> TasklaneResult<Option<Worker>> {
        self.db.with_conn(|conn| load_worker(conn, id))
    }

    fn list_workers(&self) -> TasklaneResult<Vec<Worker>> {
        self.db.with_conn(|conn| {
            let sql = format!("SELECT {WORKER_COLUMNS} FROM workers ORDER BY registered_at, id");
            let mut stmt = conn.prepare(&sql)?;
            let workers = stmt
                .query_map([], worker_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(workers)
        })
    }

    fn heartbeat(&self, id: &WorkerId) -> TasklaneResult<()> {
        let now = format_ts(self.clock.now());
        // Single narrow UPDATE; never takes part in a claim transaction.
        let changed = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE workers
                 SET last_heartbeat_at = ?2,
                     status = CASE WHEN status = 'dead' THEN 'idle' ELSE status END
                 WHERE id = ?1",
                params![id, now],
            )?)
        })?;
        if changed == 0 {
            return Err(TasklaneError::not_found("worker", id));
        }
        tracing::trace!(worker_id = %id, "Heartbeat");
        Ok(())
    }

    fn set_status(&self, id: &WorkerId, status: WorkerStatus) -> TasklaneResult<()> {
        let changed = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE workers SET status = ?2 WHERE id = ?1",
                params![id, status.as_str()],
            )?)
        })?;
        if changed == 0 {
            return Err(TasklaneError::not_found("worker", id));
        }
        Ok(())
    }

    fn mark_dead(&self, id: &WorkerId) -> TasklaneResult<bool> {
        let transitioned = self.db.immediate(|tx| {
            if load_worker(tx, id)?.is_none() {
                return Err(TasklaneError::not_found("worker", id));
            }
            let changed = tx.execute(
                "UPDATE workers SET status = 'dead' WHERE id = ?1 AND status != 'dead'",
                [id],
            )?;
            Ok(changed > 0)
        })?;
        if transitioned {
            tracing::warn!(worker_id = %id, "Worker marked dead");
        }
        Ok(transitioned)
    }

    fn mark_dead_if_stale(
        &self,
        id: &WorkerId,
        stale_threshold: Duration,
    ) -> TasklaneResult<bool> {
        let cutoff = stale_cutoff(self.clock.now(), stale_threshold)?;
        let transitioned = self.db.immediate(|tx| {
            if load_worker(tx, id)?.is_none() {
                return Err(TasklaneError::not_found("worker", id));
            }
            let changed = tx.execute(
                "UPDATE workers SET status = 'dead'
                 WHERE id = ?1 AND status != 'dead' AND last_heartbeat_at < ?2",
                params![id, cutoff],
            )?;
            Ok(changed > 0)
        })?;
        if transitioned {
            tracing::warn!(worker_id = %id, "Stale worker marked dead");
        } else {
            tracing::debug!(worker_id = %id, "Worker no longer stale, left alive");
        }
        Ok(transitioned)
    }

    fn find_dead_workers(&self, stale_threshold: Duration) -> TasklaneResult<Vec<Worker>> {
        let cutoff = stale_cutoff(self.clock.now(), stale_threshold)?;
        self.db.with_conn(|conn| {
            let sql = format!(
                "SELECT {WORKER_COLUMNS} FROM workers
                 WHERE status != 'dead' AND last_heartbeat_at < ?1
                 ORDER BY last_heartbeat_at, id"
            );
            let mut stmt = conn.prepare(&sql)?;
            let workers = stmt
                .query_map([cutoff], worker_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(workers)
        })
    }
}

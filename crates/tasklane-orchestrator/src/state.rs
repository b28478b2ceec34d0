use crate::types::{OrchestratorState, OrchestratorStatePatch, OrchestratorStatus};
use rusqlite::types::Type;
use rusqlite::{params, Connection};
use tasklane_core::time::format_ts;
use tasklane_core::{TasklaneError, TasklaneResult};
use tasklane_store::db::{json_column, opt_ts_column};
use tasklane_store::Database;

/// Access to the singleton orchestrator row.
pub trait OrchestratorStateStore: Send + Sync {
    /// Current state; the row is created with defaults on first access.
    fn get(&self) -> TasklaneResult<OrchestratorState>;

    /// Apply a partial update and return the resulting state.
    fn update(&self, patch: &OrchestratorStatePatch) -> TasklaneResult<OrchestratorState>;
}

pub struct SqliteOrchestratorStateStore {
    db: Database,
}

impl SqliteOrchestratorStateStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

fn unsigned<T: TryFrom<i64>>(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: i64 = row.get(idx)?;
    T::try_from(raw).map_err(|_| rusqlite::Error::IntegralValueOutOfRange(idx, raw))
}

/// Read row 1, inserting the defaults if it does not exist yet.
///
/// Safe to call inside a caller's transaction.
pub fn load_or_init(conn: &Connection) -> TasklaneResult<OrchestratorState> {
    conn.execute("INSERT OR IGNORE INTO orchestrator_state (id) VALUES (1)", [])?;
    let state = conn.query_row(
        "SELECT status, pid, started_at, last_reconcile_at, worker_pool_size,
                reconcile_interval_seconds, heartbeat_interval_seconds,
                lease_duration_minutes, metadata
         FROM orchestrator_state WHERE id = 1",
        [],
        |row| {
            let status: String = row.get(0)?;
            let status = status.parse::<OrchestratorStatus>().map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e))
            })?;
            let pid: Option<i64> = row.get(1)?;
            Ok(OrchestratorState {
                status,
                pid: pid.and_then(|p| u32::try_from(p).ok()),
                started_at: opt_ts_column(row, 2)?,
                last_reconcile_at: opt_ts_column(row, 3)?,
                worker_pool_size: unsigned(row, 4)?,
                reconcile_interval_seconds: unsigned(row, 5)?,
                heartbeat_interval_seconds: unsigned(row, 6)?,
                lease_duration_minutes: unsigned(row, 7)?,
                metadata: json_column(row, 8)?,
            })
        },
    )?;
    Ok(state)
}

fn write_state(conn: &Connection, state: &OrchestratorState) -> TasklaneResult<()> {
    conn.execute(
        "UPDATE orchestrator_state SET status = ?1, pid = ?2, started_at = ?3,
                last_reconcile_at = ?4, worker_pool_size = ?5,
                reconcile_interval_seconds = ?6, heartbeat_interval_seconds = ?7,
                lease_duration_minutes = ?8, metadata = ?9
         WHERE id = 1",
        params![
            state.status.as_str(),
            state.pid,
            state.started_at.map(format_ts),
            state.last_reconcile_at.map(format_ts),
            state.worker_pool_size,
            state.reconcile_interval_seconds as i64,
            state.heartbeat_interval_seconds as i64,
            state.lease_duration_minutes as i64,
            serde_json::to_string(&state.metadata)?,
        ],
    )?;
    Ok(())
}

/// Longest accepted lease: one hundred years.
pub const MAX_LEASE_DURATION_MINUTES: u64 = 100 * 366 * 24 * 60;

/// Longest accepted reconcile or heartbeat interval.
pub const MAX_INTERVAL_SECONDS: u64 = u32::MAX as u64;

fn validate(state: &OrchestratorState) -> TasklaneResult<()> {
    let checks = [
        ("worker_pool_size", u64::from(state.worker_pool_size), u64::from(u32::MAX)),
        (
            "reconcile_interval_seconds",
            state.reconcile_interval_seconds,
            MAX_INTERVAL_SECONDS,
        ),
        (
            "heartbeat_interval_seconds",
            state.heartbeat_interval_seconds,
            MAX_INTERVAL_SECONDS,
        ),
        (
            "lease_duration_minutes",
            state.lease_duration_minutes,
            MAX_LEASE_DURATION_MINUTES,
        ),
    ];
    for (field, value, max) in checks {
        if value == 0 || value > max {
            return Err(TasklaneError::Validation(format!(
                "{field} must be between 1 and {max}, got {value}"
            )));
        }
    }
    Ok(())
}

impl OrchestratorStateStore for SqliteOrchestratorStateStore {
    fn get(&self) -> TasklaneResult<OrchestratorState> {
        self.db.with_conn(load_or_init)
    }

    fn update(&self, patch: &OrchestratorStatePatch) -> TasklaneResult<OrchestratorState> {
        let state = self.db.immediate(|tx| {
            let mut state = load_or_init(tx)?;
            if patch.is_empty() {
                return Ok(state);
            }
            patch.apply_to(&mut state);
            validate(&state)?;
            write_state(tx, &state)?;
            Ok(state)
        })?;
        tracing::debug!(status = %state.status, pid = ?state.pid, "Orchestrator state updated");
        Ok(state)
    }
}

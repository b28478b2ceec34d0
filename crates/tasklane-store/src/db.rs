use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{Connection, Row, Transaction, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tasklane_core::time::parse_ts;
use tasklane_core::TasklaneResult;

// --- Schema ---

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS tasks (
    id           TEXT PRIMARY KEY,
    title        TEXT NOT NULL,
    description  TEXT NOT NULL DEFAULT '',
    status       TEXT NOT NULL DEFAULT 'backlog',
    parent_id    TEXT REFERENCES tasks(id) ON DELETE SET NULL,
    score        REAL NOT NULL DEFAULT 0,
    created_at   TEXT NOT NULL,
    updated_at   TEXT NOT NULL,
    completed_at TEXT,
    metadata     TEXT NOT NULL DEFAULT '{}'
);
CREATE INDEX IF NOT EXISTS idx_tasks_parent ON tasks(parent_id);
CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);

CREATE TABLE IF NOT EXISTS task_dependencies (
    blocker_id TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
    blocked_id TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
    created_at TEXT NOT NULL,
    UNIQUE (blocker_id, blocked_id)
);
CREATE INDEX IF NOT EXISTS idx_deps_blocked ON task_dependencies(blocked_id);

CREATE TABLE IF NOT EXISTS workers (
    id                TEXT PRIMARY KEY,
    name              TEXT NOT NULL,
    hostname          TEXT NOT NULL DEFAULT '',
    pid               INTEGER,
    status            TEXT NOT NULL DEFAULT 'idle',
    registered_at     TEXT NOT NULL,
    last_heartbeat_at TEXT NOT NULL,
    capabilities      TEXT NOT NULL DEFAULT '[]',
    metadata          TEXT NOT NULL DEFAULT '{}'
);

CREATE TABLE IF NOT EXISTS task_claims (
    id               TEXT PRIMARY KEY,
    task_id          TEXT NOT NULL,
    worker_id        TEXT NOT NULL REFERENCES workers(id),
    status           TEXT NOT NULL DEFAULT 'active',
    claimed_at       TEXT NOT NULL,
    lease_expires_at TEXT NOT NULL,
    renewed_count    INTEGER NOT NULL DEFAULT 0
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_claims_one_active
    ON task_claims(task_id) WHERE status = 'active';
CREATE INDEX IF NOT EXISTS idx_claims_worker ON task_claims(worker_id, status);

CREATE TABLE IF NOT EXISTS orchestrator_state (
    id                         INTEGER PRIMARY KEY CHECK (id = 1),
    status                     TEXT NOT NULL DEFAULT 'stopped',
    pid                        INTEGER,
    started_at                 TEXT,
    last_reconcile_at          TEXT,
    worker_pool_size           INTEGER NOT NULL DEFAULT 1,
    reconcile_interval_seconds INTEGER NOT NULL DEFAULT 60,
    heartbeat_interval_seconds INTEGER NOT NULL DEFAULT 30,
    lease_duration_minutes     INTEGER NOT NULL DEFAULT 30,
    metadata                   TEXT NOT NULL DEFAULT '{}'
);

CREATE TABLE IF NOT EXISTS sync_config (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
";

/// Default `busy_timeout` applied when none is configured.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

fn apply_pragmas(conn: &Connection, busy_timeout: Duration) -> rusqlite::Result<()> {
    conn.busy_timeout(busy_timeout)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA foreign_keys = ON;",
    )
}

/// Shared handle to the tasklane SQLite database.
///
/// Cloning is cheap; all clones serialize on the same connection. Separate
/// processes open their own handle on the same file and are serialized by
/// SQLite's locking (`BEGIN IMMEDIATE` for writers that need it).
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").field("path", &self.path).finish()
    }
}

impl Database {
    /// Open (or create) the database at `path` with the default busy timeout.
    pub fn open(path: &Path) -> TasklaneResult<Self> {
        Self::open_with_timeout(path, DEFAULT_BUSY_TIMEOUT)
    }

    pub fn open_with_timeout(path: &Path, busy_timeout: Duration) -> TasklaneResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        apply_pragmas(&conn, busy_timeout)?;
        conn.execute_batch(SCHEMA)?;
        tracing::debug!(path = %path.display(), "Database opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path.to_path_buf()),
        })
    }

    /// Private in-memory database, mostly for tests.
    pub fn open_in_memory() -> TasklaneResult<Self> {
        let conn = Connection::open_in_memory()?;
        apply_pragmas(&conn, DEFAULT_BUSY_TIMEOUT)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        })
    }

    /// File backing this handle, `None` for in-memory databases.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Run `f` against the connection in autocommit mode.
    pub fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> TasklaneResult<T>,
    ) -> TasklaneResult<T> {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Run `f` inside a `BEGIN IMMEDIATE` transaction.
    ///
    /// The write lock is taken up front, so the read-check-write sequence in
    /// `f` cannot interleave with another writer. Commits when `f` returns
    /// `Ok`; any error rolls everything back.
    pub fn immediate<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> TasklaneResult<T>,
    ) -> TasklaneResult<T> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }
}

// --- Column helpers ---

/// Read a required timestamp column.
pub fn ts_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_ts(&raw).map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Read a nullable timestamp column.
pub fn opt_ts_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|r| {
        parse_ts(&r)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

/// Read a JSON-encoded text column.
pub fn json_column<T: serde::de::DeserializeOwned>(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

use crate::state::load_or_init;
use crate::types::{Claim, ClaimStatus, WorkerStatus};
use crate::workers::load_worker;
use chrono::{DateTime, Duration, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::Arc;
use tasklane_core::time::format_ts;
use tasklane_core::{ClaimId, Clock, TaskId, TasklaneError, TasklaneResult, WorkerId};
use tasklane_store::db::ts_column;
use tasklane_store::rows::{self, idle_if_unclaimed};
use tasklane_store::Database;

/// Heartbeat age, in seconds, after which a claim holder is treated as dead.
pub const DEFAULT_STALE_THRESHOLD_SECONDS: i64 = 300;

/// Lease-based exclusive task acquisition.
pub trait ClaimManager: Send + Sync {
    /// Atomically acquire `task_id` for `worker_id`.
    ///
    /// An active claim held by a live worker within its lease wins
    /// ([`TasklaneError::AlreadyClaimed`]). An active claim whose lease ran
    /// out, or whose holder is dead, is expired and replaced in the same
    /// transaction.
    fn claim(&self, task_id: &TaskId, worker_id: &WorkerId) -> TasklaneResult<Claim>;

    /// Push the lease out to `now + lease duration` and bump `renewed_count`.
    fn renew(&self, claim_id: &ClaimId) -> TasklaneResult<Claim>;

    /// Give the task back. Releasing an already released claim is a no-op.
    fn release(&self, claim_id: &ClaimId) -> TasklaneResult<Claim>;

    fn get_claim(&self, claim_id: &ClaimId) -> TasklaneResult<Option<Claim>>;
    fn active_claim(&self, task_id: &TaskId) -> TasklaneResult<Option<Claim>>;

    /// Full claim history of a task, oldest first.
    fn claims_for_task(&self, task_id: &TaskId) -> TasklaneResult<Vec<Claim>>;
    fn active_claims_for_worker(&self, worker_id: &WorkerId) -> TasklaneResult<Vec<Claim>>;

    /// Expire every active claim past its lease. Returns the claims this call expired.
    fn expire_stale_leases(&self) -> TasklaneResult<Vec<Claim>>;

    /// Expire every active claim held by `worker_id` while that worker is
    /// marked dead. A worker that heartbeated back to life keeps its claims.
    /// Returns the claims this call expired.
    fn expire_claims_of_worker(&self, worker_id: &WorkerId) -> TasklaneResult<Vec<Claim>>;
}

const CLAIM_COLUMNS: &str =
    "id, task_id, worker_id, status, claimed_at, lease_expires_at, renewed_count";

fn claim_from_row(row: &Row<'_>) -> rusqlite::Result<Claim> {
    let status: String = row.get(3)?;
    let status = status
        .parse::<ClaimStatus>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))?;
    Ok(Claim {
        id: row.get(0)?,
        task_id: row.get(1)?,
        worker_id: row.get(2)?,
        status,
        claimed_at: ts_column(row, 4)?,
        lease_expires_at: ts_column(row, 5)?,
        renewed_count: row.get(6)?,
    })
}

fn load_claim(conn: &Connection, id: &ClaimId) -> TasklaneResult<Option<Claim>> {
    let sql = format!("SELECT {CLAIM_COLUMNS} FROM task_claims WHERE id = ?1");
    Ok(conn.query_row(&sql, [id], claim_from_row).optional()?)
}

fn load_active_claim(conn: &Connection, task_id: &TaskId) -> TasklaneResult<Option<Claim>> {
    let sql = format!(
        "SELECT {CLAIM_COLUMNS} FROM task_claims WHERE task_id = ?1 AND status = 'active'"
    );
    Ok(conn.query_row(&sql, [task_id], claim_from_row).optional()?)
}

fn query_claims(
    conn: &Connection,
    where_sql: &str,
    params: impl rusqlite::Params,
) -> TasklaneResult<Vec<Claim>> {
    let sql = format!(
        "SELECT {CLAIM_COLUMNS} FROM task_claims WHERE {where_sql} ORDER BY claimed_at, id"
    );
    let mut stmt = conn.prepare(&sql)?;
    let claims = stmt
        .query_map(params, claim_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(claims)
}

/// Guarded `active -> expired` transition. Returns false if the claim was no longer active.
fn expire_if_active(conn: &Connection, id: &ClaimId) -> TasklaneResult<bool> {
    let changed = conn.execute(
        "UPDATE task_claims SET status = 'expired' WHERE id = ?1 AND status = 'active'",
        [id],
    )?;
    Ok(changed > 0)
}

/// `now` plus the configured lease, or a validation error if that leaves
/// the representable time range.
fn lease_deadline(conn: &Connection, now: DateTime<Utc>) -> TasklaneResult<DateTime<Utc>> {
    let minutes = load_or_init(conn)?.lease_duration_minutes;
    i64::try_from(minutes)
        .ok()
        .and_then(Duration::try_minutes)
        .and_then(|lease| now.checked_add_signed(lease))
        .ok_or_else(|| {
            TasklaneError::Validation(format!("lease duration of {minutes} minutes is out of range"))
        })
}

/// Which claims a sweep may still expire once it holds the write lock.
#[derive(Debug, Clone, Copy)]
enum ExpiryGuard<'a> {
    /// The lease is still past `now`; a renew in between wins.
    LeasePassed(&'a str),
    /// The holder is still marked dead; a heartbeat in between wins.
    HolderDead,
}

impl ExpiryGuard<'_> {
    fn reason(self) -> &'static str {
        match self {
            Self::LeasePassed(_) => "lease_timeout",
            Self::HolderDead => "worker_dead",
        }
    }

    fn expire(self, conn: &Connection, claim: &Claim) -> TasklaneResult<bool> {
        let changed = match self {
            Self::LeasePassed(now) => conn.execute(
                "UPDATE task_claims SET status = 'expired'
                 WHERE id = ?1 AND status = 'active' AND lease_expires_at < ?2",
                params![claim.id, now],
            )?,
            Self::HolderDead => conn.execute(
                "UPDATE task_claims SET status = 'expired'
                 WHERE id = ?1 AND status = 'active'
                   AND EXISTS (SELECT 1 FROM workers WHERE id = ?2 AND status = 'dead')",
                params![claim.id, claim.worker_id],
            )?,
        };
        Ok(changed > 0)
    }
}

/// [`ClaimManager`] over the `task_claims` table.
pub struct SqliteClaimManager {
    db: Database,
    clock: Arc<dyn Clock>,
    stale_threshold: Duration,
}

impl SqliteClaimManager {
    pub fn new(db: Database, clock: Arc<dyn Clock>) -> Self {
        Self {
            db,
            clock,
            stale_threshold: Duration::seconds(DEFAULT_STALE_THRESHOLD_SECONDS),
        }
    }

    pub fn with_stale_threshold(mut self, stale_threshold: Duration) -> Self {
        self.stale_threshold = stale_threshold;
        self
    }

    fn holder_is_dead(
        &self,
        conn: &Connection,
        worker_id: &WorkerId,
        now: DateTime<Utc>,
    ) -> TasklaneResult<bool> {
        Ok(match load_worker(conn, worker_id)? {
            Some(worker) => {
                worker.status == WorkerStatus::Dead
                    || now - worker.last_heartbeat_at > self.stale_threshold
            }
            None => true,
        })
    }

    /// Expire each candidate in its own guarded transaction.
    fn expire_each(
        &self,
        candidates: Vec<Claim>,
        guard: ExpiryGuard<'_>,
    ) -> TasklaneResult<Vec<Claim>> {
        let reason = guard.reason();
        let mut expired = Vec::new();
        for mut claim in candidates {
            let transitioned = self.db.immediate(|tx| {
                let transitioned = guard.expire(tx, &claim)?;
                if transitioned {
                    idle_if_unclaimed(tx, &claim.worker_id)?;
                }
                Ok(transitioned)
            })?;
            if transitioned {
                tracing::info!(
                    claim_id = %claim.id,
                    task_id = %claim.task_id,
                    worker_id = %claim.worker_id,
                    reason,
                    "Claim expired"
                );
                claim.status = ClaimStatus::Expired;
                expired.push(claim);
            } else {
                tracing::debug!(claim_id = %claim.id, reason, "Claim no longer expirable");
            }
        }
        Ok(expired)
    }
}

impl ClaimManager for SqliteClaimManager {
    fn claim(&self, task_id: &TaskId, worker_id: &WorkerId) -> TasklaneResult<Claim> {
        let now = self.clock.now();

        let (claim, superseded) = self.db.immediate(|tx| {
            if !rows::task_exists(tx, task_id)? {
                return Err(TasklaneError::not_found("task", task_id));
            }
            let worker = load_worker(tx, worker_id)?
                .ok_or_else(|| TasklaneError::not_found("worker", worker_id))?;
            if worker.status == WorkerStatus::Dead {
                return Err(TasklaneError::Validation(format!(
                    "worker {worker_id} is marked dead and must heartbeat before claiming"
                )));
            }

            let mut superseded = None;
            if let Some(existing) = load_active_claim(tx, task_id)? {
                let holder_dead = self.holder_is_dead(tx, &existing.worker_id, now)?;
                if existing.is_live_at(now) && !holder_dead {
                    return Err(TasklaneError::AlreadyClaimed {
                        task_id: task_id.to_string(),
                        claim_id: existing.id.to_string(),
                        worker_id: existing.worker_id.to_string(),
                    });
                }
                expire_if_active(tx, &existing.id)?;
                idle_if_unclaimed(tx, &existing.worker_id)?;
                superseded = Some(existing);
            }

            let lease_expires_at = lease_deadline(tx, now)?;
            let claim = Claim {
                id: ClaimId::generate(),
                task_id: task_id.clone(),
                worker_id: worker_id.clone(),
                status: ClaimStatus::Active,
                claimed_at: now,
                lease_expires_at,
                renewed_count: 0,
            };
            tx.execute(
                "INSERT INTO task_claims (id, task_id, worker_id, status, claimed_at,
                                          lease_expires_at, renewed_count)
                 VALUES (?1, ?2, ?3, 'active', ?4, ?5, 0)",
                params![
                    claim.id,
                    claim.task_id,
                    claim.worker_id,
                    format_ts(claim.claimed_at),
                    format_ts(claim.lease_expires_at),
                ],
            )?;
            tx.execute(
                "UPDATE workers SET status = 'busy' WHERE id = ?1",
                [worker_id],
            )?;
            Ok((claim, superseded))
        })?;

        if let Some(old) = superseded {
            tracing::info!(
                claim_id = %old.id,
                task_id = %old.task_id,
                worker_id = %old.worker_id,
                reason = "superseded",
                "Claim expired"
            );
        }
        tracing::info!(
            claim_id = %claim.id,
            task_id = %claim.task_id,
            worker_id = %claim.worker_id,
            lease_expires_at = %claim.lease_expires_at,
            "Task claimed"
        );
        Ok(claim)
    }

    fn renew(&self, claim_id: &ClaimId) -> TasklaneResult<Claim> {
        let now = self.clock.now();
        let claim = self.db.immediate(|tx| {
            let mut claim = load_claim(tx, claim_id)?
                .ok_or_else(|| TasklaneError::not_found("claim", claim_id))?;
            if claim.status != ClaimStatus::Active {
                return Err(TasklaneError::ClaimNotActive {
                    claim_id: claim_id.to_string(),
                    status: claim.status.to_string(),
                });
            }
            if now > claim.lease_expires_at {
                return Err(TasklaneError::LeaseExpired {
                    claim_id: claim_id.to_string(),
                });
            }
            claim.lease_expires_at = lease_deadline(tx, now)?;
            claim.renewed_count += 1;
            tx.execute(
                "UPDATE task_claims SET lease_expires_at = ?2, renewed_count = ?3
                 WHERE id = ?1 AND status = 'active'",
                params![claim.id, format_ts(claim.lease_expires_at), claim.renewed_count],
            )?;
            Ok(claim)
        })?;
        tracing::info!(
            claim_id = %claim.id,
            renewed_count = claim.renewed_count,
            lease_expires_at = %claim.lease_expires_at,
            "Claim renewed"
        );
        Ok(claim)
    }

    fn release(&self, claim_id: &ClaimId) -> TasklaneResult<Claim> {
        let (claim, changed) = self.db.immediate(|tx| {
            let mut claim = load_claim(tx, claim_id)?
                .ok_or_else(|| TasklaneError::not_found("claim", claim_id))?;
            match claim.status {
                ClaimStatus::Released => Ok((claim, false)),
                ClaimStatus::Expired => Err(TasklaneError::ClaimNotActive {
                    claim_id: claim_id.to_string(),
                    status: claim.status.to_string(),
                }),
                ClaimStatus::Active => {
                    tx.execute(
                        "UPDATE task_claims SET status = 'released'
                         WHERE id = ?1 AND status = 'active'",
                        [claim_id],
                    )?;
                    idle_if_unclaimed(tx, &claim.worker_id)?;
                    claim.status = ClaimStatus::Released;
                    Ok((claim, true))
                }
            }
        })?;
        if changed {
            tracing::info!(claim_id = %claim.id, task_id = %claim.task_id, "Claim released");
        } else {
            tracing::debug!(claim_id = %claim.id, "Claim already released");
        }
        Ok(claim)
    }

    fn get_claim(&self, claim_id: &ClaimId) -> TasklaneResult<Option<Claim>> {
        self.db.with_conn(|conn| load_claim(conn, claim_id))
    }

    fn active_claim(&self, task_id: &TaskId) -> TasklaneResult<Option<Claim>> {
        self.db.with_conn(|conn| load_active_claim(conn, task_id))
    }

    fn claims_for_task(&self, task_id: &TaskId) -> TasklaneResult<Vec<Claim>> {
        self.db
            .with_conn(|conn| query_claims(conn, "task_id = ?1", [task_id]))
    }

    fn active_claims_for_worker(&self, worker_id: &WorkerId) -> TasklaneResult<Vec<Claim>> {
        self.db.with_conn(|conn| {
            query_claims(conn, "worker_id = ?1 AND status = 'active'", [worker_id])
        })
    }

    fn expire_stale_leases(&self) -> TasklaneResult<Vec<Claim>> {
        let now = format_ts(self.clock.now());
        let candidates = self.db.with_conn(|conn| {
            query_claims(conn, "status = 'active' AND lease_expires_at < ?1", [&now])
        })?;
        self.expire_each(candidates, ExpiryGuard::LeasePassed(&now))
    }

    fn expire_claims_of_worker(&self, worker_id: &WorkerId) -> TasklaneResult<Vec<Claim>> {
        let candidates = self.db.with_conn(|conn| {
            query_claims(conn, "worker_id = ?1 AND status = 'active'", [worker_id])
        })?;
        self.expire_each(candidates, ExpiryGuard::HolderDead)
    }
}

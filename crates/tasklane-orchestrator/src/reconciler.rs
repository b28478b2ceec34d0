use crate::claims::ClaimManager;
use crate::state::OrchestratorStateStore;
use crate::types::{OrchestratorStatePatch, OrchestratorStatus};
use crate::workers::WorkerRegistry;
use chrono::Duration;
use serde::Serialize;
use std::sync::Arc;
use tasklane_core::{ClaimId, Clock, TaskId, TasklaneResult, WorkerId};
use tasklane_store::TaskStore;
use tokio::sync::watch;

/// What a single reconciliation pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Workers this pass transitioned to dead.
    pub dead_workers: Vec<WorkerId>,
    /// Claims expired because their holder died.
    pub reclaimed_claims: Vec<ClaimId>,
    /// Claims expired because their lease ran out.
    pub expired_leases: Vec<ClaimId>,
    /// Ready set after the sweep.
    pub ready_tasks: Vec<TaskId>,
}

/// The control loop: dead-worker sweep, orphan reclaim, lease expiry, readiness.
///
/// Every step is idempotent and runs in its own short transactions, so
/// passes can interleave with live claim/release traffic from workers.
pub struct Reconciler {
    tasks: Arc<dyn TaskStore>,
    workers: Arc<dyn WorkerRegistry>,
    claims: Arc<dyn ClaimManager>,
    state: Arc<dyn OrchestratorStateStore>,
    clock: Arc<dyn Clock>,
    stale_threshold: Duration,
}

impl Reconciler {
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        workers: Arc<dyn WorkerRegistry>,
        claims: Arc<dyn ClaimManager>,
        state: Arc<dyn OrchestratorStateStore>,
        clock: Arc<dyn Clock>,
        stale_threshold: Duration,
    ) -> Self {
        Self {
            tasks,
            workers,
            claims,
            state,
            clock,
            stale_threshold,
        }
    }

    /// Run one reconciliation pass.
    pub fn run_once(&self) -> TasklaneResult<ReconcileReport> {
        let mut report = ReconcileReport::default();

        for worker in self.workers.find_dead_workers(self.stale_threshold)? {
            // The scan is a snapshot; a heartbeat since then keeps the worker alive.
            if !self
                .workers
                .mark_dead_if_stale(&worker.id, self.stale_threshold)?
            {
                continue;
            }
            report.dead_workers.push(worker.id.clone());
            let reclaimed = self.claims.expire_claims_of_worker(&worker.id)?;
            report
                .reclaimed_claims
                .extend(reclaimed.into_iter().map(|c| c.id));
        }

        report.expired_leases = self
            .claims
            .expire_stale_leases()?
            .into_iter()
            .map(|c| c.id)
            .collect();

        report.ready_tasks = self
            .tasks
            .get_ready()?
            .into_iter()
            .map(|t| t.id)
            .collect();

        self.state.update(&OrchestratorStatePatch {
            last_reconcile_at: Some(Some(self.clock.now())),
            ..OrchestratorStatePatch::default()
        })?;

        if report.dead_workers.is_empty()
            && report.reclaimed_claims.is_empty()
            && report.expired_leases.is_empty()
        {
            tracing::debug!(ready = report.ready_tasks.len(), "Reconcile pass: nothing to do");
        } else {
            tracing::info!(
                dead_workers = report.dead_workers.len(),
                reclaimed_claims = report.reclaimed_claims.len(),
                expired_leases = report.expired_leases.len(),
                ready = report.ready_tasks.len(),
                "Reconcile pass"
            );
        }
        Ok(report)
    }

    /// Start the background loop.
    ///
    /// Spawns a tokio task that records `starting -> running` in the state row,
    /// runs a pass, then sleeps `reconcile_interval_seconds` (re-read every
    /// tick) until `shutdown` flips to `true` or its sender is dropped. On exit
    /// the row goes back to `stopped` with a null pid.
    ///
    /// Returns the [`tokio::task::JoinHandle`] so the caller can await it.
    pub fn start(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<TasklaneResult<()>> {
        tokio::spawn(async move {
            let pid = std::process::id();
            self.state.update(&OrchestratorStatePatch {
                status: Some(OrchestratorStatus::Starting),
                pid: Some(Some(pid)),
                started_at: Some(Some(self.clock.now())),
                ..OrchestratorStatePatch::default()
            })?;
            self.state.update(&OrchestratorStatePatch {
                status: Some(OrchestratorStatus::Running),
                ..OrchestratorStatePatch::default()
            })?;
            tracing::info!(pid, "Reconciler running");

            let outcome = self.run_loop(&mut shutdown).await;

            self.state.update(&OrchestratorStatePatch {
                status: Some(OrchestratorStatus::Stopped),
                pid: Some(None),
                ..OrchestratorStatePatch::default()
            })?;
            tracing::info!("Reconciler stopped");
            outcome
        })
    }

    async fn run_loop(self: &Arc<Self>, shutdown: &mut watch::Receiver<bool>) -> TasklaneResult<()> {
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            let this = Arc::clone(self);
            match tokio::task::spawn_blocking(move || this.run_once()).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => tracing::warn!(error = %e, "Reconcile pass failed"),
                Err(e) => tracing::error!(error = %e, "Reconcile pass panicked"),
            }

            let interval = self.state.get()?.reconcile_interval_seconds;
            tokio::select! {
                _ = tokio::time::sleep(std::time::Duration::from_secs(interval)) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }
}

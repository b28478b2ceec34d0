use crate::engine::SyncEngine;
use std::path::PathBuf;
use std::sync::Arc;
use tasklane_store::{Mutation, MutationHook};

/// Re-exports the database to a JSONL file after every committed mutation,
/// as long as auto-sync is switched on.
///
/// Failures are logged and swallowed: the mutation itself has already
/// committed and must not be reported as failed.
pub struct AutoExportHook {
    engine: Arc<SyncEngine>,
    path: PathBuf,
}

impl AutoExportHook {
    pub fn new(engine: Arc<SyncEngine>, path: impl Into<PathBuf>) -> Self {
        Self {
            engine,
            path: path.into(),
        }
    }
}

impl MutationHook for AutoExportHook {
    fn on_mutation(&self, mutation: &Mutation) {
        match self.engine.is_auto_sync_enabled() {
            Ok(false) => {}
            Ok(true) => match self.engine.export(&self.path) {
                Ok(result) => tracing::debug!(
                    ?mutation,
                    ops = result.op_count,
                    "Auto-sync export"
                ),
                Err(e) => tracing::warn!(
                    ?mutation,
                    path = %self.path.display(),
                    error = %e,
                    "Auto-sync export failed"
                ),
            },
            Err(e) => tracing::warn!(error = %e, "Could not read auto-sync flag"),
        }
    }
}

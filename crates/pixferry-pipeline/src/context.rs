//! Shared pipeline context.
//!
//! One explicit value threaded through every phase; there is no global state.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use pixferry_core::models::{PhaseName, Severity};
use pixferry_core::{Notifier, PipelineConfig, TwoFactorSource};
use pixferry_db::{HashIndex, MetaStore, MetaStoreMirror};

#[derive(Clone)]
pub struct PipelineContext {
    pub config: Arc<PipelineConfig>,
    pub store: MetaStore,
    pub hash_index: Arc<HashIndex>,
    pub mirror: Arc<MetaStoreMirror>,
    pub notifier: Arc<dyn Notifier>,
    pub two_factor: Arc<dyn TwoFactorSource>,
    pub cancel: CancellationToken,
}

impl PipelineContext {
    /// Record a pipeline event in the log store and the tracing output.
    /// Log-store failures are demoted to tracing warnings; logging must
    /// never take a phase down.
    pub async fn log(&self, step: PhaseName, severity: Severity, message: &str) {
        match severity {
            Severity::Error => tracing::error!(step = %step, "{}", message),
            Severity::Warning => tracing::warn!(step = %step, "{}", message),
            _ => tracing::info!(step = %step, "{}", message),
        }
        if let Err(e) = self.store.append_log(step, severity, message).await {
            tracing::warn!(step = %step, error = %e, "failed to append log entry");
        }
    }
}

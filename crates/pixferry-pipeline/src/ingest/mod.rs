//! Ingest adapters.
//!
//! Each variant implements [`IngestSource`]: enumerate candidate items,
//! fetch them into `originals/`, and tag the registered rows. New files
//! enter the store at status `downloaded` with no hash.

mod folder;
mod icloud;

pub use folder::FolderIngest;
pub use icloud::{AuthState, CloudPhotoClient, ICloudIngest};

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use pixferry_core::models::{IngestKind, NewMediaFile, PhaseName, PhaseOutcome, Severity};
use pixferry_core::{PipelineError, PipelineResult};

use crate::context::PipelineContext;

/// A candidate item produced by discovery: a remote reference or local path
/// plus the filename it will land under.
#[derive(Debug, Clone)]
pub struct IngestItem {
    pub reference: String,
    pub filename: String,
}

#[async_trait]
pub trait IngestSource: Send + Sync {
    /// Which variant this is; recorded on every file it registers.
    fn tag(&self) -> IngestKind;

    /// Enumerate candidate items. Finite; called once per run.
    async fn discover(&self) -> PipelineResult<Vec<IngestItem>>;

    /// Materialize one item under `originals/` and return its local path.
    async fn fetch(&self, item: &IngestItem) -> PipelineResult<PathBuf>;
}

/// Runs every enabled ingest source and registers fetched files.
pub struct IngestPhase {
    pub sources: Vec<Arc<dyn IngestSource>>,
}

impl IngestPhase {
    pub async fn run(&self, ctx: &PipelineContext) -> PhaseOutcome {
        let mut outcome = PhaseOutcome::new(PhaseName::Ingest);
        let start = Instant::now();

        for source in &self.sources {
            if ctx.cancel.is_cancelled() {
                break;
            }
            let tag = source.tag();
            let items = match source.discover().await {
                Ok(items) => items,
                Err(e) => {
                    // Discovery failures (bad credentials, unreachable
                    // source) are phase-level: nothing can be fetched.
                    ctx.log(
                        PhaseName::Ingest,
                        Severity::Error,
                        &format!("{} discovery failed: {}", tag, e),
                    )
                    .await;
                    outcome.started = false;
                    outcome.error = Some(e.to_string());
                    outcome.duration = start.elapsed();
                    return outcome;
                }
            };
            tracing::info!(source = %tag, candidates = items.len(), "discovery complete");

            for item in items {
                if ctx.cancel.is_cancelled() {
                    break;
                }
                outcome.processed += 1;
                match self.fetch_and_register(ctx, source.as_ref(), &item).await {
                    Ok(registered) => {
                        if registered {
                            outcome.succeeded += 1;
                        } else {
                            outcome.skipped += 1;
                        }
                    }
                    Err(e @ PipelineError::Auth(_)) => {
                        ctx.log(
                            PhaseName::Ingest,
                            Severity::Error,
                            &format!("{} authentication lost: {}", tag, e),
                        )
                        .await;
                        outcome.started = false;
                        outcome.error = Some(e.to_string());
                        outcome.duration = start.elapsed();
                        return outcome;
                    }
                    Err(e) => {
                        outcome.failed += 1;
                        ctx.log(
                            PhaseName::Ingest,
                            Severity::Warning,
                            &format!("failed to fetch {}: {}", item.reference, e),
                        )
                        .await;
                    }
                }
            }
        }

        outcome.duration = start.elapsed();
        outcome
    }

    /// Returns `Ok(true)` when a new row was registered, `Ok(false)` when
    /// the item was already known (idempotent re-run).
    async fn fetch_and_register(
        &self,
        ctx: &PipelineContext,
        source: &dyn IngestSource,
        item: &IngestItem,
    ) -> PipelineResult<bool> {
        if ctx
            .store
            .find_file_by_source(&item.reference, &item.filename)
            .await?
            .is_some()
        {
            tracing::debug!(reference = %item.reference, "already registered, skipping fetch");
            return Ok(false);
        }
        let path = source.fetch(item).await?;
        let size_bytes = tokio::fs::metadata(&path).await?.len() as i64;
        let file = ctx
            .store
            .upsert_file(NewMediaFile {
                filename: item.filename.clone(),
                path,
                source_path: item.reference.clone(),
                size_bytes,
                source_kind: source.tag(),
            })
            .await?;
        tracing::debug!(file_id = %file.id, filename = %file.filename, "registered");
        Ok(true)
    }
}

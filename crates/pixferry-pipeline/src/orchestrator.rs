//! Phase orchestrator.
//!
//! Executes the linear phase graph Ingest -> Dedupe -> Compress -> Stage ->
//! (UploadICloud ∥ SyncPixel) -> Verify -> Sort. Disabled phases pass
//! through untouched. A phase that fails to start breaks the chain for its
//! dependents, but the two upload phases are independent of each other and
//! the tail keeps running as long as one upload path survived. Because
//! every phase pulls its input from the store by status, an interrupted run
//! resumes wherever it stopped.

use std::sync::Arc;

use pixferry_core::models::{PhaseName, PhaseOutcome, RunReport, Severity};
use pixferry_core::PipelineResult;

use crate::compress::CompressPhase;
use crate::context::PipelineContext;
use crate::dedupe::DedupePhase;
use crate::ingest::{IngestPhase, IngestSource};
use crate::sort::SortPhase;
use crate::stage::StagePhase;
use crate::syncpixel::SyncPixelPhase;
use crate::uploader::icloud::ICloudUploadPhase;
use crate::verify::{SyncCheck, VerifyPhase};

pub struct Orchestrator {
    ctx: PipelineContext,
    ingest_sources: Vec<Arc<dyn IngestSource>>,
    sync_check: Option<Arc<dyn SyncCheck>>,
    inspect_selectors: bool,
}

impl Orchestrator {
    pub fn new(ctx: PipelineContext) -> Self {
        Self {
            ctx,
            ingest_sources: Vec::new(),
            sync_check: None,
            inspect_selectors: false,
        }
    }

    pub fn with_ingest_source(mut self, source: Arc<dyn IngestSource>) -> Self {
        self.ingest_sources.push(source);
        self
    }

    pub fn with_sync_check(mut self, checker: Arc<dyn SyncCheck>) -> Self {
        self.sync_check = Some(checker);
        self
    }

    pub fn with_selector_inspection(mut self, inspect: bool) -> Self {
        self.inspect_selectors = inspect;
        self
    }

    /// Run the full phase graph and aggregate the report.
    pub async fn run(&self) -> PipelineResult<RunReport> {
        let mut outcomes = Vec::new();
        let mut chain_ok = true;

        for phase in [
            PhaseName::Ingest,
            PhaseName::Dedupe,
            PhaseName::Compress,
            PhaseName::Stage,
        ] {
            let outcome = if !self.enabled(phase) {
                PhaseOutcome::disabled(phase)
            } else if !chain_ok {
                self.skip_for_upstream(phase).await
            } else {
                self.execute(phase).await
            };
            chain_ok &= outcome.started;
            outcomes.push(outcome);
        }

        // The two upload phases are mutually independent; run them together
        // when both are enabled.
        let (icloud_outcome, pixel_outcome) = match (
            self.enabled(PhaseName::UploadICloud),
            self.enabled(PhaseName::SyncPixel),
        ) {
            (true, true) if chain_ok => {
                tokio::join!(
                    self.execute(PhaseName::UploadICloud),
                    self.execute(PhaseName::SyncPixel)
                )
            }
            (icloud_on, pixel_on) => {
                let icloud = if !icloud_on {
                    PhaseOutcome::disabled(PhaseName::UploadICloud)
                } else if !chain_ok {
                    self.skip_for_upstream(PhaseName::UploadICloud).await
                } else {
                    self.execute(PhaseName::UploadICloud).await
                };
                let pixel = if !pixel_on {
                    PhaseOutcome::disabled(PhaseName::SyncPixel)
                } else if !chain_ok {
                    self.skip_for_upstream(PhaseName::SyncPixel).await
                } else {
                    self.execute(PhaseName::SyncPixel).await
                };
                (icloud, pixel)
            }
        };
        // The tail depends on the uploads collectively: it proceeds as long
        // as no enabled upload path is left in a broken state on both sides.
        let uploads_enabled =
            self.enabled(PhaseName::UploadICloud) || self.enabled(PhaseName::SyncPixel);
        let any_upload_ok = (self.enabled(PhaseName::UploadICloud) && icloud_outcome.started)
            || (self.enabled(PhaseName::SyncPixel) && pixel_outcome.started);
        outcomes.push(icloud_outcome);
        outcomes.push(pixel_outcome);
        chain_ok &= !uploads_enabled || any_upload_ok;

        for phase in [PhaseName::Verify, PhaseName::Sort] {
            let outcome = if !self.enabled(phase) {
                PhaseOutcome::disabled(phase)
            } else if !chain_ok {
                self.skip_for_upstream(phase).await
            } else {
                self.execute(phase).await
            };
            chain_ok &= outcome.started;
            outcomes.push(outcome);
        }

        self.finish(outcomes).await
    }

    /// Run a single phase by name, honoring its toggle but no chain gating.
    pub async fn run_phase(&self, phase: PhaseName) -> PipelineResult<RunReport> {
        let outcome = if self.enabled(phase) {
            self.execute(phase).await
        } else {
            PhaseOutcome::disabled(phase)
        };
        self.finish(vec![outcome]).await
    }

    fn enabled(&self, phase: PhaseName) -> bool {
        let features = &self.ctx.config.features;
        match phase {
            PhaseName::Ingest => features.icloud_download || features.folder_download,
            PhaseName::Dedupe => features.deduplication,
            PhaseName::Compress => features.compression,
            PhaseName::Stage => features.file_preparation,
            PhaseName::UploadICloud => features.icloud_upload,
            PhaseName::SyncPixel => features.pixel_upload,
            PhaseName::Verify => features.verification,
            PhaseName::Sort => features.sorting,
        }
    }

    async fn execute(&self, phase: PhaseName) -> PhaseOutcome {
        tracing::info!(phase = %phase, "phase starting");
        let outcome = match phase {
            PhaseName::Ingest => {
                let sources: Vec<Arc<dyn IngestSource>> = self
                    .ingest_sources
                    .iter()
                    .filter(|s| self.source_enabled(s.tag()))
                    .cloned()
                    .collect();
                IngestPhase { sources }.run(&self.ctx).await
            }
            PhaseName::Dedupe => DedupePhase.run(&self.ctx).await,
            PhaseName::Compress => CompressPhase.run(&self.ctx).await,
            PhaseName::Stage => StagePhase.run(&self.ctx).await,
            PhaseName::UploadICloud => {
                ICloudUploadPhase {
                    inspect: self.inspect_selectors,
                }
                .run(&self.ctx)
                .await
            }
            PhaseName::SyncPixel => SyncPixelPhase.run(&self.ctx).await,
            PhaseName::Verify => {
                VerifyPhase {
                    checker: self.sync_check.clone(),
                }
                .run(&self.ctx)
                .await
            }
            PhaseName::Sort => SortPhase.run(&self.ctx).await,
        };
        let severity = if outcome.started {
            Severity::Success
        } else {
            Severity::Error
        };
        self.ctx
            .log(phase, severity, &outcome.to_string())
            .await;
        outcome
    }

    fn source_enabled(&self, tag: pixferry_core::models::IngestKind) -> bool {
        let features = &self.ctx.config.features;
        match tag {
            pixferry_core::models::IngestKind::ICloud => features.icloud_download,
            pixferry_core::models::IngestKind::Folder => features.folder_download,
        }
    }

    async fn skip_for_upstream(&self, phase: PhaseName) -> PhaseOutcome {
        self.ctx
            .log(
                phase,
                Severity::Warning,
                "skipped: an upstream phase failed to start",
            )
            .await;
        PhaseOutcome::disabled(phase)
    }

    async fn finish(&self, outcomes: Vec<PhaseOutcome>) -> PipelineResult<RunReport> {
        // Give the mirror one synchronous chance to drain before reporting.
        if let Err(e) = self.ctx.mirror.flush().await {
            tracing::debug!(error = %e, "mirror still behind at end of run");
        }
        let report = RunReport {
            error_file_ids: self.ctx.store.error_file_ids().await?,
            mirror_caught_up: self.ctx.mirror.caught_up().await,
            outcomes,
        };
        self.ctx
            .notifier
            .notify(
                if report.exit_code() == 0 {
                    Severity::Success
                } else {
                    Severity::Error
                },
                &report.to_string(),
            )
            .await;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::test_context;
    use pixferry_core::models::FileStatus;
    use pixferry_core::models::{IngestKind, NewMediaFile};
    use pixferry_core::PipelineConfig;

    fn set_features(ctx: &mut PipelineContext, f: impl FnOnce(&mut PipelineConfig)) {
        let mut config = (*ctx.config).clone();
        f(&mut config);
        ctx.config = Arc::new(config);
    }

    #[tokio::test]
    async fn test_all_toggles_off_is_successful_noop() {
        let (mut ctx, _guard) = test_context().await;
        set_features(&mut ctx, |c| {
            c.features = Default::default();
        });

        let report = Orchestrator::new(ctx).run().await.unwrap();
        assert_eq!(report.exit_code(), 0);
        assert_eq!(report.outcomes.len(), 8);
        assert!(report.outcomes.iter().all(|o| o.started));
        assert!(report.outcomes.iter().all(|o| o.processed == 0));
    }

    #[tokio::test]
    async fn test_running_twice_with_no_new_files_changes_nothing() {
        let (mut ctx, _guard) = test_context().await;
        set_features(&mut ctx, |c| {
            c.features = Default::default();
            c.features.deduplication = true;
            c.features.compression = true;
            c.features.verification = true;
            c.features.sorting = true;
        });

        // One file pushed through dedupe+compress only (no staging).
        let originals = ctx.config.paths.originals_dir.clone();
        tokio::fs::create_dir_all(&originals).await.unwrap();
        tokio::fs::write(originals.join("a.bin"), b"opaque").await.unwrap();
        ctx.store
            .upsert_file(NewMediaFile {
                filename: "a.bin".into(),
                path: originals.join("a.bin"),
                source_path: "/camera/a.bin".into(),
                size_bytes: 6,
                source_kind: IngestKind::Folder,
            })
            .await
            .unwrap();

        let orchestrator = Orchestrator::new(ctx.clone());
        orchestrator.run().await.unwrap();
        let counts_before = ctx.store.status_counts().await.unwrap();

        let report = orchestrator.run().await.unwrap();
        assert_eq!(report.exit_code(), 0);
        let counts_after = ctx.store.status_counts().await.unwrap();
        assert_eq!(counts_before, counts_after);
    }

    #[tokio::test]
    async fn test_file_errors_do_not_fail_the_run() {
        let (mut ctx, _guard) = test_context().await;
        set_features(&mut ctx, |c| {
            c.features = Default::default();
            c.features.deduplication = true;
        });

        // A registered file whose payload is unreadable.
        ctx.store
            .upsert_file(NewMediaFile {
                filename: "ghost.jpg".into(),
                path: ctx.config.paths.originals_dir.join("ghost.jpg"),
                source_path: "/camera/ghost.jpg".into(),
                size_bytes: 1,
                source_kind: IngestKind::Folder,
            })
            .await
            .unwrap();

        let report = Orchestrator::new(ctx.clone()).run().await.unwrap();
        assert_eq!(report.exit_code(), 0);
        assert_eq!(report.error_file_ids.len(), 1);
        assert_eq!(
            ctx.store
                .files_with_status(FileStatus::Error)
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_run_phase_honors_toggle() {
        let (mut ctx, _guard) = test_context().await;
        set_features(&mut ctx, |c| {
            c.features = Default::default();
        });

        let report = Orchestrator::new(ctx)
            .run_phase(PhaseName::Dedupe)
            .await
            .unwrap();
        assert_eq!(report.outcomes.len(), 1);
        assert_eq!(report.outcomes[0].skipped, 1);
    }
}

//! Verification phase.
//!
//! When a destination offers an out-of-band presence check, each uploaded
//! file is queried once, best-effort: a miss or a check failure leaves the
//! file at `uploaded` with a warning. Without the capability, uploads are
//! promoted to `verified` directly.

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use pixferry_core::models::{
    BatchStatus, FileStatus, MediaFile, PhaseName, PhaseOutcome, Severity,
};
use pixferry_core::PipelineResult;
use pixferry_db::FileUpdate;

use crate::context::PipelineContext;

/// Out-of-band "is this file really there" capability.
#[async_trait]
pub trait SyncCheck: Send + Sync {
    async fn exists(&self, file: &MediaFile) -> PipelineResult<bool>;
}

pub struct VerifyPhase {
    pub checker: Option<Arc<dyn SyncCheck>>,
}

impl VerifyPhase {
    pub async fn run(&self, ctx: &PipelineContext) -> PhaseOutcome {
        let mut outcome = PhaseOutcome::new(PhaseName::Verify);
        let start = Instant::now();

        let files = match ctx.store.files_with_status(FileStatus::Uploaded).await {
            Ok(files) => files,
            Err(e) => {
                outcome.started = false;
                outcome.error = Some(e.to_string());
                outcome.duration = start.elapsed();
                return outcome;
            }
        };

        let mut touched_batches = BTreeSet::new();
        for file in files {
            if ctx.cancel.is_cancelled() {
                break;
            }
            outcome.processed += 1;

            let confirmed = match &self.checker {
                None => true,
                Some(checker) => match checker.exists(&file).await {
                    Ok(present) => present,
                    Err(e) => {
                        ctx.log(
                            PhaseName::Verify,
                            Severity::Warning,
                            &format!("{}: presence check failed: {}", file.filename, e),
                        )
                        .await;
                        false
                    }
                },
            };

            if confirmed {
                match ctx
                    .store
                    .update_file_status(file.id, FileStatus::Verified, FileUpdate::default())
                    .await
                {
                    Ok(updated) => {
                        outcome.succeeded += 1;
                        if let Some(batch_id) = updated.batch_id {
                            touched_batches.insert(batch_id);
                        }
                    }
                    Err(e) => {
                        outcome.failed += 1;
                        ctx.log(
                            PhaseName::Verify,
                            Severity::Error,
                            &format!("{}: {}", file.filename, e),
                        )
                        .await;
                    }
                }
            } else {
                // Stays uploaded; the next run tries again.
                outcome.failed += 1;
                ctx.log(
                    PhaseName::Verify,
                    Severity::Warning,
                    &format!("{}: not yet visible at destination", file.filename),
                )
                .await;
            }
        }

        for batch_id in touched_batches {
            if let Err(e) = self.promote_batch(ctx, batch_id).await {
                tracing::warn!(batch_id = %batch_id, error = %e, "batch promotion failed");
            }
        }

        outcome.duration = start.elapsed();
        outcome
    }

    /// Promote an uploaded batch to verified once every member is verified.
    async fn promote_batch(&self, ctx: &PipelineContext, batch_id: uuid::Uuid) -> PipelineResult<()> {
        let Some(batch) = ctx.store.get_batch(batch_id).await? else {
            return Ok(());
        };
        if batch.status != BatchStatus::Uploaded {
            return Ok(());
        }
        let members = ctx.store.batch_members(batch_id).await?;
        if members.iter().all(|m| m.status == FileStatus::Verified) {
            let completed = batch.completed_at.unwrap_or_else(chrono::Utc::now);
            ctx.store
                .set_batch_status(batch_id, BatchStatus::Verified, Some(completed))
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::test_context;
    use pixferry_core::models::{IngestKind, NewMediaFile, UploadKind};

    async fn uploaded_file(ctx: &PipelineContext, name: &str) -> MediaFile {
        let file = ctx
            .store
            .upsert_file(NewMediaFile {
                filename: name.to_string(),
                path: ctx.config.paths.compressed_dir.join(name),
                source_path: format!("/camera/{}", name),
                size_bytes: 1,
                source_kind: IngestKind::Folder,
            })
            .await
            .unwrap();
        let file = ctx
            .store
            .update_file_status(
                file.id,
                FileStatus::Deduplicated,
                FileUpdate {
                    hash: Some(format!("hash-{}", name)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let file = ctx
            .store
            .update_file_status(file.id, FileStatus::Compressed, FileUpdate::default())
            .await
            .unwrap();
        let batch = ctx
            .store
            .create_batch(UploadKind::ICloud, &[file.id])
            .await
            .unwrap();
        ctx.store
            .set_batch_status(batch.id, BatchStatus::Uploading, None)
            .await
            .unwrap();
        ctx.store
            .set_batch_status(batch.id, BatchStatus::Uploaded, Some(chrono::Utc::now()))
            .await
            .unwrap();
        ctx.store
            .update_file_status(file.id, FileStatus::Uploaded, FileUpdate::default())
            .await
            .unwrap()
    }

    struct AlwaysThere;
    #[async_trait]
    impl SyncCheck for AlwaysThere {
        async fn exists(&self, _file: &MediaFile) -> PipelineResult<bool> {
            Ok(true)
        }
    }

    struct NeverThere;
    #[async_trait]
    impl SyncCheck for NeverThere {
        async fn exists(&self, _file: &MediaFile) -> PipelineResult<bool> {
            Ok(false)
        }
    }

    #[tokio::test]
    async fn test_without_checker_uploads_become_verified() {
        let (ctx, _guard) = test_context().await;
        let file = uploaded_file(&ctx, "a.jpg").await;

        let outcome = VerifyPhase { checker: None }.run(&ctx).await;
        assert_eq!(outcome.succeeded, 1);

        let file = ctx.store.get_file(file.id).await.unwrap().unwrap();
        assert_eq!(file.status, FileStatus::Verified);

        // The whole batch is verified once every member is.
        let batch = ctx
            .store
            .get_batch(file.batch_id.unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(batch.status, BatchStatus::Verified);
        assert!(batch.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_confirming_checker_verifies() {
        let (ctx, _guard) = test_context().await;
        uploaded_file(&ctx, "a.jpg").await;

        let outcome = VerifyPhase {
            checker: Some(Arc::new(AlwaysThere)),
        }
        .run(&ctx)
        .await;
        assert_eq!(outcome.succeeded, 1);
    }

    #[tokio::test]
    async fn test_miss_leaves_file_uploaded() {
        let (ctx, _guard) = test_context().await;
        let file = uploaded_file(&ctx, "a.jpg").await;

        let outcome = VerifyPhase {
            checker: Some(Arc::new(NeverThere)),
        }
        .run(&ctx)
        .await;
        assert_eq!(outcome.failed, 1);
        assert!(outcome.started);

        let file = ctx.store.get_file(file.id).await.unwrap().unwrap();
        assert_eq!(file.status, FileStatus::Uploaded);
    }
}

//! Deduplication phase.
//!
//! Hashing fans out on a bounded worker group; classification runs
//! sequentially in `created_at` order so the survivor of each hash class is
//! chosen deterministically (the earliest-created file wins). Duplicates are
//! quarantined under `cleanup/`, never deleted.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;

use pixferry_core::models::{FileStatus, MediaFile, PhaseName, PhaseOutcome, Severity};
use pixferry_core::{PipelineError, PipelineResult};
use pixferry_db::{FileUpdate, Observed};

use crate::context::PipelineContext;
use crate::fsutil::{move_file, unique_destination};
use crate::hashing::hash_file;

pub struct DedupePhase;

impl DedupePhase {
    pub async fn run(&self, ctx: &PipelineContext) -> PhaseOutcome {
        let mut outcome = PhaseOutcome::new(PhaseName::Dedupe);
        let start = Instant::now();

        let files = match ctx.store.files_with_status(FileStatus::Downloaded).await {
            Ok(files) => files,
            Err(e) => {
                outcome.started = false;
                outcome.error = Some(e.to_string());
                outcome.duration = start.elapsed();
                return outcome;
            }
        };
        let files: Vec<MediaFile> = files.into_iter().filter(|f| !f.is_duplicate).collect();
        tracing::info!(candidates = files.len(), "dedupe scan");

        // Fan out hashing, bounded by the per-phase worker cap.
        let semaphore = Arc::new(Semaphore::new(ctx.config.runtime.workers_per_phase));
        let algorithm = ctx.config.dedupe.hash_algorithm;
        let mut hash_tasks = Vec::with_capacity(files.len());
        for file in &files {
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let path = file.path.clone();
            hash_tasks.push(tokio::spawn(async move {
                let result = hash_file(&path, algorithm).await;
                drop(permit);
                result
            }));
        }

        let mut hashes: Vec<PipelineResult<String>> = Vec::with_capacity(hash_tasks.len());
        for task in hash_tasks {
            hashes.push(
                task.await
                    .unwrap_or_else(|e| Err(PipelineError::Media(format!("hash task: {}", e)))),
            );
        }

        // Classify sequentially, oldest first.
        for (file, hash) in files.into_iter().zip(hashes) {
            if ctx.cancel.is_cancelled() {
                break;
            }
            outcome.processed += 1;
            match self.classify(ctx, &file, hash).await {
                Ok(()) => outcome.succeeded += 1,
                Err(e) => {
                    outcome.failed += 1;
                    let _ = ctx
                        .store
                        .update_file_status(file.id, FileStatus::Error, FileUpdate::default())
                        .await;
                    ctx.log(
                        PhaseName::Dedupe,
                        Severity::Error,
                        &format!("{}: {}", file.filename, e),
                    )
                    .await;
                }
            }
        }

        outcome.duration = start.elapsed();
        outcome
    }

    async fn classify(
        &self,
        ctx: &PipelineContext,
        file: &MediaFile,
        hash: PipelineResult<String>,
    ) -> PipelineResult<()> {
        let hash = hash?;
        match ctx
            .hash_index
            .observe(&hash, file.id, file.created_at)
            .await
        {
            Observed::Fresh => {
                ctx.store
                    .update_file_status(
                        file.id,
                        FileStatus::Deduplicated,
                        FileUpdate {
                            hash: Some(hash),
                            ..Default::default()
                        },
                    )
                    .await?;
                Ok(())
            }
            Observed::DuplicateOf(survivor_id) => {
                ctx.store
                    .record_duplicate(survivor_id, file.id, &hash)
                    .await?;
                let quarantined = self.quarantine(ctx, file).await?;
                ctx.store
                    .update_file_fields(
                        file.id,
                        FileUpdate {
                            path: Some(quarantined.clone()),
                            ..Default::default()
                        },
                    )
                    .await?;
                ctx.log(
                    PhaseName::Dedupe,
                    Severity::Info,
                    &format!(
                        "{} duplicates {}, quarantined to {}",
                        file.filename,
                        survivor_id,
                        quarantined.display()
                    ),
                )
                .await;
                Ok(())
            }
        }
    }

    async fn quarantine(
        &self,
        ctx: &PipelineContext,
        file: &MediaFile,
    ) -> PipelineResult<std::path::PathBuf> {
        let cleanup_dir = &ctx.config.paths.cleanup_dir;
        tokio::fs::create_dir_all(cleanup_dir).await?;
        let dest = unique_destination(cleanup_dir, &file.filename).await?;
        move_file(&file.path, &dest).await?;
        Ok(dest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::test_context;
    use pixferry_core::models::{IngestKind, NewMediaFile};

    async fn register(ctx: &PipelineContext, name: &str, payload: &[u8]) -> MediaFile {
        let originals = &ctx.config.paths.originals_dir;
        tokio::fs::create_dir_all(originals).await.unwrap();
        let path = originals.join(name);
        tokio::fs::write(&path, payload).await.unwrap();
        ctx.store
            .upsert_file(NewMediaFile {
                filename: name.to_string(),
                path,
                source_path: format!("/camera/{}", name),
                size_bytes: payload.len() as i64,
                source_kind: IngestKind::Folder,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_unique_files_all_survive() {
        let (ctx, _guard) = test_context().await;
        register(&ctx, "a.jpg", b"content-a").await;
        register(&ctx, "b.jpg", b"content-b").await;

        let outcome = DedupePhase.run(&ctx).await;
        assert_eq!(outcome.processed, 2);
        assert_eq!(outcome.succeeded, 2);
        assert_eq!(outcome.failed, 0);

        let survivors = ctx
            .store
            .files_with_status(FileStatus::Deduplicated)
            .await
            .unwrap();
        assert_eq!(survivors.len(), 2);
        assert!(survivors.iter().all(|f| f.hash.is_some()));
    }

    #[tokio::test]
    async fn test_duplicate_within_run_quarantined() {
        let (ctx, _guard) = test_context().await;
        let first = register(&ctx, "x.jpg", b"identical bytes").await;
        let copy = register(&ctx, "x_copy.jpg", b"identical bytes").await;

        let outcome = DedupePhase.run(&ctx).await;
        assert_eq!(outcome.succeeded, 2);

        // The earlier-created file survives.
        let survivor = ctx.store.get_file(first.id).await.unwrap().unwrap();
        assert_eq!(survivor.status, FileStatus::Deduplicated);
        assert!(!survivor.is_duplicate);

        let dup = ctx.store.get_file(copy.id).await.unwrap().unwrap();
        assert!(dup.is_duplicate);
        assert_eq!(dup.status, FileStatus::Downloaded);
        assert!(dup.path.starts_with(&ctx.config.paths.cleanup_dir));
        assert!(dup.path.exists());

        let link = ctx.store.duplicate_link_for(copy.id).await.unwrap().unwrap();
        assert_eq!(link.original_id, first.id);
        assert_eq!(link.hash, survivor.hash.unwrap());
    }

    #[tokio::test]
    async fn test_dedupe_is_idempotent() {
        let (ctx, _guard) = test_context().await;
        register(&ctx, "x.jpg", b"identical bytes").await;
        register(&ctx, "x_copy.jpg", b"identical bytes").await;

        DedupePhase.run(&ctx).await;
        let second = DedupePhase.run(&ctx).await;
        // Nothing left at downloaded that is not already handled.
        assert_eq!(second.processed, 0);
        assert_eq!(ctx.store.duplicate_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unreadable_file_becomes_error_and_phase_continues() {
        let (ctx, _guard) = test_context().await;
        let ghost = ctx
            .store
            .upsert_file(NewMediaFile {
                filename: "ghost.jpg".to_string(),
                path: ctx.config.paths.originals_dir.join("ghost.jpg"),
                source_path: "/camera/ghost.jpg".to_string(),
                size_bytes: 10,
                source_kind: IngestKind::Folder,
            })
            .await
            .unwrap();
        register(&ctx, "fine.jpg", b"readable").await;

        let outcome = DedupePhase.run(&ctx).await;
        assert_eq!(outcome.failed, 1);
        assert_eq!(outcome.succeeded, 1);

        let ghost = ctx.store.get_file(ghost.id).await.unwrap().unwrap();
        assert_eq!(ghost.status, FileStatus::Error);
    }
}

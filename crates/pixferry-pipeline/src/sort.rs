//! Archival sorting phase.
//!
//! Verified files move into `sorted/YYYY/MM/DD/` by capture date, with
//! `unknown/` for files whose whole date chain failed. `processed_at` marks
//! a file as sorted, which makes the phase idempotent.

use std::path::PathBuf;
use std::time::Instant;

use chrono::{Datelike, Utc};

use pixferry_core::models::{FileStatus, MediaFile, PhaseName, PhaseOutcome, Severity};
use pixferry_core::{PipelineError, PipelineResult};
use pixferry_db::FileUpdate;

use crate::context::PipelineContext;
use crate::fsutil::{move_file, unique_destination};
use crate::hashing::hash_file;
use crate::media_date::capture_date;

pub struct SortPhase;

impl SortPhase {
    pub async fn run(&self, ctx: &PipelineContext) -> PhaseOutcome {
        let mut outcome = PhaseOutcome::new(PhaseName::Sort);
        let start = Instant::now();

        let files = match ctx.store.files_with_status(FileStatus::Verified).await {
            Ok(files) => files,
            Err(e) => {
                outcome.started = false;
                outcome.error = Some(e.to_string());
                outcome.duration = start.elapsed();
                return outcome;
            }
        };

        for file in files {
            if ctx.cancel.is_cancelled() {
                break;
            }
            if file.processed_at.is_some() {
                // Already sorted in an earlier run.
                continue;
            }
            outcome.processed += 1;
            match self.sort_one(ctx, &file).await {
                Ok(target) => {
                    outcome.succeeded += 1;
                    tracing::debug!(file_id = %file.id, target = %target.display(), "sorted");
                }
                Err(e) => {
                    outcome.failed += 1;
                    ctx.log(
                        PhaseName::Sort,
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

    async fn sort_one(&self, ctx: &PipelineContext, file: &MediaFile) -> PipelineResult<PathBuf> {
        let date = capture_date(&file.path, &ctx.config.compression.ffprobe_path).await;
        let dest_dir = match date {
            Some(date) => ctx.config.paths.sorted_dir.join(format!(
                "{:04}/{:02}/{:02}",
                date.year(),
                date.month(),
                date.day()
            )),
            None => ctx.config.paths.sorted_dir.join("unknown"),
        };
        tokio::fs::create_dir_all(&dest_dir).await?;

        let basename = file
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                PipelineError::Media(format!("no basename in {}", file.path.display()))
            })?;
        let mut target = dest_dir.join(basename);

        if target == file.path {
            // Already at its sorted location; just record it.
            self.record_sorted(ctx, file, target.clone()).await?;
            return Ok(target);
        }

        if target.exists() {
            let algorithm = ctx.config.dedupe.hash_algorithm;
            let existing = hash_file(&target, algorithm).await?;
            let incoming = hash_file(&file.path, algorithm).await?;
            if existing == incoming {
                // Already archived; drop the redundant source copy.
                tokio::fs::remove_file(&file.path).await?;
                self.record_sorted(ctx, file, target.clone()).await?;
                return Ok(target);
            }
            target = unique_destination(&dest_dir, basename).await?;
        }

        move_file(&file.path, &target).await?;
        self.record_sorted(ctx, file, target.clone()).await?;
        Ok(target)
    }

    async fn record_sorted(
        &self,
        ctx: &PipelineContext,
        file: &MediaFile,
        target: PathBuf,
    ) -> PipelineResult<()> {
        ctx.store
            .update_file_fields(
                file.id,
                FileUpdate {
                    path: Some(target),
                    processed_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }
}

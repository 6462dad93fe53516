//! Compression phase.
//!
//! Applies the age-tiered policy: assets captured within the configured
//! interval get the initial (gentler) parameters, older assets the
//! subsequent (more aggressive) ones. Originals stay in place; artifacts are
//! written under `compressed/` preserving the basename, so an interrupted
//! run simply overwrites its own partial output on resume.

mod image;
mod video;

pub use self::image::compress_image;
pub use self::video::compress_video;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::Semaphore;

use pixferry_core::models::{FileStatus, MediaFile, PhaseName, PhaseOutcome, Severity};
use pixferry_core::{CompressionPolicy, PipelineError, PipelineResult};
use pixferry_db::FileUpdate;

use crate::context::PipelineContext;
use crate::hashing::hash_file;
use crate::media::MediaType;
use crate::media_date::{age_years, capture_date};

/// Parameters chosen for one file after tiering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Tier {
    resize_percentage: u32,
    video_resolution: u32,
}

fn pick_tier(policy: &CompressionPolicy, age: Option<u32>) -> Tier {
    // An unknown capture date is treated as recent: the gentler tier loses
    // less if the guess is wrong.
    let recent = age.map_or(true, |age| age < policy.interval_years);
    if recent {
        Tier {
            resize_percentage: policy.initial_resize_percentage,
            video_resolution: policy.initial_video_resolution,
        }
    } else {
        Tier {
            resize_percentage: policy.subsequent_resize_percentage,
            video_resolution: policy.subsequent_video_resolution,
        }
    }
}

pub struct CompressPhase;

impl CompressPhase {
    pub async fn run(&self, ctx: &PipelineContext) -> PhaseOutcome {
        let mut outcome = PhaseOutcome::new(PhaseName::Compress);
        let start = Instant::now();

        let files = match ctx.store.files_with_status(FileStatus::Deduplicated).await {
            Ok(files) => files,
            Err(e) => {
                outcome.started = false;
                outcome.error = Some(e.to_string());
                outcome.duration = start.elapsed();
                return outcome;
            }
        };
        if let Err(e) = tokio::fs::create_dir_all(&ctx.config.paths.compressed_dir).await {
            outcome.started = false;
            outcome.error = Some(format!(
                "cannot create {}: {}",
                ctx.config.paths.compressed_dir.display(),
                e
            ));
            outcome.duration = start.elapsed();
            return outcome;
        }
        tracing::info!(candidates = files.len(), "compression scan");

        let semaphore = Arc::new(Semaphore::new(ctx.config.runtime.workers_per_phase));
        let mut tasks = Vec::with_capacity(files.len());
        for file in files {
            if ctx.cancel.is_cancelled() {
                break;
            }
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let ctx = ctx.clone();
            tasks.push(tokio::spawn(async move {
                let result = compress_one(&ctx, &file).await;
                drop(permit);
                (file, result)
            }));
        }

        for task in tasks {
            let Ok((file, result)) = task.await else {
                outcome.failed += 1;
                continue;
            };
            outcome.processed += 1;
            match result {
                Ok(ratio) => {
                    outcome.succeeded += 1;
                    tracing::debug!(file_id = %file.id, ratio, "compressed");
                }
                Err(e) => {
                    outcome.failed += 1;
                    let _ = ctx
                        .store
                        .update_file_status(file.id, FileStatus::Error, FileUpdate::default())
                        .await;
                    ctx.log(
                        PhaseName::Compress,
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
}

/// Compress one file and commit the transition. Returns the recorded ratio.
async fn compress_one(ctx: &PipelineContext, file: &MediaFile) -> PipelineResult<f64> {
    let policy = &ctx.config.compression;
    let basename = file
        .path
        .file_name()
        .ok_or_else(|| PipelineError::Media(format!("no basename in {}", file.path.display())))?;
    let artifact: PathBuf = ctx.config.paths.compressed_dir.join(basename);

    let original_size = tokio::fs::metadata(&file.path).await?.len();

    // An artifact with the same basename and the same content hash is left
    // over from an interrupted run: commit the transition without redoing
    // the work.
    if artifact.exists() {
        let algorithm = ctx.config.dedupe.hash_algorithm;
        let artifact_hash = hash_file(&artifact, algorithm).await?;
        let source_hash = match &file.hash {
            Some(hash) => hash.clone(),
            None => hash_file(&file.path, algorithm).await?,
        };
        if artifact_hash == source_hash {
            tracing::debug!(
                file_id = %file.id,
                artifact = %artifact.display(),
                "artifact already present, skipping recompression"
            );
            ctx.store
                .update_file_status(
                    file.id,
                    FileStatus::Compressed,
                    FileUpdate {
                        path: Some(artifact),
                        compression_ratio: Some(1.0),
                        ..Default::default()
                    },
                )
                .await?;
            return Ok(1.0);
        }
    }

    let date = capture_date(&file.path, &policy.ffprobe_path).await;
    let age = date.map(|d| age_years(d, Utc::now().date_naive()));
    let tier = pick_tier(policy, age);

    let compressed_size = match MediaType::from_path(&file.path) {
        MediaType::Image => {
            match compress_image(
                &file.path,
                &artifact,
                tier.resize_percentage,
                policy.jpeg_quality,
            )
            .await
            {
                Ok(size) => Some(size),
                Err(PipelineError::Media(reason)) => {
                    // Undecodable image: pass it through untouched.
                    ctx.log(
                        PhaseName::Compress,
                        Severity::Warning,
                        &format!("{}: passing through uncompressed ({})", file.filename, reason),
                    )
                    .await;
                    None
                }
                Err(e) => return Err(e),
            }
        }
        MediaType::Video => Some(
            compress_video(
                &policy.ffmpeg_path,
                &file.path,
                &artifact,
                tier.video_resolution,
                policy.video_crf,
                policy.video_preset,
            )
            .await?,
        ),
        MediaType::Other => {
            ctx.log(
                PhaseName::Compress,
                Severity::Warning,
                &format!("{}: unsupported media type, passing through", file.filename),
            )
            .await;
            None
        }
    };

    // A result larger than the original keeps the original bytes; ratio 1.0.
    let ratio = match compressed_size {
        Some(size) if size < original_size && original_size > 0 => size as f64 / original_size as f64,
        _ => {
            tokio::fs::copy(&file.path, &artifact).await?;
            1.0
        }
    };

    ctx.store
        .update_file_status(
            file.id,
            FileStatus::Compressed,
            FileUpdate {
                path: Some(artifact),
                compression_ratio: Some(ratio),
                ..Default::default()
            },
        )
        .await?;
    Ok(ratio)
}

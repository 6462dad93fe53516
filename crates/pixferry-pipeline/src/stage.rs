//! Bridge staging phase.
//!
//! Partitions compressed artifacts into the flat per-destination bridge
//! directories, bounded by the configured size and count caps. Each
//! invocation records one Batch row per destination covering exactly the
//! files it placed. Bridge directories are held under a lock file that the
//! stager and the destination's uploader share.

use std::path::{Path, PathBuf};
use std::time::Instant;

use pixferry_core::models::{
    FileStatus, MediaFile, PhaseName, PhaseOutcome, Severity, UploadKind,
};
use pixferry_core::{PipelineError, PipelineResult, StagingPolicy};

use crate::context::PipelineContext;
use crate::fsutil::with_name_suffix;
use crate::hashing::hash_file;

pub(crate) const LOCK_FILENAME: &str = ".pixferry.lock";

/// Exclusive ownership of a bridge directory, backed by a create-new lock
/// file. Dropped on scope exit; a stale lock from a crashed process must be
/// removed by the operator.
pub struct BridgeLock {
    path: PathBuf,
}

impl BridgeLock {
    pub async fn acquire(bridge_dir: &Path) -> PipelineResult<Self> {
        tokio::fs::create_dir_all(bridge_dir).await?;
        let path = bridge_dir.join(LOCK_FILENAME);
        match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(_) => Ok(Self { path }),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(PipelineError::Media(
                format!("bridge {} is locked by another process", bridge_dir.display()),
            )),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for BridgeLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// How one file landed in a bridge.
enum Placement {
    Copied(PathBuf),
    /// Same name, same content already present (interrupted stage).
    AlreadyPresent(PathBuf),
}

pub struct StagePhase;

impl StagePhase {
    pub async fn run(&self, ctx: &PipelineContext) -> PhaseOutcome {
        let mut outcome = PhaseOutcome::new(PhaseName::Stage);
        let start = Instant::now();

        let destinations: Vec<UploadKind> = [
            (UploadKind::ICloud, ctx.config.features.icloud_upload),
            (UploadKind::Pixel, ctx.config.features.pixel_upload),
        ]
        .into_iter()
        .filter_map(|(dest, enabled)| enabled.then_some(dest))
        .collect();
        if destinations.is_empty() {
            outcome.skipped = 1;
            outcome.duration = start.elapsed();
            return outcome;
        }

        let eligible = match ctx.store.files_with_status(FileStatus::Compressed).await {
            Ok(files) => files,
            Err(e) => {
                outcome.started = false;
                outcome.error = Some(e.to_string());
                outcome.duration = start.elapsed();
                return outcome;
            }
        };
        let shipment = take_within_caps(&ctx.config.staging, &eligible);
        tracing::info!(
            eligible = eligible.len(),
            staged = shipment.len(),
            destinations = destinations.len(),
            "staging shipment"
        );
        if shipment.is_empty() {
            outcome.duration = start.elapsed();
            return outcome;
        }

        for dest in destinations {
            if ctx.cancel.is_cancelled() {
                break;
            }
            match self.stage_destination(ctx, dest, &shipment).await {
                Ok(placed) => {
                    outcome.processed += placed as u64;
                    outcome.succeeded += placed as u64;
                }
                Err(e) => {
                    outcome.started = false;
                    outcome.error = Some(e.to_string());
                    ctx.log(
                        PhaseName::Stage,
                        Severity::Error,
                        &format!("staging for {} failed: {}", dest, e),
                    )
                    .await;
                }
            }
        }

        outcome.duration = start.elapsed();
        outcome
    }

    /// Place the shipment into one destination's bridge and record the
    /// batch. Returns how many files were placed.
    async fn stage_destination(
        &self,
        ctx: &PipelineContext,
        dest: UploadKind,
        shipment: &[MediaFile],
    ) -> PipelineResult<usize> {
        let bridge_dir = ctx.config.paths.bridge_dir(dest).to_path_buf();
        let _lock = BridgeLock::acquire(&bridge_dir).await?;

        if ctx.config.staging.clear_bridge_before_processing {
            self.clear_uploaded_residue(ctx, &bridge_dir).await?;
        }

        let mut member_ids = Vec::with_capacity(shipment.len());
        for file in shipment {
            let placement = self
                .place(ctx, file, &bridge_dir)
                .await?;
            match &placement {
                Placement::Copied(path) => {
                    tracing::debug!(file_id = %file.id, path = %path.display(), "staged");
                }
                Placement::AlreadyPresent(path) => {
                    tracing::debug!(file_id = %file.id, path = %path.display(), "already staged");
                }
            }
            member_ids.push(file.id);
        }

        let batch = ctx.store.create_batch(dest, &member_ids).await?;
        ctx.log(
            PhaseName::Stage,
            Severity::Success,
            &format!(
                "batch {} for {}: {} files, {} bytes",
                batch.id, dest, batch.file_count, batch.total_size_bytes
            ),
        )
        .await;
        Ok(member_ids.len())
    }

    /// Copy one artifact into the bridge under the filename-conflict rule:
    /// same name and same hash is skipped; same name with a different hash
    /// gets an eight-character hash prefix appended before the extension.
    async fn place(
        &self,
        ctx: &PipelineContext,
        file: &MediaFile,
        bridge_dir: &Path,
    ) -> PipelineResult<Placement> {
        let basename = file
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                PipelineError::Media(format!("no basename in {}", file.path.display()))
            })?;
        let hash = file
            .hash
            .as_deref()
            .ok_or_else(|| PipelineError::Media(format!("file {} has no hash", file.id)))?;

        let mut target = bridge_dir.join(basename);
        if target.exists() {
            let existing_hash =
                hash_file(&target, ctx.config.dedupe.hash_algorithm).await?;
            let staged_hash = hash_file(&file.path, ctx.config.dedupe.hash_algorithm).await?;
            if existing_hash == staged_hash {
                return Ok(Placement::AlreadyPresent(target));
            }
            let suffix = format!("_{}", &hash[..hash.len().min(8)]);
            target = bridge_dir.join(with_name_suffix(basename, &suffix));
            if target.exists() {
                // Suffixed copy from an earlier interrupted run.
                return Ok(Placement::AlreadyPresent(target));
            }
        }
        tokio::fs::copy(&file.path, &target).await?;
        Ok(Placement::Copied(target))
    }

    /// Remove bridge entries whose tracked file already moved past upload.
    async fn clear_uploaded_residue(
        &self,
        ctx: &PipelineContext,
        bridge_dir: &Path,
    ) -> PipelineResult<()> {
        let mut entries = tokio::fs::read_dir(bridge_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name == LOCK_FILENAME {
                continue;
            }
            let rows = ctx.store.find_files_by_filename(name).await?;
            let uploaded = rows.iter().any(|f| {
                matches!(f.status, FileStatus::Uploaded | FileStatus::Verified)
            });
            if uploaded {
                tokio::fs::remove_file(&path).await?;
                tracing::debug!(path = %path.display(), "cleared uploaded residue");
            }
        }
        Ok(())
    }
}

/// Prefix of `eligible` fitting the caps. A file landing exactly on either
/// cap is included; a single oversized file is shipped alone rather than
/// wedging the queue.
fn take_within_caps(policy: &StagingPolicy, eligible: &[MediaFile]) -> Vec<MediaFile> {
    let max_bytes = policy.max_batch_size_bytes();
    let mut total = 0u64;
    let mut taken = Vec::new();
    for file in eligible {
        if taken.len() as u64 >= policy.max_batch_files {
            break;
        }
        let size = file.size_bytes.max(0) as u64;
        if total + size > max_bytes && !taken.is_empty() {
            break;
        }
        total += size;
        taken.push(file.clone());
    }
    taken
}

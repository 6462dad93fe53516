//! Destination upload adapters.
//!
//! Both adapters consume a bridge directory the stager filled: the browser
//! uploader pushes each file through the cloud photo UI, the pixel adapter
//! hands the folder to the sync daemon. The bridge listing on disk is the
//! shipping manifest; rows are mapped back to tracked files through the
//! stager's naming rules.

pub mod icloud;
pub mod selectors;
pub mod webdriver;

use std::path::{Path, PathBuf};

use pixferry_core::models::{FileStatus, MediaFile, UploadKind};
use pixferry_core::PipelineResult;
use pixferry_db::FileUpdate;

use crate::context::PipelineContext;
use crate::fsutil::{move_file, unique_destination};

pub(crate) use crate::stage::LOCK_FILENAME;

/// Files currently staged in a bridge, sorted by name.
pub(crate) async fn bridge_entries(bridge_dir: &Path) -> PipelineResult<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut entries = match tokio::fs::read_dir(bridge_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(files),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        let path = entry.path();
        if path.file_name().and_then(|n| n.to_str()) == Some(LOCK_FILENAME) {
            continue;
        }
        files.push(path);
    }
    files.sort();
    Ok(files)
}

/// Map a bridge entry back to its tracked file.
///
/// Plain names match the row's filename directly. Names the stager suffixed
/// for a conflict (`stem_<8-hex>.ext`) are matched by stripping the suffix
/// and checking the hash prefix.
pub(crate) async fn map_bridge_entry(
    ctx: &PipelineContext,
    entry: &Path,
) -> PipelineResult<Option<MediaFile>> {
    let Some(name) = entry.file_name().and_then(|n| n.to_str()) else {
        return Ok(None);
    };
    fn shippable(f: &MediaFile) -> bool {
        matches!(
            f.status,
            FileStatus::Batched | FileStatus::Uploaded | FileStatus::Verified
        )
    }

    let rows = ctx.store.find_files_by_filename(name).await?;
    if let Some(file) = rows.into_iter().find(shippable) {
        return Ok(Some(file));
    }

    // stem_deadbeef.ext -> stem.ext with hash prefix deadbeef
    let path = Path::new(name);
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or(name);
    let ext = path.extension().and_then(|e| e.to_str());
    if let Some(idx) = stem.rfind('_') {
        let (base, suffix) = stem.split_at(idx);
        let prefix = &suffix[1..];
        if prefix.len() == 8 && prefix.chars().all(|c| c.is_ascii_hexdigit()) {
            let original = match ext {
                Some(ext) => format!("{}.{}", base, ext),
                None => base.to_string(),
            };
            let rows = ctx.store.find_files_by_filename(&original).await?;
            let matched = rows.into_iter().find(|f| {
                shippable(f) && f.hash.as_deref().is_some_and(|h| h.starts_with(prefix))
            });
            return Ok(matched);
        }
    }
    Ok(None)
}

/// Record a successful ship: move the bridge copy into the destination's
/// uploaded directory and advance the row when this is its first completed
/// destination.
pub(crate) async fn finish_upload(
    ctx: &PipelineContext,
    dest: UploadKind,
    entry: &Path,
    file: &MediaFile,
) -> PipelineResult<()> {
    let uploaded_dir = ctx.config.paths.uploaded_dir(dest);
    tokio::fs::create_dir_all(uploaded_dir).await?;
    let name = entry
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(&file.filename);
    let target = unique_destination(uploaded_dir, name).await?;
    move_file(entry, &target).await?;

    if file.status == FileStatus::Batched {
        ctx.store
            .update_file_status(
                file.id,
                FileStatus::Uploaded,
                FileUpdate {
                    path: Some(target),
                    ..Default::default()
                },
            )
            .await?;
    }
    Ok(())
}

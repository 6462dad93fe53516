//! Small filesystem helpers shared by the phases.

use std::path::{Path, PathBuf};

use pixferry_core::{PipelineError, PipelineResult};

/// Move a file, falling back to copy+remove across filesystems.
pub async fn move_file(source: &Path, dest: &Path) -> PipelineResult<()> {
    match tokio::fs::rename(source, dest).await {
        Ok(()) => Ok(()),
        Err(_) => {
            tokio::fs::copy(source, dest).await?;
            tokio::fs::remove_file(source).await?;
            Ok(())
        }
    }
}

/// First free destination path in `dir`: the plain basename, then
/// `name_1.ext`, `name_2.ext`, and so on.
pub async fn unique_destination(dir: &Path, filename: &str) -> PipelineResult<PathBuf> {
    let candidate = dir.join(filename);
    if !candidate.exists() {
        return Ok(candidate);
    }
    let path = Path::new(filename);
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(filename);
    let ext = path.extension().and_then(|e| e.to_str());
    for n in 1..10_000u32 {
        let name = match ext {
            Some(ext) => format!("{}_{}.{}", stem, n, ext),
            None => format!("{}_{}", stem, n),
        };
        let candidate = dir.join(name);
        if !candidate.exists() {
            return Ok(candidate);
        }
    }
    Err(PipelineError::Media(format!(
        "cannot find a free name for {} in {}",
        filename,
        dir.display()
    )))
}

/// `name.ext` -> `name<suffix>.ext`; no extension appends directly.
pub fn with_name_suffix(filename: &str, suffix: &str) -> String {
    let path = Path::new(filename);
    match (
        path.file_stem().and_then(|s| s.to_str()),
        path.extension().and_then(|e| e.to_str()),
    ) {
        (Some(stem), Some(ext)) => format!("{}{}.{}", stem, suffix, ext),
        _ => format!("{}{}", filename, suffix),
    }
}

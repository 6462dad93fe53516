//! Video recompression via ffmpeg.

use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;

use pixferry_core::{PipelineError, PipelineResult, VideoPreset};

/// Transcode `source` to `dest`, scaling to `target_lines` of vertical
/// resolution (width follows, kept even) with the given CRF and preset.
/// Audio is copied through. Returns the output size in bytes.
pub async fn compress_video(
    ffmpeg_path: &str,
    source: &Path,
    dest: &Path,
    target_lines: u32,
    crf: u8,
    preset: VideoPreset,
) -> PipelineResult<u64> {
    let output = Command::new(ffmpeg_path)
        .arg("-y")
        .arg("-i")
        .arg(source)
        .args([
            "-c:v",
            "libx264",
            "-vf",
            &format!("scale=-2:'min({},ih)'", target_lines),
            "-crf",
            &crf.to_string(),
            "-preset",
            preset.as_str(),
            "-c:a",
            "copy",
        ])
        .arg(dest)
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| PipelineError::Media(format!("failed to execute ffmpeg: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(PipelineError::Media(format!(
            "ffmpeg failed on {}: {}",
            source.display(),
            stderr.trim()
        )));
    }

    Ok(tokio::fs::metadata(dest).await?.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_ffmpeg_is_media_error() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("clip.mp4");
        tokio::fs::write(&source, b"stub").await.unwrap();

        let err = compress_video(
            "ffmpeg-binary-that-does-not-exist",
            &source,
            &dir.path().join("out.mp4"),
            720,
            28,
            VideoPreset::Medium,
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), "media");
    }
}

//! Capture-date extraction.
//!
//! The same fallback chain serves the compressor's age tiering and the
//! sorter's date partitioning:
//!
//! 1. EXIF `DateTimeOriginal`
//! 2. container creation metadata (EXIF `DateTimeDigitized`, or the video
//!    container's `creation_time` via ffprobe)
//! 3. EXIF `DateTime` / filesystem creation time
//! 4. filesystem mtime
//!
//! `None` means every step failed; the sorter buckets such files under
//! `unknown/`.

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

use crate::media::MediaType;

/// Resolve the capture date for a media file.
pub async fn capture_date(path: &Path, ffprobe_path: &str) -> Option<NaiveDate> {
    let media_type = MediaType::from_path(path);

    let metadata_date = match media_type {
        MediaType::Image => exif_date(path).await,
        MediaType::Video => container_date(path, ffprobe_path).await,
        MediaType::Other => None,
    };
    if let Some(date) = metadata_date {
        return Some(date);
    }

    filesystem_date(path).await
}

/// EXIF chain for images: DateTimeOriginal, then DateTimeDigitized, then
/// DateTime. Parsing runs on the blocking pool.
async fn exif_date(path: &Path) -> Option<NaiveDate> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || read_exif_date(&path))
        .await
        .ok()
        .flatten()
}

fn read_exif_date(path: &PathBuf) -> Option<NaiveDate> {
    let file = File::open(path).ok()?;
    let mut reader = BufReader::new(file);
    let exif = exif::Reader::new().read_from_container(&mut reader).ok()?;

    for tag in [
        exif::Tag::DateTimeOriginal,
        exif::Tag::DateTimeDigitized,
        exif::Tag::DateTime,
    ] {
        if let Some(field) = exif.get_field(tag, exif::In::PRIMARY) {
            if let exif::Value::Ascii(ref values) = field.value {
                if let Some(raw) = values.first() {
                    if let Ok(dt) = exif::DateTime::from_ascii(raw) {
                        if let Some(date) =
                            NaiveDate::from_ymd_opt(dt.year as i32, dt.month as u32, dt.day as u32)
                        {
                            return Some(date);
                        }
                    }
                }
            }
        }
    }
    None
}

/// Video container creation date via ffprobe.
async fn container_date(path: &Path, ffprobe_path: &str) -> Option<NaiveDate> {
    let output = Command::new(ffprobe_path)
        .args([
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-show_format",
        ])
        .arg(path)
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let parsed: serde_json::Value = serde_json::from_slice(&output.stdout).ok()?;
    let creation_time = parsed
        .get("format")?
        .get("tags")?
        .get("creation_time")?
        .as_str()?;
    DateTime::parse_from_rfc3339(creation_time)
        .ok()
        .map(|dt| dt.date_naive())
}

/// Filesystem fallbacks: creation time where the platform reports one,
/// then mtime.
async fn filesystem_date(path: &Path) -> Option<NaiveDate> {
    let metadata = tokio::fs::metadata(path).await.ok()?;
    let stamp = metadata.created().or_else(|_| metadata.modified()).ok()?;
    let datetime: DateTime<Utc> = stamp.into();
    Some(datetime.date_naive())
}

/// Age in whole years relative to `now`, used for compression tiering.
pub fn age_years(date: NaiveDate, now: NaiveDate) -> u32 {
    let mut years = now.year() - date.year();
    if (now.month(), now.day()) < (date.month(), date.day()) {
        years -= 1;
    }
    years.max(0) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_age_years() {
        let shot = NaiveDate::from_ymd_opt(2023, 4, 15).unwrap();
        assert_eq!(age_years(shot, NaiveDate::from_ymd_opt(2024, 4, 14).unwrap()), 0);
        assert_eq!(age_years(shot, NaiveDate::from_ymd_opt(2024, 4, 15).unwrap()), 1);
        assert_eq!(age_years(shot, NaiveDate::from_ymd_opt(2026, 8, 1).unwrap()), 3);
        // A date in the future never yields a negative age.
        assert_eq!(age_years(shot, NaiveDate::from_ymd_opt(2020, 1, 1).unwrap()), 0);
    }

    #[tokio::test]
    async fn test_plain_file_falls_back_to_filesystem_date() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("no_exif.jpg");
        tokio::fs::write(&path, b"not a real jpeg").await.unwrap();

        let date = capture_date(&path, "ffprobe-that-does-not-exist").await;
        // The file was just written, so the fallback date is today.
        assert_eq!(date, Some(Utc::now().date_naive()));
    }

    #[tokio::test]
    async fn test_missing_file_has_no_date() {
        assert_eq!(
            capture_date(Path::new("/nonexistent/clip.mp4"), "ffprobe").await,
            None
        );
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

/// Lifecycle status of a tracked media file.
///
/// Transitions are one-way. `Error` is terminal and can only be cleared by an
/// explicit operator reset, which re-enters the file at `Downloaded`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Downloaded,
    Deduplicated,
    Compressed,
    Batched,
    Uploaded,
    Verified,
    Error,
}

impl FileStatus {
    /// Whether the one-way status machine permits `self -> next`.
    pub fn can_transition_to(self, next: FileStatus) -> bool {
        use FileStatus::*;
        match (self, next) {
            (Downloaded, Deduplicated)
            | (Deduplicated, Compressed)
            | (Compressed, Batched)
            | (Batched, Uploaded)
            | (Uploaded, Verified) => true,
            // Any non-terminal status can fail.
            (Downloaded | Deduplicated | Compressed | Batched | Uploaded, Error) => true,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, FileStatus::Verified | FileStatus::Error)
    }
}

impl Display for FileStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        let s = match self {
            FileStatus::Downloaded => "downloaded",
            FileStatus::Deduplicated => "deduplicated",
            FileStatus::Compressed => "compressed",
            FileStatus::Batched => "batched",
            FileStatus::Uploaded => "uploaded",
            FileStatus::Verified => "verified",
            FileStatus::Error => "error",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for FileStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "downloaded" => Ok(FileStatus::Downloaded),
            "deduplicated" => Ok(FileStatus::Deduplicated),
            "compressed" => Ok(FileStatus::Compressed),
            "batched" => Ok(FileStatus::Batched),
            "uploaded" => Ok(FileStatus::Uploaded),
            "verified" => Ok(FileStatus::Verified),
            "error" => Ok(FileStatus::Error),
            _ => Err(anyhow::anyhow!("Invalid file status: {}", s)),
        }
    }
}

/// Which ingest adapter produced a file.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum IngestKind {
    ICloud,
    Folder,
}

impl Display for IngestKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            IngestKind::ICloud => write!(f, "icloud"),
            IngestKind::Folder => write!(f, "folder"),
        }
    }
}

impl FromStr for IngestKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "icloud" => Ok(IngestKind::ICloud),
            "folder" => Ok(IngestKind::Folder),
            _ => Err(anyhow::anyhow!("Invalid ingest kind: {}", s)),
        }
    }
}

/// A tracked media asset and its position in the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaFile {
    pub id: Uuid,
    pub filename: String,
    /// Current absolute location on disk.
    pub path: PathBuf,
    /// Where the file originally came from (remote reference or local path).
    pub source_path: String,
    pub size_bytes: i64,
    /// Lowercase hex of the configured hash algorithm. Set by dedupe.
    pub hash: Option<String>,
    /// compressed size / original size. Set by the compressor.
    pub compression_ratio: Option<f64>,
    pub is_duplicate: bool,
    pub source_kind: IngestKind,
    pub status: FileStatus,
    pub batch_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub mirror_synced: bool,
}

/// Attributes for registering a freshly ingested file.
#[derive(Debug, Clone)]
pub struct NewMediaFile {
    pub filename: String,
    pub path: PathBuf,
    pub source_path: String,
    pub size_bytes: i64,
    pub source_kind: IngestKind,
}

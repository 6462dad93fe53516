use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;
use uuid::Uuid;

/// Upload destination a batch is shipped to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum UploadKind {
    ICloud,
    Pixel,
}

impl Display for UploadKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            UploadKind::ICloud => write!(f, "icloud"),
            UploadKind::Pixel => write!(f, "pixel"),
        }
    }
}

impl FromStr for UploadKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "icloud" => Ok(UploadKind::ICloud),
            "pixel" => Ok(UploadKind::Pixel),
            _ => Err(anyhow::anyhow!("Invalid upload kind: {}", s)),
        }
    }
}

/// Lifecycle status of a batch.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Created,
    Uploading,
    Uploaded,
    Verified,
    Error,
}

impl BatchStatus {
    pub fn can_transition_to(self, next: BatchStatus) -> bool {
        use BatchStatus::*;
        matches!(
            (self, next),
            (Created, Uploading)
                | (Uploading, Uploaded)
                | (Uploaded, Verified)
                | (Uploading, Error)
                | (Uploaded, Error)
        )
    }
}

impl Display for BatchStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        let s = match self {
            BatchStatus::Created => "created",
            BatchStatus::Uploading => "uploading",
            BatchStatus::Uploaded => "uploaded",
            BatchStatus::Verified => "verified",
            BatchStatus::Error => "error",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for BatchStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(BatchStatus::Created),
            "uploading" => Ok(BatchStatus::Uploading),
            "uploaded" => Ok(BatchStatus::Uploaded),
            "verified" => Ok(BatchStatus::Verified),
            "error" => Ok(BatchStatus::Error),
            _ => Err(anyhow::anyhow!("Invalid batch status: {}", s)),
        }
    }
}

/// One shipment of files to a single destination.
///
/// `total_size_bytes` and `file_count` always equal the sum/count of member
/// files; the store enforces this by linking members in the same transaction
/// that creates the row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub id: Uuid,
    pub destination: UploadKind,
    pub status: BatchStatus,
    pub total_size_bytes: i64,
    pub file_count: i64,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

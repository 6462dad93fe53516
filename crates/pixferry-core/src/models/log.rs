use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;

/// The pipeline phases, in execution order.
///
/// `UploadICloud` and `SyncPixel` occupy the same position in the graph and
/// may run concurrently.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PhaseName {
    Ingest,
    Dedupe,
    Compress,
    Stage,
    UploadICloud,
    SyncPixel,
    Verify,
    Sort,
}

impl PhaseName {
    pub const ALL: [PhaseName; 8] = [
        PhaseName::Ingest,
        PhaseName::Dedupe,
        PhaseName::Compress,
        PhaseName::Stage,
        PhaseName::UploadICloud,
        PhaseName::SyncPixel,
        PhaseName::Verify,
        PhaseName::Sort,
    ];
}

impl Display for PhaseName {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        let s = match self {
            PhaseName::Ingest => "ingest",
            PhaseName::Dedupe => "dedupe",
            PhaseName::Compress => "compress",
            PhaseName::Stage => "stage",
            PhaseName::UploadICloud => "upload_icloud",
            PhaseName::SyncPixel => "sync_pixel",
            PhaseName::Verify => "verify",
            PhaseName::Sort => "sort",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for PhaseName {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ingest" => Ok(PhaseName::Ingest),
            "dedupe" => Ok(PhaseName::Dedupe),
            "compress" => Ok(PhaseName::Compress),
            "stage" => Ok(PhaseName::Stage),
            "upload_icloud" => Ok(PhaseName::UploadICloud),
            "sync_pixel" => Ok(PhaseName::SyncPixel),
            "verify" => Ok(PhaseName::Verify),
            "sort" => Ok(PhaseName::Sort),
            _ => Err(anyhow::anyhow!("Invalid phase name: {}", s)),
        }
    }
}

/// Severity of a log entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
}

impl Display for Severity {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        let s = match self {
            Severity::Info => "info",
            Severity::Success => "success",
            Severity::Warning => "warning",
            Severity::Error => "error",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for Severity {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(Severity::Info),
            "success" => Ok(Severity::Success),
            "warning" => Ok(Severity::Warning),
            "error" => Ok(Severity::Error),
            _ => Err(anyhow::anyhow!("Invalid severity: {}", s)),
        }
    }
}

/// An append-only structured pipeline event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// Monotone rowid assigned by the store.
    pub id: i64,
    pub step: PhaseName,
    pub message: String,
    pub severity: Severity,
    pub created_at: DateTime<Utc>,
}

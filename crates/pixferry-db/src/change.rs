//! Committed-change events emitted by the store.
//!
//! Every mutation that commits produces one [`Change`] carrying a full row
//! snapshot. The mirror replays snapshots as remote upserts, so events are
//! safe to coalesce, reorder within a row, or drop and re-derive from the
//! `mirror_synced` flags.

use pixferry_core::models::{Batch, DuplicateLink, LogEntry, MediaFile};

#[derive(Debug, Clone)]
pub enum Change {
    FileUpserted(MediaFile),
    FileStatusChanged(MediaFile),
    BatchCreated(Batch),
    BatchStatusChanged(Batch),
    DuplicateRecorded(DuplicateLink),
    LogAppended(LogEntry),
}

impl Change {
    /// Remote table the change belongs to.
    pub fn table(&self) -> &'static str {
        match self {
            Change::FileUpserted(_) | Change::FileStatusChanged(_) => "media_files",
            Change::BatchCreated(_) | Change::BatchStatusChanged(_) => "batches",
            Change::DuplicateRecorded(_) => "duplicates",
            Change::LogAppended(_) => "log_entries",
        }
    }

    /// Log-entry changes are the only ones the mirror queue may evict.
    pub fn is_log(&self) -> bool {
        matches!(self, Change::LogAppended(_))
    }

    /// JSON payload for the remote upsert.
    pub fn payload(&self) -> serde_json::Value {
        match self {
            Change::FileUpserted(f) | Change::FileStatusChanged(f) => {
                serde_json::to_value(f).unwrap_or_default()
            }
            Change::BatchCreated(b) | Change::BatchStatusChanged(b) => {
                serde_json::to_value(b).unwrap_or_default()
            }
            Change::DuplicateRecorded(d) => serde_json::to_value(d).unwrap_or_default(),
            Change::LogAppended(l) => serde_json::to_value(l).unwrap_or_default(),
        }
    }
}

//! Error types module
//!
//! All pipeline errors are unified under the [`PipelineError`] enum. Phase
//! workers record file-level errors on the file row and keep going; only
//! configuration and schema errors are fatal to the orchestrator.

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Schema conflict in local store: {0}")]
    Schema(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Upload control not found: tried {attempted} selectors within {timeout_secs}s")]
    SelectorNotFound { attempted: usize, timeout_secs: u64 },

    #[error("Upload timed out after {0}s")]
    UploadTimeout(u64),

    #[error("Sync did not settle within {0}s")]
    SyncTimeout(u64),

    #[error("Remote store unavailable: {0}")]
    RemoteUnavailable(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Nested write attempted while a write transaction is open")]
    Reentrant,

    #[error("Database error: {0}")]
    Database(#[source] sqlx::Error),

    #[error("Media processing error: {0}")]
    Media(String),

    #[error("Illegal status transition for {entity} {id}: {from} -> {to}")]
    IllegalTransition {
        entity: &'static str,
        id: String,
        from: String,
        to: String,
    },
}

impl From<sqlx::Error> for PipelineError {
    fn from(err: sqlx::Error) -> Self {
        PipelineError::Database(err)
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::Media(format!("JSON parsing error: {}", err))
    }
}

impl PipelineError {
    /// Short machine-readable kind, used in log rows and reports.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Config(_) => "config",
            PipelineError::Schema(_) => "schema",
            PipelineError::Auth(_) => "auth",
            PipelineError::SelectorNotFound { .. } => "selector_not_found",
            PipelineError::UploadTimeout(_) => "upload_timeout",
            PipelineError::SyncTimeout(_) => "sync_timeout",
            PipelineError::RemoteUnavailable(_) => "remote_unavailable",
            PipelineError::Io(_) => "io",
            PipelineError::Reentrant => "reentrant",
            PipelineError::Database(_) => "database",
            PipelineError::Media(_) => "media",
            PipelineError::IllegalTransition { .. } => "illegal_transition",
        }
    }

    /// Whether this error must abort the whole process rather than a single
    /// file or phase. Config and schema problems cannot be worked around;
    /// the CLI maps them to exit code 2.
    pub fn is_fatal(&self) -> bool {
        matches!(self, PipelineError::Config(_) | PipelineError::Schema(_))
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;

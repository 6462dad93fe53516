//! Append-only log entries.

use chrono::{DateTime, Utc};
use sqlx::FromRow;

use pixferry_core::models::{LogEntry, PhaseName, Severity};
use pixferry_core::{PipelineError, PipelineResult};

use super::MetaStore;
use crate::change::Change;

#[derive(FromRow)]
struct LogRow {
    id: i64,
    step: String,
    message: String,
    severity: String,
    created_at: DateTime<Utc>,
}

impl LogRow {
    fn into_model(self) -> PipelineResult<LogEntry> {
        let corrupt =
            |what: &str, raw: &str| PipelineError::Schema(format!("invalid {}: '{}'", what, raw));
        Ok(LogEntry {
            id: self.id,
            step: self
                .step
                .parse::<PhaseName>()
                .map_err(|_| corrupt("log step", &self.step))?,
            message: self.message,
            severity: self
                .severity
                .parse::<Severity>()
                .map_err(|_| corrupt("log severity", &self.severity))?,
            created_at: self.created_at,
        })
    }
}

impl MetaStore {
    /// Append a structured event. Rows are never updated or deleted outside
    /// retention pruning; ids are the monotone SQLite rowid.
    pub async fn append_log(
        &self,
        step: PhaseName,
        severity: Severity,
        message: &str,
    ) -> PipelineResult<LogEntry> {
        let message = message.to_string();
        let entry = self
            .with_write(|pool| async move {
                let now = Utc::now();
                let result = sqlx::query(
                    "INSERT INTO log_entries (step, message, severity, created_at) \
                     VALUES (?, ?, ?, ?)",
                )
                .bind(step.to_string())
                .bind(&message)
                .bind(severity.to_string())
                .bind(now)
                .execute(&pool)
                .await?;
                Ok(LogEntry {
                    id: result.last_insert_rowid(),
                    step,
                    message,
                    severity,
                    created_at: now,
                })
            })
            .await?;
        self.emit(Change::LogAppended(entry.clone()));
        Ok(entry)
    }

    /// Most recent entries, newest first.
    pub async fn recent_logs(&self, limit: i64) -> PipelineResult<Vec<LogEntry>> {
        let rows = sqlx::query_as::<_, LogRow>(
            "SELECT id, step, message, severity, created_at FROM log_entries \
             ORDER BY id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(LogRow::into_model).collect()
    }

    /// Retention pruning: drop entries older than `cutoff`. The only
    /// permitted deletion from the log table.
    pub async fn prune_logs(&self, cutoff: DateTime<Utc>) -> PipelineResult<u64> {
        self.with_write(|pool| async move {
            let result = sqlx::query("DELETE FROM log_entries WHERE created_at < ?")
                .bind(cutoff)
                .execute(&pool)
                .await?;
            Ok(result.rows_affected())
        })
        .await
    }
}

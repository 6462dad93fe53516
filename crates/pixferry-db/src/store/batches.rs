//! Batch operations.

use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

use pixferry_core::models::{Batch, BatchStatus, FileStatus, MediaFile, UploadKind};
use pixferry_core::{PipelineError, PipelineResult};

use super::files::MediaFileRow;
use super::MetaStore;
use crate::change::Change;

#[derive(FromRow)]
struct BatchRow {
    id: String,
    destination: String,
    status: String,
    total_size_bytes: i64,
    file_count: i64,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl BatchRow {
    fn into_model(self) -> PipelineResult<Batch> {
        let corrupt =
            |what: &str, raw: &str| PipelineError::Schema(format!("invalid {}: '{}'", what, raw));
        Ok(Batch {
            id: Uuid::parse_str(&self.id).map_err(|_| corrupt("batch id", &self.id))?,
            destination: self
                .destination
                .parse::<UploadKind>()
                .map_err(|_| corrupt("destination", &self.destination))?,
            status: self
                .status
                .parse::<BatchStatus>()
                .map_err(|_| corrupt("batch status", &self.status))?,
            total_size_bytes: self.total_size_bytes,
            file_count: self.file_count,
            created_at: self.created_at,
            completed_at: self.completed_at,
        })
    }
}

const SELECT_BATCH: &str = "SELECT id, destination, status, total_size_bytes, file_count, \
     created_at, completed_at FROM batches";

impl MetaStore {
    /// Create a batch for `destination` and atomically link `member_ids`.
    ///
    /// Members at `compressed` are transitioned to `batched` with their
    /// `batch_id` set in the same transaction. Members already `batched`
    /// (staged to another destination in the same run) are counted into the
    /// batch totals but keep their original link; a file's `batch_id`
    /// records its first shipment.
    pub async fn create_batch(
        &self,
        destination: UploadKind,
        member_ids: &[Uuid],
    ) -> PipelineResult<Batch> {
        if member_ids.is_empty() {
            return Err(PipelineError::Media(
                "cannot create a batch with no members".to_string(),
            ));
        }
        let ids: Vec<Uuid> = member_ids.to_vec();
        let (batch, members) = self
            .with_write(|pool| async move {
                let mut tx = pool.begin().await?;
                let now = Utc::now();
                let batch_id = Uuid::new_v4();

                let mut total_size = 0i64;
                let mut members = Vec::with_capacity(ids.len());
                for file_id in &ids {
                    let row = sqlx::query_as::<_, MediaFileRow>(
                        "SELECT id, filename, path, source_path, size_bytes, hash, \
                         compression_ratio, is_duplicate, source_kind, status, batch_id, \
                         created_at, processed_at, updated_at, mirror_synced \
                         FROM media_files WHERE id = ?",
                    )
                    .bind(file_id.to_string())
                    .fetch_optional(&mut *tx)
                    .await?
                    .ok_or_else(|| {
                        PipelineError::Media(format!("batch member {} not found", file_id))
                    })?;
                    let file = row.into_model()?;
                    if file.status != FileStatus::Batched
                        && !file.status.can_transition_to(FileStatus::Batched)
                    {
                        return Err(PipelineError::IllegalTransition {
                            entity: "file",
                            id: file_id.to_string(),
                            from: file.status.to_string(),
                            to: FileStatus::Batched.to_string(),
                        });
                    }
                    total_size += file.size_bytes;
                    members.push(file);
                }

                sqlx::query(
                    "INSERT INTO batches (id, destination, status, total_size_bytes, \
                     file_count, created_at, mirror_synced) VALUES (?, ?, ?, ?, ?, ?, 0)",
                )
                .bind(batch_id.to_string())
                .bind(destination.to_string())
                .bind(BatchStatus::Created.to_string())
                .bind(total_size)
                .bind(members.len() as i64)
                .bind(now)
                .execute(&mut *tx)
                .await?;

                for file in &mut members {
                    if file.status == FileStatus::Batched {
                        continue;
                    }
                    sqlx::query(
                        "UPDATE media_files SET status = ?, batch_id = ?, updated_at = ?, \
                         mirror_synced = 0 WHERE id = ?",
                    )
                    .bind(FileStatus::Batched.to_string())
                    .bind(batch_id.to_string())
                    .bind(now)
                    .bind(file.id.to_string())
                    .execute(&mut *tx)
                    .await?;
                    file.status = FileStatus::Batched;
                    file.batch_id = Some(batch_id);
                    file.updated_at = now;
                    file.mirror_synced = false;
                }

                tx.commit().await?;
                Ok((
                    Batch {
                        id: batch_id,
                        destination,
                        status: BatchStatus::Created,
                        total_size_bytes: total_size,
                        file_count: members.len() as i64,
                        created_at: now,
                        completed_at: None,
                    },
                    members,
                ))
            })
            .await?;

        self.emit(Change::BatchCreated(batch.clone()));
        for member in members {
            self.emit(Change::FileStatusChanged(member));
        }
        Ok(batch)
    }

    /// Transition a batch, optionally stamping `completed_at`.
    pub async fn set_batch_status(
        &self,
        id: Uuid,
        new_status: BatchStatus,
        completed_at: Option<DateTime<Utc>>,
    ) -> PipelineResult<Batch> {
        let batch = self
            .with_write(|pool| async move {
                let mut tx = pool.begin().await?;
                let row = sqlx::query_as::<_, BatchRow>(&format!(
                    "{} WHERE id = ?",
                    SELECT_BATCH
                ))
                .bind(id.to_string())
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| PipelineError::Media(format!("batch {} not found", id)))?;
                let mut batch = row.into_model()?;
                if !batch.status.can_transition_to(new_status) {
                    return Err(PipelineError::IllegalTransition {
                        entity: "batch",
                        id: id.to_string(),
                        from: batch.status.to_string(),
                        to: new_status.to_string(),
                    });
                }
                sqlx::query(
                    "UPDATE batches SET status = ?, completed_at = ?, mirror_synced = 0 \
                     WHERE id = ?",
                )
                .bind(new_status.to_string())
                .bind(completed_at)
                .bind(id.to_string())
                .execute(&mut *tx)
                .await?;
                tx.commit().await?;
                batch.status = new_status;
                batch.completed_at = completed_at;
                Ok(batch)
            })
            .await?;
        self.emit(Change::BatchStatusChanged(batch.clone()));
        Ok(batch)
    }

    /// Most recent batch for `destination` that has not finished uploading.
    /// Uploaders use this to find the shipment the stager just prepared.
    pub async fn latest_open_batch(
        &self,
        destination: UploadKind,
    ) -> PipelineResult<Option<Batch>> {
        let row = sqlx::query_as::<_, BatchRow>(&format!(
            "{} WHERE destination = ? AND status IN ('created', 'uploading') \
             ORDER BY created_at DESC, id DESC LIMIT 1",
            SELECT_BATCH
        ))
        .bind(destination.to_string())
        .fetch_optional(self.pool())
        .await?;
        row.map(BatchRow::into_model).transpose()
    }

    pub async fn get_batch(&self, id: Uuid) -> PipelineResult<Option<Batch>> {
        let row = sqlx::query_as::<_, BatchRow>(&format!("{} WHERE id = ?", SELECT_BATCH))
            .bind(id.to_string())
            .fetch_optional(self.pool())
            .await?;
        row.map(BatchRow::into_model).transpose()
    }

    /// Member files of a batch, oldest first.
    pub async fn batch_members(&self, id: Uuid) -> PipelineResult<Vec<MediaFile>> {
        let rows = sqlx::query_as::<_, MediaFileRow>(
            "SELECT id, filename, path, source_path, size_bytes, hash, compression_ratio, \
             is_duplicate, source_kind, status, batch_id, created_at, processed_at, \
             updated_at, mirror_synced FROM media_files WHERE batch_id = ? \
             ORDER BY created_at, id",
        )
        .bind(id.to_string())
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(MediaFileRow::into_model).collect()
    }

    /// Batches the remote mirror has not acknowledged yet.
    pub async fn unsynced_batches(&self) -> PipelineResult<Vec<Batch>> {
        let rows = sqlx::query_as::<_, BatchRow>(&format!(
            "{} WHERE mirror_synced = 0 ORDER BY created_at, id",
            SELECT_BATCH
        ))
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(BatchRow::into_model).collect()
    }

    /// Remote acknowledged this row. Called by the mirror only.
    pub async fn mark_batch_mirror_synced(&self, id: Uuid) -> PipelineResult<()> {
        self.with_write(|pool| async move {
            sqlx::query("UPDATE batches SET mirror_synced = 1 WHERE id = ?")
                .bind(id.to_string())
                .execute(&pool)
                .await?;
            Ok(())
        })
        .await
    }
}

//! MediaFile operations.

use chrono::{DateTime, Utc};
use sqlx::FromRow;
use std::path::PathBuf;
use uuid::Uuid;

use pixferry_core::models::{FileStatus, IngestKind, MediaFile, NewMediaFile};
use pixferry_core::{PipelineError, PipelineResult};

use super::MetaStore;
use crate::change::Change;

#[derive(FromRow)]
pub(crate) struct MediaFileRow {
    pub id: String,
    pub filename: String,
    pub path: String,
    pub source_path: String,
    pub size_bytes: i64,
    pub hash: Option<String>,
    pub compression_ratio: Option<f64>,
    pub is_duplicate: bool,
    pub source_kind: String,
    pub status: String,
    pub batch_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub mirror_synced: bool,
}

impl MediaFileRow {
    pub(crate) fn into_model(self) -> PipelineResult<MediaFile> {
        let corrupt =
            |what: &str, raw: &str| PipelineError::Schema(format!("invalid {}: '{}'", what, raw));
        Ok(MediaFile {
            id: Uuid::parse_str(&self.id).map_err(|_| corrupt("file id", &self.id))?,
            filename: self.filename,
            path: PathBuf::from(self.path),
            source_path: self.source_path,
            size_bytes: self.size_bytes,
            hash: self.hash,
            compression_ratio: self.compression_ratio,
            is_duplicate: self.is_duplicate,
            source_kind: self
                .source_kind
                .parse::<IngestKind>()
                .map_err(|_| corrupt("source kind", &self.source_kind))?,
            status: self
                .status
                .parse::<FileStatus>()
                .map_err(|_| corrupt("file status", &self.status))?,
            batch_id: match self.batch_id {
                Some(raw) => Some(Uuid::parse_str(&raw).map_err(|_| corrupt("batch id", &raw))?),
                None => None,
            },
            created_at: self.created_at,
            processed_at: self.processed_at,
            updated_at: self.updated_at,
            mirror_synced: self.mirror_synced,
        })
    }
}

const SELECT_FILE: &str = "SELECT id, filename, path, source_path, size_bytes, hash, \
     compression_ratio, is_duplicate, source_kind, status, batch_id, created_at, \
     processed_at, updated_at, mirror_synced FROM media_files";

/// Optional field updates applied together with (or without) a status change.
#[derive(Debug, Default, Clone)]
pub struct FileUpdate {
    pub path: Option<PathBuf>,
    pub hash: Option<String>,
    pub compression_ratio: Option<f64>,
    pub batch_id: Option<Uuid>,
    pub is_duplicate: Option<bool>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl MetaStore {
    /// Register a file, idempotent on `(source_path, filename)`. Returns the
    /// existing row untouched when the pair was seen before.
    pub async fn upsert_file(&self, new: NewMediaFile) -> PipelineResult<MediaFile> {
        let (file, created) = self
            .with_write(|pool| async move {
                let mut tx = pool.begin().await?;
                let existing = sqlx::query_as::<_, MediaFileRow>(&format!(
                    "{} WHERE source_path = ? AND filename = ?",
                    SELECT_FILE
                ))
                .bind(&new.source_path)
                .bind(&new.filename)
                .fetch_optional(&mut *tx)
                .await?;

                if let Some(row) = existing {
                    tx.commit().await?;
                    return Ok((row.into_model()?, false));
                }

                let now = Utc::now();
                let id = Uuid::new_v4();
                sqlx::query(
                    "INSERT INTO media_files (id, filename, path, source_path, size_bytes, \
                     is_duplicate, source_kind, status, created_at, updated_at, mirror_synced) \
                     VALUES (?, ?, ?, ?, ?, 0, ?, ?, ?, ?, 0)",
                )
                .bind(id.to_string())
                .bind(&new.filename)
                .bind(new.path.to_string_lossy().as_ref())
                .bind(&new.source_path)
                .bind(new.size_bytes)
                .bind(new.source_kind.to_string())
                .bind(FileStatus::Downloaded.to_string())
                .bind(now)
                .bind(now)
                .execute(&mut *tx)
                .await?;
                tx.commit().await?;

                Ok((
                    MediaFile {
                        id,
                        filename: new.filename,
                        path: new.path,
                        source_path: new.source_path,
                        size_bytes: new.size_bytes,
                        hash: None,
                        compression_ratio: None,
                        is_duplicate: false,
                        source_kind: new.source_kind,
                        status: FileStatus::Downloaded,
                        batch_id: None,
                        created_at: now,
                        processed_at: None,
                        updated_at: now,
                        mirror_synced: false,
                    },
                    true,
                ))
            })
            .await?;
        if created {
            self.emit(Change::FileUpserted(file.clone()));
        }
        Ok(file)
    }

    /// Transition a file to `new_status`, applying `fields` in the same
    /// write. The one-way status machine is enforced; an illegal transition
    /// writes nothing.
    pub async fn update_file_status(
        &self,
        id: Uuid,
        new_status: FileStatus,
        fields: FileUpdate,
    ) -> PipelineResult<MediaFile> {
        let file = self
            .with_write(|pool| async move {
                let mut tx = pool.begin().await?;
                let row = fetch_required(&mut tx, id).await?;
                let current = row.into_model()?;
                if !current.status.can_transition_to(new_status) {
                    return Err(PipelineError::IllegalTransition {
                        entity: "file",
                        id: id.to_string(),
                        from: current.status.to_string(),
                        to: new_status.to_string(),
                    });
                }
                let updated = apply_update(&mut tx, current, Some(new_status), fields).await?;
                tx.commit().await?;
                Ok(updated)
            })
            .await?;
        self.emit(Change::FileStatusChanged(file.clone()));
        Ok(file)
    }

    /// Apply field updates without touching the status (quarantine moves,
    /// recorded sort timestamps).
    pub async fn update_file_fields(
        &self,
        id: Uuid,
        fields: FileUpdate,
    ) -> PipelineResult<MediaFile> {
        let file = self
            .with_write(|pool| async move {
                let mut tx = pool.begin().await?;
                let row = fetch_required(&mut tx, id).await?;
                let current = row.into_model()?;
                let updated = apply_update(&mut tx, current, None, fields).await?;
                tx.commit().await?;
                Ok(updated)
            })
            .await?;
        self.emit(Change::FileUpserted(file.clone()));
        Ok(file)
    }

    /// Operator action: clear `error` and re-enter the pipeline at
    /// `downloaded`. Refused for files in any other status.
    pub async fn reset_file(&self, id: Uuid) -> PipelineResult<MediaFile> {
        let file = self
            .with_write(|pool| async move {
                let mut tx = pool.begin().await?;
                let row = fetch_required(&mut tx, id).await?;
                let current = row.into_model()?;
                if current.status != FileStatus::Error {
                    return Err(PipelineError::IllegalTransition {
                        entity: "file",
                        id: id.to_string(),
                        from: current.status.to_string(),
                        to: FileStatus::Downloaded.to_string(),
                    });
                }
                let now = Utc::now();
                sqlx::query(
                    "UPDATE media_files SET status = ?, batch_id = NULL, updated_at = ?, \
                     mirror_synced = 0 WHERE id = ?",
                )
                .bind(FileStatus::Downloaded.to_string())
                .bind(now)
                .bind(id.to_string())
                .execute(&mut *tx)
                .await?;
                tx.commit().await?;
                Ok(MediaFile {
                    status: FileStatus::Downloaded,
                    batch_id: None,
                    updated_at: now,
                    mirror_synced: false,
                    ..current
                })
            })
            .await?;
        self.emit(Change::FileStatusChanged(file.clone()));
        Ok(file)
    }

    /// All rows sharing a logical filename, oldest first. Bridge cleanup
    /// uses this to map directory entries back to tracked files.
    pub async fn find_files_by_filename(&self, filename: &str) -> PipelineResult<Vec<MediaFile>> {
        let rows = sqlx::query_as::<_, MediaFileRow>(&format!(
            "{} WHERE filename = ? ORDER BY created_at, id",
            SELECT_FILE
        ))
        .bind(filename)
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(MediaFileRow::into_model).collect()
    }

    /// Look up a file by its registration key.
    pub async fn find_file_by_source(
        &self,
        source_path: &str,
        filename: &str,
    ) -> PipelineResult<Option<MediaFile>> {
        let row = sqlx::query_as::<_, MediaFileRow>(&format!(
            "{} WHERE source_path = ? AND filename = ?",
            SELECT_FILE
        ))
        .bind(source_path)
        .bind(filename)
        .fetch_optional(self.pool())
        .await?;
        row.map(MediaFileRow::into_model).transpose()
    }

    pub async fn get_file(&self, id: Uuid) -> PipelineResult<Option<MediaFile>> {
        let row = sqlx::query_as::<_, MediaFileRow>(&format!("{} WHERE id = ?", SELECT_FILE))
            .bind(id.to_string())
            .fetch_optional(self.pool())
            .await?;
        row.map(MediaFileRow::into_model).transpose()
    }

    /// All files carrying `hash`, oldest first.
    pub async fn find_by_hash(&self, hash: &str) -> PipelineResult<Vec<MediaFile>> {
        let rows = sqlx::query_as::<_, MediaFileRow>(&format!(
            "{} WHERE hash = ? ORDER BY created_at, id",
            SELECT_FILE
        ))
        .bind(hash)
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(MediaFileRow::into_model).collect()
    }

    /// Files at `status`, oldest first. Phases use this as their work queue,
    /// which is what makes interrupted runs resumable.
    pub async fn files_with_status(&self, status: FileStatus) -> PipelineResult<Vec<MediaFile>> {
        let rows = sqlx::query_as::<_, MediaFileRow>(&format!(
            "{} WHERE status = ? ORDER BY created_at, id",
            SELECT_FILE
        ))
        .bind(status.to_string())
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(MediaFileRow::into_model).collect()
    }

    /// Survivor rows for warming the hash index: `(hash, id, created_at)` of
    /// every hashed non-duplicate file.
    pub async fn hash_survivors(&self) -> PipelineResult<Vec<(String, Uuid, DateTime<Utc>)>> {
        let rows = sqlx::query_as::<_, (String, String, DateTime<Utc>)>(
            "SELECT hash, id, created_at FROM media_files \
             WHERE hash IS NOT NULL AND is_duplicate = 0 ORDER BY created_at, id",
        )
        .fetch_all(self.pool())
        .await?;
        rows.into_iter()
            .map(|(hash, id, created_at)| {
                let id = Uuid::parse_str(&id)
                    .map_err(|_| PipelineError::Schema(format!("invalid file id: '{}'", id)))?;
                Ok((hash, id, created_at))
            })
            .collect()
    }

    pub async fn status_counts(&self) -> PipelineResult<Vec<(FileStatus, i64)>> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            "SELECT status, COUNT(*) FROM media_files GROUP BY status ORDER BY status",
        )
        .fetch_all(self.pool())
        .await?;
        rows.into_iter()
            .map(|(raw, count)| {
                let status = raw
                    .parse::<FileStatus>()
                    .map_err(|_| PipelineError::Schema(format!("invalid file status: '{}'", raw)))?;
                Ok((status, count))
            })
            .collect()
    }

    pub async fn error_file_ids(&self) -> PipelineResult<Vec<Uuid>> {
        let rows = sqlx::query_as::<_, (String,)>(
            "SELECT id FROM media_files WHERE status = 'error' ORDER BY created_at, id",
        )
        .fetch_all(self.pool())
        .await?;
        rows.into_iter()
            .map(|(id,)| {
                Uuid::parse_str(&id)
                    .map_err(|_| PipelineError::Schema(format!("invalid file id: '{}'", id)))
            })
            .collect()
    }

    /// Files the remote mirror has not acknowledged yet.
    pub async fn unsynced_files(&self) -> PipelineResult<Vec<MediaFile>> {
        let rows = sqlx::query_as::<_, MediaFileRow>(&format!(
            "{} WHERE mirror_synced = 0 ORDER BY created_at, id",
            SELECT_FILE
        ))
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(MediaFileRow::into_model).collect()
    }

    /// Remote acknowledged this row. Called by the mirror only.
    pub async fn mark_file_mirror_synced(&self, id: Uuid) -> PipelineResult<()> {
        self.with_write(|pool| async move {
            sqlx::query("UPDATE media_files SET mirror_synced = 1 WHERE id = ?")
                .bind(id.to_string())
                .execute(&pool)
                .await?;
            Ok(())
        })
        .await
    }
}

async fn fetch_required(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    id: Uuid,
) -> PipelineResult<MediaFileRow> {
    sqlx::query_as::<_, MediaFileRow>(&format!("{} WHERE id = ?", SELECT_FILE))
        .bind(id.to_string())
        .fetch_optional(&mut **tx)
        .await?
        .ok_or_else(|| PipelineError::Media(format!("file {} not found", id)))
}

async fn apply_update(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    current: MediaFile,
    new_status: Option<FileStatus>,
    fields: FileUpdate,
) -> PipelineResult<MediaFile> {
    let mut updated = current;
    if let Some(status) = new_status {
        updated.status = status;
    }
    if let Some(path) = fields.path {
        updated.path = path;
    }
    if let Some(hash) = fields.hash {
        updated.hash = Some(hash);
    }
    if let Some(ratio) = fields.compression_ratio {
        updated.compression_ratio = Some(ratio);
    }
    if let Some(batch_id) = fields.batch_id {
        updated.batch_id = Some(batch_id);
    }
    if let Some(is_duplicate) = fields.is_duplicate {
        updated.is_duplicate = is_duplicate;
    }
    if let Some(processed_at) = fields.processed_at {
        updated.processed_at = Some(processed_at);
    }
    updated.updated_at = Utc::now();
    updated.mirror_synced = false;
    sqlx::query(
        "UPDATE media_files SET status = ?, path = ?, hash = ?, compression_ratio = ?, \
         batch_id = ?, is_duplicate = ?, processed_at = ?, updated_at = ?, mirror_synced = 0 \
         WHERE id = ?",
    )
    .bind(updated.status.to_string())
    .bind(updated.path.to_string_lossy().as_ref())
    .bind(&updated.hash)
    .bind(updated.compression_ratio)
    .bind(updated.batch_id.map(|id| id.to_string()))
    .bind(updated.is_duplicate)
    .bind(updated.processed_at)
    .bind(updated.updated_at)
    .bind(updated.id.to_string())
    .execute(&mut **tx)
    .await?;
    Ok(updated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::new_file;

    #[tokio::test]
    async fn test_upsert_is_idempotent_on_source_and_name() {
        let store = MetaStore::open_in_memory().await.unwrap();
        let first = store.upsert_file(new_file("a.jpg")).await.unwrap();
        let second = store.upsert_file(new_file("a.jpg")).await.unwrap();
        assert_eq!(first.id, second.id);

        let all = store
            .files_with_status(FileStatus::Downloaded)
            .await
            .unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn test_status_transitions_enforced() {
        let store = MetaStore::open_in_memory().await.unwrap();
        let file = store.upsert_file(new_file("a.jpg")).await.unwrap();

        // Skipping deduplicated is refused and writes nothing.
        let err = store
            .update_file_status(file.id, FileStatus::Compressed, FileUpdate::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "illegal_transition");
        let unchanged = store.get_file(file.id).await.unwrap().unwrap();
        assert_eq!(unchanged.status, FileStatus::Downloaded);

        let file = store
            .update_file_status(
                file.id,
                FileStatus::Deduplicated,
                FileUpdate {
                    hash: Some("abc123".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(file.status, FileStatus::Deduplicated);
        assert_eq!(file.hash.as_deref(), Some("abc123"));
        assert!(!file.mirror_synced);
    }

    #[tokio::test]
    async fn test_find_by_hash_ordered_by_created() {
        let store = MetaStore::open_in_memory().await.unwrap();
        let a = store.upsert_file(new_file("a.jpg")).await.unwrap();
        let b = store.upsert_file(new_file("b.jpg")).await.unwrap();
        for f in [&a, &b] {
            store
                .update_file_status(
                    f.id,
                    FileStatus::Deduplicated,
                    FileUpdate {
                        hash: Some("samehash".into()),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
        }
        let found = store.find_by_hash("samehash").await.unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].id, a.id);
    }

    #[tokio::test]
    async fn test_reset_file_only_from_error() {
        let store = MetaStore::open_in_memory().await.unwrap();
        let file = store.upsert_file(new_file("a.jpg")).await.unwrap();

        assert!(store.reset_file(file.id).await.is_err());

        store
            .update_file_status(file.id, FileStatus::Error, FileUpdate::default())
            .await
            .unwrap();
        let reset = store.reset_file(file.id).await.unwrap();
        assert_eq!(reset.status, FileStatus::Downloaded);
        assert!(reset.batch_id.is_none());
    }

    #[tokio::test]
    async fn test_status_counts() {
        let store = MetaStore::open_in_memory().await.unwrap();
        let a = store.upsert_file(new_file("a.jpg")).await.unwrap();
        store.upsert_file(new_file("b.jpg")).await.unwrap();
        store
            .update_file_status(a.id, FileStatus::Error, FileUpdate::default())
            .await
            .unwrap();

        let counts = store.status_counts().await.unwrap();
        assert!(counts.contains(&(FileStatus::Downloaded, 1)));
        assert!(counts.contains(&(FileStatus::Error, 1)));
        assert_eq!(store.error_file_ids().await.unwrap(), vec![a.id]);
    }
}

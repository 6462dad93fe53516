//! Duplicate-link operations. Rows are written once and never mutated.

use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

use pixferry_core::models::DuplicateLink;
use pixferry_core::{PipelineError, PipelineResult};

use super::MetaStore;
use crate::change::Change;

#[derive(FromRow)]
struct DuplicateRow {
    id: String,
    original_id: String,
    duplicate_id: String,
    hash: String,
    created_at: DateTime<Utc>,
}

impl DuplicateRow {
    fn into_model(self) -> PipelineResult<DuplicateLink> {
        let parse = |what: &str, raw: &str| {
            Uuid::parse_str(raw)
                .map_err(|_| PipelineError::Schema(format!("invalid {}: '{}'", what, raw)))
        };
        Ok(DuplicateLink {
            id: parse("duplicate link id", &self.id)?,
            original_id: parse("original id", &self.original_id)?,
            duplicate_id: parse("duplicate id", &self.duplicate_id)?,
            hash: self.hash,
            created_at: self.created_at,
        })
    }
}

impl MetaStore {
    /// Link `duplicate_id` to its surviving original and flag the duplicate
    /// row, in one transaction.
    pub async fn record_duplicate(
        &self,
        original_id: Uuid,
        duplicate_id: Uuid,
        hash: &str,
    ) -> PipelineResult<DuplicateLink> {
        let hash = hash.to_string();
        let link = self
            .with_write(|pool| async move {
                let mut tx = pool.begin().await?;
                let now = Utc::now();
                let id = Uuid::new_v4();
                sqlx::query(
                    "INSERT INTO duplicates (id, original_id, duplicate_id, hash, created_at) \
                     VALUES (?, ?, ?, ?, ?)",
                )
                .bind(id.to_string())
                .bind(original_id.to_string())
                .bind(duplicate_id.to_string())
                .bind(&hash)
                .bind(now)
                .execute(&mut *tx)
                .await?;
                sqlx::query(
                    "UPDATE media_files SET is_duplicate = 1, hash = ?, updated_at = ?, \
                     mirror_synced = 0 WHERE id = ?",
                )
                .bind(&hash)
                .bind(now)
                .bind(duplicate_id.to_string())
                .execute(&mut *tx)
                .await?;
                tx.commit().await?;
                Ok(DuplicateLink {
                    id,
                    original_id,
                    duplicate_id,
                    hash,
                    created_at: now,
                })
            })
            .await?;
        self.emit(Change::DuplicateRecorded(link.clone()));
        if let Some(file) = self.get_file(duplicate_id).await? {
            self.emit(Change::FileUpserted(file));
        }
        Ok(link)
    }

    /// The link whose duplicate side is `duplicate_id`, if any.
    pub async fn duplicate_link_for(
        &self,
        duplicate_id: Uuid,
    ) -> PipelineResult<Option<DuplicateLink>> {
        let row = sqlx::query_as::<_, DuplicateRow>(
            "SELECT id, original_id, duplicate_id, hash, created_at FROM duplicates \
             WHERE duplicate_id = ?",
        )
        .bind(duplicate_id.to_string())
        .fetch_optional(self.pool())
        .await?;
        row.map(DuplicateRow::into_model).transpose()
    }

    pub async fn duplicate_count(&self) -> PipelineResult<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM duplicates")
            .fetch_one(self.pool())
            .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::new_file;

    #[tokio::test]
    async fn test_record_duplicate_flags_file_and_links() {
        let store = MetaStore::open_in_memory().await.unwrap();
        let survivor = store.upsert_file(new_file("x.jpg")).await.unwrap();
        let copy = store.upsert_file(new_file("x_copy.jpg")).await.unwrap();

        let link = store
            .record_duplicate(survivor.id, copy.id, "deadbeef")
            .await
            .unwrap();
        assert_eq!(link.original_id, survivor.id);
        assert_eq!(link.duplicate_id, copy.id);

        let copy = store.get_file(copy.id).await.unwrap().unwrap();
        assert!(copy.is_duplicate);
        assert_eq!(copy.hash.as_deref(), Some("deadbeef"));

        let survivor = store.get_file(survivor.id).await.unwrap().unwrap();
        assert!(!survivor.is_duplicate);

        let found = store.duplicate_link_for(copy.id).await.unwrap().unwrap();
        assert_eq!(found.id, link.id);
        assert_eq!(store.duplicate_count().await.unwrap(), 1);
    }
}

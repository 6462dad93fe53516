//! Content-hash lookup.
//!
//! Answers "have I seen this content before" in O(1) expected. The in-process
//! map is warmed from the store's persistent hash index on start, which is
//! what makes lookups stable across restarts.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use pixferry_core::PipelineResult;

use crate::store::MetaStore;

#[derive(Debug, Clone, Copy)]
struct Survivor {
    id: Uuid,
    created_at: DateTime<Utc>,
}

/// Result of recording a newly hashed file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observed {
    /// First occurrence of this content; the file is the survivor.
    Fresh,
    /// Content already known; the file duplicates the given survivor.
    DuplicateOf(Uuid),
}

pub struct HashIndex {
    inner: RwLock<HashMap<String, Survivor>>,
}

impl HashIndex {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Build the index from every hashed non-duplicate row in the store.
    pub async fn warm(store: &MetaStore) -> PipelineResult<Self> {
        let index = Self::new();
        let survivors = store.hash_survivors().await?;
        let mut map = index.inner.write().await;
        for (hash, id, created_at) in survivors {
            // The query is ordered oldest-first, so the first insert per
            // hash is the earliest-created survivor.
            map.entry(hash).or_insert(Survivor { id, created_at });
        }
        drop(map);
        Ok(index)
    }

    pub async fn survivor_for(&self, hash: &str) -> Option<Uuid> {
        self.inner.read().await.get(hash).map(|s| s.id)
    }

    /// Record a hashed file. Callers must feed files in ascending
    /// `created_at` order (the store's status queries guarantee it); ties on
    /// the same hash then deterministically keep the earliest file as
    /// survivor.
    pub async fn observe(&self, hash: &str, id: Uuid, created_at: DateTime<Utc>) -> Observed {
        let mut map = self.inner.write().await;
        match map.get(hash) {
            Some(existing) => Observed::DuplicateOf(existing.id),
            None => {
                map.insert(hash.to_string(), Survivor { id, created_at });
                Observed::Fresh
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }
}

impl Default for HashIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FileUpdate;
    use pixferry_core::models::{FileStatus, IngestKind, NewMediaFile};
    use std::path::PathBuf;

    #[tokio::test]
    async fn test_observe_first_wins() {
        let index = HashIndex::new();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        let t0 = Utc::now();

        assert_eq!(index.observe("abc", first, t0).await, Observed::Fresh);
        assert_eq!(
            index.observe("abc", second, t0 + chrono::Duration::seconds(1)).await,
            Observed::DuplicateOf(first)
        );
        assert_eq!(index.survivor_for("abc").await, Some(first));
        assert_eq!(index.survivor_for("other").await, None);
    }

    #[tokio::test]
    async fn test_warm_rebuilds_from_store() {
        let store = MetaStore::open_in_memory().await.unwrap();
        let file = store
            .upsert_file(NewMediaFile {
                filename: "a.jpg".into(),
                path: PathBuf::from("/mnt/nas/originals/a.jpg"),
                source_path: "/camera/a.jpg".into(),
                size_bytes: 10,
                source_kind: IngestKind::Folder,
            })
            .await
            .unwrap();
        store
            .update_file_status(
                file.id,
                FileStatus::Deduplicated,
                FileUpdate {
                    hash: Some("cafebabe".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        // A fresh index, as after a process restart.
        let index = HashIndex::warm(&store).await.unwrap();
        assert_eq!(index.len().await, 1);
        assert_eq!(index.survivor_for("cafebabe").await, Some(file.id));
    }
}

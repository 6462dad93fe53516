//! Local-folder ingest: sweep configured directories for media files and
//! move them into `originals/`.

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use pixferry_core::models::IngestKind;
use pixferry_core::PipelineResult;

use super::{IngestItem, IngestSource};
use crate::fsutil::{move_file, unique_destination};
use crate::media::MediaType;

pub struct FolderIngest {
    roots: Vec<PathBuf>,
    originals_dir: PathBuf,
}

impl FolderIngest {
    /// `roots` are the scan directories (the configured source folders plus
    /// any extra sweep directories).
    pub fn new(roots: Vec<PathBuf>, originals_dir: PathBuf) -> Self {
        Self {
            roots,
            originals_dir,
        }
    }

    async fn walk(&self, root: &Path, found: &mut Vec<IngestItem>) -> PipelineResult<()> {
        let mut pending = vec![root.to_path_buf()];
        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::warn!(dir = %dir.display(), error = %e, "cannot read directory");
                    continue;
                }
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    pending.push(path);
                } else if file_type.is_file() && MediaType::is_media(&path) {
                    let filename = path
                        .file_name()
                        .and_then(|n| n.to_str())
                        .unwrap_or_default()
                        .to_string();
                    found.push(IngestItem {
                        reference: path.to_string_lossy().into_owned(),
                        filename,
                    });
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl IngestSource for FolderIngest {
    fn tag(&self) -> IngestKind {
        IngestKind::Folder
    }

    async fn discover(&self) -> PipelineResult<Vec<IngestItem>> {
        let mut found = Vec::new();
        for root in &self.roots {
            if !root.exists() {
                tracing::warn!(root = %root.display(), "scan root does not exist, skipping");
                continue;
            }
            self.walk(root, &mut found).await?;
        }
        // Deterministic processing order across runs.
        found.sort_by(|a, b| a.reference.cmp(&b.reference));
        Ok(found)
    }

    async fn fetch(&self, item: &IngestItem) -> PipelineResult<PathBuf> {
        tokio::fs::create_dir_all(&self.originals_dir).await?;
        let source = PathBuf::from(&item.reference);
        let dest = unique_destination(&self.originals_dir, &item.filename).await?;
        move_file(&source, &dest).await?;
        Ok(dest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_discover_finds_only_media_recursively() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("camera/2023");
        tokio::fs::create_dir_all(&nested).await.unwrap();
        tokio::fs::write(nested.join("a.jpg"), b"x").await.unwrap();
        tokio::fs::write(nested.join("b.mov"), b"x").await.unwrap();
        tokio::fs::write(nested.join("notes.txt"), b"x").await.unwrap();

        let originals = dir.path().join("originals");
        let ingest = FolderIngest::new(vec![dir.path().join("camera")], originals);
        let items = ingest.discover().await.unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].filename, "a.jpg");
        assert_eq!(items[1].filename, "b.mov");
    }

    #[tokio::test]
    async fn test_fetch_moves_into_originals() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("incoming");
        tokio::fs::create_dir_all(&source).await.unwrap();
        tokio::fs::write(source.join("a.jpg"), b"payload").await.unwrap();

        let originals = dir.path().join("originals");
        let ingest = FolderIngest::new(vec![source.clone()], originals.clone());
        let items = ingest.discover().await.unwrap();
        let dest = ingest.fetch(&items[0]).await.unwrap();

        assert_eq!(dest, originals.join("a.jpg"));
        assert!(dest.exists());
        assert!(!source.join("a.jpg").exists());
    }

    #[tokio::test]
    async fn test_fetch_suffixes_on_name_collision() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("incoming");
        tokio::fs::create_dir_all(&source).await.unwrap();
        tokio::fs::write(source.join("a.jpg"), b"new").await.unwrap();

        let originals = dir.path().join("originals");
        tokio::fs::create_dir_all(&originals).await.unwrap();
        tokio::fs::write(originals.join("a.jpg"), b"old").await.unwrap();

        let ingest = FolderIngest::new(vec![source], originals.clone());
        let items = ingest.discover().await.unwrap();
        let dest = ingest.fetch(&items[0]).await.unwrap();
        assert_eq!(dest, originals.join("a_1.jpg"));
    }

    #[tokio::test]
    async fn test_missing_root_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let ingest = FolderIngest::new(
            vec![dir.path().join("not-there")],
            dir.path().join("originals"),
        );
        assert!(ingest.discover().await.unwrap().is_empty());
    }
}

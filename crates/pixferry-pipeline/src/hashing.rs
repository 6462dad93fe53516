//! Streaming content hashing.

use md5::Md5;
use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::io::AsyncReadExt;

use pixferry_core::{HashAlgorithm, PipelineResult};

const CHUNK_SIZE: usize = 64 * 1024;

enum Hasher {
    Md5(Md5),
    Sha256(Sha256),
}

impl Hasher {
    fn new(algorithm: HashAlgorithm) -> Self {
        match algorithm {
            HashAlgorithm::Md5 => Hasher::Md5(Md5::new()),
            HashAlgorithm::Sha256 => Hasher::Sha256(Sha256::new()),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Md5(h) => h.update(data),
            Hasher::Sha256(h) => h.update(data),
        }
    }

    fn finalize_hex(self) -> String {
        match self {
            Hasher::Md5(h) => hex::encode(h.finalize()),
            Hasher::Sha256(h) => hex::encode(h.finalize()),
        }
    }
}

/// Hash a file's contents in streaming chunks, yielding between reads.
pub async fn hash_file(path: &Path, algorithm: HashAlgorithm) -> PipelineResult<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Hasher::new(algorithm);
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let read = file.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hasher.finalize_hex())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_known_digests() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello.txt");
        tokio::fs::write(&path, b"hello world").await.unwrap();

        assert_eq!(
            hash_file(&path, HashAlgorithm::Md5).await.unwrap(),
            "5eb63bbbe01eeed093cb22bb8f5acdc3"
        );
        assert_eq!(
            hash_file(&path, HashAlgorithm::Sha256).await.unwrap(),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn test_identical_content_same_hash() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.bin");
        let b = dir.path().join("b.bin");
        let payload = vec![7u8; 200_000];
        tokio::fs::write(&a, &payload).await.unwrap();
        tokio::fs::write(&b, &payload).await.unwrap();

        let ha = hash_file(&a, HashAlgorithm::Sha256).await.unwrap();
        let hb = hash_file(&b, HashAlgorithm::Sha256).await.unwrap();
        assert_eq!(ha, hb);
    }

    #[tokio::test]
    async fn test_missing_file_is_io_error() {
        let err = hash_file(Path::new("/nonexistent/x.jpg"), HashAlgorithm::Sha256)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "io");
    }
}

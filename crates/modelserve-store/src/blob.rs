//! Content-addressed blob files under `blobs/<algorithm>/<hex-digest>`.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;
use uuid::Uuid;

use crate::error::StoreError;
use crate::manifest::BlobDigest;

const HASH_BUF_SIZE: usize = 64 * 1024;

/// Reads, writes, and verifies blobs under a store root.
#[derive(Debug, Clone)]
pub struct BlobStorage {
    root: PathBuf,
}

impl BlobStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Path a digest's content lives at.
    pub fn blob_path(&self, digest: &BlobDigest) -> PathBuf {
        self.root
            .join("blobs")
            .join(digest.algorithm.as_str())
            .join(&digest.value)
    }

    /// Import a file: stream it through SHA-256 into a temporary file, then
    /// rename onto the content-addressed path. Re-importing identical bytes
    /// lands on the same path, so the operation is idempotent.
    pub async fn store_blob(&self, source: &Path) -> Result<BlobDigest, StoreError> {
        if !source.exists() {
            return Err(StoreError::BlobMissing(source.to_path_buf()));
        }

        let dir = self.root.join("blobs").join("sha256");
        fs::create_dir_all(&dir).await?;
        let tmp = dir.join(format!(".import-{}.tmp", Uuid::new_v4().simple()));

        let mut reader = fs::File::open(source).await?;
        let mut writer = fs::File::create(&tmp).await.map_err(|e| StoreError::WriteFailed {
            path: tmp.clone(),
            message: e.to_string(),
        })?;

        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; HASH_BUF_SIZE];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            if let Err(e) = writer.write_all(&buf[..n]).await {
                let _ = fs::remove_file(&tmp).await;
                return Err(StoreError::WriteFailed {
                    path: tmp,
                    message: e.to_string(),
                });
            }
        }
        writer.flush().await?;
        drop(writer);

        let digest = BlobDigest::sha256(hex::encode(hasher.finalize()));
        let dest = self.blob_path(&digest);
        if let Err(e) = fs::rename(&tmp, &dest).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(StoreError::WriteFailed {
                path: dest,
                message: e.to_string(),
            });
        }

        debug!(digest = %digest, source = %source.display(), "blob imported");
        Ok(digest)
    }

    /// Re-hash a stored blob and compare against its digest.
    pub async fn verify_blob(&self, digest: &BlobDigest) -> Result<(), StoreError> {
        let path = self.blob_path(digest);
        if !path.exists() {
            return Err(StoreError::BlobMissing(path));
        }

        let mut reader = fs::File::open(&path).await?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; HASH_BUF_SIZE];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }

        let actual = hex::encode(hasher.finalize());
        if actual != digest.value {
            return Err(StoreError::DigestMismatch {
                expected: digest.value.clone(),
                actual,
            });
        }
        Ok(())
    }

    /// Best-effort blob deletion; absence is not an error.
    pub async fn delete_blob(&self, digest: &BlobDigest) {
        let path = self.blob_path(digest);
        if path.exists() {
            let _ = fs::remove_file(&path).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn import_is_idempotent() {
        let root = tempfile::tempdir().unwrap();
        let storage = BlobStorage::new(root.path());

        let source = root.path().join("weights.bin");
        fs::write(&source, b"hello blob").await.unwrap();

        let first = storage.store_blob(&source).await.unwrap();
        let second = storage.store_blob(&source).await.unwrap();
        assert_eq!(first, second);
        assert!(storage.blob_path(&first).exists());
        storage.verify_blob(&first).await.unwrap();
    }

    #[tokio::test]
    async fn import_fails_for_missing_source() {
        let root = tempfile::tempdir().unwrap();
        let storage = BlobStorage::new(root.path());

        let err = storage
            .store_blob(&root.path().join("absent.bin"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::BlobMissing(_)));
    }

    #[tokio::test]
    async fn verify_reports_mismatch_with_expected_digest() {
        let root = tempfile::tempdir().unwrap();
        let storage = BlobStorage::new(root.path());

        let source = root.path().join("weights.bin");
        fs::write(&source, b"original").await.unwrap();
        let digest = storage.store_blob(&source).await.unwrap();

        fs::write(storage.blob_path(&digest), b"tampered")
            .await
            .unwrap();

        match storage.verify_blob(&digest).await.unwrap_err() {
            StoreError::DigestMismatch { expected, actual } => {
                assert_eq!(expected, digest.value);
                assert_ne!(actual, digest.value);
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}

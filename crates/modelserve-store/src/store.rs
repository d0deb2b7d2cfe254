//! Filesystem-backed model store.

use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::debug;
use uuid::Uuid;

use crate::blob::BlobStorage;
use crate::error::StoreError;
use crate::manifest::{BlobDigest, ModelManifest, ModelTag};

/// Default store root: `MODELSERVE_HOME`, else `~/.modelserve`.
///
/// Resolved once at process start by configuration and passed into
/// [`FileModelStore::new`]; store methods never consult the environment.
pub fn default_store_root() -> PathBuf {
    if let Ok(home) = std::env::var("MODELSERVE_HOME") {
        if !home.is_empty() {
            return PathBuf::from(home);
        }
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".modelserve")
}

/// Durable, content-addressed persistence of manifests and blobs under one
/// root directory.
#[derive(Debug, Clone)]
pub struct FileModelStore {
    root: PathBuf,
    blobs: BlobStorage,
}

impl FileModelStore {
    /// Open a store rooted at `root`, creating the layout on first use.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        let store = Self {
            blobs: BlobStorage::new(&root),
            root,
        };
        store.ensure_layout()?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Atomically write (or overwrite) the manifest for its tag.
    ///
    /// Side effect only; referenced blobs are not validated here.
    pub async fn put(&self, manifest: &ModelManifest) -> Result<(), StoreError> {
        self.ensure_layout()?;
        let path = self.manifest_path(&manifest.tag);
        let data = serde_json::to_vec_pretty(manifest).map_err(|e| StoreError::WriteFailed {
            path: path.clone(),
            message: e.to_string(),
        })?;
        atomic_write(&path, &data).await
    }

    /// Look up the manifest for a tag. `None` when no file exists; a decode
    /// error when the file exists but cannot be parsed.
    pub async fn manifest(&self, tag: &ModelTag) -> Result<Option<ModelManifest>, StoreError> {
        let path = self.manifest_path(tag);
        if !path.exists() {
            return Ok(None);
        }
        let data = fs::read(&path).await?;
        serde_json::from_slice(&data)
            .map(Some)
            .map_err(|e| StoreError::ManifestDecode {
                path,
                message: e.to_string(),
            })
    }

    /// Delete a tag's manifest. With `delete_blobs`, the primary blob is
    /// removed best-effort; its failure is swallowed because the manifest
    /// removal is the visible contract and has already succeeded.
    pub async fn remove(&self, tag: &ModelTag, delete_blobs: bool) -> Result<(), StoreError> {
        let manifest = self
            .manifest(tag)
            .await?
            .ok_or_else(|| StoreError::TagNotFound(tag.clone()))?;
        fs::remove_file(self.manifest_path(tag)).await?;

        if delete_blobs {
            self.blobs.delete_blob(&manifest.digest).await;
        }
        Ok(())
    }

    /// All valid manifests, sorted ascending by tag display name. Unreadable
    /// files are skipped silently so one corrupt manifest cannot hide the
    /// rest.
    pub async fn list(&self) -> Result<Vec<ModelManifest>, StoreError> {
        self.ensure_layout()?;
        let dir = self.root.join("manifests");
        let mut entries = fs::read_dir(&dir).await?;
        let mut results = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().map(|ext| ext == "json") != Some(true) {
                continue;
            }
            let data = match fs::read(&path).await {
                Ok(data) => data,
                Err(_) => continue,
            };
            match serde_json::from_slice::<ModelManifest>(&data) {
                Ok(manifest) => results.push(manifest),
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "skipping unreadable manifest");
                }
            }
        }

        results.sort_by_key(|m| m.tag.display_name());
        Ok(results)
    }

    /// Import a file into the blob directory and return its digest.
    pub async fn import_blob(&self, source: &Path) -> Result<BlobDigest, StoreError> {
        self.ensure_layout()?;
        self.blobs.store_blob(source).await
    }

    /// Re-hash every blob the manifest references. Returns `true` only when
    /// the primary blob and all additional blobs are present and
    /// hash-correct.
    pub async fn verify(&self, manifest: &ModelManifest) -> Result<bool, StoreError> {
        self.blobs.verify_blob(&manifest.digest).await?;
        if let Some(extras) = &manifest.additional_blobs {
            for digest in extras.values() {
                self.blobs.verify_blob(digest).await?;
            }
        }
        Ok(true)
    }

    /// Filesystem path of a digest's blob. Exposed for inspection and tests.
    pub fn blob_path(&self, digest: &BlobDigest) -> PathBuf {
        self.blobs.blob_path(digest)
    }

    fn manifest_path(&self, tag: &ModelTag) -> PathBuf {
        self.root
            .join("manifests")
            .join(format!("{}.json", sanitize(&tag.display_name())))
    }

    fn ensure_layout(&self) -> Result<(), StoreError> {
        for dir in [
            self.root.clone(),
            self.root.join("blobs").join("sha256"),
            self.root.join("manifests"),
        ] {
            if dir.exists() {
                if dir.is_dir() {
                    continue;
                }
                return Err(StoreError::InvalidRoot(dir));
            }
            std::fs::create_dir_all(&dir)?;
        }
        Ok(())
    }
}

/// Tag display names can contain `:`/`@`; map filesystem-hostile characters
/// to `_` for the manifest filename. Injective over the accepted tag
/// character set.
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '@' => '_',
            other => other,
        })
        .collect()
}

/// Write-to-temp-then-rename so a crash mid-write never leaves a
/// half-written file visible to a concurrent reader.
async fn atomic_write(path: &Path, data: &[u8]) -> Result<(), StoreError> {
    let parent = path
        .parent()
        .ok_or_else(|| StoreError::InvalidRoot(path.to_path_buf()))?;
    let tmp = parent.join(format!(".write-{}.tmp", Uuid::new_v4().simple()));

    if let Err(e) = fs::write(&tmp, data).await {
        return Err(StoreError::WriteFailed {
            path: tmp,
            message: e.to_string(),
        });
    }
    if let Err(e) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(StoreError::WriteFailed {
            path: path.to_path_buf(),
            message: e.to_string(),
        });
    }
    Ok(())
}

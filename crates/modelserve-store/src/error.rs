//! Error types for store operations.

use std::path::PathBuf;

use thiserror::Error;

use crate::manifest::ModelTag;

/// Errors that can occur while reading or writing the model store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A store layout path exists but is not a directory.
    #[error("store root path is not a directory: {0}")]
    InvalidRoot(PathBuf),

    /// A manifest file exists but could not be parsed.
    #[error("failed to decode manifest at {path}: {message}")]
    ManifestDecode { path: PathBuf, message: String },

    /// Writing a manifest or blob failed.
    #[error("failed to write {path}: {message}")]
    WriteFailed { path: PathBuf, message: String },

    /// No manifest exists for the requested tag.
    #[error("no manifest for tag '{0}'")]
    TagNotFound(ModelTag),

    /// A referenced blob file is absent.
    #[error("blob missing at {0}")]
    BlobMissing(PathBuf),

    /// A stored blob's content no longer matches its digest.
    #[error("blob digest mismatch: expected {expected}, actual {actual}")]
    DigestMismatch { expected: String, actual: String },

    /// The artifact a manifest build refers to does not exist.
    #[error("artifact not found at {0}")]
    ArtifactMissing(PathBuf),

    /// The tokenizer file a manifest build refers to does not exist.
    #[error("tokenizer not found at {0}")]
    TokenizerMissing(PathBuf),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

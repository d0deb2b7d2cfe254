//! Content-addressed persistence for locally served model artifacts.
//!
//! One root directory holds `manifests/<sanitized-tag>.json` plus
//! `blobs/sha256/<hex-digest>` files. Manifests describe a stored model's
//! primary blob digest, size, and metadata; blobs are immutable files keyed
//! by the SHA-256 of their contents, which makes re-imports idempotent and
//! tampering detectable.

pub mod blob;
pub mod error;
pub mod manifest;
pub mod spec;
pub mod store;

pub use blob::BlobStorage;
pub use error::StoreError;
pub use manifest::{BlobDigest, DigestAlgorithm, ModelManifest, ModelTag};
pub use spec::{ModelSpec, ModelSpecBuildOptions, ModelSpecBuilder, SpecBase, SpecDefaults};
pub use store::{default_store_root, FileModelStore};

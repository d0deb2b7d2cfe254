//! Model tags, blob digests, and manifests.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Human-readable model identifier, rendered as `name[:variant][@version]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelTag {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl ModelTag {
    pub fn new(
        name: impl Into<String>,
        variant: Option<String>,
        version: Option<String>,
    ) -> Self {
        Self {
            name: name.into(),
            variant,
            version,
        }
    }

    /// Parse `name[:variant][@version]`. Fails only when the name is empty;
    /// empty variant/version segments normalize to `None`.
    pub fn parse(input: &str) -> Option<Self> {
        let (left, version) = match input.split_once('@') {
            Some((left, version)) => (left, Some(version)),
            None => (input, None),
        };
        let (name, variant) = match left.split_once(':') {
            Some((name, variant)) => (name, Some(variant)),
            None => (left, None),
        };
        if name.is_empty() {
            return None;
        }
        Some(Self {
            name: name.to_string(),
            variant: variant.filter(|v| !v.is_empty()).map(str::to_string),
            version: version.filter(|v| !v.is_empty()).map(str::to_string),
        })
    }

    /// Exact inverse of [`ModelTag::parse`].
    pub fn display_name(&self) -> String {
        match (&self.variant, &self.version) {
            (Some(variant), Some(version)) => format!("{}:{}@{}", self.name, variant, version),
            (Some(variant), None) => format!("{}:{}", self.name, variant),
            (None, Some(version)) => format!("{}@{}", self.name, version),
            (None, None) => self.name.clone(),
        }
    }
}

impl fmt::Display for ModelTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display_name())
    }
}

/// Digest algorithm of a stored blob. Only SHA-256 is supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestAlgorithm {
    Sha256,
}

impl DigestAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            DigestAlgorithm::Sha256 => "sha256",
        }
    }
}

/// Identity of stored content: lowercase hex SHA-256 of the exact bytes at
/// the blob path. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlobDigest {
    pub algorithm: DigestAlgorithm,
    pub value: String,
}

impl BlobDigest {
    pub fn sha256(value: impl Into<String>) -> Self {
        Self {
            algorithm: DigestAlgorithm::Sha256,
            value: value.into(),
        }
    }
}

impl fmt::Display for BlobDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm.as_str(), self.value)
    }
}

/// Persisted record describing a stored model: primary blob digest, size at
/// build time, creation timestamp, free-form metadata, and any extra blobs
/// (tokenizer files and the like) keyed by role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelManifest {
    pub tag: ModelTag,
    pub digest: BlobDigest,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_blobs: Option<BTreeMap<String, BlobDigest>>,
}

impl ModelManifest {
    pub fn new(tag: ModelTag, digest: BlobDigest, size_bytes: u64) -> Self {
        Self {
            tag,
            digest,
            size_bytes,
            created_at: Utc::now(),
            metadata: BTreeMap::new(),
            additional_blobs: None,
        }
    }
}

//! Declarative model specs and the manifest build (pack) workflow.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::info;

use crate::error::StoreError;
use crate::manifest::{BlobDigest, ModelManifest, ModelTag};
use crate::store::FileModelStore;

/// Where the artifact originally came from.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpecBase {
    #[serde(default)]
    pub hf_repo: Option<String>,
    #[serde(default)]
    pub revision: Option<String>,
    #[serde(default)]
    pub local_path: Option<String>,
}

/// Generation defaults a spec may suggest for its model.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpecDefaults {
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub stop: Option<Vec<String>>,
    #[serde(default)]
    pub system_prompt: Option<String>,
}

/// Declarative description of a model to pack into the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSpec {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub base: SpecBase,
    #[serde(default = "default_format")]
    pub format: String,
    #[serde(default)]
    pub quantization: Option<String>,
    #[serde(default)]
    pub tokenizer: Option<String>,
    #[serde(default)]
    pub prompt_template: Option<String>,
    #[serde(default)]
    pub defaults: Option<SpecDefaults>,
    #[serde(default)]
    pub license: Option<String>,
    #[serde(default)]
    pub metadata: Option<BTreeMap<String, String>>,
}

fn default_format() -> String {
    "gguf".to_string()
}

impl ModelSpec {
    /// The store tag this spec packs under: quantization becomes the
    /// variant, version passes through untouched so pull-then-generate
    /// round-trips on the same tag string.
    pub fn tag(&self) -> ModelTag {
        ModelTag::new(
            self.name.clone(),
            self.quantization.clone(),
            self.version.clone(),
        )
    }

    /// Load a spec from a JSON file.
    pub async fn load(path: &Path) -> Result<Self, StoreError> {
        let data = fs::read(path).await?;
        serde_json::from_slice(&data).map_err(|e| StoreError::ManifestDecode {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }
}

/// Inputs for a manifest build.
#[derive(Debug, Clone)]
pub struct ModelSpecBuildOptions {
    pub artifact_path: PathBuf,
    pub tokenizer_path: Option<PathBuf>,
}

/// Builds a manifest from a [`ModelSpec`]: imports the artifact (and the
/// optional tokenizer) as blobs, merges spec provenance into manifest
/// metadata, and persists the result.
pub struct ModelSpecBuilder<'a> {
    store: &'a FileModelStore,
}

impl<'a> ModelSpecBuilder<'a> {
    pub fn new(store: &'a FileModelStore) -> Self {
        Self { store }
    }

    pub async fn build(
        &self,
        spec: &ModelSpec,
        options: &ModelSpecBuildOptions,
    ) -> Result<ModelManifest, StoreError> {
        let artifact = &options.artifact_path;
        if !artifact.exists() {
            return Err(StoreError::ArtifactMissing(artifact.clone()));
        }

        let size_bytes = fs::metadata(artifact).await?.len();
        let digest = self.store.import_blob(artifact).await?;

        let mut additional: BTreeMap<String, BlobDigest> = BTreeMap::new();
        if let Some(tokenizer) = &options.tokenizer_path {
            if !tokenizer.exists() {
                return Err(StoreError::TokenizerMissing(tokenizer.clone()));
            }
            additional.insert("tokenizer".to_string(), self.store.import_blob(tokenizer).await?);
        }

        let mut metadata = spec.metadata.clone().unwrap_or_default();
        metadata.insert("format".to_string(), spec.format.clone());
        if let Some(quant) = &spec.quantization {
            metadata.insert("quantization".to_string(), quant.clone());
        }
        if let Some(tokenizer) = &spec.tokenizer {
            metadata.insert("tokenizer".to_string(), tokenizer.clone());
        }
        if let Some(repo) = &spec.base.hf_repo {
            metadata.insert("base_hf_repo".to_string(), repo.clone());
        }
        if let Some(revision) = &spec.base.revision {
            metadata.insert("base_revision".to_string(), revision.clone());
        }
        if let Some(local) = &spec.base.local_path {
            metadata.insert("base_local_path".to_string(), local.clone());
        }

        let mut manifest = ModelManifest::new(spec.tag(), digest, size_bytes);
        manifest.metadata = metadata;
        manifest.additional_blobs = if additional.is_empty() {
            None
        } else {
            Some(additional)
        };

        self.store.put(&manifest).await?;
        info!(tag = %manifest.tag, size_bytes, "manifest built");
        Ok(manifest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str) -> ModelSpec {
        ModelSpec {
            name: name.to_string(),
            version: Some("v1".to_string()),
            base: SpecBase {
                hf_repo: Some("acme/llama".to_string()),
                revision: None,
                local_path: None,
            },
            format: "gguf".to_string(),
            quantization: Some("q4".to_string()),
            tokenizer: None,
            prompt_template: None,
            defaults: None,
            license: None,
            metadata: Some(BTreeMap::from([(
                "source".to_string(),
                "test".to_string(),
            )])),
        }
    }

    #[tokio::test]
    async fn build_imports_artifact_and_merges_metadata() {
        let root = tempfile::tempdir().unwrap();
        let store = FileModelStore::new(root.path()).unwrap();

        let artifact = root.path().join("weights.gguf");
        fs::write(&artifact, b"weights").await.unwrap();

        let spec = spec("llama");
        let manifest = ModelSpecBuilder::new(&store)
            .build(
                &spec,
                &ModelSpecBuildOptions {
                    artifact_path: artifact,
                    tokenizer_path: None,
                },
            )
            .await
            .unwrap();

        assert_eq!(manifest.tag.display_name(), "llama:q4@v1");
        assert_eq!(manifest.size_bytes, 7);
        assert_eq!(manifest.metadata.get("format").unwrap(), "gguf");
        assert_eq!(manifest.metadata.get("quantization").unwrap(), "q4");
        assert_eq!(manifest.metadata.get("base_hf_repo").unwrap(), "acme/llama");
        assert_eq!(manifest.metadata.get("source").unwrap(), "test");
        assert_eq!(manifest.additional_blobs, None);

        // persisted and verifiable
        let fetched = store.manifest(&spec.tag()).await.unwrap().unwrap();
        assert_eq!(fetched, manifest);
        assert!(store.verify(&manifest).await.unwrap());
    }

    #[tokio::test]
    async fn build_records_tokenizer_blob() {
        let root = tempfile::tempdir().unwrap();
        let store = FileModelStore::new(root.path()).unwrap();

        let artifact = root.path().join("weights.gguf");
        fs::write(&artifact, b"weights").await.unwrap();
        let tokenizer = root.path().join("vocab.json");
        fs::write(&tokenizer, b"{}").await.unwrap();

        let manifest = ModelSpecBuilder::new(&store)
            .build(
                &spec("llama"),
                &ModelSpecBuildOptions {
                    artifact_path: artifact,
                    tokenizer_path: Some(tokenizer),
                },
            )
            .await
            .unwrap();

        let extras = manifest.additional_blobs.as_ref().unwrap();
        assert!(extras.contains_key("tokenizer"));
        assert!(store.verify(&manifest).await.unwrap());
    }

    #[tokio::test]
    async fn build_fails_without_artifact() {
        let root = tempfile::tempdir().unwrap();
        let store = FileModelStore::new(root.path()).unwrap();

        let err = ModelSpecBuilder::new(&store)
            .build(
                &spec("llama"),
                &ModelSpecBuildOptions {
                    artifact_path: root.path().join("absent.gguf"),
                    tokenizer_path: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ArtifactMissing(_)));
    }
}

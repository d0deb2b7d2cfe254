//! Model id → artifact path mappings loaded from a JSON file.
//!
//! File format: an array of `{ "name": "...", "variant": "...",
//! "version": "...", "path": "/path/to/model" }` objects.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use super::ModelId;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelPathEntry {
    pub name: String,
    #[serde(default)]
    pub variant: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    pub path: String,
}

pub fn load_model_paths(path: &Path) -> anyhow::Result<HashMap<ModelId, PathBuf>> {
    let data = std::fs::read(path)
        .with_context(|| format!("failed to read model path mapping {}", path.display()))?;
    let entries: Vec<ModelPathEntry> = serde_json::from_slice(&data)
        .with_context(|| format!("invalid model path mapping {}", path.display()))?;

    Ok(entries
        .into_iter()
        .map(|entry| {
            (
                ModelId::new(entry.name, entry.variant, entry.version),
                PathBuf::from(entry.path),
            )
        })
        .collect())
}

//! Encode/decode contract over tokenizers, with a vocab-backed
//! implementation loaded from the model folder.
//!
//! Backends that manage tokenization internally treat loading as optional.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TokenizerError {
    #[error("tokenizer load failed: {0}")]
    LoadFailed(String),
}

pub trait Tokenizer: Send + Sync {
    fn encode(&self, text: &str) -> Vec<u32>;
    fn decode(&self, tokens: &[u32]) -> String;
}

#[async_trait]
pub trait TokenizerLoading: Send + Sync {
    /// Load the tokenizer assets that live alongside a model artifact.
    async fn load_tokenizer(
        &self,
        model_path: &Path,
    ) -> Result<Box<dyn Tokenizer>, TokenizerError>;
}

/// Whitespace tokenizer: one id per word position. A stand-in until a real
/// vocab is available.
pub struct WhitespaceTokenizer;

impl Tokenizer for WhitespaceTokenizer {
    fn encode(&self, text: &str) -> Vec<u32> {
        text.split_whitespace()
            .enumerate()
            .map(|(i, _)| i as u32 + 1)
            .collect()
    }

    fn decode(&self, tokens: &[u32]) -> String {
        tokens
            .iter()
            .map(|t| t.to_string())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Vocab-backed tokenizer: whitespace-split words map to known ids, unknown
/// words to 0. Decoding maps ids back through the vocab, falling back to the
/// numeric id.
pub struct VocabTokenizer {
    token_to_id: HashMap<String, u32>,
    id_to_token: HashMap<u32, String>,
}

impl VocabTokenizer {
    pub fn new(vocab: HashMap<String, u32>) -> Self {
        let id_to_token = vocab.iter().map(|(t, id)| (*id, t.clone())).collect();
        Self {
            token_to_id: vocab,
            id_to_token,
        }
    }
}

impl Tokenizer for VocabTokenizer {
    fn encode(&self, text: &str) -> Vec<u32> {
        text.split_whitespace()
            .map(|word| self.token_to_id.get(word).copied().unwrap_or(0))
            .collect()
    }

    fn decode(&self, tokens: &[u32]) -> String {
        tokens
            .iter()
            .map(|id| {
                self.id_to_token
                    .get(id)
                    .cloned()
                    .unwrap_or_else(|| id.to_string())
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Loads a [`VocabTokenizer`] from a `vocab.json` file (token → id map) in
/// the directory containing the model artifact.
pub struct VocabTokenizerLoader;

#[async_trait]
impl TokenizerLoading for VocabTokenizerLoader {
    async fn load_tokenizer(
        &self,
        model_path: &Path,
    ) -> Result<Box<dyn Tokenizer>, TokenizerError> {
        let folder = model_path.parent().unwrap_or_else(|| Path::new("."));
        let vocab_path = folder.join("vocab.json");
        let data = tokio::fs::read(&vocab_path)
            .await
            .map_err(|e| TokenizerError::LoadFailed(format!("{}: {e}", vocab_path.display())))?;
        let vocab: HashMap<String, u32> = serde_json::from_slice(&data)
            .map_err(|e| TokenizerError::LoadFailed(format!("{}: {e}", vocab_path.display())))?;
        Ok(Box::new(VocabTokenizer::new(vocab)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vocab_tokenizer_round_trip() {
        let vocab = HashMap::from([("hello".to_string(), 7), ("world".to_string(), 9)]);
        let tokenizer = VocabTokenizer::new(vocab);

        assert_eq!(tokenizer.encode("hello world unknown"), vec![7, 9, 0]);
        assert_eq!(tokenizer.decode(&[7, 9]), "hello world");
        assert_eq!(tokenizer.decode(&[42]), "42");
    }

    #[tokio::test]
    async fn loader_reads_vocab_next_to_model() {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("weights.gguf");
        std::fs::write(&model, b"weights").unwrap();
        std::fs::write(dir.path().join("vocab.json"), br#"{"hi": 1, "there": 2}"#).unwrap();

        let tokenizer = VocabTokenizerLoader.load_tokenizer(&model).await.unwrap();
        assert_eq!(tokenizer.encode("hi there"), vec![1, 2]);
    }

    #[tokio::test]
    async fn loader_fails_without_vocab_file() {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("weights.gguf");
        std::fs::write(&model, b"weights").unwrap();

        let err = match VocabTokenizerLoader.load_tokenizer(&model).await {
            Ok(_) => panic!("expected load to fail without vocab file"),
            Err(e) => e,
        };
        assert!(matches!(err, TokenizerError::LoadFailed(_)));
    }
}

//! The runner abstraction: a uniform load/generate/unload contract over
//! backends that differ in execution strategy.
//!
//! Backends share one state machine per model id per runner instance:
//! `unloaded → loaded` on a successful load, back to `unloaded` on unload.
//! `generate` is valid only in the loaded state and re-checks that state at
//! stream start, so a race between `unload` and a late `generate` surfaces
//! as [`RunnerError::ModelNotLoaded`] instead of silently proceeding.

pub mod local;
pub mod mock;
pub mod native;
pub mod paths;
pub mod prompt;
pub mod subprocess;
pub mod tokenizer;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Runner-facing model identity, rendered as `name[:variant][@version]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModelId {
    pub name: String,
    pub variant: Option<String>,
    pub version: Option<String>,
}

impl ModelId {
    pub fn new(name: impl Into<String>, variant: Option<String>, version: Option<String>) -> Self {
        Self {
            name: name.into(),
            variant,
            version,
        }
    }

    pub fn display_name(&self) -> String {
        match (&self.variant, &self.version) {
            (Some(variant), Some(version)) => format!("{}:{}@{}", self.name, variant, version),
            (Some(variant), None) => format!("{}:{}", self.name, variant),
            (None, Some(version)) => format!("{}@{}", self.name, version),
            (None, None) => self.name.clone(),
        }
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display_name())
    }
}

/// Options accepted by [`ModelRunner::load`].
#[derive(Debug, Clone)]
pub struct ModelLoadOptions {
    /// Seconds to keep the model resident after the request completes.
    pub keep_alive: Option<f64>,
    pub eager_load: bool,
}

impl Default for ModelLoadOptions {
    fn default() -> Self {
        Self {
            keep_alive: None,
            eager_load: true,
        }
    }
}

/// Opaque handle returned by a successful load. A generation call is valid
/// only while the issuing runner instance still considers the id loaded.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedModel {
    pub id: ModelId,
    pub loaded_at: DateTime<Utc>,
}

impl LoadedModel {
    pub fn new(id: ModelId) -> Self {
        Self {
            id,
            loaded_at: Utc::now(),
        }
    }
}

/// Sampling and stopping parameters for one generation.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationConfig {
    pub max_tokens: Option<u32>,
    pub temperature: f32,
    pub top_p: f32,
    pub stop_sequences: Vec<String>,
    pub presence_penalty: f32,
    pub frequency_penalty: f32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_tokens: Some(256),
            temperature: 0.8,
            top_p: 0.95,
            stop_sequences: Vec::new(),
            presence_penalty: 0.0,
            frequency_penalty: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

impl ChatRole {
    /// Lenient role parsing for wire input; unknown roles fall back to user.
    pub fn from_wire(role: &str) -> Self {
        match role {
            "system" => ChatRole::System,
            "assistant" => ChatRole::Assistant,
            _ => ChatRole::User,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChatRole::System => "system",
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// The canonical request shape produced by the dialect normalizer; backends
/// never see dialect-specific types.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub model: ModelId,
    pub prompt: String,
    pub messages: Vec<ChatMessage>,
    pub config: GenerationConfig,
    pub system_prompt: Option<String>,
    pub keep_alive: Option<f64>,
}

impl GenerationRequest {
    pub fn new(model: ModelId, prompt: impl Into<String>) -> Self {
        Self {
            model,
            prompt: prompt.into(),
            messages: Vec::new(),
            config: GenerationConfig::default(),
            system_prompt: None,
            keep_alive: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationStats {
    pub prompt_tokens: usize,
    pub generated_tokens: usize,
    pub duration: Option<Duration>,
    /// Whether a stop sequence truncated the output.
    pub stop_hit: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationResult {
    pub text: String,
    pub stats: GenerationStats,
}

/// One element of a generation stream: zero or more tokens followed by
/// exactly one completion.
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationEvent {
    Token(String),
    Completed(GenerationResult),
}

/// Terminal failures a generation stream or load can surface.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RunnerError {
    #[error("model '{0}' is not loaded")]
    ModelNotLoaded(ModelId),

    #[error("generation cancelled")]
    Cancelled,

    /// The external generation process failed after all retries.
    #[error("generation process failed: {0}")]
    Process(String),

    /// The native inference engine reported a failure.
    #[error("inference engine error: {0}")]
    Engine(String),
}

/// Cloneable cancellation signal. Backends consult it before each token
/// emission and terminate the stream with [`RunnerError::Cancelled`] when
/// set; an in-flight engine or process call may still run to completion
/// internally, but no further events are forwarded.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Single-pass stream of generation events. Not restartable.
pub type EventStream =
    Box<dyn Stream<Item = Result<GenerationEvent, RunnerError>> + Send + Unpin>;

/// Uniform contract over generation backends.
#[async_trait]
pub trait ModelRunner: Send + Sync {
    /// Prepare a model for generation. Fails with
    /// [`RunnerError::ModelNotLoaded`] when the backend cannot locate or
    /// prepare the artifact.
    async fn load(
        &self,
        model: &ModelId,
        options: ModelLoadOptions,
    ) -> Result<LoadedModel, RunnerError>;

    /// Release backend-held resources for the id. Idempotent.
    async fn unload(&self, model: &LoadedModel);

    /// Produce a stream of zero or more `Token` events followed by exactly
    /// one `Completed` event, or fail the stream with a terminal error.
    async fn generate(
        &self,
        request: GenerationRequest,
        model: &LoadedModel,
        cancel: CancelFlag,
    ) -> EventStream;
}

/// Collect a stream's tokens and final result. Test and unary-response
/// helper.
pub async fn collect_events(
    mut stream: EventStream,
) -> Result<(Vec<String>, Option<GenerationResult>), RunnerError> {
    use futures_util::StreamExt;

    let mut tokens = Vec::new();
    let mut result = None;
    while let Some(event) = stream.next().await {
        match event? {
            GenerationEvent::Token(token) => tokens.push(token),
            GenerationEvent::Completed(completed) => result = Some(completed),
        }
    }
    Ok((tokens, result))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_id_display_name_forms() {
        let full = ModelId::new("llama", Some("demo".into()), Some("v1".into()));
        assert_eq!(full.display_name(), "llama:demo@v1");

        let versioned = ModelId::new("llama", None, Some("v1".into()));
        assert_eq!(versioned.display_name(), "llama@v1");

        let bare = ModelId::new("llama", None, None);
        assert_eq!(bare.display_name(), "llama");
    }

    #[test]
    fn generation_config_defaults() {
        let config = GenerationConfig::default();
        assert_eq!(config.max_tokens, Some(256));
        assert_eq!(config.temperature, 0.8);
        assert_eq!(config.top_p, 0.95);
        assert!(config.stop_sequences.is_empty());
    }

    #[test]
    fn cancel_flag_propagates_across_clones() {
        let flag = CancelFlag::new();
        let clone = flag.clone();
        assert!(!clone.is_cancelled());
        flag.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn chat_role_wire_fallback() {
        assert_eq!(ChatRole::from_wire("system"), ChatRole::System);
        assert_eq!(ChatRole::from_wire("assistant"), ChatRole::Assistant);
        assert_eq!(ChatRole::from_wire("tool"), ChatRole::User);
    }
}

//! Contract for the external native inference engine consumed by the
//! adapter-backed runner.
//!
//! The engine accepts chat-shaped input plus sampling parameters and yields
//! an incremental event stream: text chunks, tool-call notices, and a final
//! info record with token counts and timing. The actual tensor computation
//! lives behind this trait and is not part of this crate.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::Stream;
use thiserror::Error;

use crate::runner::ChatMessage;

/// Sampling parameters handed to the engine for one generation.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingParams {
    pub max_tokens: Option<u32>,
    pub temperature: f32,
    pub top_p: f32,
    pub repetition_penalty: Option<f32>,
    pub repetition_context: usize,
}

/// Final token-count and timing metadata reported by the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionInfo {
    pub prompt_tokens: usize,
    pub generated_tokens: usize,
    pub prompt_time: Duration,
    pub generate_time: Duration,
}

/// Incremental output of an engine generation.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// A decoded text chunk.
    Chunk(String),
    /// A tool invocation emitted by the model. Not forwarded to clients.
    ToolCall(String),
    /// Final metadata; arrives at most once, after the last chunk.
    Info(CompletionInfo),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    #[error("engine failed to load context: {0}")]
    LoadFailed(String),

    #[error("engine generation failed: {0}")]
    Generation(String),
}

pub type EngineEventStream = Box<dyn Stream<Item = EngineEvent> + Send + Unpin>;

/// A native inference engine. Loading a context is expensive; callers cache
/// contexts per model id and reuse them across generations.
#[async_trait]
pub trait InferenceEngine: Send + Sync + 'static {
    type Context: Send + Sync + 'static;

    async fn load_context(&self, artifact: &Path) -> Result<Self::Context, EngineError>;

    async fn generate(
        &self,
        context: &Self::Context,
        messages: &[ChatMessage],
        params: SamplingParams,
    ) -> Result<EngineEventStream, EngineError>;
}

//! modelserve: a local model-serving daemon.
//!
//! Exposes a native generate/chat HTTP dialect and an OpenAI-compatible
//! chat-completions dialect over locally stored model artifacts, routing
//! each request through a uniform runner contract to one of several
//! interchangeable generation backends.

pub mod api;
pub mod config;
pub mod engine;
pub mod runner;
pub mod telemetry;

/// Content-addressed persistence lives in its own crate.
pub use modelserve_store as store;

// Public API exports
pub use api::ApiServer;
pub use config::{Config, RunnerKind};
pub use runner::{
    CancelFlag, ChatMessage, ChatRole, GenerationConfig, GenerationEvent, GenerationRequest,
    GenerationResult, LoadedModel, ModelId, ModelLoadOptions, ModelRunner, RunnerError,
};

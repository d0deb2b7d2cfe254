//! Adapter-backed native backend: wraps an [`InferenceEngine`] behind a
//! context cache keyed by model id.
//!
//! Loading an engine context is expensive, so a second `load` for an
//! already-cached id reuses the cached context instead of reloading.
//! Tokenizer loading is attempted but optional; the engine may manage
//! tokenization internally.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::{mpsc, RwLock};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::engine::{CompletionInfo, EngineEvent, InferenceEngine, SamplingParams};

use super::tokenizer::{Tokenizer, TokenizerLoading};
use super::{
    CancelFlag, ChatMessage, ChatRole, EventStream, GenerationConfig, GenerationEvent,
    GenerationRequest, GenerationResult, GenerationStats, LoadedModel, ModelId,
    ModelLoadOptions, ModelRunner, RunnerError,
};

struct CachedContext<E: InferenceEngine> {
    context: Arc<E::Context>,
    #[allow(dead_code)]
    tokenizer: Option<Arc<dyn Tokenizer>>,
}

impl<E: InferenceEngine> Clone for CachedContext<E> {
    fn clone(&self) -> Self {
        Self {
            context: self.context.clone(),
            tokenizer: self.tokenizer.clone(),
        }
    }
}

pub struct NativeRunner<E: InferenceEngine> {
    engine: Arc<E>,
    model_paths: Arc<HashMap<ModelId, PathBuf>>,
    tokenizer_loader: Option<Arc<dyn TokenizerLoading>>,
    contexts: Arc<RwLock<HashMap<ModelId, CachedContext<E>>>>,
}

impl<E: InferenceEngine> NativeRunner<E> {
    pub fn new(engine: E, model_paths: HashMap<ModelId, PathBuf>) -> Self {
        Self {
            engine: Arc::new(engine),
            model_paths: Arc::new(model_paths),
            tokenizer_loader: None,
            contexts: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn with_tokenizer_loader(mut self, loader: Arc<dyn TokenizerLoading>) -> Self {
        self.tokenizer_loader = Some(loader);
        self
    }

    /// Number of cached engine contexts. Exposed for inspection and tests.
    pub async fn cached_contexts(&self) -> usize {
        self.contexts.read().await.len()
    }

    fn build_chat(request: &GenerationRequest) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(request.messages.len() + 2);
        if let Some(system) = &request.system_prompt {
            messages.push(ChatMessage::new(ChatRole::System, system.clone()));
        }
        messages.extend(request.messages.iter().cloned());
        messages.push(ChatMessage::new(ChatRole::User, request.prompt.clone()));
        messages
    }

    fn sampling_params(config: &GenerationConfig) -> SamplingParams {
        let penalty = config.presence_penalty.max(config.frequency_penalty);
        SamplingParams {
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            top_p: config.top_p,
            repetition_penalty: (penalty > 0.0).then_some(penalty),
            repetition_context: 128,
        }
    }

    /// If `text` ends with one of the stop sequences, return it with that
    /// suffix trimmed.
    fn trim_stop_sequence(text: &str, stops: &[String]) -> Option<String> {
        stops
            .iter()
            .filter(|stop| !stop.is_empty())
            .find(|stop| text.ends_with(stop.as_str()))
            .map(|stop| text[..text.len() - stop.len()].to_string())
    }
}

#[async_trait]
impl<E: InferenceEngine> ModelRunner for NativeRunner<E> {
    async fn load(
        &self,
        model: &ModelId,
        _options: ModelLoadOptions,
    ) -> Result<LoadedModel, RunnerError> {
        let path = match self.model_paths.get(model) {
            Some(path) if path.exists() => path.clone(),
            _ => return Err(RunnerError::ModelNotLoaded(model.clone())),
        };

        if self.contexts.read().await.contains_key(model) {
            debug!(model = %model, "engine context cache hit");
            return Ok(LoadedModel::new(model.clone()));
        }

        let tokenizer = match &self.tokenizer_loader {
            Some(loader) => match loader.load_tokenizer(&path).await {
                Ok(tokenizer) => Some(Arc::from(tokenizer)),
                Err(e) => {
                    // Non-fatal: the engine tokenizes internally.
                    warn!(model = %model, error = %e, "tokenizer load failed");
                    None
                }
            },
            None => None,
        };

        let context = self.engine.load_context(&path).await.map_err(|e| {
            warn!(model = %model, error = %e, "engine context load failed");
            RunnerError::ModelNotLoaded(model.clone())
        })?;

        self.contexts.write().await.insert(
            model.clone(),
            CachedContext {
                context: Arc::new(context),
                tokenizer,
            },
        );
        Ok(LoadedModel::new(model.clone()))
    }

    async fn unload(&self, model: &LoadedModel) {
        self.contexts.write().await.remove(&model.id);
    }

    async fn generate(
        &self,
        request: GenerationRequest,
        model: &LoadedModel,
        cancel: CancelFlag,
    ) -> EventStream {
        let (tx, rx) = mpsc::channel(32);
        let engine = self.engine.clone();
        let contexts = self.contexts.clone();
        let id = model.id.clone();

        tokio::spawn(async move {
            let Some(entry) = contexts.read().await.get(&id).cloned() else {
                let _ = tx.send(Err(RunnerError::ModelNotLoaded(id))).await;
                return;
            };

            let chat = Self::build_chat(&request);
            let params = Self::sampling_params(&request.config);
            let stops = request.config.stop_sequences.clone();
            let start = Instant::now();

            let mut events = match engine.generate(&entry.context, &chat, params).await {
                Ok(events) => events,
                Err(e) => {
                    let _ = tx.send(Err(RunnerError::Engine(e.to_string()))).await;
                    return;
                }
            };

            let mut collected = String::new();
            let mut chunk_count = 0usize;
            let mut info: Option<CompletionInfo> = None;
            let mut stop_hit = false;

            while let Some(event) = events.next().await {
                if cancel.is_cancelled() {
                    let _ = tx.send(Err(RunnerError::Cancelled)).await;
                    return;
                }
                match event {
                    EngineEvent::Chunk(text) => {
                        let candidate = format!("{collected}{text}");
                        if let Some(trimmed) = Self::trim_stop_sequence(&candidate, &stops) {
                            // The trimmed text is the final visible output;
                            // emission halts immediately.
                            collected = trimmed;
                            stop_hit = true;
                            break;
                        }
                        collected = candidate;
                        chunk_count += 1;
                        if tx.send(Ok(GenerationEvent::Token(text))).await.is_err() {
                            return;
                        }
                    }
                    EngineEvent::ToolCall(_) => {
                        // Tool calls are not part of the streaming contract.
                    }
                    EngineEvent::Info(completion) => info = Some(completion),
                }
            }

            let stats = match info {
                Some(info) => GenerationStats {
                    prompt_tokens: info.prompt_tokens,
                    generated_tokens: info.generated_tokens,
                    duration: Some(info.prompt_time + info.generate_time),
                    stop_hit,
                },
                None => GenerationStats {
                    prompt_tokens: chat
                        .iter()
                        .map(|m| m.content.split_whitespace().count())
                        .sum(),
                    generated_tokens: chunk_count,
                    duration: Some(start.elapsed()),
                    stop_hit,
                },
            };
            let _ = tx
                .send(Ok(GenerationEvent::Completed(GenerationResult {
                    text: collected,
                    stats,
                })))
                .await;
        });

        Box::new(ReceiverStream::new(rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineError, EngineEventStream};
    use crate::runner::collect_events;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Test engine that replays fixed chunks and counts context loads.
    struct ReplayEngine {
        chunks: Vec<String>,
        with_info: bool,
        loads: AtomicUsize,
    }

    impl ReplayEngine {
        fn new(chunks: Vec<&str>) -> Self {
            Self {
                chunks: chunks.into_iter().map(str::to_string).collect(),
                with_info: true,
                loads: AtomicUsize::new(0),
            }
        }

        fn without_info(mut self) -> Self {
            self.with_info = false;
            self
        }
    }

    #[async_trait]
    impl InferenceEngine for ReplayEngine {
        type Context = ();

        async fn load_context(&self, _artifact: &std::path::Path) -> Result<(), EngineError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn generate(
            &self,
            _context: &(),
            _messages: &[ChatMessage],
            _params: SamplingParams,
        ) -> Result<EngineEventStream, EngineError> {
            let mut events: Vec<EngineEvent> =
                self.chunks.iter().cloned().map(EngineEvent::Chunk).collect();
            if self.with_info {
                events.push(EngineEvent::Info(CompletionInfo {
                    prompt_tokens: 5,
                    generated_tokens: self.chunks.len(),
                    prompt_time: Duration::from_millis(10),
                    generate_time: Duration::from_millis(20),
                }));
            }
            Ok(Box::new(futures_util::stream::iter(events)))
        }
    }

    fn artifact_map(dir: &tempfile::TempDir, id: &ModelId) -> HashMap<ModelId, PathBuf> {
        let artifact = dir.path().join("weights.gguf");
        std::fs::write(&artifact, b"weights").unwrap();
        HashMap::from([(id.clone(), artifact)])
    }

    #[tokio::test]
    async fn streams_engine_chunks_and_info_stats() {
        let dir = tempfile::tempdir().unwrap();
        let id = ModelId::new("demo", None, None);
        let runner = NativeRunner::new(
            ReplayEngine::new(vec!["hel", "lo"]),
            artifact_map(&dir, &id),
        );

        let model = runner.load(&id, ModelLoadOptions::default()).await.unwrap();
        let stream = runner
            .generate(GenerationRequest::new(id, "hi"), &model, CancelFlag::new())
            .await;
        let (tokens, result) = collect_events(stream).await.unwrap();

        assert_eq!(tokens, vec!["hel", "lo"]);
        let result = result.unwrap();
        assert_eq!(result.text, "hello");
        assert_eq!(result.stats.prompt_tokens, 5);
        assert_eq!(result.stats.generated_tokens, 2);
        assert!(!result.stats.stop_hit);
    }

    #[tokio::test]
    async fn second_load_reuses_cached_context() {
        let dir = tempfile::tempdir().unwrap();
        let id = ModelId::new("demo", None, None);
        let engine = ReplayEngine::new(vec!["x"]);
        let runner = NativeRunner::new(engine, artifact_map(&dir, &id));

        runner.load(&id, ModelLoadOptions::default()).await.unwrap();
        runner.load(&id, ModelLoadOptions::default()).await.unwrap();

        assert_eq!(runner.engine.loads.load(Ordering::SeqCst), 1);
        assert_eq!(runner.cached_contexts().await, 1);
    }

    #[tokio::test]
    async fn unload_evicts_the_context() {
        let dir = tempfile::tempdir().unwrap();
        let id = ModelId::new("demo", None, None);
        let runner = NativeRunner::new(ReplayEngine::new(vec!["x"]), artifact_map(&dir, &id));

        let model = runner.load(&id, ModelLoadOptions::default()).await.unwrap();
        runner.unload(&model).await;
        assert_eq!(runner.cached_contexts().await, 0);

        let stream = runner
            .generate(GenerationRequest::new(id, "hi"), &model, CancelFlag::new())
            .await;
        let err = collect_events(stream).await.unwrap_err();
        assert!(matches!(err, RunnerError::ModelNotLoaded(_)));
    }

    #[tokio::test]
    async fn stop_sequence_trims_and_halts() {
        let dir = tempfile::tempdir().unwrap();
        let id = ModelId::new("demo", None, None);
        let runner = NativeRunner::new(
            ReplayEngine::new(vec!["one ", "two STOP", "never"]).without_info(),
            artifact_map(&dir, &id),
        );

        let model = runner.load(&id, ModelLoadOptions::default()).await.unwrap();
        let mut request = GenerationRequest::new(id, "hi");
        request.config.stop_sequences = vec!["STOP".to_string()];

        let stream = runner.generate(request, &model, CancelFlag::new()).await;
        let (tokens, result) = collect_events(stream).await.unwrap();

        // The chunk containing the stop sequence is never emitted.
        assert_eq!(tokens, vec!["one "]);
        let result = result.unwrap();
        assert_eq!(result.text, "one two ");
        assert!(result.stats.stop_hit);
    }

    #[tokio::test]
    async fn repetition_penalty_derives_from_penalties() {
        let mut config = GenerationConfig::default();
        config.presence_penalty = 0.2;
        config.frequency_penalty = 0.7;
        let params = NativeRunner::<ReplayEngine>::sampling_params(&config);
        assert_eq!(params.repetition_penalty, Some(0.7));

        config.presence_penalty = 0.0;
        config.frequency_penalty = 0.0;
        let params = NativeRunner::<ReplayEngine>::sampling_params(&config);
        assert_eq!(params.repetition_penalty, None);
    }

    #[tokio::test]
    async fn load_fails_when_artifact_missing() {
        let dir = tempfile::tempdir().unwrap();
        let id = ModelId::new("demo", None, None);
        let runner = NativeRunner::new(
            ReplayEngine::new(vec!["x"]),
            HashMap::from([(id.clone(), dir.path().join("absent.gguf"))]),
        );

        let err = runner
            .load(&id, ModelLoadOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::ModelNotLoaded(_)));
    }
}

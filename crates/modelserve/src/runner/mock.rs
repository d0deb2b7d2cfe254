//! Mock backend: loads unconditionally and replays a fixed token list.
//!
//! Reference implementation for stream-protocol conformance tests.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock};
use tokio_stream::wrappers::ReceiverStream;

use super::{
    CancelFlag, EventStream, GenerationEvent, GenerationRequest, GenerationResult,
    GenerationStats, LoadedModel, ModelId, ModelLoadOptions, ModelRunner, RunnerError,
};

pub struct MockRunner {
    tokens: Arc<Vec<String>>,
    token_delay: Option<Duration>,
    loaded: Arc<RwLock<HashSet<ModelId>>>,
}

impl MockRunner {
    pub fn new(tokens: Vec<impl Into<String>>) -> Self {
        Self {
            tokens: Arc::new(tokens.into_iter().map(Into::into).collect()),
            token_delay: None,
            loaded: Arc::new(RwLock::new(HashSet::new())),
        }
    }

    pub fn with_token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = Some(delay);
        self
    }
}

impl Default for MockRunner {
    fn default() -> Self {
        Self::new(vec!["hello", " world"])
    }
}

#[async_trait]
impl ModelRunner for MockRunner {
    async fn load(
        &self,
        model: &ModelId,
        _options: ModelLoadOptions,
    ) -> Result<LoadedModel, RunnerError> {
        self.loaded.write().await.insert(model.clone());
        Ok(LoadedModel::new(model.clone()))
    }

    async fn unload(&self, model: &LoadedModel) {
        self.loaded.write().await.remove(&model.id);
    }

    async fn generate(
        &self,
        request: GenerationRequest,
        model: &LoadedModel,
        cancel: CancelFlag,
    ) -> EventStream {
        let (tx, rx) = mpsc::channel(32);
        let tokens = self.tokens.clone();
        let token_delay = self.token_delay;
        let loaded = self.loaded.clone();
        let id = model.id.clone();

        tokio::spawn(async move {
            if !loaded.read().await.contains(&id) {
                let _ = tx.send(Err(RunnerError::ModelNotLoaded(id))).await;
                return;
            }

            let start = Instant::now();
            let mut aggregate = String::new();

            for token in tokens.iter() {
                if cancel.is_cancelled() {
                    let _ = tx.send(Err(RunnerError::Cancelled)).await;
                    return;
                }
                aggregate.push_str(token);
                if tx
                    .send(Ok(GenerationEvent::Token(token.clone())))
                    .await
                    .is_err()
                {
                    return;
                }
                if let Some(delay) = token_delay {
                    tokio::time::sleep(delay).await;
                }
            }

            let stats = GenerationStats {
                prompt_tokens: request.prompt.split_whitespace().count(),
                generated_tokens: tokens.len(),
                duration: Some(start.elapsed()),
                stop_hit: false,
            };
            let _ = tx
                .send(Ok(GenerationEvent::Completed(GenerationResult {
                    text: aggregate,
                    stats,
                })))
                .await;
        });

        Box::new(ReceiverStream::new(rx))
    }
}

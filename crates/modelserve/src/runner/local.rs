//! Local placeholder backend: validates the artifact path on load, then
//! emits deterministic tokens derived from the model's display name. A
//! stand-in proving the runner contract without a real engine.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock};
use tokio_stream::wrappers::ReceiverStream;

use super::{
    CancelFlag, EventStream, GenerationEvent, GenerationRequest, GenerationResult,
    GenerationStats, LoadedModel, ModelId, ModelLoadOptions, ModelRunner, RunnerError,
};

pub struct LocalRunner {
    model_paths: Arc<HashMap<ModelId, PathBuf>>,
    token_delay: Option<Duration>,
    loaded: Arc<RwLock<HashSet<ModelId>>>,
}

impl LocalRunner {
    pub fn new(model_paths: HashMap<ModelId, PathBuf>) -> Self {
        Self {
            model_paths: Arc::new(model_paths),
            token_delay: None,
            loaded: Arc::new(RwLock::new(HashSet::new())),
        }
    }

    pub fn with_token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = Some(delay);
        self
    }

    fn placeholder_tokens(id: &ModelId) -> Vec<String> {
        let base = format!("placeholder tokens streaming from {} runner", id.display_name());
        let repeated = format!("{base} {base}");
        repeated.split(' ').map(str::to_string).collect()
    }
}

#[async_trait]
impl ModelRunner for LocalRunner {
    async fn load(
        &self,
        model: &ModelId,
        _options: ModelLoadOptions,
    ) -> Result<LoadedModel, RunnerError> {
        match self.model_paths.get(model) {
            Some(path) if path.exists() => {
                self.loaded.write().await.insert(model.clone());
                Ok(LoadedModel::new(model.clone()))
            }
            _ => Err(RunnerError::ModelNotLoaded(model.clone())),
        }
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
        let loaded = self.loaded.clone();
        let token_delay = self.token_delay;
        let id = model.id.clone();

        tokio::spawn(async move {
            if !loaded.read().await.contains(&id) {
                let _ = tx.send(Err(RunnerError::ModelNotLoaded(id))).await;
                return;
            }

            let start = Instant::now();
            let tokens = Self::placeholder_tokens(&id);
            let mut combined = String::new();

            for token in &tokens {
                if cancel.is_cancelled() {
                    let _ = tx.send(Err(RunnerError::Cancelled)).await;
                    return;
                }
                combined.push_str(token);
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
                    text: combined,
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
    use crate::runner::collect_events;

    #[tokio::test]
    async fn load_requires_existing_artifact_path() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("weights.gguf");
        std::fs::write(&artifact, b"weights").unwrap();

        let mapped = ModelId::new("demo", None, None);
        let mut paths = HashMap::new();
        paths.insert(mapped.clone(), artifact);
        paths.insert(ModelId::new("ghost", None, None), dir.path().join("absent"));

        let runner = LocalRunner::new(paths);
        assert!(runner
            .load(&mapped, ModelLoadOptions::default())
            .await
            .is_ok());

        let missing_file = runner
            .load(&ModelId::new("ghost", None, None), ModelLoadOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(missing_file, RunnerError::ModelNotLoaded(_)));

        let unmapped = runner
            .load(&ModelId::new("unknown", None, None), ModelLoadOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(unmapped, RunnerError::ModelNotLoaded(_)));
    }

    #[tokio::test]
    async fn emits_placeholder_tokens_from_display_name() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("weights.gguf");
        std::fs::write(&artifact, b"weights").unwrap();

        let id = ModelId::new("demo", Some("q4".into()), None);
        let runner = LocalRunner::new(HashMap::from([(id.clone(), artifact)]));
        let model = runner.load(&id, ModelLoadOptions::default()).await.unwrap();

        let stream = runner
            .generate(GenerationRequest::new(id.clone(), "hi"), &model, CancelFlag::new())
            .await;
        let (tokens, result) = collect_events(stream).await.unwrap();

        assert!(tokens.contains(&"demo:q4".to_string()));
        let result = result.unwrap();
        assert_eq!(result.stats.generated_tokens, tokens.len());
    }
}

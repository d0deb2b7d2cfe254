//! Subprocess backend: shells out to an external generation CLI and streams
//! its stdout incrementally as token events.
//!
//! GPU-path crashes on certain inputs are a known failure mode of the
//! wrapped engine, so execution is two-tier: try the default device first,
//! and when the process exits non-zero or stderr matches a known crash
//! signature, retry once forcing CPU-only execution. Attempts are strictly
//! sequenced; the external process is never double-started.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::{mpsc, RwLock};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use super::{
    prompt, CancelFlag, EventStream, GenerationEvent, GenerationRequest, GenerationResult,
    GenerationStats, LoadedModel, ModelId, ModelLoadOptions, ModelRunner, RunnerError,
};

/// Stderr substring that marks a GPU-path crash worth retrying on CPU.
/// Engine-version-specific heuristic, not a byte-exact contract.
const CRASH_SIGNATURE: &str = "CUDA error";

pub struct SubprocessRunner {
    binary: PathBuf,
    model_paths: Arc<HashMap<ModelId, PathBuf>>,
    force_cpu: bool,
    allow_fallback: bool,
    threads: usize,
    loaded: Arc<RwLock<HashSet<ModelId>>>,
}

struct AttemptOutcome {
    aggregate: String,
    stderr: String,
    success: bool,
    exit_detail: String,
    duration: Duration,
}

impl SubprocessRunner {
    pub fn new(binary: impl Into<PathBuf>, model_paths: HashMap<ModelId, PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            model_paths: Arc::new(model_paths),
            force_cpu: false,
            allow_fallback: true,
            threads: num_cpus::get(),
            loaded: Arc::new(RwLock::new(HashSet::new())),
        }
    }

    /// Skip the default device entirely and run CPU-only.
    pub fn force_cpu(mut self, force: bool) -> Self {
        self.force_cpu = force;
        self
    }

    pub fn allow_fallback(mut self, allow: bool) -> Self {
        self.allow_fallback = allow;
        self
    }

    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = threads.max(1);
        self
    }

    /// One sequenced process execution. Streams stdout chunks as token
    /// events while they arrive; stderr is drained concurrently so a
    /// chatty child cannot deadlock on a full pipe.
    async fn run_attempt(
        binary: &Path,
        model_path: &Path,
        prompt_text: &str,
        max_tokens: Option<u32>,
        threads: usize,
        cpu_only: bool,
        tx: &mpsc::Sender<Result<GenerationEvent, RunnerError>>,
        cancel: &CancelFlag,
    ) -> Result<AttemptOutcome, RunnerError> {
        let start = Instant::now();

        let mut cmd = Command::new(binary);
        cmd.arg("--model")
            .arg(model_path)
            .arg("--prompt")
            .arg(prompt_text)
            .arg("--threads")
            .arg(threads.to_string());
        if let Some(max) = max_tokens {
            cmd.arg("--n-predict").arg(max.to_string());
        }
        if cpu_only {
            // Hiding all devices routes the engine onto its CPU path.
            cmd.env("CUDA_VISIBLE_DEVICES", "");
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| {
            RunnerError::Process(format!("failed to spawn {}: {e}", binary.display()))
        })?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| RunnerError::Process("stdout not captured".to_string()))?;
        let mut stderr_pipe = child
            .stderr
            .take()
            .ok_or_else(|| RunnerError::Process("stderr not captured".to_string()))?;

        let stderr_task = tokio::spawn(async move {
            let mut text = String::new();
            let _ = stderr_pipe.read_to_string(&mut text).await;
            text
        });

        let mut aggregate = String::new();
        let mut buf = [0u8; 4096];
        loop {
            if cancel.is_cancelled() {
                let _ = child.start_kill();
                return Err(RunnerError::Cancelled);
            }
            let n = stdout
                .read(&mut buf)
                .await
                .map_err(|e| RunnerError::Process(format!("stdout read failed: {e}")))?;
            if n == 0 {
                break;
            }
            let chunk = String::from_utf8_lossy(&buf[..n]).into_owned();
            aggregate.push_str(&chunk);
            if tx.send(Ok(GenerationEvent::Token(chunk))).await.is_err() {
                // Receiver dropped: the client-facing stream is gone.
                let _ = child.start_kill();
                return Err(RunnerError::Cancelled);
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| RunnerError::Process(format!("wait failed: {e}")))?;
        let stderr = stderr_task.await.unwrap_or_default();

        Ok(AttemptOutcome {
            aggregate,
            stderr,
            success: status.success(),
            exit_detail: format!("{status}"),
            duration: start.elapsed(),
        })
    }
}

#[async_trait]
impl ModelRunner for SubprocessRunner {
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
        let model_paths = self.model_paths.clone();
        let binary = self.binary.clone();
        let force_cpu = self.force_cpu;
        let allow_fallback = self.allow_fallback;
        let threads = self.threads;
        let id = model.id.clone();

        tokio::spawn(async move {
            if !loaded.read().await.contains(&id) {
                let _ = tx.send(Err(RunnerError::ModelNotLoaded(id))).await;
                return;
            }
            let Some(model_path) = model_paths.get(&id).cloned() else {
                let _ = tx.send(Err(RunnerError::ModelNotLoaded(id))).await;
                return;
            };

            // The CLI takes a single prompt argument; chat history is
            // flattened through the Llama-3 template when present.
            let prompt_text =
                if request.messages.is_empty() && request.system_prompt.is_none() {
                    request.prompt.clone()
                } else {
                    prompt::llama3(
                        request.system_prompt.as_deref(),
                        &request.messages,
                        &request.prompt,
                    )
                };
            let max_tokens = request.config.max_tokens;

            let mut cpu_only = force_cpu;
            let mut outcome = match Self::run_attempt(
                &binary,
                &model_path,
                &prompt_text,
                max_tokens,
                threads,
                cpu_only,
                &tx,
                &cancel,
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(RunnerError::Cancelled) => {
                    let _ = tx.send(Err(RunnerError::Cancelled)).await;
                    return;
                }
                Err(e) => {
                    if allow_fallback && !cpu_only {
                        warn!(model = %id, error = %e, "default-device attempt failed, retrying on CPU");
                        cpu_only = true;
                        match Self::run_attempt(
                            &binary,
                            &model_path,
                            &prompt_text,
                            max_tokens,
                            threads,
                            true,
                            &tx,
                            &cancel,
                        )
                        .await
                        {
                            Ok(outcome) => outcome,
                            Err(e) => {
                                let _ = tx.send(Err(e)).await;
                                return;
                            }
                        }
                    } else {
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                }
            };

            let crashed = !outcome.success || outcome.stderr.contains(CRASH_SIGNATURE);
            if crashed && allow_fallback && !cpu_only {
                warn!(
                    model = %id,
                    exit = %outcome.exit_detail,
                    "engine process crashed on default device, retrying on CPU"
                );
                match Self::run_attempt(
                    &binary,
                    &model_path,
                    &prompt_text,
                    max_tokens,
                    threads,
                    true,
                    &tx,
                    &cancel,
                )
                .await
                {
                    Ok(retry) => outcome = retry,
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                }
            }

            if !outcome.success {
                let detail = if outcome.stderr.trim().is_empty() {
                    outcome.exit_detail
                } else {
                    outcome.stderr.trim().to_string()
                };
                let _ = tx.send(Err(RunnerError::Process(detail))).await;
                return;
            }

            debug!(model = %id, cpu_only, duration_ms = outcome.duration.as_millis() as u64, "subprocess generation finished");

            let stats = GenerationStats {
                prompt_tokens: request.prompt.split_whitespace().count(),
                generated_tokens: outcome.aggregate.split_whitespace().count(),
                duration: Some(outcome.duration),
                stop_hit: false,
            };
            let _ = tx
                .send(Ok(GenerationEvent::Completed(GenerationResult {
                    text: outcome.aggregate.trim().to_string(),
                    stats,
                })))
                .await;
        });

        Box::new(ReceiverStream::new(rx))
    }
}

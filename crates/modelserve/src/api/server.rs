//! Protocol server: accepts TCP connections, parses one HTTP request per
//! connection, dispatches on a fixed route table, and writes either a
//! single JSON response or a chunked streaming response.
//!
//! Each accepted connection is handled by its own task; generation runs as
//! a separate producer task whose event stream the handler consumes, so a
//! slow peer never blocks accepting new connections.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures_util::StreamExt;
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::runner::{
    collect_events, CancelFlag, GenerationEvent, GenerationRequest, GenerationStats,
    LoadedModel, ModelLoadOptions, ModelRunner, RunnerError,
};
use crate::store::{
    FileModelStore, ModelManifest, ModelSpec, ModelSpecBuildOptions, ModelSpecBuilder,
    ModelTag, SpecBase, StoreError,
};

use super::http::{self, HttpRequest};
use super::wire::{
    normalize_native, normalize_openai, ChatChoice, ChatCompletionChunk,
    ChatCompletionRequest, ChatCompletionResponse, ChunkChoice, ChunkDelta, GenerateRequest,
    ModelList, ModelListEntry, PullRequest, Usage, WireMessage,
};

/// Which wire dialect shapes the response.
#[derive(Clone)]
enum Dialect {
    Native,
    OpenAi { model: String },
}

struct ServerState {
    runner: Arc<dyn ModelRunner>,
    store: Arc<FileModelStore>,
}

pub struct ApiServer {
    state: Arc<ServerState>,
}

impl ApiServer {
    pub fn new(runner: Arc<dyn ModelRunner>, store: Arc<FileModelStore>) -> Self {
        Self {
            state: Arc::new(ServerState { runner, store }),
        }
    }

    pub async fn run(&self, addr: SocketAddr) -> anyhow::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!("listening on http://{}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Accept loop over an already-bound listener. A failed request never
    /// crashes the listener.
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        loop {
            let socket = match listener.accept().await {
                Ok((socket, _peer)) => socket,
                Err(e) => {
                    error!(error = %e, "accept failed");
                    continue;
                }
            };
            let state = self.state.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(state, socket).await {
                    debug!(error = %e, "connection closed with error");
                }
            });
        }
    }
}

async fn handle_connection(state: Arc<ServerState>, mut socket: TcpStream) -> std::io::Result<()> {
    let req_id = Uuid::new_v4().to_string();
    let raw = http::read_request(&mut socket).await?;
    let Some(request) = http::parse_request(&raw) else {
        http::write_response(&mut socket, 400, &error_body("bad request")).await?;
        return Ok(());
    };

    let start = Instant::now();
    info!(path = %request.path, req_id = %req_id, "request start");
    let status = route(&state, &mut socket, &request, &req_id).await?;
    info!(
        path = %request.path,
        req_id = %req_id,
        status,
        duration_ms = start.elapsed().as_millis() as u64,
        "request end"
    );
    Ok(())
}

async fn route(
    state: &ServerState,
    socket: &mut TcpStream,
    request: &HttpRequest,
    req_id: &str,
) -> std::io::Result<u16> {
    match (request.method.as_str(), request.path.as_str()) {
        ("GET", "/api/health") => respond(socket, 200, &json!({"status": "ok"}).to_string()).await,
        ("GET", "/api/version") => {
            respond(socket, 200, &json!({"version": env!("CARGO_PKG_VERSION")}).to_string()).await
        }
        ("GET", "/v1/models") => handle_list_models(state, socket).await,
        ("POST", "/api/generate") | ("POST", "/api/chat") => {
            handle_native_generation(state, socket, request, req_id).await
        }
        ("POST", "/v1/chat/completions") => {
            handle_openai_chat(state, socket, request, req_id).await
        }
        ("POST", "/api/pull") => handle_pull(state, socket, request, req_id).await,
        _ => respond(socket, 404, &error_body("not found")).await,
    }
}

async fn respond(socket: &mut TcpStream, status: u16, body: &str) -> std::io::Result<u16> {
    http::write_response(socket, status, body).await?;
    Ok(status)
}

fn error_body(message: &str) -> String {
    json!({ "error": message }).to_string()
}

async fn handle_list_models(state: &ServerState, socket: &mut TcpStream) -> std::io::Result<u16> {
    let manifests = match state.store.list().await {
        Ok(manifests) => manifests,
        Err(e) => {
            error!(error = %e, "model list failed");
            return respond(socket, 500, &error_body("list failed")).await;
        }
    };

    let list = ModelList {
        object: "list".to_string(),
        data: manifests
            .iter()
            .map(|m| ModelListEntry {
                id: m.tag.display_name(),
                object: "model".to_string(),
                created: m.created_at.timestamp(),
                owned_by: "local".to_string(),
                size: m.size_bytes,
            })
            .collect(),
    };
    let body = serde_json::to_string(&list).unwrap_or_default();
    respond(socket, 200, &body).await
}

async fn handle_native_generation(
    state: &ServerState,
    socket: &mut TcpStream,
    request: &HttpRequest,
    req_id: &str,
) -> std::io::Result<u16> {
    let wire: GenerateRequest = match serde_json::from_slice(&request.body) {
        Ok(wire) => wire,
        Err(_) => return respond(socket, 400, &error_body("invalid json")).await,
    };
    let Some(gen_req) = normalize_native(&wire) else {
        return respond(socket, 400, &error_body("invalid model tag")).await;
    };
    dispatch_generation(
        state,
        socket,
        request,
        gen_req,
        wire.stream.unwrap_or(false),
        Dialect::Native,
        req_id,
    )
    .await
}

async fn handle_openai_chat(
    state: &ServerState,
    socket: &mut TcpStream,
    request: &HttpRequest,
    req_id: &str,
) -> std::io::Result<u16> {
    let wire: ChatCompletionRequest = match serde_json::from_slice(&request.body) {
        Ok(wire) => wire,
        Err(_) => return respond(socket, 400, &error_body("invalid json")).await,
    };
    let Some(gen_req) = normalize_openai(&wire) else {
        return respond(socket, 400, &error_body("invalid model tag")).await;
    };
    dispatch_generation(
        state,
        socket,
        request,
        gen_req,
        wire.stream.unwrap_or(false),
        Dialect::OpenAi { model: wire.model },
        req_id,
    )
    .await
}

/// Dispatch sequence for a generation route: manifest lookup → blob
/// verification → load → unary collect or stream.
async fn dispatch_generation(
    state: &ServerState,
    socket: &mut TcpStream,
    request: &HttpRequest,
    gen_req: GenerationRequest,
    stream: bool,
    dialect: Dialect,
    req_id: &str,
) -> std::io::Result<u16> {
    let tag = ModelTag::new(
        gen_req.model.name.clone(),
        gen_req.model.variant.clone(),
        gen_req.model.version.clone(),
    );

    let manifest = match state.store.manifest(&tag).await {
        Ok(Some(manifest)) => manifest,
        Ok(None) => {
            error!(model = %gen_req.model, req_id = %req_id, "manifest missing");
            return respond(socket, 404, &error_body("manifest not found")).await;
        }
        Err(e) => {
            error!(model = %gen_req.model, req_id = %req_id, error = %e, "manifest lookup failed");
            return respond(socket, 500, &error_body("manifest lookup failed")).await;
        }
    };

    // Verification blocks serving a corrupted artifact.
    if let Err(e) = state.store.verify(&manifest).await {
        error!(model = %gen_req.model, req_id = %req_id, error = %e, "manifest verification failed");
        return respond(socket, 500, &error_body("manifest verification failed")).await;
    }

    let options = ModelLoadOptions {
        keep_alive: gen_req.keep_alive,
        eager_load: true,
    };
    let loaded = match state.runner.load(&gen_req.model, options).await {
        Ok(loaded) => loaded,
        Err(e @ RunnerError::ModelNotLoaded(_)) => {
            error!(model = %gen_req.model, req_id = %req_id, error = %e, "model load failed");
            return respond(socket, 404, &error_body(&e.to_string())).await;
        }
        Err(e) => {
            error!(model = %gen_req.model, req_id = %req_id, error = %e, "model load failed");
            return respond(socket, 500, &error_body("generation failed")).await;
        }
    };

    if stream {
        stream_generation(state, socket, request, gen_req, loaded, dialect, req_id).await
    } else {
        unary_generation(state, socket, gen_req, loaded, dialect, req_id).await
    }
}

/// Collect the full event stream into one JSON response.
async fn unary_generation(
    state: &ServerState,
    socket: &mut TcpStream,
    gen_req: GenerationRequest,
    loaded: LoadedModel,
    dialect: Dialect,
    req_id: &str,
) -> std::io::Result<u16> {
    let model_label = gen_req.model.display_name();
    let stream = state
        .runner
        .generate(gen_req, &loaded, CancelFlag::new())
        .await;

    let (tokens, result) = match collect_events(stream).await {
        Ok(collected) => collected,
        Err(e) => {
            error!(model = %model_label, req_id = %req_id, error = %e, "generation failed");
            return respond(socket, 500, &error_body("generation failed")).await;
        }
    };
    let (text, stats) = match result {
        Some(result) => (result.text, result.stats),
        None => (
            tokens.concat(),
            GenerationStats {
                prompt_tokens: 0,
                generated_tokens: tokens.len(),
                duration: None,
                stop_hit: false,
            },
        ),
    };

    match dialect {
        Dialect::Native => {
            let body = json!({
                "model": model_label,
                "response": text,
                "tokens": tokens,
            });
            respond(socket, 200, &body.to_string()).await
        }
        Dialect::OpenAi { model } => {
            let response = ChatCompletionResponse {
                id: format!("chatcmpl-{req_id}"),
                object: "chat.completion".to_string(),
                created: Utc::now().timestamp(),
                model,
                choices: vec![ChatChoice {
                    index: 0,
                    message: WireMessage {
                        role: "assistant".to_string(),
                        content: text,
                    },
                    finish_reason: Some("stop".to_string()),
                }],
                usage: Usage {
                    prompt_tokens: stats.prompt_tokens as u32,
                    completion_tokens: stats.generated_tokens as u32,
                    total_tokens: (stats.prompt_tokens + stats.generated_tokens) as u32,
                },
            };
            let body = serde_json::to_string(&response).unwrap_or_default();
            respond(socket, 200, &body).await
        }
    }
}

/// Stream generation events over chunked transfer encoding: SSE framing
/// when the request accepts `text/event-stream`, NDJSON otherwise. A failed
/// chunk write cancels the producer; the closing chunk is still sent so the
/// transfer terminates cleanly.
async fn stream_generation(
    state: &ServerState,
    socket: &mut TcpStream,
    request: &HttpRequest,
    gen_req: GenerationRequest,
    loaded: LoadedModel,
    dialect: Dialect,
    req_id: &str,
) -> std::io::Result<u16> {
    let model_label = gen_req.model.display_name();
    let sse = request
        .header("accept")
        .map(|v| v.to_ascii_lowercase().contains("text/event-stream"))
        .unwrap_or(false);

    let cancel = CancelFlag::new();
    let mut events = state
        .runner
        .generate(gen_req, &loaded, cancel.clone())
        .await;

    http::write_stream_head(socket, sse).await?;
    let created = Utc::now().timestamp();
    let chunk_id = format!("chatcmpl-{req_id}");

    while let Some(event) = events.next().await {
        let payload = match event {
            Ok(GenerationEvent::Token(token)) => match &dialect {
                Dialect::Native => json!({ "token": token }).to_string(),
                Dialect::OpenAi { model } => openai_chunk(
                    &chunk_id,
                    created,
                    model,
                    Some(token),
                    None,
                ),
            },
            Ok(GenerationEvent::Completed(result)) => match &dialect {
                Dialect::Native => {
                    json!({ "done": true, "response": result.text }).to_string()
                }
                Dialect::OpenAi { model } => openai_chunk(
                    &chunk_id,
                    created,
                    model,
                    Some(result.text),
                    Some("stop".to_string()),
                ),
            },
            Err(e) => {
                error!(model = %model_label, req_id = %req_id, error = %e, "streaming failed");
                break;
            }
        };

        let framed = if sse {
            format!("data: {payload}\n\n")
        } else {
            format!("{payload}\n")
        };
        if http::write_chunk(socket, framed.as_bytes()).await.is_err() {
            // Peer went away: stop forwarding; the producer observes the
            // flag before its next emission.
            cancel.cancel();
            break;
        }
    }

    let _ = http::write_final_chunk(socket).await;
    Ok(200)
}

fn openai_chunk(
    id: &str,
    created: i64,
    model: &str,
    content: Option<String>,
    finish_reason: Option<String>,
) -> String {
    let chunk = ChatCompletionChunk {
        id: id.to_string(),
        object: "chat.completion.chunk".to_string(),
        created,
        model: model.to_string(),
        choices: vec![ChunkChoice {
            index: 0,
            delta: ChunkDelta {
                role: Some("assistant".to_string()),
                content,
            },
            finish_reason,
        }],
    };
    serde_json::to_string(&chunk).unwrap_or_default()
}

/// Build-and-import a manifest from a local artifact path, reusing the
/// store's pack workflow.
async fn handle_pull(
    state: &ServerState,
    socket: &mut TcpStream,
    request: &HttpRequest,
    req_id: &str,
) -> std::io::Result<u16> {
    let pull: PullRequest = match serde_json::from_slice(&request.body) {
        Ok(pull) => pull,
        Err(_) => return respond(socket, 400, &error_body("invalid json")).await,
    };
    let Some(tag) = ModelTag::parse(&pull.tag) else {
        return respond(socket, 400, &error_body("invalid tag")).await;
    };

    let built = match &pull.root {
        Some(root) => match FileModelStore::new(root.as_str()) {
            Ok(store) => build_pull_manifest(&store, &tag, &pull).await,
            Err(e) => {
                error!(req_id = %req_id, error = %e, "store init failed");
                return respond(socket, 500, &error_body("store init failed")).await;
            }
        },
        None => build_pull_manifest(&state.store, &tag, &pull).await,
    };

    match built {
        Ok(manifest) => {
            let body = serde_json::to_string_pretty(&manifest).unwrap_or_default();
            respond(socket, 200, &body).await
        }
        Err(e) => {
            error!(tag = %tag, req_id = %req_id, error = %e, "pull failed");
            respond(socket, 500, &error_body(&e.to_string())).await
        }
    }
}

async fn build_pull_manifest(
    store: &FileModelStore,
    tag: &ModelTag,
    pull: &PullRequest,
) -> Result<ModelManifest, StoreError> {
    let artifact = PathBuf::from(&pull.artifact);
    let tokenizer = pull.tokenizer.as_ref().map(PathBuf::from);
    let spec = ModelSpec {
        name: tag.name.clone(),
        version: tag.version.clone(),
        base: SpecBase {
            hf_repo: None,
            revision: None,
            local_path: Some(pull.artifact.clone()),
        },
        format: "gguf".to_string(),
        quantization: tag.variant.clone(),
        tokenizer: tokenizer
            .as_ref()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().to_string()),
        prompt_template: None,
        defaults: None,
        license: None,
        metadata: Some(BTreeMap::from([(
            "source".to_string(),
            "pull-api".to_string(),
        )])),
    };

    ModelSpecBuilder::new(store)
        .build(
            &spec,
            &ModelSpecBuildOptions {
                artifact_path: artifact,
                tokenizer_path: tokenizer,
            },
        )
        .await
}

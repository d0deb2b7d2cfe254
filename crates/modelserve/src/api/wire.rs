//! Wire dialect shapes and the request normalizer.
//!
//! Two independent JSON dialects converge here into the canonical
//! [`GenerationRequest`]; everything downstream (store lookup, runner) is
//! dialect-agnostic.

use serde::{Deserialize, Serialize};

use crate::runner::{
    ChatMessage, ChatRole, GenerationConfig, GenerationRequest, ModelId,
};
use crate::store::ModelTag;

// ---- Native dialect ----

/// Body of `POST /api/generate` and `POST /api/chat`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub model: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub system: Option<String>,
    #[serde(default)]
    pub template: Option<String>,
    #[serde(default)]
    pub stream: Option<bool>,
    #[serde(default)]
    pub keep_alive: Option<f64>,
    #[serde(default)]
    pub options: Option<GenerationOptions>,
    #[serde(default)]
    pub messages: Option<Vec<ChatMessage>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerationOptions {
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub stop: Option<Vec<String>>,
}

// ---- OpenAI-compatible dialect ----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    pub role: String,
    pub content: String,
}

/// Body of `POST /v1/chat/completions`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<WireMessage>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub stream: Option<bool>,
    #[serde(default)]
    pub stop: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChatChoice>,
    pub usage: Usage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatChoice {
    pub index: u32,
    pub message: WireMessage,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// One streamed chat-completion chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: ChunkDelta,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

// ---- Model list and pull ----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelList {
    pub object: String,
    pub data: Vec<ModelListEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelListEntry {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub owned_by: String,
    pub size: u64,
}

/// Body of `POST /api/pull`: import a local artifact into the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequest {
    pub tag: String,
    pub artifact: String,
    #[serde(default)]
    pub tokenizer: Option<String>,
    #[serde(default)]
    pub root: Option<String>,
}

// ---- Normalization ----

fn model_id_from_tag(tag: ModelTag) -> ModelId {
    ModelId::new(tag.name, tag.variant, tag.version)
}

/// Map a native-dialect request into the canonical shape. `None` when the
/// model tag cannot be parsed.
pub fn normalize_native(req: &GenerateRequest) -> Option<GenerationRequest> {
    let model = model_id_from_tag(ModelTag::parse(&req.model)?);
    let options = req.options.clone().unwrap_or_default();

    let config = GenerationConfig {
        max_tokens: options.max_tokens.or(Some(256)),
        temperature: options.temperature.unwrap_or(0.8),
        top_p: options.top_p.unwrap_or(0.95),
        stop_sequences: options.stop.unwrap_or_default(),
        presence_penalty: 0.0,
        frequency_penalty: 0.0,
    };

    Some(GenerationRequest {
        model,
        prompt: req.prompt.clone(),
        messages: req.messages.clone().unwrap_or_default(),
        config,
        system_prompt: req.system.clone(),
        keep_alive: req.keep_alive,
    })
}

/// Map an OpenAI-dialect request into the canonical shape. History carries
/// the content, so `prompt` stays empty.
pub fn normalize_openai(req: &ChatCompletionRequest) -> Option<GenerationRequest> {
    let model = model_id_from_tag(ModelTag::parse(&req.model)?);

    let messages = req
        .messages
        .iter()
        .map(|m| ChatMessage::new(ChatRole::from_wire(&m.role), m.content.clone()))
        .collect();

    let config = GenerationConfig {
        max_tokens: req.max_tokens.or(Some(256)),
        temperature: req.temperature.unwrap_or(0.8),
        top_p: req.top_p.unwrap_or(0.95),
        stop_sequences: req.stop.clone().unwrap_or_default(),
        presence_penalty: 0.0,
        frequency_penalty: 0.0,
    };

    Some(GenerationRequest {
        model,
        prompt: String::new(),
        messages,
        config,
        system_prompt: None,
        keep_alive: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_native_request() {
        let req = GenerateRequest {
            model: "llama:demo@v1".to_string(),
            prompt: "hi".to_string(),
            system: Some("sys".to_string()),
            template: None,
            stream: Some(true),
            keep_alive: Some(60.0),
            options: Some(GenerationOptions {
                temperature: Some(0.5),
                top_p: Some(0.9),
                max_tokens: Some(42),
                stop: Some(vec!["stop".to_string()]),
            }),
            messages: Some(vec![ChatMessage::new(ChatRole::User, "hello")]),
        };

        let normalized = normalize_native(&req).unwrap();
        assert_eq!(normalized.model.name, "llama");
        assert_eq!(normalized.model.variant.as_deref(), Some("demo"));
        assert_eq!(normalized.model.version.as_deref(), Some("v1"));
        assert_eq!(normalized.prompt, "hi");
        assert_eq!(normalized.system_prompt.as_deref(), Some("sys"));
        assert_eq!(normalized.keep_alive, Some(60.0));
        assert_eq!(normalized.config.max_tokens, Some(42));
        assert_eq!(normalized.config.temperature, 0.5);
        assert_eq!(normalized.config.top_p, 0.9);
        assert_eq!(normalized.config.stop_sequences, vec!["stop"]);
    }

    #[test]
    fn native_defaults_apply_when_options_absent() {
        let req = GenerateRequest {
            model: "llama".to_string(),
            prompt: "hi".to_string(),
            system: None,
            template: None,
            stream: None,
            keep_alive: None,
            options: None,
            messages: None,
        };

        let normalized = normalize_native(&req).unwrap();
        assert_eq!(normalized.config.temperature, 0.8);
        assert_eq!(normalized.config.top_p, 0.95);
        assert_eq!(normalized.config.max_tokens, Some(256));
        assert!(normalized.config.stop_sequences.is_empty());
    }

    #[test]
    fn native_rejects_invalid_tag() {
        let req = GenerateRequest {
            model: "@v1".to_string(),
            prompt: String::new(),
            system: None,
            template: None,
            stream: None,
            keep_alive: None,
            options: None,
            messages: None,
        };
        assert!(normalize_native(&req).is_none());
    }

    #[test]
    fn normalizes_openai_request() {
        let req = ChatCompletionRequest {
            model: "llama".to_string(),
            messages: vec![WireMessage {
                role: "user".to_string(),
                content: "hi".to_string(),
            }],
            temperature: Some(0.7),
            top_p: Some(0.8),
            max_tokens: Some(64),
            stream: Some(true),
            stop: Some(vec!["stop".to_string()]),
        };

        let normalized = normalize_openai(&req).unwrap();
        assert_eq!(normalized.model.name, "llama");
        assert_eq!(normalized.prompt, "");
        assert_eq!(normalized.config.temperature, 0.7);
        assert_eq!(normalized.config.top_p, 0.8);
        assert_eq!(normalized.config.max_tokens, Some(64));
        assert_eq!(normalized.config.stop_sequences, vec!["stop"]);
        assert_eq!(
            normalized.messages,
            vec![ChatMessage::new(ChatRole::User, "hi")]
        );
    }

    #[test]
    fn openai_unknown_role_falls_back_to_user() {
        let req = ChatCompletionRequest {
            model: "llama".to_string(),
            messages: vec![WireMessage {
                role: "tool".to_string(),
                content: "result".to_string(),
            }],
            temperature: None,
            top_p: None,
            max_tokens: None,
            stream: None,
            stop: None,
        };

        let normalized = normalize_openai(&req).unwrap();
        assert_eq!(normalized.messages[0].role, ChatRole::User);
    }

    #[test]
    fn generate_request_decodes_with_minimal_body() {
        let req: GenerateRequest =
            serde_json::from_str(r#"{"model": "llama", "prompt": "hi"}"#).unwrap();
        assert_eq!(req.model, "llama");
        assert_eq!(req.prompt, "hi");
        assert!(req.options.is_none());
    }
}

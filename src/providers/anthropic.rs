// Anthropic-style API adapter
//
// Differs from the OpenAI-compatible family in three ways that matter here:
// system instructions travel out-of-band in a `system` field, images are
// `{media_type, base64}` objects with the data-URI prefix stripped, and
// stream events are typed (`content_block_delta`, `error`).

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::LlmError;
use crate::net::framing::{sse_data, LineBuffer};
use crate::net::Transport;

use super::types::{
    ChatMessage, ChatRequest, ChatResponse, ModelCapabilities, ModelInfo, Role,
};
use super::{ModelProvider, TextStream};

const CHANNEL_CAPACITY: usize = 100;
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_MODEL: &str = "claude-3-5-sonnet-20240620";
const MAX_TOKENS: u32 = 4096;

pub struct AnthropicProvider {
    api_key: String,
    base_url: String,
    transport: Arc<Transport>,
}

impl AnthropicProvider {
    pub fn new(api_key: impl Into<String>, transport: Arc<Transport>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            transport,
        }
    }

    /// Point at a different endpoint (proxies, tests).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn headers(&self) -> Vec<(String, String)> {
        vec![
            ("x-api-key".to_string(), self.api_key.clone()),
            ("anthropic-version".to_string(), API_VERSION.to_string()),
            ("content-type".to_string(), "application/json".to_string()),
        ]
    }

    /// Split canonical messages into the merged system prompt and the wire
    /// message list.
    fn build_request(&self, request: &ChatRequest, stream: bool) -> WireRequest {
        let mut system = String::new();
        let mut messages = Vec::new();

        for message in &request.messages {
            if message.role == Role::System {
                if let Some(text) = &message.content {
                    system.push_str(text);
                    system.push('\n');
                }
                continue;
            }
            messages.push(to_wire_message(message));
        }

        let system = system.trim().to_string();
        WireRequest {
            model: request
                .model
                .clone()
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            messages,
            max_tokens: MAX_TOKENS,
            temperature: request.temperature,
            stream,
            system: if system.is_empty() { None } else { Some(system) },
        }
    }
}

#[async_trait]
impl ModelProvider for AnthropicProvider {
    fn id(&self) -> &str {
        "anthropic"
    }

    fn display_name(&self) -> &str {
        "Anthropic"
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, LlmError> {
        let url = format!("{}/models", self.base_url);
        let headers = vec![
            ("x-api-key".to_string(), self.api_key.clone()),
            ("anthropic-version".to_string(), API_VERSION.to_string()),
        ];
        match self.transport.request(&url, "GET", &headers, None).await {
            Ok(response) => {
                let listing: ModelsResponse = serde_json::from_value(response)
                    .map_err(|e| LlmError::Protocol(format!("unexpected model listing shape: {e}")))?;
                Ok(listing
                    .data
                    .into_iter()
                    .map(|m| ModelInfo {
                        name: m.display_name.unwrap_or_else(|| m.id.clone()),
                        id: m.id,
                        capabilities: Some(FULL_CAPS),
                    })
                    .collect())
            }
            Err(e) => {
                tracing::warn!("failed to fetch Anthropic models, using static list: {e}");
                Ok(static_models())
            }
        }
    }

    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError> {
        let url = format!("{}/messages", self.base_url);
        let body = serde_json::to_value(self.build_request(request, false))
            .map_err(|e| LlmError::Protocol(e.to_string()))?;

        let response = self
            .transport
            .request(&url, "POST", &self.headers(), Some(body))
            .await?;
        let parsed: MessagesResponse = serde_json::from_value(response)
            .map_err(|e| LlmError::Protocol(format!("unexpected response shape: {e}")))?;

        let content = parsed
            .content
            .into_iter()
            .find(|block| block.block_type == "text")
            .and_then(|block| block.text)
            .unwrap_or_default();

        Ok(ChatResponse {
            content,
            tool_calls: Vec::new(),
        })
    }

    async fn stream(&self, request: &ChatRequest) -> Result<TextStream, LlmError> {
        let url = format!("{}/messages", self.base_url);
        let body = serde_json::to_value(self.build_request(request, true))
            .map_err(|e| LlmError::Protocol(e.to_string()))?;

        let mut raw = self
            .transport
            .stream(&url, "POST", &self.headers(), Some(body), request.cancel.clone())
            .await?;

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(async move {
            let mut buf = LineBuffer::new();
            while let Some(item) = raw.recv().await {
                let fragment = match item {
                    Ok(f) => f,
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                };
                for line in buf.push(&fragment) {
                    match parse_event_line(&line) {
                        Ok(Some(text)) => {
                            if tx.send(Ok(text)).await.is_err() {
                                return;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            let _ = tx.send(Err(e)).await;
                            return;
                        }
                    }
                }
            }
            // Flush the trailing partial line: an error payload split at the
            // buffer boundary must not be silently dropped.
            if let Some(rest) = buf.finish() {
                match parse_event_line(&rest) {
                    Ok(Some(text)) => {
                        let _ = tx.send(Ok(text)).await;
                    }
                    Ok(None) => {
                        if let Some(message) = bare_error_message(&rest) {
                            let _ = tx.send(Err(LlmError::Stream(message))).await;
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                    }
                }
            }
        });
        Ok(rx)
    }
}

/// Parse one SSE line: `Ok(Some(text))` for a text delta, `Ok(None)` for
/// anything ignorable, `Err` for a provider error event.
fn parse_event_line(line: &str) -> Result<Option<String>, LlmError> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with("event:") {
        return Ok(None);
    }
    let Some(data) = sse_data(trimmed) else {
        tracing::warn!("skipping non-SSE line in Anthropic stream: {trimmed}");
        return Ok(None);
    };
    let event: StreamEvent = match serde_json::from_str(data) {
        Ok(event) => event,
        Err(e) => {
            tracing::warn!("skipping malformed stream line: {e}");
            return Ok(None);
        }
    };
    match event.event_type.as_str() {
        "content_block_delta" => {
            let delta = event.delta.unwrap_or_default();
            if delta.delta_type.as_deref() == Some("text_delta") {
                if let Some(text) = delta.text.filter(|t| !t.is_empty()) {
                    return Ok(Some(text));
                }
            }
            Ok(None)
        }
        "error" => Err(LlmError::Stream(
            event
                .error
                .and_then(|e| e.message)
                .unwrap_or_else(|| "Anthropic stream error".to_string()),
        )),
        _ => Ok(None),
    }
}

/// A raw JSON error payload without SSE framing (seen when the stream dies
/// mid-response and the tail arrives unframed).
fn bare_error_message(rest: &str) -> Option<String> {
    let event: StreamEvent = serde_json::from_str(rest).ok()?;
    if event.event_type == "error" {
        Some(
            event
                .error
                .and_then(|e| e.message)
                .unwrap_or_else(|| "Anthropic stream error".to_string()),
        )
    } else {
        None
    }
}

const FULL_CAPS: ModelCapabilities = ModelCapabilities {
    vision: true,
    tools: true,
    reasoning: false,
};

fn static_models() -> Vec<ModelInfo> {
    [
        ("claude-3-5-sonnet-20241022", "Claude 3.5 Sonnet (New)"),
        ("claude-3-5-haiku-20241022", "Claude 3.5 Haiku"),
        ("claude-3-5-sonnet-20240620", "Claude 3.5 Sonnet"),
        ("claude-3-opus-20240229", "Claude 3 Opus"),
        ("claude-3-haiku-20240307", "Claude 3 Haiku"),
    ]
    .into_iter()
    .map(|(id, name)| ModelInfo {
        id: id.to_string(),
        name: name.to_string(),
        capabilities: Some(FULL_CAPS),
    })
    .collect()
}

fn to_wire_message(message: &ChatMessage) -> WireMessage {
    if message.images.is_empty() {
        return WireMessage {
            role: message.role,
            content: WireContent::Text(message.content.clone().unwrap_or_default()),
        };
    }

    let mut parts = Vec::new();
    for image in &message.images {
        let (media_type, data) = split_data_uri(image);
        parts.push(WirePart::Image {
            source: WireImageSource {
                source_type: "base64".to_string(),
                media_type,
                data,
            },
        });
    }
    if let Some(text) = message.content.as_ref().filter(|t| !t.is_empty()) {
        parts.push(WirePart::Text { text: text.clone() });
    }
    WireMessage {
        role: message.role,
        content: WireContent::Parts(parts),
    }
}

/// Split a data URI into media type and bare base64 payload. Inputs without
/// the scheme prefix pass through with a jpeg default.
fn split_data_uri(uri: &str) -> (String, String) {
    match uri.split_once(";base64,") {
        Some((head, data)) => {
            let media_type = head.strip_prefix("data:").unwrap_or(head);
            (media_type.to_string(), data.to_string())
        }
        None => ("image/jpeg".to_string(), uri.to_string()),
    }
}

// Wire types

#[derive(Debug, Serialize)]
struct WireRequest {
    model: String,
    messages: Vec<WireMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: Role,
    content: WireContent,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum WireContent {
    Text(String),
    Parts(Vec<WirePart>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum WirePart {
    #[serde(rename = "image")]
    Image { source: WireImageSource },
    #[serde(rename = "text")]
    Text { text: String },
}

#[derive(Debug, Serialize)]
struct WireImageSource {
    #[serde(rename = "type")]
    source_type: String,
    media_type: String,
    data: String,
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    data: Vec<ModelRow>,
}

#[derive(Debug, Deserialize)]
struct ModelRow {
    id: String,
    display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ResponseBlock>,
}

#[derive(Debug, Deserialize)]
struct ResponseBlock {
    #[serde(rename = "type")]
    block_type: String,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamEvent {
    #[serde(rename = "type")]
    event_type: String,
    delta: Option<EventDelta>,
    error: Option<EventError>,
}

#[derive(Debug, Default, Deserialize)]
struct EventDelta {
    #[serde(rename = "type")]
    delta_type: Option<String>,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EventError {
    message: Option<String>,
}

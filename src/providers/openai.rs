// OpenAI-compatible API adapter
//
// Covers the local backend (Ollama, LM Studio, llama.cpp server) and every
// hosted service that speaks the same wire format (OpenAI, Grok/x.ai,
// OpenRouter) - instances differ only in identity, key, and base URL.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::LlmError;
use crate::net::framing::{sse_data, LineBuffer};
use crate::net::Transport;

use super::types::{
    infer_capabilities, ChatMessage, ChatRequest, ChatResponse, ModelInfo, Role, ToolCall,
};
use super::{ModelProvider, TextStream};

const CHANNEL_CAPACITY: usize = 100;

pub struct OpenAiCompatProvider {
    id: String,
    display_name: String,
    api_key: String,
    base_url: String,
    transport: Arc<Transport>,
}

impl OpenAiCompatProvider {
    pub fn new(
        id: impl Into<String>,
        display_name: impl Into<String>,
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        transport: Arc<Transport>,
    ) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            id: id.into(),
            display_name: display_name.into(),
            api_key: api_key.into(),
            base_url,
            transport,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn headers(&self) -> Vec<(String, String)> {
        vec![
            ("Content-Type".to_string(), "application/json".to_string()),
            (
                "Authorization".to_string(),
                format!("Bearer {}", self.api_key),
            ),
        ]
    }

    fn build_request(&self, request: &ChatRequest, stream: bool) -> WireRequest {
        WireRequest {
            model: request.model.clone().unwrap_or_default(),
            messages: request.messages.iter().map(to_wire_message).collect(),
            temperature: request.temperature,
            stream,
            tools: request.tools.clone(),
            tool_choice: request.tool_choice.clone(),
        }
    }
}

#[async_trait]
impl ModelProvider for OpenAiCompatProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn display_name(&self) -> &str {
        &self.display_name
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, LlmError> {
        if self.api_key.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!("{}/models", self.base_url);
        let auth = vec![(
            "Authorization".to_string(),
            format!("Bearer {}", self.api_key),
        )];
        let response = self.transport.request(&url, "GET", &auth, None).await?;
        let listing: ModelsResponse = serde_json::from_value(response)
            .map_err(|e| LlmError::Protocol(format!("unexpected model listing shape: {e}")))?;

        let mut models: Vec<ModelInfo> = listing
            .data
            .into_iter()
            .map(|m| ModelInfo {
                name: m.id.clone(),
                capabilities: Some(infer_capabilities(&m.id)),
                id: m.id,
            })
            .collect();
        models.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(models)
    }

    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = serde_json::to_value(self.build_request(request, false))
            .map_err(|e| LlmError::Protocol(e.to_string()))?;

        tracing::debug!(provider = %self.id, "sending chat completion request");
        let response = self
            .transport
            .request(&url, "POST", &self.headers(), Some(body))
            .await?;

        let parsed: ChatCompletionResponse = serde_json::from_value(response)
            .map_err(|e| LlmError::Protocol(format!("unexpected completion shape: {e}")))?;
        let message = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message)
            .unwrap_or_default();

        let mut content = message.content.unwrap_or_default();
        let mut tool_calls: Vec<ToolCall> = message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .filter(|tc| tc.call_type == "function")
            .map(|tc| ToolCall {
                id: tc.id,
                name: tc.function.name,
                arguments: tc.function.arguments,
            })
            .collect();

        // Some local models emit tool invocations as plain text instead of
        // structured fields. Salvage them; on any parse failure the content
        // goes back to the caller untouched.
        if tool_calls.is_empty() {
            if let Some(extracted) = extract_embedded_tool_calls(&content) {
                tool_calls = extracted;
                content = String::new();
            }
        }

        Ok(ChatResponse {
            content,
            tool_calls,
        })
    }

    async fn stream(&self, request: &ChatRequest) -> Result<TextStream, LlmError> {
        let url = format!("{}/chat/completions", self.base_url);
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
                        EventLine::Delta(text) => {
                            if tx.send(Ok(text)).await.is_err() {
                                return;
                            }
                        }
                        EventLine::Done => return,
                        EventLine::Skip => {}
                    }
                }
            }
            // One final parse attempt on the unterminated tail so an error
            // payload split at the buffer boundary still surfaces.
            if let Some(rest) = buf.finish() {
                match parse_event_line(&rest) {
                    EventLine::Delta(text) => {
                        let _ = tx.send(Ok(text)).await;
                    }
                    EventLine::Done | EventLine::Skip => {
                        if let Some(message) = embedded_error_message(&rest) {
                            let _ = tx.send(Err(LlmError::Stream(message))).await;
                        }
                    }
                }
            }
        });
        Ok(rx)
    }
}

enum EventLine {
    Delta(String),
    Done,
    Skip,
}

fn parse_event_line(line: &str) -> EventLine {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return EventLine::Skip;
    }
    let Some(data) = sse_data(trimmed) else {
        return EventLine::Skip;
    };
    if data == "[DONE]" {
        return EventLine::Done;
    }
    match serde_json::from_str::<StreamChunk>(data) {
        Ok(chunk) => {
            let delta = chunk
                .choices
                .into_iter()
                .next()
                .and_then(|c| c.delta.content)
                .unwrap_or_default();
            if delta.is_empty() {
                EventLine::Skip
            } else {
                EventLine::Delta(delta)
            }
        }
        Err(e) => {
            tracing::warn!("skipping malformed stream line: {e}");
            EventLine::Skip
        }
    }
}

/// Pull an error message out of a trailing payload (`{"error": ...}` with or
/// without SSE framing).
fn embedded_error_message(rest: &str) -> Option<String> {
    let payload = sse_data(rest).unwrap_or(rest);
    let value: Value = serde_json::from_str(payload).ok()?;
    value.get("error")?;
    Some(crate::error::error_body_message(payload))
}

/// Scan completed content for a plain-text JSON object carrying a
/// `tool_uses` key and synthesize structured tool calls from it.
///
/// Returns `None` unless the whole pattern parses - this must never fail a
/// request that simply contains the literal text.
fn extract_embedded_tool_calls(content: &str) -> Option<Vec<ToolCall>> {
    if !content.contains("\"tool_uses\"") {
        return None;
    }
    let start = content.find('{')?;
    let end = content.rfind('}')?;
    if end <= start {
        return None;
    }
    let parsed: Value = serde_json::from_str(&content[start..=end]).ok()?;
    let uses = parsed.get("tool_uses")?.as_array()?;

    let mut calls = Vec::new();
    for entry in uses {
        let name = entry
            .get("recipient_name")
            .or_else(|| entry.get("name"))?
            .as_str()?;
        let name = name.strip_prefix("functions.").unwrap_or(name);
        let arguments = entry
            .get("parameters")
            .or_else(|| entry.get("arguments"))
            .cloned()
            .unwrap_or_else(|| Value::Object(Default::default()));
        calls.push(ToolCall {
            id: format!("call_{}", Uuid::new_v4().simple()),
            name: name.to_string(),
            arguments: serde_json::to_string(&arguments).ok()?,
        });
    }
    if calls.is_empty() {
        None
    } else {
        Some(calls)
    }
}

fn to_wire_message(message: &ChatMessage) -> WireMessage {
    let tool_calls = if message.tool_calls.is_empty() {
        None
    } else {
        Some(
            message
                .tool_calls
                .iter()
                .map(|tc| WireToolCall {
                    id: tc.id.clone(),
                    call_type: "function".to_string(),
                    function: WireFunction {
                        name: tc.name.clone(),
                        arguments: tc.arguments.clone(),
                    },
                })
                .collect(),
        )
    };

    let content = if message.images.is_empty() {
        // Some local servers reject null content with a 400; force "".
        WireContent::Text(message.content.clone().unwrap_or_default())
    } else {
        let mut parts = Vec::new();
        if let Some(text) = message.content.as_ref().filter(|t| !t.is_empty()) {
            parts.push(WirePart::Text { text: text.clone() });
        }
        for image in &message.images {
            parts.push(WirePart::ImageUrl {
                image_url: WireImageUrl { url: image.clone() },
            });
        }
        WireContent::Parts(parts)
    };

    WireMessage {
        role: message.role,
        content,
        tool_calls,
        tool_call_id: message.tool_call_id.clone(),
    }
}

// Wire types (request side serialized, response side deserialized)

#[derive(Debug, Serialize)]
struct WireRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<Value>,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: Role,
    content: WireContent,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
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
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image_url")]
    ImageUrl { image_url: WireImageUrl },
}

#[derive(Debug, Serialize)]
struct WireImageUrl {
    url: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type")]
    call_type: String,
    function: WireFunction,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Default, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: Delta,
}

#[derive(Debug, Default, Deserialize)]
struct Delta {
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_message_null_content_becomes_empty_string() {
        let msg = ChatMessage::assistant_tool_calls(vec![ToolCall {
            id: "call_1".to_string(),
            name: "search".to_string(),
            arguments: "{}".to_string(),
        }]);
        let wire = to_wire_message(&msg);
        let json = serde_json::to_value(&wire).unwrap();
        assert_eq!(json["content"], "");
        assert_eq!(json["tool_calls"][0]["function"]["name"], "search");
    }

    #[test]
    fn test_wire_message_images_become_parts() {
        let msg = ChatMessage::user("look at this")
            .with_images(vec!["data:image/png;base64,AAAA".to_string()]);
        let json = serde_json::to_value(to_wire_message(&msg)).unwrap();
        let parts = json["content"].as_array().unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0]["type"], "text");
        assert_eq!(parts[1]["type"], "image_url");
        assert_eq!(parts[1]["image_url"]["url"], "data:image/png;base64,AAAA");
    }

    #[test]
    fn test_extract_tool_uses_recipient_name_form() {
        let content = r#"I'll search for that.
{"tool_uses": [{"recipient_name": "functions.web_search", "parameters": {"query": "rust"}}]}"#;
        let calls = extract_embedded_tool_calls(content).unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "web_search");
        let args: Value = serde_json::from_str(&calls[0].arguments).unwrap();
        assert_eq!(args["query"], "rust");
    }

    #[test]
    fn test_extract_tool_uses_plain_name_form() {
        let content = r#"{"tool_uses": [{"name": "lookup", "arguments": {"id": 7}}]}"#;
        let calls = extract_embedded_tool_calls(content).unwrap();
        assert_eq!(calls[0].name, "lookup");
    }

    #[test]
    fn test_extract_tool_uses_malformed_leaves_content() {
        assert!(extract_embedded_tool_calls("just mentions \"tool_uses\" in prose").is_none());
        assert!(extract_embedded_tool_calls("{\"tool_uses\": [{\"broken\"").is_none());
        assert!(extract_embedded_tool_calls("no marker at all").is_none());
    }

    #[test]
    fn test_parse_event_line_delta() {
        let line = r#"data: {"choices":[{"delta":{"content":"Hi"}}]}"#;
        match parse_event_line(line) {
            EventLine::Delta(text) => assert_eq!(text, "Hi"),
            _ => panic!("expected delta"),
        }
    }

    #[test]
    fn test_parse_event_line_done_and_noise() {
        assert!(matches!(parse_event_line("data: [DONE]"), EventLine::Done));
        assert!(matches!(parse_event_line(""), EventLine::Skip));
        assert!(matches!(parse_event_line("event: ping"), EventLine::Skip));
        assert!(matches!(parse_event_line("data: not-json"), EventLine::Skip));
    }

    #[test]
    fn test_embedded_error_message_extraction() {
        let rest = r#"data: {"error":{"message":"context length exceeded"}}"#;
        assert_eq!(
            embedded_error_message(rest).as_deref(),
            Some("context length exceeded")
        );
        assert!(embedded_error_message("data: {\"ok\":true}").is_none());
    }
}

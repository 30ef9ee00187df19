// Gemini-style API adapter
//
// Messages become `contents` with user/model roles, the system message
// travels as `systemInstruction`, and auth is a query parameter rather than
// a header. Streaming is bare newline-delimited JSON: one object per line,
// with the array punctuation the backend wraps around lines tolerated and
// discarded.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::LlmError;
use crate::net::framing::LineBuffer;
use crate::net::Transport;

use super::types::{ChatRequest, ChatResponse, ModelCapabilities, ModelInfo, Role};
use super::{ModelProvider, TextStream};

const CHANNEL_CAPACITY: usize = 100;
const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";
const DEFAULT_MODEL: &str = "gemini-1.5-flash";

pub struct GeminiProvider {
    api_key: String,
    base_url: String,
    transport: Arc<Transport>,
}

impl GeminiProvider {
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

    fn build_request(&self, request: &ChatRequest) -> WireRequest {
        let contents = request
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| WireContent {
                role: if m.role == Role::Assistant {
                    "model".to_string()
                } else {
                    "user".to_string()
                },
                parts: vec![WirePart {
                    text: m.content.clone().unwrap_or_default(),
                }],
            })
            .collect();

        let system_instruction = request
            .messages
            .iter()
            .find(|m| m.role == Role::System)
            .and_then(|m| m.content.clone())
            .map(|text| WireSystemInstruction {
                parts: vec![WirePart { text }],
            });

        WireRequest {
            contents,
            system_instruction,
            generation_config: WireGenerationConfig {
                temperature: request.temperature,
            },
        }
    }

    fn model_for(&self, request: &ChatRequest) -> String {
        request
            .model
            .clone()
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| DEFAULT_MODEL.to_string())
    }
}

#[async_trait]
impl ModelProvider for GeminiProvider {
    fn id(&self) -> &str {
        "gemini"
    }

    fn display_name(&self) -> &str {
        "Google Gemini"
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, LlmError> {
        let url = format!("{}?key={}", self.base_url, self.api_key);
        let mut models = Vec::new();

        match self.transport.request(&url, "GET", &[], None).await {
            Ok(response) => {
                if let Ok(listing) = serde_json::from_value::<ModelListing>(response) {
                    for m in listing.models {
                        if !m
                            .supported_generation_methods
                            .iter()
                            .any(|method| method == "generateContent")
                        {
                            continue;
                        }
                        let id = m.name.strip_prefix("models/").unwrap_or(&m.name).to_string();
                        models.push(ModelInfo {
                            capabilities: Some(gemini_capabilities(&id)),
                            name: m.display_name.unwrap_or_else(|| id.clone()),
                            id,
                        });
                    }
                }
            }
            Err(e) => {
                tracing::warn!("failed to fetch Gemini models, using static list: {e}");
            }
        }

        if models.is_empty() {
            return Ok(static_models());
        }
        Ok(models)
    }

    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError> {
        let model = self.model_for(request);
        let url = format!(
            "{}/{}:generateContent?key={}",
            self.base_url, model, self.api_key
        );
        let body = serde_json::to_value(self.build_request(request))
            .map_err(|e| LlmError::Protocol(e.to_string()))?;
        let headers = vec![("Content-Type".to_string(), "application/json".to_string())];

        let response = self.transport.request(&url, "POST", &headers, Some(body)).await?;
        let parsed: GenerateResponse = serde_json::from_value(response)
            .map_err(|e| LlmError::Protocol(format!("unexpected response shape: {e}")))?;

        Ok(ChatResponse {
            content: parsed.first_text().unwrap_or_default(),
            tool_calls: Vec::new(),
        })
    }

    async fn stream(&self, request: &ChatRequest) -> Result<TextStream, LlmError> {
        let model = self.model_for(request);
        let url = format!(
            "{}/{}:streamGenerateContent?key={}",
            self.base_url, model, self.api_key
        );
        let body = serde_json::to_value(self.build_request(request))
            .map_err(|e| LlmError::Protocol(e.to_string()))?;
        let headers = vec![("Content-Type".to_string(), "application/json".to_string())];

        let mut raw = self
            .transport
            .stream(&url, "POST", &headers, Some(body), request.cancel.clone())
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
                    if let Some(text) = parse_json_line(&line) {
                        if tx.send(Ok(text)).await.is_err() {
                            return;
                        }
                    }
                }
            }
            if let Some(rest) = buf.finish() {
                if let Some(text) = parse_json_line(&rest) {
                    let _ = tx.send(Ok(text)).await;
                }
            }
        });
        Ok(rx)
    }
}

/// Parse one newline-delimited JSON line into its text delta.
///
/// The backend decorates lines with array punctuation (`[` before the first
/// object, `,` between objects, a closing `]` line) - strip it and parse
/// what remains as a single JSON object.
fn parse_json_line(line: &str) -> Option<String> {
    let mut trimmed = line.trim();
    trimmed = trimmed
        .strip_prefix('[')
        .or_else(|| trimmed.strip_prefix(','))
        .unwrap_or(trimmed)
        .trim();
    trimmed = trimmed.strip_suffix(',').unwrap_or(trimmed).trim();
    if trimmed.is_empty() || trimmed == "]" {
        return None;
    }
    match serde_json::from_str::<GenerateResponse>(trimmed) {
        Ok(chunk) => chunk.first_text().filter(|t| !t.is_empty()),
        Err(e) => {
            tracing::warn!("skipping malformed stream line: {e}");
            None
        }
    }
}

fn gemini_capabilities(id: &str) -> ModelCapabilities {
    ModelCapabilities {
        vision: id.contains("vision") || id.contains("1.5") || id.contains("2.0"),
        tools: true,
        reasoning: id.contains("pro") || id.contains("ultra"),
    }
}

fn static_models() -> Vec<ModelInfo> {
    [
        ("gemini-1.5-pro", "Gemini 1.5 Pro", true),
        ("gemini-1.5-flash", "Gemini 1.5 Flash", false),
        ("gemini-1.5-flash-8b", "Gemini 1.5 Flash-8B", false),
        ("gemini-2.0-flash-exp", "Gemini 2.0 Flash (Experimental)", false),
    ]
    .into_iter()
    .map(|(id, name, reasoning)| ModelInfo {
        id: id.to_string(),
        name: name.to_string(),
        capabilities: Some(ModelCapabilities {
            vision: true,
            tools: true,
            reasoning,
        }),
    })
    .collect()
}

// Wire types

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireRequest {
    contents: Vec<WireContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<WireSystemInstruction>,
    generation_config: WireGenerationConfig,
}

#[derive(Debug, Serialize)]
struct WireContent {
    role: String,
    parts: Vec<WirePart>,
}

#[derive(Debug, Serialize)]
struct WireSystemInstruction {
    parts: Vec<WirePart>,
}

#[derive(Debug, Serialize)]
struct WirePart {
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireGenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct ModelListing {
    #[serde(default)]
    models: Vec<ModelRow>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModelRow {
    name: String,
    display_name: Option<String>,
    #[serde(default)]
    supported_generation_methods: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

impl GenerateResponse {
    fn first_text(self) -> Option<String> {
        self.candidates
            .into_iter()
            .next()?
            .content?
            .parts
            .into_iter()
            .next()?
            .text
    }
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::types::ChatMessage;

    fn provider() -> GeminiProvider {
        GeminiProvider::new("test-key", Arc::new(Transport::new().unwrap()))
    }

    #[test]
    fn test_roles_mapped_to_user_and_model() {
        let request = ChatRequest::new(vec![
            ChatMessage::user("hi"),
            ChatMessage::assistant("hello"),
            ChatMessage::tool_result("call_1", "result"),
        ]);
        let wire = provider().build_request(&request);
        let roles: Vec<&str> = wire.contents.iter().map(|c| c.role.as_str()).collect();
        assert_eq!(roles, vec!["user", "model", "user"]);
    }

    #[test]
    fn test_system_message_becomes_instruction() {
        let request = ChatRequest::new(vec![
            ChatMessage::system("Be precise."),
            ChatMessage::user("hi"),
        ]);
        let wire = provider().build_request(&request);
        assert_eq!(wire.contents.len(), 1);
        let instruction = wire.system_instruction.unwrap();
        assert_eq!(instruction.parts[0].text, "Be precise.");
    }

    #[test]
    fn test_parse_json_line_plain_object() {
        let line = r#"{"candidates":[{"content":{"parts":[{"text":"Hey"}]}}]}"#;
        assert_eq!(parse_json_line(line).as_deref(), Some("Hey"));
    }

    #[test]
    fn test_parse_json_line_tolerates_array_punctuation() {
        let open = r#"[{"candidates":[{"content":{"parts":[{"text":"a"}]}}]}"#;
        let mid = r#",{"candidates":[{"content":{"parts":[{"text":"b"}]}}]}"#;
        assert_eq!(parse_json_line(open).as_deref(), Some("a"));
        assert_eq!(parse_json_line(mid).as_deref(), Some("b"));
        assert!(parse_json_line("]").is_none());
        assert!(parse_json_line("").is_none());
    }

    #[test]
    fn test_parse_json_line_malformed_skipped() {
        assert!(parse_json_line("{\"candidates\": [").is_none());
    }

    #[test]
    fn test_capabilities_by_family_markers() {
        assert!(gemini_capabilities("gemini-1.5-pro").reasoning);
        assert!(gemini_capabilities("gemini-1.5-pro").vision);
        assert!(!gemini_capabilities("gemini-1.0").vision);
    }
}

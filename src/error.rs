// Error taxonomy for the gateway, transport, and indexing layers.
//
// Configuration errors abort before any network call; API errors carry the
// provider-assigned status and message; protocol errors cover malformed
// stream payloads. Best-effort operations (unload/preload) return these too,
// but their callers log and ignore them.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LlmError {
    /// Missing or invalid configuration, detected before any request is sent.
    #[error("configuration error: {0}")]
    Config(String),

    /// No embedding model is configured and auto-detection found none.
    #[error("no embedding model selected and auto-detection found no local models")]
    NoEmbeddingModel,

    /// A scoped model id referenced a provider that is not registered.
    #[error("provider '{0}' not found or not configured")]
    ProviderNotFound(String),

    /// Non-2xx response; `message` is the human-readable text extracted from
    /// the error body (JSON `error.message` / `message`, else the raw bytes).
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    /// Connection-level failure: refused, reset, DNS, timeout.
    #[error("network error: {0}")]
    Network(String),

    /// Malformed wire payload that could not be skipped.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Provider-reported failure inside an otherwise-healthy stream (the
    /// HTTP exchange itself succeeded). Delivered after any fragments that
    /// preceded it.
    #[error("stream error: {0}")]
    Stream(String),

    /// The request's cancellation token was triggered.
    #[error("request cancelled")]
    Cancelled,
}

impl LlmError {
    /// Status code for API failures, `None` for every other variant.
    pub fn status(&self) -> Option<u16> {
        match self {
            LlmError::Api { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(e: reqwest::Error) -> Self {
        LlmError::Network(e.to_string())
    }
}

impl From<std::io::Error> for LlmError {
    fn from(e: std::io::Error) -> Self {
        LlmError::Network(e.to_string())
    }
}

/// Extract a human-readable message from an error response body.
///
/// Providers disagree on the shape: OpenAI-compatible backends nest it under
/// `error.message`, some local servers use a bare `message`, others return
/// plain text. Falls back to the raw body.
pub fn error_body_message(body: &str) -> String {
    if let Ok(json) = serde_json::from_str::<serde_json::Value>(body) {
        if let Some(msg) = json
            .pointer("/error/message")
            .or_else(|| json.pointer("/message"))
            .and_then(|v| v.as_str())
        {
            return msg.to_string();
        }
    }
    body.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_body_message_openai_shape() {
        let body = r#"{"error": {"message": "model not found", "type": "invalid_request_error"}}"#;
        assert_eq!(error_body_message(body), "model not found");
    }

    #[test]
    fn test_error_body_message_flat_shape() {
        let body = r#"{"message": "overloaded"}"#;
        assert_eq!(error_body_message(body), "overloaded");
    }

    #[test]
    fn test_error_body_message_plain_text() {
        assert_eq!(error_body_message("bad gateway"), "bad gateway");
    }

    #[test]
    fn test_api_error_status() {
        let err = LlmError::Api {
            status: 404,
            message: "not found".to_string(),
        };
        assert_eq!(err.status(), Some(404));
        assert_eq!(LlmError::Cancelled.status(), None);
    }
}

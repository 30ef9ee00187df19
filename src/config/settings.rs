// Configuration structs

use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

fn default_embed_delay_ms() -> u64 {
    300
}

fn default_max_chunk_chars() -> usize {
    1000
}

/// Everything the gateway and indexer need to run.
///
/// All fields are defaulted so a partial TOML file (or a settings form that
/// only filled in one API key) deserializes cleanly. Reconfiguration builds
/// a fresh provider set from the new values; it never mutates live adapters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceSettings {
    /// Base URL of the local OpenAI-compatible server, e.g.
    /// "http://localhost:11434/v1". Empty disables the local provider.
    #[serde(default)]
    pub model_url: String,

    /// API key sent to the local server (most accept any non-empty value).
    #[serde(default)]
    pub api_key: String,

    #[serde(default)]
    pub openai_api_key: String,

    #[serde(default)]
    pub anthropic_api_key: String,

    #[serde(default)]
    pub gemini_api_key: String,

    #[serde(default)]
    pub grok_api_key: String,

    #[serde(default)]
    pub openrouter_api_key: String,

    /// Default chat model for unscoped requests on the local provider.
    #[serde(default)]
    pub chat_model: String,

    /// Embedding model on the local provider; empty triggers auto-detection.
    #[serde(default)]
    pub embedding_model: String,

    /// Aggressive low-memory mode: unload the previously active local model
    /// before any switch, including chat → embedding.
    #[serde(default)]
    pub enable_smart_memory: bool,

    /// Unload the previous chat model when the user switches chat models.
    #[serde(default)]
    pub auto_unload_on_switch: bool,

    /// Master switch for the background sync pass.
    #[serde(default = "default_true")]
    pub enable_background_indexing: bool,

    /// Pause between chunk embedding requests. A rate limiter for small
    /// local servers, not a correctness requirement.
    #[serde(default = "default_embed_delay_ms")]
    pub embed_delay_ms: u64,

    /// Maximum chunk length in characters for the paragraph chunker.
    #[serde(default = "default_max_chunk_chars")]
    pub max_chunk_chars: usize,
}

impl Default for WorkspaceSettings {
    fn default() -> Self {
        Self {
            model_url: String::new(),
            api_key: String::new(),
            openai_api_key: String::new(),
            anthropic_api_key: String::new(),
            gemini_api_key: String::new(),
            grok_api_key: String::new(),
            openrouter_api_key: String::new(),
            chat_model: String::new(),
            embedding_model: String::new(),
            enable_smart_memory: false,
            auto_unload_on_switch: false,
            enable_background_indexing: true,
            embed_delay_ms: default_embed_delay_ms(),
            max_chunk_chars: default_max_chunk_chars(),
        }
    }
}

impl WorkspaceSettings {
    /// Root of the local backend with any `/v1` suffix removed — the base
    /// for the native management endpoints (`/api/generate`, `/api/ps`,
    /// `/api/embeddings`).
    pub fn local_root_url(&self) -> String {
        let base = if self.model_url.is_empty() {
            "http://localhost:11434"
        } else {
            &self.model_url
        };
        let trimmed = base.trim_end_matches('/');
        trimmed.strip_suffix("/v1").unwrap_or(trimmed).to_string()
    }
}

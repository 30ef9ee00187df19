// Multi-provider LLM support
//
// One trait over a closed set of backend adapters. Shared logic never
// branches on provider identifier strings - adding a backend means adding
// an implementation, not another special case.

use async_trait::async_trait;

use crate::error::LlmError;
use crate::net::FragmentStream;

pub mod anthropic;
pub mod gemini;
pub mod openai;
pub mod registry;
pub mod types;

pub use anthropic::AnthropicProvider;
pub use gemini::GeminiProvider;
pub use openai::OpenAiCompatProvider;
pub use registry::ProviderRegistry;
pub use types::{
    ChatMessage, ChatRequest, ChatResponse, ModelCapabilities, ModelInfo, Role, ToolCall,
};

/// A lazy sequence of canonical text fragments; concatenated, the fragments
/// equal the full response text. End-of-stream is channel close; an error is
/// delivered at most once, after every fragment that preceded it.
pub type TextStream = FragmentStream;

/// Trait implemented by every backend adapter.
///
/// Identity fields are fixed at construction; reconfiguration registers a
/// replacement instance rather than mutating a live one, so in-flight
/// requests keep the adapter they started with.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Stable identifier, e.g. "local", "openai", "anthropic".
    fn id(&self) -> &str;

    /// Human-readable name for UI display.
    fn display_name(&self) -> &str;

    /// Models this backend offers. Best-effort: adapters may fall back to a
    /// static list when the backend has no listing endpoint.
    async fn list_models(&self) -> Result<Vec<ModelInfo>, LlmError>;

    /// Send a conversation and wait for the complete response.
    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError>;

    /// Send a conversation and stream the response text incrementally.
    async fn stream(&self, request: &ChatRequest) -> Result<TextStream, LlmError>;
}

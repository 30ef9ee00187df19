// Vaultmind - grounded LLM core for a note-taking workspace
// Library exports

pub mod config;
pub mod error;
pub mod gateway;
pub mod index;
pub mod net;
pub mod providers;

pub use config::WorkspaceSettings;
pub use error::LlmError;
pub use gateway::{Gateway, ScopedModelInfo};
pub use index::{Document, Embedder, NoteChunk, NoteIndexer, VectorStore};
pub use providers::{ChatMessage, ChatRequest, ChatResponse, Role, ToolCall};

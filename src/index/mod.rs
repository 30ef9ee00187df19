// Corpus indexing and retrieval
//
// The vector store owns the chunk list and its persistence; the indexer
// only submits chunk generations through the store's API.

use async_trait::async_trait;

use crate::error::LlmError;

pub mod chunker;
pub mod indexer;
pub mod store;

pub use chunker::chunk_paragraphs;
pub use indexer::{Document, NoteIndexer};
pub use store::{NoteChunk, VectorStore};

/// Source of embedding vectors.
///
/// The gateway implements this against the local backend; tests substitute
/// a deterministic stub.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError>;
}

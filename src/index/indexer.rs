// Indexing pipeline
//
// Converts documents into embedded chunk generations. Documents arrive from
// an external watcher as {path, text, modified_at} tuples; the pipeline
// never reads files itself. One document's upsert is one atomic unit -
// callers must not assume atomicity across a whole sync pass.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::config::WorkspaceSettings;
use crate::index::chunker::chunk_paragraphs;
use crate::index::store::{NoteChunk, VectorStore};
use crate::index::Embedder;

/// A document snapshot handed in by the host's file layer.
#[derive(Debug, Clone)]
pub struct Document {
    pub path: String,
    pub text: String,
    /// Epoch milliseconds; the skip-check compares this against the store's
    /// stamp for the path.
    pub modified_at: i64,
}

pub struct NoteIndexer {
    embedder: Arc<dyn Embedder>,
    max_chunk_chars: usize,
    /// Pause between embedding requests so a small local server is not
    /// flooded. A rate limiter, not a correctness requirement.
    embed_delay: Duration,
    background_sync: bool,
}

impl NoteIndexer {
    pub fn new(embedder: Arc<dyn Embedder>, settings: &WorkspaceSettings) -> Self {
        Self {
            embedder,
            max_chunk_chars: settings.max_chunk_chars,
            embed_delay: Duration::from_millis(settings.embed_delay_ms),
            background_sync: settings.enable_background_indexing,
        }
    }

    /// Index one document, skipping it entirely when its modification time
    /// matches the store's stamp. Returns the number of chunks written
    /// (0 for a skip). Persistence is the caller's call - `sync_all` saves
    /// once per pass.
    pub async fn index_document(&self, store: &mut VectorStore, doc: &Document) -> Result<usize> {
        if store.modified_at(&doc.path) == Some(doc.modified_at) {
            return Ok(0);
        }
        self.embed_into(store, &doc.path, &doc.text, doc.modified_at)
            .await
    }

    /// Index raw text under a virtual path (content not backed by a file,
    /// e.g. an imported web page). The virtual path acts as the filter key.
    pub async fn index_text(
        &self,
        store: &mut VectorStore,
        virtual_path: &str,
        text: &str,
        modified_at: i64,
    ) -> Result<usize> {
        self.embed_into(store, virtual_path, text, modified_at).await
    }

    /// Drop a document's chunks and persist the store.
    pub fn remove_document(&self, store: &mut VectorStore, path: &str) -> Result<()> {
        store.delete_by_source(path);
        store.save()
    }

    /// Re-index every document whose modification time differs from the
    /// store's stamp. Saves once when anything changed. Returns how many
    /// documents were re-indexed; 0 immediately when background indexing is
    /// disabled.
    pub async fn sync_all(&self, store: &mut VectorStore, docs: &[Document]) -> Result<usize> {
        if !self.background_sync {
            tracing::debug!("background indexing disabled, skipping sync");
            return Ok(0);
        }
        let mut updated = 0;
        for doc in docs {
            if store.modified_at(&doc.path) != Some(doc.modified_at) {
                self.index_document(store, doc).await?;
                updated += 1;
            }
        }
        if updated > 0 {
            store.save()?;
            tracing::info!("sync updated {updated} documents");
        }
        Ok(updated)
    }

    /// Chunk, embed sequentially, and upsert one generation. A chunk whose
    /// embedding fails is logged and dropped; the rest of the document still
    /// goes in.
    async fn embed_into(
        &self,
        store: &mut VectorStore,
        path: &str,
        text: &str,
        modified_at: i64,
    ) -> Result<usize> {
        let chunks = chunk_paragraphs(text, self.max_chunk_chars);
        let mut generation = Vec::new();

        for (index, chunk_text) in chunks.iter().enumerate() {
            match self.embedder.embed(chunk_text).await {
                Ok(vector) => generation.push(NoteChunk {
                    id: format!("{path}#{index}"),
                    text: chunk_text.clone(),
                    vector,
                    source_path: path.to_string(),
                    modified_at,
                }),
                Err(e) => {
                    tracing::warn!("failed to embed chunk {index} of {path}: {e}");
                }
            }
            if !self.embed_delay.is_zero() && index + 1 < chunks.len() {
                tokio::time::sleep(self.embed_delay).await;
            }
        }

        let written = generation.len();
        if written > 0 {
            store.upsert(generation);
        }
        Ok(written)
    }
}

// Vector store
//
// A flat in-memory chunk list with whole-file JSON persistence. Re-indexing
// a document is atomic-by-replacement: upserting a generation first removes
// every chunk sharing a source path with the incoming ones. Good to a few
// tens of thousands of chunks, which covers a personal note corpus.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

const STORE_FILE: &str = "vector_store.json";

/// One embedded slice of a document.
///
/// Identity is derived, never assigned: `source_path + "#" + ordinal`.
/// Every chunk of a document carries the same `modified_at` stamp - it is
/// the cache-validity stamp for the whole document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoteChunk {
    pub id: String,
    pub text: String,
    pub vector: Vec<f32>,
    pub source_path: String,
    /// Document modification time, epoch milliseconds.
    pub modified_at: i64,
}

pub struct VectorStore {
    chunks: Vec<NoteChunk>,
    db_path: PathBuf,
}

impl VectorStore {
    /// A store persisted under the host application's data directory.
    pub fn new(data_dir: &Path) -> Self {
        Self {
            chunks: Vec::new(),
            db_path: data_dir.join(STORE_FILE),
        }
    }

    /// Load the persisted chunk set. A missing file means an empty store;
    /// an unreadable one is logged and treated the same rather than taking
    /// retrieval down with it.
    pub fn load(&mut self) -> Result<()> {
        if !self.db_path.exists() {
            tracing::debug!("vector store not found, starting fresh");
            self.chunks = Vec::new();
            return Ok(());
        }
        let content = fs::read_to_string(&self.db_path)
            .with_context(|| format!("failed to read vector store: {}", self.db_path.display()))?;
        match serde_json::from_str(&content) {
            Ok(chunks) => {
                self.chunks = chunks;
                tracing::debug!("vector store loaded {} chunks", self.chunks.len());
            }
            Err(e) => {
                tracing::warn!("failed to parse vector store, starting fresh: {e}");
                self.chunks = Vec::new();
            }
        }
        Ok(())
    }

    /// Serialize the full chunk set as one JSON document.
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.db_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string(&self.chunks)?;
        fs::write(&self.db_path, json)
            .with_context(|| format!("failed to write vector store: {}", self.db_path.display()))
    }

    /// Insert a chunk generation, replacing every existing chunk whose
    /// source path matches any incoming chunk's.
    pub fn upsert(&mut self, new_chunks: Vec<NoteChunk>) {
        let incoming_paths: std::collections::HashSet<&str> =
            new_chunks.iter().map(|c| c.source_path.as_str()).collect();
        self.chunks
            .retain(|c| !incoming_paths.contains(c.source_path.as_str()));
        self.chunks.extend(new_chunks);
    }

    /// Remove all chunks with exactly this source path. Returns how many
    /// were removed.
    pub fn delete_by_source(&mut self, path: &str) -> usize {
        let before = self.chunks.len();
        self.chunks.retain(|c| c.source_path != path);
        let removed = before - self.chunks.len();
        if removed > 0 {
            tracing::debug!("deleted {removed} chunks for {path}");
        }
        removed
    }

    /// The stamped modification time of any chunk belonging to `path`, or
    /// `None` if the document was never indexed.
    pub fn modified_at(&self, path: &str) -> Option<i64> {
        self.chunks
            .iter()
            .find(|c| c.source_path == path)
            .map(|c| c.modified_at)
    }

    /// Top-`k` chunks by cosine similarity to `vector`, optionally
    /// restricted to source paths starting with `path_prefix`. Ties keep
    /// input order (the sort is stable).
    pub fn query(&self, vector: &[f32], k: usize, path_prefix: Option<&str>) -> Vec<NoteChunk> {
        let mut scored: Vec<(f32, &NoteChunk)> = self
            .chunks
            .iter()
            .filter(|c| match path_prefix {
                Some(prefix) => c.source_path.starts_with(prefix),
                None => true,
            })
            .map(|c| (cosine_similarity(vector, &c.vector), c))
            .collect();

        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        scored.into_iter().map(|(_, c)| c.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

/// Cosine similarity, 0.0 for mismatched lengths or zero-magnitude inputs
/// so a degenerate vector can never rank above real matches as NaN would.
fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(path: &str, index: usize, vector: Vec<f32>) -> NoteChunk {
        NoteChunk {
            id: format!("{path}#{index}"),
            text: format!("chunk {index} of {path}"),
            vector,
            source_path: path.to_string(),
            modified_at: 1_700_000_000_000,
        }
    }

    #[test]
    fn test_upsert_replaces_whole_generation() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = VectorStore::new(dir.path());
        store.upsert(vec![
            chunk("notes/a.md", 0, vec![1.0, 0.0]),
            chunk("notes/a.md", 1, vec![0.0, 1.0]),
        ]);
        assert_eq!(store.len(), 2);

        // Second generation has fewer chunks; only it must remain.
        store.upsert(vec![chunk("notes/a.md", 0, vec![0.5, 0.5])]);
        assert_eq!(store.len(), 1);
        assert_eq!(store.query(&[1.0, 1.0], 10, None)[0].vector, vec![0.5, 0.5]);
    }

    #[test]
    fn test_upsert_leaves_other_paths_alone() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = VectorStore::new(dir.path());
        store.upsert(vec![chunk("notes/a.md", 0, vec![1.0])]);
        store.upsert(vec![chunk("notes/b.md", 0, vec![1.0])]);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_delete_by_source_is_exact() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = VectorStore::new(dir.path());
        store.upsert(vec![chunk("notes/a.md", 0, vec![1.0])]);
        store.upsert(vec![chunk("notes/a.md.bak", 0, vec![1.0])]);
        assert_eq!(store.delete_by_source("notes/a.md"), 1);
        assert_eq!(store.len(), 1);
        assert!(store.modified_at("notes/a.md").is_none());
        assert!(store.modified_at("notes/a.md.bak").is_some());
    }

    #[test]
    fn test_query_ranks_descending_and_caps_at_k() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = VectorStore::new(dir.path());
        store.upsert(vec![chunk("far.md", 0, vec![0.0, 1.0])]);
        store.upsert(vec![chunk("near.md", 0, vec![1.0, 0.05])]);
        store.upsert(vec![chunk("exact.md", 0, vec![1.0, 0.0])]);

        let results = store.query(&[1.0, 0.0], 2, None);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].source_path, "exact.md");
        assert_eq!(results[1].source_path, "near.md");
    }

    #[test]
    fn test_query_path_prefix_filter() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = VectorStore::new(dir.path());
        store.upsert(vec![chunk("projects/x/a.md", 0, vec![1.0, 0.0])]);
        store.upsert(vec![chunk("journal/b.md", 0, vec![1.0, 0.0])]);

        let results = store.query(&[1.0, 0.0], 10, Some("projects/"));
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].source_path, "projects/x/a.md");
    }

    #[test]
    fn test_query_ties_keep_input_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = VectorStore::new(dir.path());
        store.upsert(vec![chunk("first.md", 0, vec![1.0, 0.0])]);
        store.upsert(vec![chunk("second.md", 0, vec![2.0, 0.0])]); // same direction, same cosine

        let results = store.query(&[1.0, 0.0], 2, None);
        assert_eq!(results[0].source_path, "first.md");
        assert_eq!(results[1].source_path, "second.md");
    }

    #[test]
    fn test_zero_vector_scores_zero_not_nan() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn test_persistence_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = VectorStore::new(dir.path());
        store.upsert(vec![
            chunk("notes/a.md", 0, vec![0.1, 0.2, 0.3]),
            chunk("notes/b.md", 0, vec![0.4, 0.5, 0.6]),
        ]);
        store.save().unwrap();

        let mut reloaded = VectorStore::new(dir.path());
        reloaded.load().unwrap();
        assert_eq!(reloaded.len(), 2);
        assert_eq!(
            reloaded.query(&[0.1, 0.2, 0.3], 10, None),
            store.query(&[0.1, 0.2, 0.3], 10, None)
        );
        assert_eq!(reloaded.modified_at("notes/a.md"), Some(1_700_000_000_000));
    }

    #[test]
    fn test_load_missing_file_is_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = VectorStore::new(dir.path());
        store.load().unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_load_corrupt_file_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(STORE_FILE), "{not json").unwrap();
        let mut store = VectorStore::new(dir.path());
        store.load().unwrap();
        assert!(store.is_empty());
    }
}

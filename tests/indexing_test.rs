// End-to-end indexing: documents in, embeddings via the gateway against a
// mock local backend, chunks retrievable from a persisted store.

use std::sync::Arc;

use mockito::Matcher;
use serde_json::json;
use vaultmind::{Document, Embedder, Gateway, NoteIndexer, VectorStore, WorkspaceSettings};

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

#[tokio::test]
async fn test_index_and_query_through_gateway() {
    init_logging();
    let mut server = mockito::Server::new_async().await;
    let embed_mock = server
        .mock("POST", "/v1/embeddings")
        .match_body(Matcher::PartialJson(json!({"model": "nomic-embed-text"})))
        .with_body(r#"{"data": [{"embedding": [0.6, 0.8]}]}"#)
        .expect(2)
        .create_async()
        .await;

    let settings = WorkspaceSettings {
        model_url: format!("{}/v1", server.url()),
        embedding_model: "nomic-embed-text".to_string(),
        embed_delay_ms: 0,
        max_chunk_chars: 40,
        ..Default::default()
    };
    let gateway = Arc::new(Gateway::new(settings.clone()).unwrap());

    let data_dir = tempfile::tempdir().unwrap();
    let mut store = VectorStore::new(data_dir.path());
    store.load().unwrap();

    let indexer = NoteIndexer::new(gateway.clone() as Arc<dyn Embedder>, &settings);
    let doc = Document {
        path: "notes/retrieval.md".to_string(),
        text: format!("{}\n\n{}", "alpha ".repeat(6), "beta ".repeat(6)),
        modified_at: 1_700_000_000_000,
    };

    let written = indexer.index_document(&mut store, &doc).await.unwrap();
    assert_eq!(written, 2);
    embed_mock.assert_async().await;

    // Query and persist round-trip.
    let results = store.query(&[0.6, 0.8], 1, Some("notes/"));
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].source_path, "notes/retrieval.md");

    store.save().unwrap();
    let mut reloaded = VectorStore::new(data_dir.path());
    reloaded.load().unwrap();
    assert_eq!(reloaded.len(), 2);

    // Unchanged mtime: the second pass issues no embedding calls (the mock
    // would fail its expect(2) otherwise).
    let skipped = indexer.index_document(&mut store, &doc).await.unwrap();
    assert_eq!(skipped, 0);
}

// Streaming behavior across adapters and framings
//
// Runs against a local mock server over plain http, which routes every
// request through the direct-socket transport path - so these tests cover
// the hand-written HTTP/1.1 exchange, the line re-framing, and the adapter
// parsing together.

use std::io::Write;
use std::sync::Arc;

use mockito::Matcher;
use tokio_util::sync::CancellationToken;
use vaultmind::net::Transport;
use vaultmind::providers::{
    AnthropicProvider, ChatMessage, ChatRequest, GeminiProvider, ModelProvider,
    OpenAiCompatProvider,
};
use vaultmind::LlmError;

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn openai_provider(server: &mockito::Server) -> OpenAiCompatProvider {
    OpenAiCompatProvider::new(
        "local",
        "Local LLM",
        "test-key",
        server.url(),
        Arc::new(Transport::new().unwrap()),
    )
}

fn request(model: &str) -> ChatRequest {
    ChatRequest::new(vec![ChatMessage::user("hi")]).with_model(model)
}

async fn collect(mut stream: vaultmind::providers::TextStream) -> (String, Option<LlmError>) {
    let mut text = String::new();
    let mut error = None;
    while let Some(item) = stream.recv().await {
        match item {
            Ok(fragment) => text.push_str(&fragment),
            Err(e) => {
                error = Some(e);
                break;
            }
        }
    }
    (text, error)
}

#[tokio::test]
async fn test_event_line_split_across_fragments_reassembles() {
    init_logging();
    let mut server = mockito::Server::new_async().await;
    // The event line is cut mid-JSON across two transfer chunks.
    let mock = server
        .mock("POST", "/chat/completions")
        .with_chunked_body(|w: &mut dyn Write| {
            w.write_all(b"data: {\"choices\":[{\"delta\":{\"content\":\"Hel")?;
            w.write_all(b"lo\"}}]}\n\ndata: [DONE]\n")
        })
        .create_async()
        .await;

    let provider = openai_provider(&server);
    let stream = provider.stream(&request("m")).await.unwrap();
    let (text, error) = collect(stream).await;

    assert_eq!(text, "Hello");
    assert!(error.is_none());
    mock.assert_async().await;
}

#[tokio::test]
async fn test_split_and_unsplit_delivery_agree() {
    init_logging();
    let body = "data: {\"choices\":[{\"delta\":{\"content\":\"one \"}}]}\n\
                data: {\"choices\":[{\"delta\":{\"content\":\"two\"}}]}\n\
                data: [DONE]\n";

    // Unsplit: one body.
    let mut server_a = mockito::Server::new_async().await;
    server_a
        .mock("POST", "/chat/completions")
        .with_body(body)
        .create_async()
        .await;
    let (unsplit, _) = collect(
        openai_provider(&server_a)
            .stream(&request("m"))
            .await
            .unwrap(),
    )
    .await;

    // Split: the identical bytes cut at an awkward boundary.
    let mut server_b = mockito::Server::new_async().await;
    let (head, tail) = body.split_at(37);
    let head = head.to_string();
    let tail = tail.to_string();
    server_b
        .mock("POST", "/chat/completions")
        .with_chunked_body(move |w: &mut dyn Write| {
            w.write_all(head.as_bytes())?;
            w.write_all(tail.as_bytes())
        })
        .create_async()
        .await;
    let (split, _) = collect(
        openai_provider(&server_b)
            .stream(&request("m"))
            .await
            .unwrap(),
    )
    .await;

    assert_eq!(unsplit, "one two");
    assert_eq!(split, unsplit);
}

#[tokio::test]
async fn test_malformed_line_skipped_stream_continues() {
    init_logging();
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/chat/completions")
        .with_body(
            "data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n\
             data: {this is not json}\n\
             data: {\"choices\":[{\"delta\":{\"content\":\"b\"}}]}\n\
             data: [DONE]\n",
        )
        .create_async()
        .await;

    let (text, error) = collect(
        openai_provider(&server)
            .stream(&request("m"))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(text, "ab");
    assert!(error.is_none());
}

#[tokio::test]
async fn test_http_error_status_fails_before_any_fragment() {
    init_logging();
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/chat/completions")
        .with_status(500)
        .with_body(r#"{"error":{"message":"model exploded"}}"#)
        .create_async()
        .await;

    let result = openai_provider(&server).stream(&request("m")).await;
    match result {
        Err(LlmError::Api { status, message }) => {
            assert_eq!(status, 500);
            assert_eq!(message, "model exploded");
        }
        other => panic!("expected Api error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_pre_cancelled_token_yields_no_fragments() {
    init_logging();
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/chat/completions")
        .with_body("data: {\"choices\":[{\"delta\":{\"content\":\"never\"}}]}\n")
        .create_async()
        .await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let req = request("m").with_cancel(cancel);
    match openai_provider(&server).stream(&req).await {
        Err(LlmError::Cancelled) => {}
        other => panic!("expected Cancelled, got {other:?}"),
    }
}

#[tokio::test]
async fn test_anthropic_error_event_surfaces_after_partial_output() {
    init_logging();
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/messages")
        .with_body(
            "event: content_block_delta\n\
             data: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"partial \"}}\n\
             data: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"answer\"}}\n\
             data: {\"type\":\"error\",\"error\":{\"message\":\"overloaded\"}}\n",
        )
        .create_async()
        .await;

    let provider = AnthropicProvider::new("test-key", Arc::new(Transport::new().unwrap()))
        .with_base_url(server.url());
    let stream = provider.stream(&request("claude-3-5-sonnet-20240620")).await.unwrap();
    let (text, error) = collect(stream).await;

    // Prior output preserved, failure reported alongside it.
    assert_eq!(text, "partial answer");
    let error = error.expect("error event must surface");
    assert!(error.to_string().contains("overloaded"));
}

#[tokio::test]
async fn test_anthropic_split_error_payload_flushed_at_stream_end() {
    init_logging();
    let mut server = mockito::Server::new_async().await;
    // The error payload has no trailing newline - only the final buffer
    // flush can catch it.
    server
        .mock("POST", "/messages")
        .with_chunked_body(|w: &mut dyn Write| {
            w.write_all(
                b"data: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"hi\"}}\n",
            )?;
            w.write_all(b"data: {\"type\":\"error\",\"error\":{\"mess")?;
            w.write_all(b"age\":\"stream died\"}}")
        })
        .create_async()
        .await;

    let provider = AnthropicProvider::new("test-key", Arc::new(Transport::new().unwrap()))
        .with_base_url(server.url());
    let stream = provider.stream(&request("claude-3-5-sonnet-20240620")).await.unwrap();
    let (text, error) = collect(stream).await;

    assert_eq!(text, "hi");
    assert!(error.expect("flushed error must surface").to_string().contains("stream died"));
}

#[tokio::test]
async fn test_gemini_newline_delimited_json_with_array_punctuation() {
    init_logging();
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/models/gemini-1.5-flash:streamGenerateContent")
        .match_query(Matcher::Any)
        .with_body(
            "[{\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"Hel\"}]}}]}\n\
             ,{\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"lo\"}]}}]}\n\
             ]\n",
        )
        .create_async()
        .await;

    let provider = GeminiProvider::new("test-key", Arc::new(Transport::new().unwrap()))
        .with_base_url(format!("{}/models", server.url()));
    let stream = provider.stream(&request("gemini-1.5-flash")).await.unwrap();
    let (text, error) = collect(stream).await;

    assert_eq!(text, "Hello");
    assert!(error.is_none());
}

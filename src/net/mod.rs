// Transport layer
//
// One request/stream contract over two execution paths: plain-http URLs go
// through the direct socket path (local backends, first-fragment latency),
// everything else through the shared reqwest client. Callers cannot tell
// which ran - both validate the status line before returning, both deliver
// fragments in arrival order over the same channel type, and both stop
// promptly on cancellation.

pub mod framing;
pub mod socket;

use std::time::Duration;

use futures::StreamExt;
use reqwest::Client;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{error_body_message, LlmError};
use framing::Utf8Carry;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const CHANNEL_CAPACITY: usize = 100;

/// A lazy, finite, non-restartable sequence of raw text fragments.
pub type FragmentStream = mpsc::Receiver<Result<String, LlmError>>;

pub struct Transport {
    client: Client,
}

impl Transport {
    pub fn new() -> Result<Self, LlmError> {
        // No total-request timeout: it would cut off long streams. Connect
        // timeout only; reads are bounded by cancellation.
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| LlmError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }

    /// Perform a request and parse the response as JSON.
    ///
    /// Status >= 400 is a hard failure carrying the message extracted from
    /// the error body.
    pub async fn request(
        &self,
        url: &str,
        method: &str,
        headers: &[(String, String)],
        body: Option<Value>,
    ) -> Result<Value, LlmError> {
        let parsed = parse_url(url)?;
        if parsed.scheme() == "http" {
            // Socket path: stream the body and reassemble.
            let body_text = body.map(|b| b.to_string());
            let mut rx =
                socket::stream_http(&parsed, method, headers, body_text, CancellationToken::new())
                    .await?;
            let mut text = String::new();
            while let Some(fragment) = rx.recv().await {
                text.push_str(&fragment?);
            }
            return serde_json::from_str(&text)
                .map_err(|e| LlmError::Protocol(format!("invalid JSON response: {e}")));
        }

        let mut request = self.client.request(parse_method(method)?, parsed);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(b) = body {
            request = request.json(&b);
        }
        let response = request.send().await?;
        let status = response.status().as_u16();
        let text = response.text().await.unwrap_or_default();
        if status >= 400 {
            return Err(LlmError::Api {
                status,
                message: error_body_message(&text),
            });
        }
        serde_json::from_str(&text)
            .map_err(|e| LlmError::Protocol(format!("invalid JSON response: {e}")))
    }

    /// Perform a request and deliver the response body incrementally.
    ///
    /// The returned receiver yields fragments in arrival order; end-of-stream
    /// is channel close, an error is delivered at most once after all
    /// fragments that preceded it. After cancellation no further fragments
    /// are yielded.
    pub async fn stream(
        &self,
        url: &str,
        method: &str,
        headers: &[(String, String)],
        body: Option<Value>,
        cancel: CancellationToken,
    ) -> Result<FragmentStream, LlmError> {
        let parsed = parse_url(url)?;
        if parsed.scheme() == "http" {
            let body_text = body.map(|b| b.to_string());
            return socket::stream_http(&parsed, method, headers, body_text, cancel).await;
        }

        let mut request = self.client.request(parse_method(method)?, parsed);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(b) = body {
            request = request.json(&b);
        }

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(LlmError::Cancelled),
            r = request.send() => r?,
        };
        let status = response.status().as_u16();
        if status >= 400 {
            let text = response.text().await.unwrap_or_default();
            return Err(LlmError::Api {
                status,
                message: error_body_message(&text),
            });
        }

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut carry = Utf8Carry::default();
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        tracing::debug!("stream cancelled");
                        break;
                    }
                    next = stream.next() => match next {
                        Some(Ok(bytes)) => {
                            let text = carry.push(&bytes);
                            if !text.is_empty() && tx.send(Ok(text)).await.is_err() {
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            let _ = tx.send(Err(e.into())).await;
                            break;
                        }
                        None => break,
                    }
                }
            }
        });
        Ok(rx)
    }
}

fn parse_url(url: &str) -> Result<reqwest::Url, LlmError> {
    reqwest::Url::parse(url).map_err(|e| LlmError::Config(format!("invalid URL '{url}': {e}")))
}

fn parse_method(method: &str) -> Result<reqwest::Method, LlmError> {
    method
        .parse()
        .map_err(|_| LlmError::Config(format!("invalid HTTP method: {method}")))
}

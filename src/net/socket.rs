// Direct-socket HTTP path for plain-http backends.
//
// Local servers are reached over loopback without TLS, so a hand-written
// HTTP/1.1 exchange on a TcpStream lets body fragments reach the consumer
// the moment they arrive instead of after the whole response is buffered.
// The response head is parsed before anything is handed back: a >=400 status
// drains the error body and fails the call, otherwise a spawned task pumps
// body fragments into a bounded channel until end-of-stream, error, or
// cancellation.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{error_body_message, LlmError};
use crate::net::framing::Utf8Carry;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const READ_CHUNK_BYTES: usize = 8192;
const CHANNEL_CAPACITY: usize = 100;

/// How the response body is delimited.
#[derive(Debug, Clone, Copy, PartialEq)]
enum BodyFraming {
    ContentLength(usize),
    Chunked,
    /// Neither header present: read until the server closes the connection.
    UntilClose,
}

struct ResponseHead {
    status: u16,
    framing: BodyFraming,
}

/// Issue a request over a raw TCP socket and stream the body incrementally.
///
/// Returns after the status line and headers are parsed, so callers see
/// HTTP failures as an `Err` before any fragment, exactly like the client
/// fallback path.
pub async fn stream_http(
    url: &reqwest::Url,
    method: &str,
    headers: &[(String, String)],
    body: Option<String>,
    cancel: CancellationToken,
) -> Result<mpsc::Receiver<Result<String, LlmError>>, LlmError> {
    let host = url
        .host_str()
        .ok_or_else(|| LlmError::Config(format!("URL has no host: {url}")))?
        .to_string();
    let port = url.port_or_known_default().unwrap_or(80);

    let connect = TcpStream::connect((host.as_str(), port));
    let stream = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(LlmError::Cancelled),
        conn = tokio::time::timeout(CONNECT_TIMEOUT, connect) => match conn {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => return Err(LlmError::Network(format!("connect {host}:{port}: {e}"))),
            Err(_) => return Err(LlmError::Network(format!("connect {host}:{port}: timed out"))),
        },
    };

    let host_header = match url.port() {
        Some(p) => format!("{host}:{p}"),
        None => host.clone(),
    };
    let mut reader = BufReader::new(stream);
    write_request(reader.get_mut(), url, method, &host_header, headers, body).await?;

    let head = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(LlmError::Cancelled),
        head = read_response_head(&mut reader) => head?,
    };

    if head.status >= 400 {
        let error_body = drain_body(&mut reader, head.framing).await.unwrap_or_default();
        return Err(LlmError::Api {
            status: head.status,
            message: error_body_message(&error_body),
        });
    }

    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    tokio::spawn(async move {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!("socket stream cancelled");
                Ok(())
            }
            r = pump_body(&mut reader, head.framing, &tx) => r,
        };
        if let Err(e) = result {
            // The receiver may already be gone; that just ends the stream.
            let _ = tx.send(Err(e)).await;
        }
        // Dropping reader closes the socket on every exit path.
    });

    Ok(rx)
}

async fn write_request(
    stream: &mut TcpStream,
    url: &reqwest::Url,
    method: &str,
    host: &str,
    headers: &[(String, String)],
    body: Option<String>,
) -> Result<(), LlmError> {
    let mut target = url.path().to_string();
    if let Some(query) = url.query() {
        target.push('?');
        target.push_str(query);
    }

    let mut head = format!("{method} {target} HTTP/1.1\r\n");
    head.push_str(&format!("Host: {host}\r\n"));
    head.push_str("Connection: close\r\n");
    head.push_str("Accept-Encoding: identity\r\n");
    for (name, value) in headers {
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    if let Some(ref b) = body {
        head.push_str(&format!("Content-Length: {}\r\n", b.len()));
    }
    head.push_str("\r\n");

    stream.write_all(head.as_bytes()).await?;
    if let Some(b) = body {
        stream.write_all(b.as_bytes()).await?;
    }
    stream.flush().await?;
    Ok(())
}

async fn read_response_head(
    reader: &mut BufReader<TcpStream>,
) -> Result<ResponseHead, LlmError> {
    let mut status_line = String::new();
    reader.read_line(&mut status_line).await?;
    // "HTTP/1.1 200 OK"
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| LlmError::Protocol(format!("bad status line: {}", status_line.trim())))?;

    let mut framing = BodyFraming::UntilClose;
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        let line = line.trim();
        if n == 0 || line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            let value = value.trim();
            match name.trim().to_ascii_lowercase().as_str() {
                "transfer-encoding" if value.eq_ignore_ascii_case("chunked") => {
                    framing = BodyFraming::Chunked;
                }
                "content-length" => {
                    if let Ok(len) = value.parse::<usize>() {
                        if framing == BodyFraming::UntilClose {
                            framing = BodyFraming::ContentLength(len);
                        }
                    }
                }
                _ => {}
            }
        }
    }

    Ok(ResponseHead { status, framing })
}

/// Read the whole body into one string (used for error responses only).
async fn drain_body(
    reader: &mut BufReader<TcpStream>,
    framing: BodyFraming,
) -> Result<String, LlmError> {
    let (tx, mut rx) = mpsc::channel(CHANNEL_CAPACITY);
    let pump = async {
        let result = pump_body(reader, framing, &tx).await;
        drop(tx);
        result
    };
    let collect = async {
        let mut body = String::new();
        while let Some(fragment) = rx.recv().await {
            if let Ok(s) = fragment {
                body.push_str(&s);
            }
        }
        body
    };
    let (result, body) = tokio::join!(pump, collect);
    result?;
    Ok(body)
}

/// Deliver body fragments to `tx` in arrival order until the body ends.
async fn pump_body(
    reader: &mut BufReader<TcpStream>,
    framing: BodyFraming,
    tx: &mpsc::Sender<Result<String, LlmError>>,
) -> Result<(), LlmError> {
    let mut carry = Utf8Carry::default();
    match framing {
        BodyFraming::ContentLength(total) => {
            let mut remaining = total;
            let mut buf = [0u8; READ_CHUNK_BYTES];
            while remaining > 0 {
                let want = remaining.min(READ_CHUNK_BYTES);
                let n = reader.read(&mut buf[..want]).await?;
                if n == 0 {
                    break; // server closed early; deliver what we have
                }
                remaining -= n;
                if !send_text(tx, &mut carry, &buf[..n]).await {
                    return Ok(());
                }
            }
        }
        BodyFraming::Chunked => {
            loop {
                let mut size_line = String::new();
                if reader.read_line(&mut size_line).await? == 0 {
                    break;
                }
                let size_str = size_line.trim();
                if size_str.is_empty() {
                    continue; // CRLF between chunks
                }
                // Chunk extensions after ';' are ignored.
                let size = usize::from_str_radix(
                    size_str.split(';').next().unwrap_or(""),
                    16,
                )
                .map_err(|_| LlmError::Protocol(format!("bad chunk size: {size_str}")))?;
                if size == 0 {
                    // Trailer section: read until the blank line.
                    loop {
                        let mut trailer = String::new();
                        let n = reader.read_line(&mut trailer).await?;
                        if n == 0 || trailer.trim().is_empty() {
                            break;
                        }
                    }
                    break;
                }
                let mut remaining = size;
                let mut buf = [0u8; READ_CHUNK_BYTES];
                while remaining > 0 {
                    let want = remaining.min(READ_CHUNK_BYTES);
                    let n = reader.read(&mut buf[..want]).await?;
                    if n == 0 {
                        return Err(LlmError::Network("connection closed mid-chunk".to_string()));
                    }
                    remaining -= n;
                    if !send_text(tx, &mut carry, &buf[..n]).await {
                        return Ok(());
                    }
                }
            }
        }
        BodyFraming::UntilClose => {
            let mut buf = [0u8; READ_CHUNK_BYTES];
            loop {
                let n = reader.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                if !send_text(tx, &mut carry, &buf[..n]).await {
                    return Ok(());
                }
            }
        }
    }
    Ok(())
}

/// Returns false when the consumer has gone away.
async fn send_text(
    tx: &mpsc::Sender<Result<String, LlmError>>,
    carry: &mut Utf8Carry,
    bytes: &[u8],
) -> bool {
    let text = carry.push(bytes);
    if text.is_empty() {
        return true;
    }
    tx.send(Ok(text)).await.is_ok()
}

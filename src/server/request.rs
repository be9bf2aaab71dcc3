use std::time::Duration;

use axum::http::{Request, Version};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::sleep;

use crate::inbounds::HandshakeError;

/// Largest request head accepted on the stream path.
pub const MAX_HEAD_LEN: usize = 8 * 1024;

/// Most headers accepted on the stream path.
pub const MAX_HEADERS: usize = 64;

const PEEK_RETRY: Duration = Duration::from_millis(5);

/// Where an accepted socket goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Request line names the stream path: take the socket over
    Stream,
    /// Anything else: serve it through the router
    Http,
    /// Peer closed before sending a request line
    Gone,
}

/// Looks at the request line without consuming it.
///
/// Waits for as long as the peer takes; callers bound it with a timeout.
///
/// # Arguments
/// * `socket` - Freshly accepted socket
/// * `stream_path` - Path served by the event stream
pub async fn sniff(socket: &TcpStream, stream_path: &str) -> Route {
    let mut buf = vec![0u8; MAX_HEAD_LEN];

    loop {
        let peeked = match socket.peek(&mut buf).await {
            Ok(0) | Err(_) => return Route::Gone,
            Ok(peeked) => peeked,
        };

        if let Some(end) = buf[..peeked].iter().position(|byte| *byte == b'\n') {
            return match request_path(&buf[..end]) {
                Some(path) if path == stream_path => Route::Stream,
                _ => Route::Http,
            };
        }
        // Let the router reject oversized request lines.
        if peeked == buf.len() {
            return Route::Http;
        }
        sleep(PEEK_RETRY).await;
    }
}

/// Path of a request line such as `GET /subscribe?channels=a HTTP/1.1`.
pub fn request_path(line: &[u8]) -> Option<&str> {
    let line = std::str::from_utf8(line).ok()?;
    let mut parts = line.split_whitespace();
    let _method = parts.next()?;
    let target = parts.next()?;
    let version = parts.next()?;
    if !version.starts_with("HTTP/") {
        return None;
    }
    target.split('?').next()
}

/// Reads and parses a request head (request line and headers).
///
/// # Errors
/// `HandshakeError::MalformedRequest` when the head is larger than
/// `MAX_HEAD_LEN`, truncated, or not valid HTTP/1.x
pub async fn read_head<R>(reader: &mut R) -> Result<Request<()>, HandshakeError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; MAX_HEAD_LEN];
    let mut filled = 0;

    loop {
        if filled == buf.len() {
            return Err(HandshakeError::MalformedRequest(
                "request head is too large".to_owned(),
            ));
        }

        let read = reader
            .read(&mut buf[filled..])
            .await
            .map_err(|err| HandshakeError::MalformedRequest(err.to_string()))?;
        if read == 0 {
            return Err(HandshakeError::MalformedRequest(
                "request head is truncated".to_owned(),
            ));
        }
        filled += read;

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut parsed = httparse::Request::new(&mut headers);
        match parsed.parse(&buf[..filled]) {
            Ok(httparse::Status::Complete(_)) => return build_request(&parsed),
            Ok(httparse::Status::Partial) => continue,
            Err(err) => return Err(HandshakeError::MalformedRequest(err.to_string())),
        }
    }
}

fn build_request(parsed: &httparse::Request<'_, '_>) -> Result<Request<()>, HandshakeError> {
    let version = match parsed.version {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    };
    let mut builder = Request::builder()
        .method(parsed.method.unwrap_or_default())
        .uri(parsed.path.unwrap_or_default())
        .version(version);
    for header in parsed.headers.iter() {
        builder = builder.header(header.name, header.value);
    }

    builder
        .body(())
        .map_err(|err| HandshakeError::MalformedRequest(err.to_string()))
}

/// Answers a request on a raw socket with a 500 and a text body.
pub async fn write_server_error<W>(writer: &mut W, message: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let response = format!(
        "HTTP/1.1 500 Internal Server Error\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        message.len(),
        message
    );
    writer.write_all(response.as_bytes()).await?;
    writer.flush().await?;
    writer.shutdown().await
}

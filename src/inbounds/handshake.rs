//--------------------------------------------------------------------------------------------------
// STRUCTS & ENUMS
//--------------------------------------------------------------------------------------------------
// | Name             | Description                                       | Key Methods          |
// |------------------|---------------------------------------------------|----------------------|
// | HandshakeOptions | Retry directive, CORS and old browser padding     | preamble             |
// | Handshake        | Turns a hijacked socket into a registered client  | accept               |
// | HandshakeError   | Malformed request, preamble I/O, registry stopped |                      |
//--------------------------------------------------------------------------------------------------

use std::io;
use std::sync::Arc;
use std::time::Duration;

use axum::http::{Request, header};
use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::OwnedSemaphorePermit;
use tracing::debug;

use crate::domain::services::broadcast::{Broadcaster, RegistryError, Registration};

use super::channels::ChannelResolver;

/// Body of the 500 answered when a stream request cannot take over its socket.
pub const HIJACKING_ERROR: &str = "webserver doesn't support hijacking";

/// Spaces in the comment line written for old browsers, which only start
/// dispatching events once they have buffered a minimum prefix.
pub const PADDING_LEN: usize = 2048;

pub const DEFAULT_RETRY: Duration = Duration::from_millis(2000);

/// Errors raised while upgrading a request to an event stream
#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    #[error("Failed to write stream preamble: {0}")]
    Io(#[from] io::Error),

    #[error("Could not register client: {0}")]
    Registry(#[from] RegistryError),
}

/// Type alias for Result with HandshakeError
pub type HandshakeResult<T> = Result<T, HandshakeError>;

/// Options that shape the stream preamble
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeOptions {
    /// Reconnection delay advertised to clients; `None` omits the directive
    pub retry: Option<Duration>,
    /// Echo the request's origin and allow credentials
    pub cors: bool,
    /// Write the padding comment line
    pub old_browser_support: bool,
}

impl Default for HandshakeOptions {
    fn default() -> Self {
        Self {
            retry: Some(DEFAULT_RETRY),
            cors: true,
            old_browser_support: true,
        }
    }
}

impl HandshakeOptions {
    /// Builds the bytes written on a hijacked socket before any event.
    ///
    /// # Arguments
    /// * `origin` - Value of the request's `Origin` header, if any
    ///
    /// # Returns
    /// The status line and headers, then the optional padding comment and
    /// the optional `retry:` directive
    pub fn preamble(&self, origin: Option<&str>) -> Bytes {
        let mut out = BytesMut::with_capacity(PADDING_LEN + 256);

        out.put_slice(b"HTTP/1.1 200 OK\r\n");
        out.put_slice(b"Content-Type: text/event-stream\r\n");
        out.put_slice(b"Cache-Control: no-cache\r\n");
        out.put_slice(b"Connection: keep-alive\r\n");

        if let (true, Some(origin)) = (self.cors, origin) {
            out.put_slice(b"Access-Control-Allow-Credentials: true\r\n");
            out.put_slice(b"Access-Control-Allow-Origin: ");
            out.put_slice(origin.as_bytes());
            out.put_slice(b"\r\n");
        }
        out.put_slice(b"\r\n");

        if self.old_browser_support {
            out.put_u8(b':');
            out.put_bytes(b' ', PADDING_LEN);
            out.put_u8(b'\n');
        }

        if let Some(retry) = self.retry.filter(|retry| !retry.is_zero()) {
            out.put_slice(format!("retry: {}\n\n", retry.as_millis()).as_bytes());
        }

        out.freeze()
    }
}

/// Turns a socket taken out of the request/response cycle into a client.
#[derive(Clone)]
pub struct Handshake {
    options: HandshakeOptions,
    resolver: Arc<dyn ChannelResolver>,
    broadcaster: Broadcaster,
}

impl Handshake {
    pub fn new(
        options: HandshakeOptions,
        resolver: Arc<dyn ChannelResolver>,
        broadcaster: Broadcaster,
    ) -> Self {
        Self {
            options,
            resolver,
            broadcaster,
        }
    }

    pub fn options(&self) -> &HandshakeOptions {
        &self.options
    }

    /// Writes the preamble, resolves the channels and registers the client.
    ///
    /// Nothing is registered unless the whole preamble was written.
    ///
    /// # Arguments
    /// * `request` - The parsed request head
    /// * `stream` - The hijacked socket; owned by the client's connection from now on
    /// * `permit` - Connection-limit permit kept alive with the client
    ///
    /// # Returns
    /// The channels the client was registered with
    pub async fn accept<S>(
        &self,
        request: &Request<()>,
        mut stream: S,
        permit: Option<OwnedSemaphorePermit>,
    ) -> HandshakeResult<Vec<String>>
    where
        S: AsyncWrite + Send + Unpin + 'static,
    {
        let origin = request
            .headers()
            .get(header::ORIGIN)
            .and_then(|value| value.to_str().ok());

        let preamble = self.options.preamble(origin);
        stream.write_all(&preamble).await?;
        stream.flush().await?;

        let channels = self.resolver.resolve(request);
        debug!(?channels, "stream preamble written");

        self.broadcaster
            .add(Registration::new(channels.clone(), Box::new(stream)).with_permit(permit))
            .await?;

        Ok(channels)
    }
}

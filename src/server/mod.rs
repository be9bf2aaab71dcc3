//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// TCP front door. Each accepted socket's request line is peeked at: requests for the stream path
// keep their raw socket and go through the streaming handshake, everything else is served by the
// Axum router over hyper.
//
// | Component      | Description                                                     |
// |----------------|-----------------------------------------------------------------|
// | ServerConfig   | Bind address, stream path, connection limit                     |
// | Server         | Accept loop with graceful stop                                  |
// | request        | Request line sniffing, head parsing, raw error responses        |
//--------------------------------------------------------------------------------------------------

pub mod request;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tower::ServiceExt;
use tracing::{debug, error, info, warn};

use crate::api;
use crate::inbounds::{Handshake, HandshakeError};
use crate::shutdown::ShutdownSignal;

use request::{Route, read_head, sniff, write_server_error};

pub const DEFAULT_STREAM_PATH: &str = "/subscribe";

/// Server configuration options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,

    /// Path of the event stream endpoint
    pub stream_path: String,

    /// Maximum concurrent connections (0 = unlimited)
    pub max_connections: usize,

    /// How long a new connection may take to send its request head
    pub request_timeout: Duration,

    /// Enable TCP_NODELAY (disable Nagle's algorithm)
    pub tcp_nodelay: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 80)),
            stream_path: DEFAULT_STREAM_PATH.to_owned(),
            max_connections: 0,
            request_timeout: Duration::from_secs(5),
            tcp_nodelay: true,
        }
    }
}

/// Event stream server
pub struct Server {
    config: ServerConfig,
    listener: TcpListener,
    router: Router,
    handshake: Handshake,
    connection_semaphore: Option<Arc<Semaphore>>,
}

impl Server {
    /// Binds the listener.
    ///
    /// # Arguments
    /// * `config` - Listener settings
    /// * `handshake` - Streaming handshake used for stream path requests
    pub async fn bind(config: ServerConfig, handshake: Handshake) -> io::Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let router = api::router(&config.stream_path, handshake.options().cors);

        let connection_semaphore = if config.max_connections > 0 {
            Some(Arc::new(Semaphore::new(config.max_connections)))
        } else {
            None
        };

        info!(
            addr = %listener.local_addr()?,
            stream_path = %config.stream_path,
            "Event stream server listening"
        );

        Ok(Self {
            config,
            listener,
            router,
            handshake,
            connection_semaphore,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until shutdown starts.
    ///
    /// Connections already handed out keep running; stream clients are
    /// closed by the registry when it stops.
    pub async fn run_until(self, mut shutdown: ShutdownSignal) {
        tokio::select! {
            _ = shutdown.draining() => info!("Shutdown signal received, no longer accepting"),
            _ = self.accept_loop() => {}
        }
    }

    async fn accept_loop(&self) {
        loop {
            match self.listener.accept().await {
                Ok((socket, peer_addr)) => self.handle_connection(socket, peer_addr),
                Err(err) => error!(error = %err, "Failed to accept connection"),
            }
        }
    }

    fn handle_connection(&self, socket: TcpStream, peer_addr: SocketAddr) {
        // Check connection limit
        let permit = if let Some(ref sem) = self.connection_semaphore {
            match sem.clone().try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    warn!(peer = %peer_addr, "Connection rejected: limit reached");
                    return;
                }
            }
        } else {
            None
        };

        if self.config.tcp_nodelay {
            if let Err(err) = socket.set_nodelay(true) {
                debug!(error = %err, "Failed to set TCP_NODELAY");
            }
        }

        let stream_path = self.config.stream_path.clone();
        let patience = self.config.request_timeout;
        let router = self.router.clone();
        let handshake = self.handshake.clone();

        tokio::spawn(async move {
            let route = timeout(patience, sniff(&socket, &stream_path))
                .await
                .unwrap_or(Route::Gone);
            match route {
                Route::Stream => hijack(socket, peer_addr, &handshake, patience, permit).await,
                Route::Http => serve_http(socket, peer_addr, router, permit).await,
                Route::Gone => debug!(peer = %peer_addr, "No request line before the deadline"),
            }
        });
    }
}

/// Keeps the raw socket and turns it into a stream client.
async fn hijack(
    mut socket: TcpStream,
    peer_addr: SocketAddr,
    handshake: &Handshake,
    patience: Duration,
    permit: Option<OwnedSemaphorePermit>,
) {
    let head = match timeout(patience, read_head(&mut socket)).await {
        Ok(head) => head,
        Err(_) => Err(HandshakeError::MalformedRequest(
            "timed out waiting for the request head".to_owned(),
        )),
    };
    let request = match head {
        Ok(request) => request,
        Err(err) => {
            warn!(peer = %peer_addr, "Rejecting stream request: {}", err);
            match timeout(patience, write_server_error(&mut socket, &err.to_string())).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    debug!(peer = %peer_addr, "Failed to answer rejected request: {}", err)
                }
                Err(_) => debug!(peer = %peer_addr, "Timed out answering rejected request"),
            }
            return;
        }
    };

    match handshake.accept(&request, socket, permit).await {
        Ok(channels) => info!(peer = %peer_addr, ?channels, "Stream client connected"),
        Err(err) => warn!(peer = %peer_addr, "Stream handshake failed: {}", err),
    }
}

/// Serves a connection through the router.
async fn serve_http(
    socket: TcpStream,
    peer_addr: SocketAddr,
    router: Router,
    permit: Option<OwnedSemaphorePermit>,
) {
    let service = service_fn(move |request: hyper::Request<Incoming>| router.clone().oneshot(request));

    if let Err(err) = http1::Builder::new()
        .serve_connection(TokioIo::new(socket), service)
        .await
    {
        debug!(peer = %peer_addr, "HTTP connection error: {}", err);
    }
    drop(permit);
}

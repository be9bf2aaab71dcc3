//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// Per-client delivery worker. One `Connection` task exists for every registered client: it
// drains the client's mailbox and writes each payload to the client's stream under a short
// write deadline.
//
// | Component      | Description                                                 |
// |----------------|-------------------------------------------------------------|
// | Connection     | Owns one outbound stream and the receiving end of a mailbox |
// | ClientStream   | Boxed writer the registry hands to new connections          |
//
//--------------------------------------------------------------------------------------------------
// STRUCTS
//--------------------------------------------------------------------------------------------------
// | Name           | Description                                   | Key Methods               |
// |----------------|-----------------------------------------------|---------------------------|
// | Connection     | Single-client send loop                       | new, with_permit, run     |
//
//--------------------------------------------------------------------------------------------------

use std::time::{Duration, Instant};

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{OwnedSemaphorePermit, mpsc};
use tokio::time::timeout;
use tracing::debug;

use crate::domain::models::{ClientRef, Mailbox, Payload};

/// Writer half of a hijacked connection, as stored by the registry.
pub type ClientStream = Box<dyn AsyncWrite + Send + Unpin>;

/// Smallest sample a successful write reports; `Duration::ZERO` means failure.
const MIN_SAMPLE: Duration = Duration::from_nanos(1);

/// Single-client send loop.
///
/// Ends in one of two ways:
/// - the mailbox is closed by the registry: the stream is shut down and
///   nothing is reported;
/// - a write fails or misses its deadline: the payload is answered with
///   zero, the client's liveness signal is closed, the stream is shut down
///   and a removal request is sent to the registry.
pub struct Connection<S> {
    stream: S,
    mailbox: Mailbox,
    removals: mpsc::UnboundedSender<ClientRef>,
    write_timeout: Duration,
    permit: Option<OwnedSemaphorePermit>,
}

impl<S> Connection<S>
where
    S: AsyncWrite + Send + Unpin,
{
    /// Creates a connection worker.
    ///
    /// # Arguments
    /// * `stream` - The client's outbound stream
    /// * `mailbox` - Worker half of the client created by `Client::new`
    /// * `removals` - Where to ask the registry to drop this client after a failure
    /// * `write_timeout` - Deadline for writing one payload
    pub fn new(
        stream: S,
        mailbox: Mailbox,
        removals: mpsc::UnboundedSender<ClientRef>,
        write_timeout: Duration,
    ) -> Self {
        Self {
            stream,
            mailbox,
            removals,
            write_timeout,
            permit: None,
        }
    }

    /// Holds a connection-limit permit for as long as the worker runs.
    pub fn with_permit(mut self, permit: Option<OwnedSemaphorePermit>) -> Self {
        self.permit = permit;
        self
    }

    pub async fn run(mut self) {
        while let Some(payload) = self.mailbox.receiver.recv().await {
            if let Err(reason) = self.deliver(payload).await {
                debug!(%reason, "client stream failed, closing connection");
                self.close().await;
                if self.removals.send(self.mailbox.me.clone()).is_err() {
                    debug!("registry already stopped, skipping removal");
                }
                return;
            }
        }

        debug!("mailbox closed, closing connection");
        self.close().await;
    }

    async fn deliver(&mut self, payload: Payload) -> Result<(), String> {
        let Payload { data, done } = payload;
        let started = Instant::now();

        let stream = &mut self.stream;
        let written = timeout(self.write_timeout, async {
            stream.write_all(&data).await?;
            stream.flush().await
        })
        .await;

        let outcome = match written {
            Ok(Ok(())) => Ok(started.elapsed().max(MIN_SAMPLE)),
            Ok(Err(err)) => Err(err.to_string()),
            Err(_) => Err(format!("write exceeded {:?}", self.write_timeout)),
        };

        match outcome {
            Ok(elapsed) => {
                // The dispatcher may have given up on this payload already.
                let _ = done.send(elapsed);
                Ok(())
            }
            Err(reason) => {
                self.mailbox.liveness.cancel();
                let _ = done.send(Duration::ZERO);
                Err(reason)
            }
        }
    }

    async fn close(&mut self) {
        self.mailbox.liveness.cancel();
        if let Ok(Err(err)) = timeout(self.write_timeout, self.stream.shutdown()).await {
            debug!("error while shutting down client stream: {}", err);
        }
        self.permit.take();
    }
}

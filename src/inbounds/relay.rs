//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// Moves messages from the bus into the broadcast registry. Every message is decoded, published
// (or dropped when malformed) and then acknowledged exactly once.
//
// | Name          | Description                                          | Key Methods            |
// |---------------|------------------------------------------------------|------------------------|
// | MessageSource | Anything that yields acknowledgeable messages        | receive, acknowledge   |
// | RelayOptions  | Compression and malformed-message policy             | default                |
// | relay         | The receive/decode/publish/ack loop                  |                        |
// | RelayError    | Bus gone, registry stopped                           |                        |
//--------------------------------------------------------------------------------------------------

use async_trait::async_trait;
use thiserror::Error;
use tokio::select;
use tracing::{debug, error, info, warn};

use crate::domain::services::broadcast::{Broadcaster, RegistryError};
use crate::shutdown::ShutdownSignal;

use super::envelope;

/// Errors that end the relay loop
#[derive(Error, Debug)]
pub enum RelayError {
    /// The bus stopped delivering messages
    #[error("Message source closed")]
    SourceClosed,

    #[error("Broadcast registry unavailable: {0}")]
    Registry(#[from] RegistryError),

    #[error("Failed to acknowledge message: {0}")]
    Acknowledge(String),
}

/// A stream of messages that must each be acknowledged once.
#[async_trait]
pub trait MessageSource: Send {
    type Message: Send + Sync;

    /// Next message; `None` once the source is closed.
    async fn receive(&mut self) -> Option<Self::Message>;

    /// Raw body of a message.
    fn payload<'m>(&self, message: &'m Self::Message) -> &'m [u8];

    /// Settles a message. `success == false` asks the source not to redeliver it as is.
    async fn acknowledge(&mut self, message: &Self::Message, success: bool)
    -> Result<(), RelayError>;
}

/// How the relay treats messages
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayOptions {
    /// Send event data compressed
    pub compress: bool,
    /// Settle malformed envelopes with `success == false` instead of acking them
    pub reject_malformed: bool,
    /// Log every raw payload
    pub verbose: bool,
}

/// Runs until the source closes or shutdown starts.
///
/// # Returns
/// * `Ok(())` - Shutdown was requested
/// * `Err(RelayError::SourceClosed)` - The bus went away
/// * `Err(RelayError::Registry)` - The registry stopped accepting events
pub async fn relay<S: MessageSource>(
    source: &mut S,
    broadcaster: &Broadcaster,
    options: RelayOptions,
    mut shutdown: ShutdownSignal,
) -> Result<(), RelayError> {
    info!(?options, "Relaying bus messages");

    loop {
        let message = select! {
            _ = shutdown.draining() => {
                debug!("relay stopping");
                return Ok(());
            }
            message = source.receive() => message.ok_or(RelayError::SourceClosed)?,
        };

        let payload = source.payload(&message);
        if options.verbose {
            debug!(payload = %String::from_utf8_lossy(payload), "message received");
        }

        let (success, published) = match envelope::decode(payload, options.compress) {
            Ok(event) => (true, broadcaster.publish(event.into()).await),
            Err(err) => {
                warn!("dropping malformed message: {}", err);
                (!options.reject_malformed, Ok(()))
            }
        };

        // A message the registry refused is settled too, then the loop ends.
        let success = success && published.is_ok();
        if let Err(err) = source.acknowledge(&message, success).await {
            error!("{}", err);
        }
        published?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::Event;
    use crate::domain::services::broadcast::{BroadcastConfig, Registration};
    use crate::domain::services::metrics::NoopMetrics;
    use crate::shutdown::Shutdown;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, duplex};

    struct QueueSource {
        messages: VecDeque<Vec<u8>>,
        next_tag: usize,
        acks: Arc<Mutex<Vec<(usize, bool)>>>,
        hold_open: bool,
    }

    impl QueueSource {
        fn new(messages: &[&[u8]]) -> (Self, Arc<Mutex<Vec<(usize, bool)>>>) {
            let acks = Arc::new(Mutex::new(Vec::new()));
            (
                Self {
                    messages: messages.iter().map(|m| m.to_vec()).collect(),
                    next_tag: 0,
                    acks: acks.clone(),
                    hold_open: false,
                },
                acks,
            )
        }
    }

    #[async_trait]
    impl MessageSource for QueueSource {
        type Message = (usize, Vec<u8>);

        async fn receive(&mut self) -> Option<Self::Message> {
            match self.messages.pop_front() {
                Some(body) => {
                    self.next_tag += 1;
                    Some((self.next_tag, body))
                }
                None if self.hold_open => std::future::pending().await,
                None => None,
            }
        }

        fn payload<'m>(&self, message: &'m Self::Message) -> &'m [u8] {
            &message.1
        }

        async fn acknowledge(
            &mut self,
            message: &Self::Message,
            success: bool,
        ) -> Result<(), RelayError> {
            self.acks.lock().unwrap().push((message.0, success));
            Ok(())
        }
    }

    fn start() -> (Shutdown, Broadcaster) {
        let shutdown = Shutdown::new();
        let config = BroadcastConfig {
            heartbeat_interval: Duration::from_secs(3600),
            ..BroadcastConfig::default()
        };
        let (broadcaster, _loop) =
            Broadcaster::start(config, Arc::new(NoopMetrics), shutdown.signal());
        (shutdown, broadcaster)
    }

    #[tokio::test]
    async fn malformed_message_is_acked_and_not_published() {
        let (shutdown, broadcaster) = start();

        let (server_side, mut browser) = duplex(1024);
        broadcaster
            .add(Registration::new(vec!["*".into()], Box::new(server_side)))
            .await
            .unwrap();
        while broadcaster.dispatch(Event::Ping).await.unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let mut ping = [0u8; 7];
        browser.read_exact(&mut ping).await.unwrap();

        let (mut source, acks) = QueueSource::new(&[
            br#"{"event":"e","data":{"#,
            br#"{"event":"e","data":1}"#,
        ]);

        let result = relay(
            &mut source,
            &broadcaster,
            RelayOptions::default(),
            shutdown.signal(),
        )
        .await;

        assert!(matches!(result, Err(RelayError::SourceClosed)));
        assert_eq!(*acks.lock().unwrap(), vec![(1, true), (2, true)]);

        let expected = b"data: {\"event\":\"e\",\"data\":1}\n\n";
        let mut frame = vec![0u8; expected.len()];
        browser.read_exact(&mut frame).await.unwrap();
        assert_eq!(&frame[..], &expected[..]);

        shutdown.drain();
    }

    #[tokio::test]
    async fn reject_malformed_settles_with_failure() {
        let (shutdown, broadcaster) = start();
        let (mut source, acks) = QueueSource::new(&[b"not json"]);

        let options = RelayOptions {
            reject_malformed: true,
            ..RelayOptions::default()
        };
        let result = relay(&mut source, &broadcaster, options, shutdown.signal()).await;

        assert!(matches!(result, Err(RelayError::SourceClosed)));
        assert_eq!(*acks.lock().unwrap(), vec![(1, false)]);
        shutdown.drain();
    }

    #[tokio::test]
    async fn shutdown_ends_the_relay_cleanly() {
        let (shutdown, broadcaster) = start();
        let (mut source, acks) = QueueSource::new(&[br#"{"event":"e"}"#]);
        source.hold_open = true;

        let signal = shutdown.signal();
        let relay_task = tokio::spawn(async move {
            relay(&mut source, &broadcaster, RelayOptions::default(), signal).await
        });

        while acks.lock().unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        shutdown.drain();

        let result = tokio::time::timeout(Duration::from_secs(2), relay_task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(*acks.lock().unwrap(), vec![(1, true)]);
    }

    #[tokio::test]
    async fn stopped_registry_ends_the_relay() {
        let shutdown = Shutdown::new();
        let (broadcaster, registry_loop) = Broadcaster::start(
            BroadcastConfig::default(),
            Arc::new(NoopMetrics),
            shutdown.signal(),
        );
        // Stop the registry but give the relay a signal that never drains.
        let relay_shutdown = Shutdown::new();
        shutdown.drain();
        registry_loop.await.unwrap();

        let (mut source, acks) = QueueSource::new(&[br#"{"event":"e"}"#]);
        let result = relay(
            &mut source,
            &broadcaster,
            RelayOptions::default(),
            relay_shutdown.signal(),
        )
        .await;

        assert!(matches!(
            result,
            Err(RelayError::Registry(RegistryError::Stopped))
        ));
        assert_eq!(*acks.lock().unwrap(), vec![(1, false)]);
    }
}

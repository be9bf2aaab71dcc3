use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::event::Subscribed;

/// A client mailbox holds at most one pending payload.
pub const MAILBOX_CAPACITY: usize = 1;

/// Wire-ready bytes plus the signal the connection answers with the elapsed
/// write time, or `Duration::ZERO` when the write failed.
#[derive(Debug)]
pub struct Payload {
    pub data: Bytes,
    pub done: oneshot::Sender<Duration>,
}

impl Payload {
    pub fn new(data: Bytes) -> (Self, oneshot::Receiver<Duration>) {
        let (done, rx) = oneshot::channel();
        (Self { data, done }, rx)
    }
}

/// Registry-side view of a connected client.
///
/// A client has no numeric id: it is identified by its mailbox. Cloning a
/// client clones the mailbox sender, so clones still compare as the same
/// client with [`Client::is`].
#[derive(Debug, Clone)]
pub struct Client {
    mailbox: mpsc::Sender<Payload>,
    channels: Vec<String>,
    liveness: CancellationToken,
}

/// Worker-side half of a client: the receiving end of its mailbox and the
/// liveness signal it closes once its stream fails.
#[derive(Debug)]
pub struct Mailbox {
    pub receiver: mpsc::Receiver<Payload>,
    pub liveness: CancellationToken,
    pub me: ClientRef,
}

/// Weak handle that identifies a client without keeping its mailbox open.
#[derive(Debug, Clone)]
pub struct ClientRef(mpsc::WeakSender<Payload>);

impl Client {
    /// Creates a client and the mailbox its connection worker drains.
    pub fn new(channels: Vec<String>) -> (Self, Mailbox) {
        let (sender, receiver) = mpsc::channel(MAILBOX_CAPACITY);
        let liveness = CancellationToken::new();
        let me = ClientRef(sender.downgrade());

        (
            Self {
                mailbox: sender,
                channels,
                liveness: liveness.clone(),
            },
            Mailbox {
                receiver,
                liveness,
                me,
            },
        )
    }

    pub fn mailbox(&self) -> &mpsc::Sender<Payload> {
        &self.mailbox
    }

    pub fn liveness(&self) -> &CancellationToken {
        &self.liveness
    }

    /// True once the client's stream has failed; it will never accept another payload.
    pub fn is_closed(&self) -> bool {
        self.liveness.is_cancelled()
    }

    /// Mailbox identity check.
    pub fn is(&self, other: &Client) -> bool {
        self.mailbox.same_channel(&other.mailbox)
    }

    pub fn downgrade(&self) -> ClientRef {
        ClientRef(self.mailbox.downgrade())
    }
}

impl Subscribed for Client {
    fn channels(&self) -> &[String] {
        &self.channels
    }
}

impl ClientRef {
    /// Whether this handle points at `client`'s mailbox.
    ///
    /// Always false once every strong sender of the mailbox is gone.
    pub fn refers_to(&self, client: &Client) -> bool {
        self.0
            .upgrade()
            .is_some_and(|sender| sender.same_channel(&client.mailbox))
    }
}

//--------------------------------------------------------------------------------------------------
// STRUCTS & ENUMS
//--------------------------------------------------------------------------------------------------
// | Name           | Description                                         | Key Methods          |
// |----------------|-----------------------------------------------------|----------------------|
// | Event          | Something to broadcast: a message or a heartbeat    | to_bytes, select     |
// | MessageEvent   | Data-carrying event with id, name and channels      | new, with_id, ...    |
// | Subscribed     | Anything that carries a list of subscribed channels | channels             |
//--------------------------------------------------------------------------------------------------

use std::collections::HashSet;
use std::io::{self, Write};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::{BufMut, Bytes, BytesMut};
use flate2::Compression;
use flate2::write::ZlibEncoder;

/// Wire frame of a heartbeat: a bare comment line followed by a blank line.
pub const PING_FRAME: &[u8] = b":ping\n\n";

/// A delivery target that is subscribed to zero or more channels.
///
/// An empty list means the target only receives global events.
pub trait Subscribed {
    fn channels(&self) -> &[String];
}

impl Subscribed for Vec<String> {
    fn channels(&self) -> &[String] {
        self
    }
}

/// Something the broadcast registry can deliver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A data-carrying event
    Message(MessageEvent),
    /// Liveness check sent to every client
    Ping,
}

/// Data event as it arrives from the bus.
///
/// `channels` decide who receives it and are never written to the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEvent {
    pub id: Option<u64>,
    pub name: Option<String>,
    pub data: Bytes,
    pub channels: Vec<String>,
    pub compress: bool,
}

impl MessageEvent {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            id: None,
            name: None,
            data: data.into(),
            channels: Vec::new(),
            compress: false,
        }
    }

    pub fn with_id(mut self, id: u64) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_channels(mut self, channels: Vec<String>) -> Self {
        self.channels = channels;
        self
    }

    pub fn compressed(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    fn render(&self) -> io::Result<Bytes> {
        let mut frame = BytesMut::with_capacity(self.data.len() + 32);

        // Ids start at 1; zero means unset.
        if let Some(id) = self.id.filter(|id| *id > 0) {
            frame.put_slice(format!("id: {}\n", id).as_bytes());
        }
        if let Some(name) = &self.name {
            frame.put_slice(b"event: ");
            frame.put_slice(name.as_bytes());
            frame.put_u8(b'\n');
        }

        frame.put_slice(b"data: ");
        if self.compress {
            let deflated = deflate(&self.data)?;
            frame.put_slice(STANDARD.encode(deflated).as_bytes());
        } else {
            frame.put_slice(&self.data);
        }
        frame.put_slice(b"\n\n");

        Ok(frame.freeze())
    }
}

impl From<MessageEvent> for Event {
    fn from(event: MessageEvent) -> Self {
        Event::Message(event)
    }
}

impl Event {
    /// Renders the event as a wire frame.
    ///
    /// # Returns
    /// * `Ok(Bytes)` - `[id: n\n][event: name\n]data: payload\n\n`, or `:ping\n\n` for a heartbeat
    /// * `Err(io::Error)` - If compressing the payload failed
    pub fn to_bytes(&self) -> io::Result<Bytes> {
        match self {
            Event::Message(message) => message.render(),
            Event::Ping => Ok(Bytes::from_static(PING_FRAME)),
        }
    }

    /// Channels the event targets; empty means every client.
    pub fn channels(&self) -> &[String] {
        match self {
            Event::Message(message) => &message.channels,
            Event::Ping => &[],
        }
    }

    /// Name used when reporting the event, e.g. to metrics.
    pub fn label(&self) -> &str {
        match self {
            Event::Message(message) => message.name.as_deref().unwrap_or("message"),
            Event::Ping => "ping",
        }
    }

    /// Picks the candidates that should receive this event.
    ///
    /// Global events go to every candidate. Otherwise a candidate is picked
    /// when it shares at least one channel with the event; each candidate
    /// appears at most once and the input order is kept.
    pub fn select<'a, T: Subscribed>(&self, candidates: &'a [T]) -> Vec<&'a T> {
        let targets = self.channels();
        if targets.is_empty() {
            return candidates.iter().collect();
        }

        let targets: HashSet<&str> = targets.iter().map(String::as_str).collect();
        candidates
            .iter()
            .filter(|candidate| {
                candidate
                    .channels()
                    .iter()
                    .any(|channel| targets.contains(channel.as_str()))
            })
            .collect()
    }
}

fn deflate(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len()), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

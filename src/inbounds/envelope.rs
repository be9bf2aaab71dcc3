use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use thiserror::Error;

use crate::domain::models::MessageEvent;

/// Channel assigned to envelopes that do not name any.
pub const WILDCARD_CHANNEL: &str = "*";

/// Errors raised while decoding a bus message
#[derive(Error, Debug)]
pub enum EnvelopeError {
    #[error("Invalid envelope: {0}")]
    Json(#[from] serde_json::Error),
}

/// Message published on the bus:
/// `{"event": "...", "data": <any JSON>, "channels": ["..."]}`
#[derive(Debug, Deserialize)]
struct Envelope<'a> {
    #[serde(default)]
    event: String,
    #[serde(borrow, default)]
    data: Option<&'a RawValue>,
    #[serde(default)]
    channels: Vec<String>,
}

/// What clients receive: the envelope without its routing information.
#[derive(Serialize)]
struct Rendered<'a> {
    event: &'a str,
    data: Option<&'a RawValue>,
}

/// Decodes a bus message into an event.
///
/// `data` is forwarded byte for byte. Envelopes without channels go to the
/// wildcard channel.
///
/// # Arguments
/// * `payload` - Raw message body
/// * `compress` - Whether the event's data is sent compressed
pub fn decode(payload: &[u8], compress: bool) -> Result<MessageEvent, EnvelopeError> {
    let envelope: Envelope<'_> = serde_json::from_slice(payload)?;

    let message = serde_json::to_vec(&Rendered {
        event: &envelope.event,
        data: envelope.data,
    })?;

    let channels = if envelope.channels.is_empty() {
        vec![WILDCARD_CHANNEL.to_owned()]
    } else {
        envelope.channels
    };

    Ok(MessageEvent::new(message)
        .with_channels(channels)
        .compressed(compress))
}

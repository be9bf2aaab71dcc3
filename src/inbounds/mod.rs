/// +----------------------------------------------------------+
/// | MODULES                                                  |
/// +----------+-------+-------+------------------------------+
/// | Exports:                                                 |
/// |   - channels                                             |
/// |   - envelope                                             |
/// |   - handshake                                            |
/// |   - relay                                                |
/// |   - rabbit_source                                        |
/// +----------------------------------------------------------+

/// Strategies mapping a stream request to subscribed channels.
pub mod channels;

/// Decoding of bus messages into events.
pub mod envelope;

/// Upgrade of a hijacked socket into a registered client.
pub mod handshake;

/// The bus-to-registry message loop.
pub mod relay;

mod rabbit_source;

pub use channels::{ChannelResolver, NoChannels, QueryChannels};
pub use handshake::{Handshake, HandshakeError, HandshakeOptions, HIJACKING_ERROR};
pub use relay::{MessageSource, RelayError, RelayOptions, relay};

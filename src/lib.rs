// Expose the modules
pub mod api;
pub mod config;
pub mod domain;
pub mod inbounds;
pub mod server;
pub mod shutdown;

// Re-export key types for easier usage
pub use config::{Config, ConfigError};
pub use domain::models::{Client, Event, MessageEvent, PING_FRAME};
pub use domain::services::broadcast::{
    BroadcastConfig, Broadcaster, Registration, RegistryError, RegistryResult,
};
pub use domain::services::metrics::{
    BufferedMetrics, LogMetrics, Metrics, MetricsError, NoopMetrics, StatsdMetrics,
};
pub use inbounds::{
    ChannelResolver, Handshake, HandshakeOptions, MessageSource, NoChannels, QueryChannels,
    RelayError, RelayOptions, relay,
};
pub use server::{Server, ServerConfig};
pub use shutdown::{Shutdown, ShutdownSignal, ShutdownState};

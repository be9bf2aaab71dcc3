//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// Broadcast registry: the single owner of the client roster. It serializes additions, removals
// and publishes, fans each publish out to the selected clients concurrently, and injects the
// periodic heartbeat.
//
// | Component        | Description                                                      |
// |------------------|------------------------------------------------------------------|
// | Broadcaster      | Handle used by the handshake and the relay                       |
// | Roster           | Client list owned by the control loop                            |
// | fan_out          | Concurrent delivery of one event with per-client timing samples  |
// | RegistryError    | Registry stopped / client not registered                         |
//--------------------------------------------------------------------------------------------------

mod dispatch;
mod error;
mod registry;
mod roster;

#[cfg(test)]
mod tests;

pub use dispatch::{deliver, fan_out};
pub use error::{RegistryError, RegistryResult};
pub use registry::{
    BroadcastConfig, Broadcaster, DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_WRITE_TIMEOUT, Registration,
};
pub use roster::Roster;

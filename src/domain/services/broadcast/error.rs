use thiserror::Error;

/// Errors returned by the broadcast registry
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// The control loop has shut down and no longer accepts requests
    #[error("Broadcast registry is stopped")]
    Stopped,

    /// A removal named a client that is not in the roster
    #[error("Client is not registered")]
    ClientNotFound,
}

/// Type alias for Result with RegistryError
pub type RegistryResult<T> = Result<T, RegistryError>;

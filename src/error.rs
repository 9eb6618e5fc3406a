use std::io;
use thiserror::Error;

/// Errors surfaced by the server controller.
///
/// Lifecycle and protocol misuse propagate to the caller. Transport faults
/// inside the background tasks are handled there and never show up here.
#[derive(Debug, Error)]
pub enum Error {
    #[error("server is already running")]
    AlreadyRunning,

    #[error("server is not running")]
    NotRunning,

    /// The instance was stopped; a stopped instance cannot be started again.
    #[error("server instance has been stopped")]
    Stopped,

    #[error("RCON is not connected")]
    SessionNotConnected,

    #[error("RCON authentication failed")]
    AuthenticationFailed,

    #[error("server_path is not set")]
    MissingServerPath,

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

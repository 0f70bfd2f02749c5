use hdriver_proto::DecodeError;
use std::io;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The harness could not be reached or did not answer the handshake.
    /// Never retried.
    #[error("connect failed: {0}")]
    Connect(String),

    /// The socket became unusable mid-session. Triggers one reconnect.
    #[error("transport error: {0}")]
    Transport(#[source] io::Error),

    /// A JSON value on the stream is not a reply. Handled like a transport fault.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// No reply carrying our correlation id arrived in time.
    #[error("wait for {} seconds", .0.as_secs_f64())]
    Timeout(Duration),

    #[error("element not found: {0}")]
    ElementNotFound(String),

    /// Any other error reported by the harness.
    #[error("harness error: {0}")]
    Driver(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A reply lacks or garbles a field the verb relies on.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// A device command gave output we cannot work with.
    #[error("device error: {0}")]
    Device(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("session closed")]
    SessionClosed,
}

impl Error {
    /// Faults the engine recovers from by reconnecting.
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::Decode(_))
    }
}

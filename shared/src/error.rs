//! Error types for Hookline.

use std::time::Duration;

use thiserror::Error;

use crate::protocol::DecodeError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Tunnel rejected by relay: {0}")]
    Rejected(String),

    #[error("Connection closed during handshake")]
    ClosedDuringHandshake,

    #[error("Transport not open within {0:?}")]
    ConnectTimeout(Duration),

    #[error("No handshake reply within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("Session is already connected")]
    AlreadyConnected,

    #[error("Invalid endpoint '{0}': {1}")]
    InvalidEndpoint(String, String),

    #[error("Invalid port '{0}': must be between 1 and 65535")]
    InvalidPort(String),

    #[error("Missing auth token")]
    MissingToken,

    #[error("Reconnect attempts exhausted after {0} tries")]
    ReconnectExhausted(u32),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error came from the relay refusing the handshake.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Error::Rejected(_))
    }
}

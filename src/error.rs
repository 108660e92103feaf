use std::io;
use thiserror::Error;

use crate::id::ConnId;

/// Why the framer stopped producing lines.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("line exceeds {limit} bytes")]
    LineTooLong { limit: usize },

    #[error("line is not valid utf-8")]
    InvalidUtf8,

    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("connection {0} is already registered")]
    DuplicateId(ConnId),

    #[error("registry is no longer running")]
    Stopped,
}

/// Client behaviour that ends a connection.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum ProtocolViolation {
    #[error("line too long")]
    LineTooLong,

    #[error("invalid utf-8")]
    InvalidUtf8,

    #[error("display name must not be empty")]
    EmptyName,

    #[error("no display name received in time")]
    HandshakeTimeout,
}

/// The first trigger that moved a connection into `Closing`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CloseReason {
    #[error("client quit")]
    Quit,

    #[error("peer closed the stream")]
    PeerClosed,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol violation: {0}")]
    Protocol(ProtocolViolation),

    #[error("mailbox stayed full, slow consumer evicted")]
    SlowConsumer,

    #[error("rejected by registry: {0}")]
    Rejected(RegistryError),

    #[error("server shutting down")]
    ServerShutdown,
}

impl CloseReason {
    /// Line written to the client before the transport is closed, if any.
    pub fn notice(&self) -> Option<String> {
        match self {
            CloseReason::Protocol(v) => Some(format!("error: {v}")),
            CloseReason::ServerShutdown => Some("server shutting down".to_string()),
            _ => None,
        }
    }
}

impl From<FrameError> for CloseReason {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::LineTooLong { .. } => CloseReason::Protocol(ProtocolViolation::LineTooLong),
            FrameError::InvalidUtf8 => CloseReason::Protocol(ProtocolViolation::InvalidUtf8),
            FrameError::Transport(e) => CloseReason::Transport(e.to_string()),
        }
    }
}

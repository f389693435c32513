//! Errors raised by a single backend store

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while talking to one key-value backend
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// Socket-level failure (connect, read, write)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The backend sent something that is not valid RESP
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The backend answered with an error reply (e.g. `-WRONGTYPE ...`)
    #[error("backend error reply: {0}")]
    Server(String),

    /// The reply was valid RESP but not the shape the command returns
    #[error("unexpected reply to {command}: {reply}")]
    UnexpectedReply {
        command: &'static str,
        reply: String,
    },

    /// Could not obtain a pooled connection
    #[error("connection pool error: {0}")]
    Pool(String),

    /// The command did not complete in time
    #[error("command timed out after {0:?}")]
    Timeout(Duration),

    /// The backend has been switched off (in-memory backends only)
    #[error("backend {0} is offline")]
    Offline(String),

    /// The connection descriptor could not be parsed
    #[error("invalid backend descriptor {descriptor:?}: {reason}")]
    InvalidDescriptor { descriptor: String, reason: String },
}

impl StoreError {
    /// Whether the error means the connection itself can no longer be trusted
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::Protocol(_) | Self::Timeout(_) | Self::Offline(_)
        )
    }
}

//! Error types for the transport layer.

use std::io;

use meshwire_core::Address;

use crate::wire::WireError;

/// Errors surfaced by [`Transport`](crate::Transport) operations.
///
/// `Clone` so that one failed connection attempt can fail every send that was
/// queued on it with the same error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// Bad bind configuration. Fatal at startup.
    #[error("invalid configuration: {message}")]
    Config {
        /// What was wrong.
        message: String,
    },

    /// No free port in the configured search range, or the bind itself failed.
    #[error("bind failed on {address}: {message}")]
    Bind {
        /// Last address tried.
        address: String,
        /// Underlying failure.
        message: String,
    },

    /// A connection to the destination could not be established.
    #[error("connect to {address} failed: {message}")]
    Connect {
        /// Destination.
        address: Address,
        /// Kind of the underlying I/O failure.
        kind: io::ErrorKind,
        /// Underlying failure.
        message: String,
    },

    /// The transport has been stopped.
    #[error("transport closed")]
    Closed,

    /// Socket failure on an established connection.
    #[error("I/O error on connection to {address}: {message}")]
    Io {
        /// Remote end of the failed connection.
        address: Address,
        /// Underlying failure.
        message: String,
    },

    /// A message could not be framed.
    #[error("wire error: {0}")]
    Wire(#[from] WireError),
}

impl TransportError {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        TransportError::Config {
            message: message.into(),
        }
    }

    pub(crate) fn connect(address: &Address, err: &io::Error) -> Self {
        TransportError::Connect {
            address: address.clone(),
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    pub(crate) fn io(address: &Address, message: impl Into<String>) -> Self {
        TransportError::Io {
            address: address.clone(),
            message: message.into(),
        }
    }

    /// Whether this is a [`TransportError::Config`].
    pub fn is_config(&self) -> bool {
        matches!(self, TransportError::Config { .. })
    }

    /// Whether this is a [`TransportError::Bind`].
    pub fn is_bind(&self) -> bool {
        matches!(self, TransportError::Bind { .. })
    }

    /// Whether this is a [`TransportError::Connect`].
    pub fn is_connect(&self) -> bool {
        matches!(self, TransportError::Connect { .. })
    }

    /// Whether this is a [`TransportError::Closed`].
    pub fn is_closed(&self) -> bool {
        matches!(self, TransportError::Closed)
    }

    /// Whether this is a [`TransportError::Io`].
    pub fn is_io(&self) -> bool {
        matches!(self, TransportError::Io { .. })
    }
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

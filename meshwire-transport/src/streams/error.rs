//! Error types for the stream protocol.
//!
//! A response stream can end badly in a few ways:
//! - the request could not be delivered ([`StreamError::Transport`])
//! - no terminal message arrived in time ([`StreamError::Timeout`])
//! - the remote handler failed ([`StreamError::RemoteFailure`])
//! - the correlation id was already in use ([`StreamError::DuplicateCorrelationId`])

use std::time::Duration;

use bytes::Bytes;
use meshwire_core::Message;
use serde::{Deserialize, Serialize};

use crate::error::TransportError;

/// Payload of a failure message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorData {
    /// Human-readable description of the failure.
    pub message: String,
}

/// Why a [`Call`](crate::Call) ended with an error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StreamError {
    /// Sending the request failed, or the connection carrying the call broke.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// No terminal message before the deadline.
    #[error("call timed out after {after:?}")]
    Timeout {
        /// Configured timeout.
        after: Duration,
    },

    /// The remote handler reported a failure.
    #[error("remote failure: {message}")]
    RemoteFailure {
        /// Description sent by the remote side.
        message: String,
        /// Raw failure payload, if any.
        payload: Option<Bytes>,
    },

    /// Another live call already uses this correlation id.
    #[error("correlation id {correlation_id} is already in use")]
    DuplicateCorrelationId {
        /// The conflicting id.
        correlation_id: String,
    },
}

impl StreamError {
    /// Build the failure described by a failure message.
    ///
    /// A JSON [`ErrorData`] payload provides the description; any other
    /// payload is read as text; no payload yields a generic failure.
    pub fn from_failure_message(message: &Message) -> Self {
        let payload = message.payload().cloned();
        let description = match &payload {
            Some(bytes) => match serde_json::from_slice::<ErrorData>(bytes) {
                Ok(data) => data.message,
                Err(_) => String::from_utf8_lossy(bytes).into_owned(),
            },
            None => "remote handler failed".to_string(),
        };
        StreamError::RemoteFailure {
            message: description,
            payload,
        }
    }

    /// Whether this is a [`StreamError::Transport`].
    pub fn is_transport(&self) -> bool {
        matches!(self, StreamError::Transport(_))
    }

    /// Whether this is a [`StreamError::Timeout`].
    pub fn is_timeout(&self) -> bool {
        matches!(self, StreamError::Timeout { .. })
    }

    /// Whether this is a [`StreamError::RemoteFailure`].
    pub fn is_remote_failure(&self) -> bool {
        matches!(self, StreamError::RemoteFailure { .. })
    }

    /// Whether this is a [`StreamError::DuplicateCorrelationId`].
    pub fn is_duplicate_correlation_id(&self) -> bool {
        matches!(self, StreamError::DuplicateCorrelationId { .. })
    }

    /// The transport error, if this is one.
    pub fn transport_error(&self) -> Option<&TransportError> {
        match self {
            StreamError::Transport(e) => Some(e),
            _ => None,
        }
    }
}

/// Why handlers could not be registered.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistrationError {
    /// A handler is already registered for this qualifier.
    #[error("a handler is already registered for {qualifier}")]
    DuplicateQualifier {
        /// The conflicting qualifier.
        qualifier: String,
    },

    /// The qualifier belongs to the reserved namespace.
    #[error("{qualifier} is a reserved qualifier")]
    ReservedQualifier {
        /// The rejected qualifier.
        qualifier: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshwire_core::qualifier;

    #[test]
    fn test_failure_from_error_data() {
        let payload = serde_json::to_vec(&ErrorData {
            message: "boom".to_string(),
        })
        .expect("encode");
        let failure = Message::with_qualifier(qualifier::ON_ERROR)
            .payload(payload)
            .build();
        match StreamError::from_failure_message(&failure) {
            StreamError::RemoteFailure { message, payload } => {
                assert_eq!(message, "boom");
                assert!(payload.is_some());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_failure_from_text_and_empty_payload() {
        let text = Message::with_qualifier(qualifier::ON_ERROR)
            .payload("plain text")
            .build();
        assert!(StreamError::from_failure_message(&text)
            .to_string()
            .contains("plain text"));

        let empty = Message::from_qualifier(qualifier::ON_ERROR);
        let err = StreamError::from_failure_message(&empty);
        assert!(err.is_remote_failure());
        assert_eq!(err.to_string(), "remote failure: remote handler failed");
    }

    #[test]
    fn test_transport_error_converts() {
        let err: StreamError = TransportError::Closed.into();
        assert!(err.is_transport());
        assert!(err.transport_error().is_some_and(|e| e.is_closed()));
    }
}

//! # meshwire-core
//!
//! Core types shared by the meshwire transport and stream processors.
//!
//! - [`Address`]: `host:port` identity of a node
//! - [`Message`]: immutable envelope (qualifier, correlation id, headers, payload)
//! - [`qualifier`]: reserved control qualifiers and `namespace/action` helpers
//! - [`CorrelationIdGenerator`]: process-unique correlation ids
//! - [`MessageCodec`]: pluggable payload serialization, with [`JsonCodec`]

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

mod address;
mod codec;
mod correlation;
mod message;
pub mod qualifier;

pub use address::{Address, AddressParseError};
pub use codec::{CodecError, JsonCodec, MessageCodec};
pub use correlation::CorrelationIdGenerator;
pub use message::{Message, MessageBuilder};
pub use qualifier::Qualifier;

//! # Meshwire Transport
//!
//! Point-to-point message transport over TCP with a streaming
//! request/response protocol on top.
//!
//! This crate provides:
//! - **Transport**: one outbound connection per remote address, FIFO
//!   delivery per destination, inbound fan-out to every subscriber
//! - **Wire format**: length-prefixed frames with CRC32C checksums
//! - **Network emulator**: per-address loss, delay and blocking for tests
//! - **Streams**: correlated request/response streams with completion and
//!   error signals
//!
//! ```no_run
//! use meshwire_transport::{
//!     ClientConfig, ClientStreamProcessor, HandlerSet, Message, ServerStreamProcessor,
//!     Transport, TransportConfig,
//! };
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let server = Transport::bind(TransportConfig::local_network()).await?;
//! let service = ServerStreamProcessor::new(server.clone());
//! service.create_subscriptions(HandlerSet::new().unary("echo", |request: Message| async move {
//!     Ok(Some(request))
//! }))?;
//!
//! let client = ClientStreamProcessor::new(
//!     Transport::client(TransportConfig::local_network())?,
//!     ClientConfig::default(),
//! );
//! let address = server.address().cloned().ok_or("server has no address")?;
//! let reply = client
//!     .invoke(&address, Message::with_qualifier("echo").payload("hi").build())
//!     .single()
//!     .await?;
//! assert!(reply.is_some());
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

// Re-export core types for convenience
pub use meshwire_core::{
    qualifier, Address, AddressParseError, CodecError, CorrelationIdGenerator, JsonCodec, Message,
    MessageBuilder, MessageCodec, Qualifier,
};

// =============================================================================
// Modules
// =============================================================================

mod config;
mod connection;
mod fanout;
mod listen;
mod pool;
mod send;
mod transport;

/// Network emulation for outbound traffic.
pub mod emulator;

/// Error types for transport operations.
pub mod error;

/// Streaming request/response protocol.
pub mod streams;

/// Frame format with CRC32C checksums.
pub mod wire;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use config::TransportConfig;
pub use connection::{ConnectionMetrics, ConnectionState, LISTEN_ADDRESS_HEADER};
pub use emulator::{EmulatorStats, NetworkEmulator, NetworkSettings, Verdict};
pub use error::{TransportError, TransportResult};
pub use fanout::{Fanout, RecvFuture, Subscription};
pub use send::SendFuture;
pub use transport::{ConnectionEvent, Inbound, Transport, TransportStats};

pub use wire::{
    deserialize_frame, serialize_frame, try_deserialize_frame, FrameHeader, WireError,
    HEADER_SIZE, MAX_FRAME_SIZE,
};

pub use streams::{
    Call, CallState, ClientConfig, ClientStreamProcessor, ErrorData, HandlerError, HandlerSet,
    RegistrationError, ResponseStream, ServerStats, ServerStreamProcessor, StreamError,
    StreamHandler,
};

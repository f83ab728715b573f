//! One TCP connection to a remote node.
//!
//! A connection owns a FIFO outbound queue and a single task that services the
//! socket: it connects (outbound) or finishes the handshake (inbound), then
//! runs a write loop and a read loop until either fails or the transport
//! stops.
//!
//! ```text
//! Connecting ──connect ok──▶ Connected ──stop──▶ Closing ──▶ Closed
//!     │                          │                            ▲
//!     └──────connect failed──────┴────read/write/frame error──┘
//! ```
//!
//! Every send queued on a connection is completed exactly once: with `Ok`
//! after its frame was written, or with the error that ended the connection.

mod core;
mod metrics;

pub use metrics::ConnectionMetrics;

pub(crate) use self::core::{
    run_inbound, run_outbound, wait_for_shutdown, Connection, ConnectionContext, Direction,
    Outbound,
};

/// Header of the hello frame carrying the connector's listen address.
pub const LISTEN_ADDRESS_HEADER: &str = "listen-address";

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Socket being established; sends queue up.
    Connecting,
    /// Socket usable.
    Connected,
    /// Transport stopping; queued sends are being failed.
    Closing,
    /// Terminal. The pool replaces a closed connection on the next send.
    Closed,
}

impl ConnectionState {
    /// Whether the connection can no longer carry frames.
    pub fn is_closed(&self) -> bool {
        matches!(self, ConnectionState::Closing | ConnectionState::Closed)
    }
}

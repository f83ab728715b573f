//! Streaming request/response protocol on top of [`Transport`](crate::Transport).
//!
//! A request carries a qualifier and a correlation id. The server answers
//! with zero or more values under the same correlation id, then exactly one
//! terminal message: [`ON_COMPLETED`](crate::qualifier::ON_COMPLETED) or
//! [`ON_ERROR`](crate::qualifier::ON_ERROR).
//!
//! ```text
//! client                                   server
//!   | -- request  (q, cid) -----------------> |  handler(q)
//!   | <- value    (q, cid) ------------------ |
//!   | <- value    (q, cid) ------------------ |
//!   | <- meshwire/onCompleted (cid) --------- |
//! ```
//!
//! On the client, [`ClientStreamProcessor`] keeps one session per correlation
//! id and fails it on timeout, on send failure or when the connection to the
//! server is lost. On the server, [`ServerStreamProcessor`] routes requests to
//! the handler registered for the qualifier or its longest `/` prefix.

mod call;
mod client;
mod dispatch;
mod error;
mod handler;
mod server;
mod session;

pub use call::Call;
pub use client::{ClientConfig, ClientStreamProcessor};
pub use error::{ErrorData, RegistrationError, StreamError};
pub use handler::{HandlerError, HandlerSet, ResponseStream, StreamHandler};
pub use server::{ServerStats, ServerStreamProcessor};
pub use session::CallState;

//! Server side of the stream protocol.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use meshwire_core::{qualifier, Address, JsonCodec, Message, MessageCodec};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::dispatch::DispatchTable;
use super::error::{ErrorData, RegistrationError};
use super::handler::{HandlerError, HandlerSet, StreamHandler};
use crate::error::TransportError;
use crate::fanout::Subscription;
use crate::transport::{Inbound, Transport};

/// Request counters of a server processor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerStats {
    /// Requests handed to a handler.
    pub dispatched: u64,
    /// Requests without a matching handler.
    pub unhandled: u64,
    /// Requests whose handler failed or panicked.
    pub failed: u64,
}

#[derive(Default)]
struct ServerCounters {
    dispatched: AtomicU64,
    unhandled: AtomicU64,
    failed: AtomicU64,
}

struct ServerInner {
    transport: Transport,
    table: DispatchTable,
    listener: Mutex<Option<JoinHandle<()>>>,
    counters: ServerCounters,
}

/// Serves registered handlers to remote callers.
///
/// Every inbound request whose qualifier matches a handler runs on its own
/// task. Its values go back to the sender with the request's correlation id,
/// followed by one completion message, or by one failure message if the
/// handler errors or panics. A value the transport cannot frame fails the
/// request the same way; a value lost with the connection ends it without
/// a terminal message. Cheap to clone.
#[derive(Clone)]
pub struct ServerStreamProcessor {
    inner: Arc<ServerInner>,
}

impl ServerStreamProcessor {
    /// Attach a processor to `transport` and start dispatching.
    pub fn new(transport: Transport) -> Self {
        let requests = transport.listen();
        let runtime = transport.runtime().clone();
        let inner = Arc::new(ServerInner {
            transport,
            table: DispatchTable::new(),
            listener: Mutex::new(None),
            counters: ServerCounters::default(),
        });

        let listener = runtime.spawn(dispatch_requests(Arc::downgrade(&inner), requests));
        *inner
            .listener
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(listener);
        Self { inner }
    }

    /// Register every handler of `handlers`.
    ///
    /// Registration is atomic: concurrent dispatch sees either none or all of
    /// the set.
    ///
    /// # Errors
    ///
    /// Nothing is registered when a qualifier is reserved or already taken.
    pub fn create_subscriptions(&self, handlers: HandlerSet) -> Result<(), RegistrationError> {
        let registered = self.inner.table.insert_all(handlers)?;
        info!(qualifiers = ?registered, "registered handlers");
        Ok(())
    }

    /// Unregister the handler for exactly `qualifier`.
    pub fn remove_subscription(&self, qualifier: &str) -> bool {
        let removed = self.inner.table.remove(qualifier);
        if removed {
            debug!(%qualifier, "removed handler");
        }
        removed
    }

    /// Number of registered handlers.
    pub fn handler_count(&self) -> usize {
        self.inner.table.len()
    }

    /// The transport requests arrive on.
    pub fn transport(&self) -> &Transport {
        &self.inner.transport
    }

    /// Request counters.
    pub fn stats(&self) -> ServerStats {
        let counters = &self.inner.counters;
        ServerStats {
            dispatched: counters.dispatched.load(Ordering::Relaxed),
            unhandled: counters.unhandled.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
        }
    }

    /// Stop dispatching new requests. Requests already running finish.
    pub fn close(&self) {
        if let Some(listener) = self
            .inner
            .listener
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            listener.abort();
        }
    }
}

async fn dispatch_requests(inner: Weak<ServerInner>, mut requests: Subscription<Inbound>) {
    while let Some(inbound) = requests.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        dispatch(&inner, inbound);
    }
    debug!("request dispatcher stopped");
}

fn dispatch(inner: &Arc<ServerInner>, inbound: Inbound) {
    let q = inbound.message.qualifier();
    if qualifier::is_reserved(q) {
        trace!(qualifier = %q, sender = %inbound.sender, "not dispatching reserved qualifier");
        return;
    }
    let Some(handler) = inner.table.lookup(q) else {
        inner.counters.unhandled.fetch_add(1, Ordering::Relaxed);
        debug!(qualifier = %q, sender = %inbound.sender, "no handler registered");
        return;
    };

    inner.counters.dispatched.fetch_add(1, Ordering::Relaxed);
    inner
        .transport
        .runtime()
        .spawn(serve_request(Arc::clone(inner), handler, inbound));
}

/// Run one request to its terminal message.
async fn serve_request(
    inner: Arc<ServerInner>,
    handler: Arc<dyn StreamHandler>,
    inbound: Inbound,
) {
    let Inbound { sender, message } = inbound;
    let correlation_id = message.correlation_id().map(str::to_string);
    let request_qualifier = message.qualifier().to_string();

    // The handler runs on its own task so a panic surfaces as a join error.
    let producer = {
        let transport = inner.transport.clone();
        let sender = sender.clone();
        let correlation_id = correlation_id.clone();
        let request_qualifier = request_qualifier.clone();
        tokio::spawn(async move {
            let mut values = handler.handle(message);
            let mut in_flight = FuturesUnordered::new();
            while let Some(value) = values.next().await {
                let value = value.map_err(ServeFailure::Handler)?;
                let qualifier = if value.qualifier().is_empty() {
                    request_qualifier.clone()
                } else {
                    value.qualifier().to_string()
                };
                let response = value
                    .to_builder()
                    .qualifier(qualifier)
                    .maybe_correlation_id(correlation_id.clone())
                    .build();
                in_flight.push(transport.send(&sender, response));

                // Stop producing at the first value that did not go out.
                while let Some(Some(written)) = in_flight.next().now_or_never() {
                    written.map_err(ServeFailure::Send)?;
                }
            }
            while let Some(written) = in_flight.next().await {
                written.map_err(ServeFailure::Send)?;
            }
            Ok::<(), ServeFailure>(())
        })
    };

    let terminal = match producer.await {
        Ok(Ok(())) => Message::with_qualifier(qualifier::ON_COMPLETED)
            .maybe_correlation_id(correlation_id.clone())
            .build(),
        Ok(Err(ServeFailure::Handler(error))) => {
            inner.counters.failed.fetch_add(1, Ordering::Relaxed);
            warn!(qualifier = %request_qualifier, %sender, %error, "handler failed");
            failure_message(correlation_id.clone(), error.message())
        }
        Ok(Err(ServeFailure::Send(error))) => {
            inner.counters.failed.fetch_add(1, Ordering::Relaxed);
            warn!(qualifier = %request_qualifier, %sender, %error, "response not sent");
            match &error {
                TransportError::Wire(_) => failure_message(
                    correlation_id.clone(),
                    &format!("response not sent: {error}"),
                ),
                // The connection to the caller is gone; its session fails there.
                _ => return,
            }
        }
        Err(join) if join.is_panic() => {
            inner.counters.failed.fetch_add(1, Ordering::Relaxed);
            warn!(qualifier = %request_qualifier, %sender, "handler panicked");
            failure_message(correlation_id.clone(), "handler panicked")
        }
        Err(_) => {
            debug!(qualifier = %request_qualifier, "handler cancelled");
            return;
        }
    };

    send_terminal(&inner.transport, &sender, terminal, correlation_id.as_deref()).await;
}

/// Why a request ended without its completion.
enum ServeFailure {
    Handler(HandlerError),
    Send(TransportError),
}

fn failure_message(correlation_id: Option<String>, description: &str) -> Message {
    let data = ErrorData {
        message: description.to_string(),
    };
    let builder = Message::with_qualifier(qualifier::ON_ERROR).maybe_correlation_id(correlation_id);
    match JsonCodec.encode(&data) {
        Ok(payload) => builder.payload(payload).build(),
        Err(e) => {
            warn!(error = %e, "cannot encode failure payload");
            builder.build()
        }
    }
}

async fn send_terminal(
    transport: &Transport,
    sender: &Address,
    terminal: Message,
    correlation_id: Option<&str>,
) {
    let qualifier = terminal.qualifier().to_string();
    if let Err(error) = transport.send(sender, terminal).await {
        debug!(%sender, ?correlation_id, %qualifier, %error, "terminal message not delivered");
    }
}

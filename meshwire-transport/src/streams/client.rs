//! Client side of the stream protocol.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use meshwire_core::{Address, CorrelationIdGenerator, Message};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::call::Call;
use super::error::StreamError;
use super::session::{CallState, Routed, SessionEntry, SessionTable, SharedState};
use crate::error::TransportError;
use crate::transport::{ConnectionEvent, Transport};

/// Client processor settings.
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    /// Deadline for a call's terminal event. `None` waits forever.
    pub timeout: Option<Duration>,
}

impl ClientConfig {
    /// Fail calls that see no terminal event within `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

struct ClientInner {
    transport: Transport,
    config: ClientConfig,
    ids: CorrelationIdGenerator,
    sessions: Arc<SessionTable>,
    next_token: AtomicU64,
    closed: AtomicBool,
    router: Mutex<Option<JoinHandle<()>>>,
}

impl ClientInner {
    fn fail_closed(&self) {
        let failed = self
            .sessions
            .fail_all(&StreamError::Transport(TransportError::Closed));
        if failed > 0 {
            debug!(failed, "failed live calls on close");
        }
    }
}

/// Issues requests and demultiplexes their response streams.
///
/// One router task consumes the transport's inbound messages and hands each
/// one to the call its correlation id names. Cheap to clone.
#[derive(Clone)]
pub struct ClientStreamProcessor {
    inner: Arc<ClientInner>,
}

impl ClientStreamProcessor {
    /// Attach a processor to `transport` and start its router.
    pub fn new(transport: Transport, config: ClientConfig) -> Self {
        let inbound = transport.listen();
        let events = transport.connection_events();
        let runtime = transport.runtime().clone();

        let inner = Arc::new(ClientInner {
            transport,
            config,
            ids: CorrelationIdGenerator::new(),
            sessions: Arc::new(SessionTable::new()),
            next_token: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            router: Mutex::new(None),
        });

        let router = runtime.spawn(route_responses(
            Arc::clone(&inner.sessions),
            inbound,
            events,
        ));
        *inner
            .router
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(router);

        Self { inner }
    }

    /// Send `message` to `address` and return the stream of its responses.
    ///
    /// Without a correlation id the message gets a fresh one. A caller-chosen
    /// id that a live call already uses fails the call immediately with
    /// [`StreamError::DuplicateCorrelationId`].
    pub fn invoke(&self, address: &Address, message: Message) -> Call {
        self.invoke_inner(address, message, self.inner.config.timeout)
    }

    /// [`invoke`](Self::invoke) with a timeout for this call only.
    pub fn invoke_with_timeout(
        &self,
        address: &Address,
        message: Message,
        timeout: Duration,
    ) -> Call {
        self.invoke_inner(address, message, Some(timeout))
    }

    fn invoke_inner(
        &self,
        address: &Address,
        message: Message,
        timeout: Option<Duration>,
    ) -> Call {
        let supplied = message.correlation_id().map(str::to_string);
        let (correlation_id, message) = match supplied {
            Some(id) => (id, message),
            None => {
                let id = self.inner.ids.next_id();
                let message = message.to_builder().correlation_id(id.clone()).build();
                (id, message)
            }
        };

        if self.inner.closed.load(Ordering::SeqCst) {
            return Call::failed(correlation_id, TransportError::Closed.into());
        }

        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);
        let state = SharedState::new(CallState::Sent);
        let (sink, events) = mpsc::unbounded_channel();
        let entry = SessionEntry {
            token,
            connection: None,
            sink,
            state: Arc::clone(&state),
            timer: None,
        };
        if self
            .inner
            .sessions
            .insert(correlation_id.clone(), entry)
            .is_err()
        {
            debug!(%correlation_id, "correlation id already in use");
            return Call::failed(
                correlation_id.clone(),
                StreamError::DuplicateCorrelationId { correlation_id },
            );
        }

        let call = Call::new(
            correlation_id.clone(),
            token,
            events,
            state,
            Arc::downgrade(&self.inner.sessions),
        );
        trace!(%correlation_id, %address, qualifier = message.qualifier(), "invoking");

        let runtime = self.inner.transport.runtime();
        if let Some(after) = timeout {
            let sessions = Arc::clone(&self.inner.sessions);
            let id = correlation_id.clone();
            let timer = runtime.spawn(async move {
                tokio::time::sleep(after).await;
                if sessions.fail(&id, token, StreamError::Timeout { after }) {
                    debug!(correlation_id = %id, ?after, "call timed out");
                }
            });
            self.inner
                .sessions
                .set_timer(&correlation_id, token, timer.abort_handle());
        }

        let sent = self.inner.transport.send(address, message);
        let sessions = Arc::clone(&self.inner.sessions);
        let transport = self.inner.transport.clone();
        let address = address.clone();
        runtime.spawn(async move {
            match sent.written_on().await {
                Ok(Some(connection)) => {
                    // The router only fails sessions bound before it saw the
                    // disconnect, so check for one it may have missed.
                    if sessions.bind_connection(&correlation_id, token, connection)
                        && !transport.is_connection_open(&address, connection)
                    {
                        let error = TransportError::io(&address, "connection lost");
                        sessions.fail(&correlation_id, token, error.into());
                    }
                }
                Ok(None) => {}
                Err(error) => {
                    sessions.fail(&correlation_id, token, error.into());
                }
            }
        });

        call
    }

    /// Number of calls awaiting their terminal event.
    pub fn active_calls(&self) -> usize {
        self.inner.sessions.len()
    }

    /// The transport requests are sent on.
    pub fn transport(&self) -> &Transport {
        &self.inner.transport
    }

    /// Fail every live call with a `Closed` transport error and stop routing.
    ///
    /// Later invocations fail the same way. The transport stays open.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(router) = self
            .inner
            .router
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            router.abort();
        }
        self.inner.fail_closed();
    }

    /// Whether [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        if let Some(router) = self
            .router
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            router.abort();
        }
        self.fail_closed();
    }
}

async fn route_responses(
    sessions: Arc<SessionTable>,
    mut inbound: crate::Subscription<crate::Inbound>,
    mut events: crate::Subscription<ConnectionEvent>,
) {
    let mut events_open = true;
    loop {
        tokio::select! {
            // Responses published before a disconnect must be routed first.
            biased;

            next = inbound.recv() => {
                let Some(inbound) = next else {
                    break;
                };
                let correlation_id = inbound.message.correlation_id().map(str::to_string);
                match sessions.route(inbound.message) {
                    Routed::Value | Routed::Terminal => {}
                    Routed::Unknown => {
                        debug!(
                            sender = %inbound.sender,
                            correlation_id = ?correlation_id,
                            "discarding response for unknown or finished call"
                        );
                    }
                }
            }

            event = events.recv(), if events_open => match event {
                Some(ConnectionEvent::Disconnected { address, connection, error }) => {
                    let error = StreamError::Transport(error);
                    let failed = sessions.fail_connection(connection, &error);
                    if failed > 0 {
                        debug!(%address, connection, failed, "connection lost, failed calls");
                    }
                }
                Some(ConnectionEvent::Connected { .. }) => {}
                None => events_open = false,
            },
        }
    }

    let failed = sessions.fail_all(&StreamError::Transport(TransportError::Closed));
    debug!(failed, "response router stopped");
}

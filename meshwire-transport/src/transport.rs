//! Transport: the node's listen endpoint plus its outbound connections.
//!
//! Sends never await: `send` serializes the message, asks the network
//! emulator for a verdict, then queues the frame on the connection for the
//! destination (opening one if needed) and returns a [`SendFuture`] for the
//! outcome. Inbound messages from every connection are multicast to
//! [`listen`](Transport::listen) subscriptions.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use meshwire_core::{Address, Message};
use tokio::net::TcpListener;
use tokio::runtime::Handle;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::TransportConfig;
use crate::connection::{
    run_inbound, run_outbound, wait_for_shutdown, ConnectionContext, ConnectionMetrics,
    ConnectionState, Outbound,
};
use crate::emulator::{NetworkEmulator, NetworkSettings, Verdict};
use crate::error::{TransportError, TransportResult};
use crate::fanout::{Fanout, Subscription};
use crate::listen::{bind_listener, resolve_listen_ip};
use crate::pool::Acquired;
use crate::send::SendFuture;
use crate::wire::serialize_frame_with_limit;

/// How long `stop` waits for connection tasks before aborting them.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// A message received from a remote node.
#[derive(Debug, Clone)]
pub struct Inbound {
    /// Listen address of the sender, or its socket address when it has none.
    pub sender: Address,
    /// The message as received.
    pub message: Message,
}

/// Connection lifecycle notifications.
///
/// `connection` identifies one socket; a later connection to the same
/// address gets a new id.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// A connection to this address became usable.
    Connected {
        /// Remote end.
        address: Address,
        /// Connection id.
        connection: u64,
    },
    /// The connection to this address ended.
    Disconnected {
        /// Remote end.
        address: Address,
        /// Connection id.
        connection: u64,
        /// Why it ended.
        error: TransportError,
    },
}

/// Counters over the transport's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    /// Sends accepted by [`Transport::send`].
    pub sends: u64,
    /// Sends discarded by the network emulator.
    pub emulator_drops: u64,
    /// Outbound connections opened.
    pub connections_opened: u64,
    /// Inbound connections accepted.
    pub connections_accepted: u64,
}

#[derive(Default)]
struct StatsCounters {
    sends: AtomicU64,
    emulator_drops: AtomicU64,
    connections_opened: AtomicU64,
    connections_accepted: AtomicU64,
}

struct TransportInner {
    ctx: Arc<ConnectionContext>,
    emulator: NetworkEmulator,
    runtime: Handle,
    shutdown: watch::Sender<bool>,
    stopped: AtomicBool,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stats: StatsCounters,
}

impl TransportInner {
    fn spawn_tracked<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = self.runtime.spawn(task);
        let mut tasks = self
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    /// Queue a frame on the connection for `address`, opening one if needed.
    fn enqueue(&self, address: &Address, outbound: Outbound) {
        let mut outbound = outbound;
        // A connection torn down between acquire and enqueue has already left
        // the pool, so one retry reaches a fresh connection.
        for _ in 0..2 {
            let connection = match self.ctx.pool.acquire(address) {
                Ok(Acquired::Existing(connection)) => connection,
                Ok(Acquired::Created(connection, rx)) => {
                    self.stats.connections_opened.fetch_add(1, Ordering::Relaxed);
                    debug!(id = connection.id(), %address, "opening connection");
                    self.spawn_tracked(run_outbound(
                        Arc::clone(&connection),
                        rx,
                        Arc::clone(&self.ctx),
                    ));
                    connection
                }
                Err(e) => {
                    outbound.complete(Err(e));
                    return;
                }
            };
            match connection.enqueue(outbound) {
                Ok(()) => return,
                Err(returned) => outbound = returned,
            }
        }
        outbound.complete(Err(TransportError::io(
            address,
            "connection closed while queueing",
        )));
    }
}

impl Drop for TransportInner {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

async fn accept_loop(
    inner: Weak<TransportInner>,
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = wait_for_shutdown(&mut shutdown) => break,
            accepted = listener.accept() => {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                match accepted {
                    Ok((stream, peer)) => {
                        inner.stats.connections_accepted.fetch_add(1, Ordering::Relaxed);
                        trace!(%peer, "accepted socket");
                        inner.spawn_tracked(run_inbound(Arc::clone(&inner.ctx), stream, peer));
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        // Avoid spinning on persistent errors such as EMFILE.
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                }
            }
        }
    }
    debug!("accept loop stopped");
}

/// Point-to-point message transport.
///
/// Cheap to clone; clones share the listener, the connection pool and the
/// subscriptions. Must be created inside a tokio runtime, but `send` may be
/// called from any thread afterwards.
///
/// ```no_run
/// use meshwire_transport::{Message, Transport, TransportConfig};
///
/// # async fn demo() -> Result<(), meshwire_transport::TransportError> {
/// let server = Transport::bind(TransportConfig::local_network()).await?;
/// let client = Transport::client(TransportConfig::local_network())?;
///
/// let mut inbound = server.listen();
///
/// let address = server.address().cloned().expect("listening");
/// client.send(&address, Message::from_qualifier("q/hello")).await?;
///
/// let hello = inbound.recv().await.expect("transport running");
/// assert_eq!(hello.message.qualifier(), "q/hello");
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Transport {
    inner: Arc<TransportInner>,
}

impl Transport {
    /// Bind a listening transport.
    ///
    /// # Errors
    ///
    /// `Config` for an invalid listen address or interface, `Bind` when no
    /// port of the configured range is free.
    pub async fn bind(config: TransportConfig) -> TransportResult<Self> {
        let ip = resolve_listen_ip(&config)?;
        let listener = bind_listener(ip, &config).await?;
        let local = listener.local_addr().map_err(|e| TransportError::Bind {
            address: ip.to_string(),
            message: e.to_string(),
        })?;
        let address = Address::from(local);

        let transport = Self::build(config, Some(address.clone()), Handle::current());
        let accept = transport.inner.runtime.spawn(accept_loop(
            Arc::downgrade(&transport.inner),
            listener,
            transport.inner.shutdown.subscribe(),
        ));
        *transport
            .inner
            .accept_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(accept);

        info!(%address, "transport listening");
        Ok(transport)
    }

    /// A transport without a listen endpoint.
    ///
    /// It can still send and receives replies on its own outbound
    /// connections; remote nodes see it under its socket address.
    ///
    /// # Errors
    ///
    /// `Config` when called outside a tokio runtime.
    pub fn client(config: TransportConfig) -> TransportResult<Self> {
        let runtime = Handle::try_current().map_err(|e| {
            TransportError::config(format!("a client transport needs a tokio runtime: {e}"))
        })?;
        debug!("client transport created");
        Ok(Self::build(config, None, runtime))
    }

    fn build(config: TransportConfig, local_address: Option<Address>, runtime: Handle) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let emulator = NetworkEmulator::new(config.use_network_emulator);
        let ctx = Arc::new(ConnectionContext {
            config,
            local_address,
            pool: crate::pool::ConnectionPool::new(),
            inbound: Fanout::new(),
            events: Fanout::new(),
            shutdown: shutdown_rx,
        });
        Self {
            inner: Arc::new(TransportInner {
                ctx,
                emulator,
                runtime,
                shutdown,
                stopped: AtomicBool::new(false),
                accept_task: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
                stats: StatsCounters::default(),
            }),
        }
    }

    /// Local listen address; `None` for a client transport.
    pub fn address(&self) -> Option<&Address> {
        self.inner.ctx.local_address.as_ref()
    }

    pub(crate) fn runtime(&self) -> &Handle {
        &self.inner.runtime
    }

    /// Configuration the transport was created with.
    pub fn config(&self) -> &TransportConfig {
        &self.inner.ctx.config
    }

    /// Send `message` to `address`.
    ///
    /// Never blocks: the frame is queued on the destination's connection in
    /// call order and the returned future reports the outcome. Frames sent
    /// from one thread to one destination are written in call order.
    ///
    /// The future resolves to
    /// - `Ok(())` once the frame is written, or when the emulator drops it
    /// - `Connect` when the connection cannot be established
    /// - `Io` when the connection fails before the frame is written
    /// - `Closed` once the transport is stopped
    /// - `Wire` when the message cannot be framed
    pub fn send(&self, address: &Address, message: Message) -> SendFuture {
        if self.is_stopped() {
            return SendFuture::ready(Err(TransportError::Closed));
        }

        let frame = match serialize_frame_with_limit(&message, self.inner.ctx.config.max_frame_size)
        {
            Ok(frame) => frame,
            Err(e) => return SendFuture::ready(Err(e.into())),
        };
        self.inner.stats.sends.fetch_add(1, Ordering::Relaxed);

        let delay = match self.inner.emulator.evaluate(address) {
            Verdict::Drop => {
                self.inner.stats.emulator_drops.fetch_add(1, Ordering::Relaxed);
                trace!(%address, qualifier = message.qualifier(), "frame dropped by emulator");
                return SendFuture::ready(Ok(()));
            }
            Verdict::Deliver { delay } => delay,
        };

        let (done, rx) = oneshot::channel();
        let outbound = Outbound::new(frame, done);
        if delay.is_zero() {
            self.inner.enqueue(address, outbound);
        } else {
            let inner = Arc::clone(&self.inner);
            let address = address.clone();
            self.inner.runtime.spawn(async move {
                tokio::time::sleep(delay).await;
                inner.enqueue(&address, outbound);
            });
        }
        SendFuture::pending(rx)
    }

    /// Subscribe to every message received from now on.
    ///
    /// Each subscription has its own unbounded backlog and ends once the
    /// transport is stopped and the backlog is drained.
    pub fn listen(&self) -> Subscription<Inbound> {
        self.inner.ctx.inbound.subscribe()
    }

    /// Run `callback` for every received message on a dedicated task.
    ///
    /// A callback that returns an error or panics ends its own subscription
    /// only; other subscribers keep receiving.
    pub fn subscribe<F, E>(&self, mut callback: F) -> JoinHandle<()>
    where
        F: FnMut(Inbound) -> Result<(), E> + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        let mut subscription = self.listen();
        self.inner.runtime.spawn(async move {
            while let Some(inbound) = subscription.recv().await {
                let qualifier = inbound.message.qualifier().to_string();
                match std::panic::catch_unwind(AssertUnwindSafe(|| callback(inbound))) {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        warn!(%qualifier, error = %e, "subscriber failed, unsubscribing");
                        return;
                    }
                    Err(_) => {
                        warn!(%qualifier, "subscriber panicked, unsubscribing");
                        return;
                    }
                }
            }
        })
    }

    /// Subscribe to connection lifecycle events.
    pub fn connection_events(&self) -> Subscription<ConnectionEvent> {
        self.inner.ctx.events.subscribe()
    }

    /// Stop the transport.
    ///
    /// Closes the listener and every connection, fails queued sends with
    /// `Closed` and completes all subscriptions. Later sends fail with
    /// `Closed`. Calling it again does nothing.
    pub async fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(address = ?self.address(), "stopping transport");

        let open = self.inner.ctx.pool.close();
        self.inner.shutdown.send_replace(true);

        let accept = self
            .inner
            .accept_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(accept) = accept {
            let _ = accept.await;
        }

        let tasks = std::mem::take(
            &mut *self
                .inner
                .tasks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        let aborts: Vec<_> = tasks.iter().map(|task| task.abort_handle()).collect();
        if tokio::time::timeout(STOP_GRACE, futures::future::join_all(tasks))
            .await
            .is_err()
        {
            warn!(
                remaining = aborts.len(),
                "connection tasks did not finish in time, aborting"
            );
            for abort in aborts {
                abort.abort();
            }
        }

        self.inner.ctx.inbound.close();
        self.inner.ctx.events.close();
        debug!(connections = open.len(), "transport stopped");
    }

    /// Whether [`stop`](Self::stop) was called.
    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// The network emulator interposed on outbound frames.
    pub fn network_emulator(&self) -> &NetworkEmulator {
        &self.inner.emulator
    }

    /// Drop every frame sent to `address` while still reporting success.
    pub fn block(&self, address: &Address) {
        self.inner.emulator.block(address);
    }

    /// Deliver frames to `address` again.
    pub fn unblock(&self, address: &Address) {
        self.inner.emulator.unblock(address);
    }

    /// Loss and latency for frames sent to `address`.
    pub fn set_network_settings(&self, address: &Address, settings: NetworkSettings) {
        self.inner.emulator.set_network_settings(address, settings);
    }

    /// Loss and latency for destinations without their own settings.
    pub fn set_default_network_settings(&self, settings: NetworkSettings) {
        self.inner.emulator.set_default_network_settings(settings);
    }

    /// Metrics of the pooled connection to `address`.
    pub fn connection_metrics(&self, address: &Address) -> Option<ConnectionMetrics> {
        self.inner
            .ctx
            .pool
            .get(address)
            .map(|connection| connection.metrics())
    }

    /// State of the pooled connection to `address`.
    pub fn connection_state(&self, address: &Address) -> Option<ConnectionState> {
        self.inner
            .ctx
            .pool
            .get(address)
            .map(|connection| connection.state())
    }

    /// Whether connection `id` is still the live pooled connection to
    /// `address`.
    pub(crate) fn is_connection_open(&self, address: &Address, id: u64) -> bool {
        self.inner
            .ctx
            .pool
            .get(address)
            .is_some_and(|connection| connection.id() == id && !connection.is_closed())
    }

    /// Number of pooled connections.
    pub fn connection_count(&self) -> usize {
        self.inner.ctx.pool.len()
    }

    /// Lifetime counters.
    pub fn stats(&self) -> TransportStats {
        let stats = &self.inner.stats;
        TransportStats {
            sends: stats.sends.load(Ordering::Relaxed),
            emulator_drops: stats.emulator_drops.load(Ordering::Relaxed),
            connections_opened: stats.connections_opened.load(Ordering::Relaxed),
            connections_accepted: stats.connections_accepted.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("address", &self.address())
            .field("connections", &self.connection_count())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

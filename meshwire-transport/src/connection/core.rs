//! Connection handle and the task that owns its socket.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use meshwire_core::{qualifier, Address, Message};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, trace, warn};

use super::{ConnectionMetrics, ConnectionState, LISTEN_ADDRESS_HEADER};
use crate::config::TransportConfig;
use crate::error::{TransportError, TransportResult};
use crate::fanout::Fanout;
use crate::pool::ConnectionPool;
use crate::transport::{ConnectionEvent, Inbound};
use crate::wire::{serialize_frame_with_limit, try_deserialize_frame_with_limit};

/// Upper bound of bytes coalesced into one socket write.
const MAX_BATCH_BYTES: usize = 256 * 1024;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// A serialized frame waiting for the socket, with its completion.
///
/// A written frame completes with the id of the connection that carried it.
pub(crate) struct Outbound {
    frame: Vec<u8>,
    done: Option<oneshot::Sender<TransportResult<u64>>>,
}

impl Outbound {
    pub(crate) fn new(frame: Vec<u8>, done: oneshot::Sender<TransportResult<u64>>) -> Self {
        Self {
            frame,
            done: Some(done),
        }
    }

    pub(crate) fn complete(mut self, result: TransportResult<u64>) {
        if let Some(done) = self.done.take() {
            // Receiver gone means the caller did not wait for the outcome.
            let _ = done.send(result);
        }
    }
}

/// Which side opened the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    Outbound,
    Inbound,
}

struct ConnectionShared {
    state: ConnectionState,
    metrics: ConnectionMetrics,
}

/// Shared handle to one connection.
///
/// Senders only ever touch the queue; the socket belongs to the connection
/// task.
pub(crate) struct Connection {
    id: u64,
    remote: Address,
    direction: Direction,
    queue: mpsc::UnboundedSender<Outbound>,
    shared: Mutex<ConnectionShared>,
}

impl Connection {
    /// New connection handle and the receiving end of its queue.
    pub(crate) fn new(
        remote: Address,
        direction: Direction,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Outbound>) {
        let (queue, rx) = mpsc::unbounded_channel();
        let connection = Arc::new(Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            remote,
            direction,
            queue,
            shared: Mutex::new(ConnectionShared {
                state: ConnectionState::Connecting,
                metrics: ConnectionMetrics::new(),
            }),
        });
        (connection, rx)
    }

    fn lock(&self) -> MutexGuard<'_, ConnectionShared> {
        self.shared
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn remote(&self) -> &Address {
        &self.remote
    }

    pub(crate) fn direction(&self) -> Direction {
        self.direction
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.lock().state
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state().is_closed()
    }

    pub(crate) fn metrics(&self) -> ConnectionMetrics {
        self.lock().metrics.clone()
    }

    fn set_state(&self, state: ConnectionState) {
        let mut shared = self.lock();
        if shared.state != state {
            trace!(id = self.id, remote = %self.remote, from = ?shared.state, to = ?state, "connection state");
            shared.state = state;
        }
    }

    fn mark_connected(&self) {
        let mut shared = self.lock();
        shared.state = ConnectionState::Connected;
        shared.metrics.record_connected();
    }

    /// Queue a frame. Hands it back when the connection task is gone.
    pub(crate) fn enqueue(&self, outbound: Outbound) -> Result<(), Outbound> {
        self.queue.send(outbound).map_err(|returned| returned.0)?;
        self.lock().metrics.record_frame_queued();
        Ok(())
    }
}

/// Everything a connection task needs from its transport.
pub(crate) struct ConnectionContext {
    pub(crate) config: TransportConfig,
    pub(crate) local_address: Option<Address>,
    pub(crate) pool: ConnectionPool,
    pub(crate) inbound: Fanout<Inbound>,
    pub(crate) events: Fanout<ConnectionEvent>,
    pub(crate) shutdown: watch::Receiver<bool>,
}

impl ConnectionContext {
    fn hello_frame(&self) -> TransportResult<Vec<u8>> {
        let mut hello = Message::with_qualifier(qualifier::HELLO);
        if let Some(address) = &self.local_address {
            hello = hello.header(LISTEN_ADDRESS_HEADER, address.to_string());
        }
        Ok(serialize_frame_with_limit(
            &hello.build(),
            self.config.max_frame_size,
        )?)
    }
}

/// Resolves once the transport is stopping.
pub(crate) async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    // A dropped sender means the transport is gone.
    let _ = shutdown.wait_for(|stopped| *stopped).await;
}

/// Backoff between connect attempts of one acquire.
#[derive(Debug, Clone)]
struct ReconnectState {
    /// Delay before the next attempt
    current_delay: Duration,

    /// Consecutive failed attempts
    failure_count: u32,
}

impl ReconnectState {
    fn new(initial_delay: Duration) -> Self {
        Self {
            current_delay: initial_delay,
            failure_count: 0,
        }
    }

    /// Count a failure and return how long to wait before retrying.
    fn record_failure(&mut self, max_delay: Duration) -> Duration {
        self.failure_count += 1;
        let delay = self.current_delay;
        self.current_delay = std::cmp::min(self.current_delay * 2, max_delay);
        delay
    }
}

/// Connect to the remote address, retrying with exponential backoff.
async fn establish_connection(
    connection: &Connection,
    config: &TransportConfig,
) -> TransportResult<TcpStream> {
    let remote = connection.remote();
    let target = remote.connect_target();
    let mut reconnect = ReconnectState::new(config.initial_reconnect_delay);

    loop {
        connection.lock().metrics.record_connection_attempt();

        let error = match tokio::time::timeout(
            config.connect_timeout,
            TcpStream::connect(target.as_str()),
        )
        .await
        {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(e)) => TransportError::connect(remote, &e),
            Err(_) => TransportError::connect(
                remote,
                &io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("timed out after {:?}", config.connect_timeout),
                ),
            ),
        };

        let delay = reconnect.record_failure(config.max_reconnect_delay);
        connection
            .lock()
            .metrics
            .record_connection_failure(reconnect.current_delay);

        if reconnect.failure_count >= config.max_connect_attempts {
            return Err(error);
        }
        debug!(%remote, attempt = reconnect.failure_count, ?delay, %error, "connect failed, retrying");
        tokio::time::sleep(delay).await;
    }
}

/// Drive an outbound connection: connect, say hello, then service the socket.
pub(crate) async fn run_outbound(
    connection: Arc<Connection>,
    rx: mpsc::UnboundedReceiver<Outbound>,
    ctx: Arc<ConnectionContext>,
) {
    let mut shutdown = ctx.shutdown.clone();
    let connected = tokio::select! {
        biased;

        _ = wait_for_shutdown(&mut shutdown) => Err(TransportError::Closed),
        result = establish_connection(&connection, &ctx.config) => result,
    };

    let stream = match connected {
        Ok(stream) => stream,
        Err(error) => {
            teardown(&connection, &ctx, rx, error);
            return;
        }
    };

    let hello = match ctx.hello_frame() {
        Ok(hello) => hello,
        Err(error) => {
            teardown(&connection, &ctx, rx, error);
            return;
        }
    };

    connection.mark_connected();
    debug!(id = connection.id(), remote = %connection.remote(), "connection established");
    ctx.events.publish(ConnectionEvent::Connected {
        address: connection.remote().clone(),
        connection: connection.id(),
    });

    run_io(connection, ctx, stream, rx, Vec::new(), Some(hello)).await;
}

/// Drive an accepted connection: identify the peer, register, then service
/// the socket.
pub(crate) async fn run_inbound(ctx: Arc<ConnectionContext>, mut stream: TcpStream, peer: SocketAddr) {
    let peer_address = Address::from(peer);
    let mut shutdown = ctx.shutdown.clone();
    let mut read_buffer = Vec::new();

    let handshake = tokio::select! {
        _ = wait_for_shutdown(&mut shutdown) => return,
        result = tokio::time::timeout(
            ctx.config.connect_timeout,
            read_first_frame(&mut stream, &mut read_buffer, &ctx.config),
        ) => result,
    };

    let (first, first_size) = match handshake {
        Ok(Ok(first)) => first,
        Ok(Err(e)) => {
            debug!(%peer, error = %e, "inbound handshake failed");
            return;
        }
        Err(_) => {
            debug!(%peer, "inbound handshake timed out");
            return;
        }
    };

    let (remote, pending) = if first.qualifier() == qualifier::HELLO {
        let announced = first
            .header(LISTEN_ADDRESS_HEADER)
            .and_then(|address| Address::parse(address).ok());
        (announced.unwrap_or(peer_address), None)
    } else {
        (peer_address, Some(first))
    };

    let (connection, rx) = Connection::new(remote.clone(), Direction::Inbound);
    connection.mark_connected();
    connection
        .lock()
        .metrics
        .record_frame_received(first_size);

    if ctx.pool.register_if_vacant(&connection) {
        ctx.events.publish(ConnectionEvent::Connected {
            address: remote.clone(),
            connection: connection.id(),
        });
    }
    debug!(id = connection.id(), %remote, %peer, "connection accepted");

    if let Some(message) = pending {
        ctx.inbound.publish(Inbound {
            sender: remote,
            message,
        });
    }

    run_io(connection, ctx, stream, rx, read_buffer, None).await;
}

async fn read_first_frame(
    stream: &mut TcpStream,
    read_buffer: &mut Vec<u8>,
    config: &TransportConfig,
) -> io::Result<(Message, usize)> {
    let mut chunk = vec![0u8; config.read_buffer_size.max(1)];
    loop {
        match try_deserialize_frame_with_limit(read_buffer, config.max_frame_size) {
            Ok(Some((message, consumed))) => {
                read_buffer.drain(..consumed);
                return Ok((message, consumed));
            }
            Ok(None) => {}
            Err(e) => return Err(io::Error::new(io::ErrorKind::InvalidData, e)),
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        read_buffer.extend_from_slice(&chunk[..n]);
    }
}

/// Service an established socket until shutdown or failure.
///
/// Only this task touches the socket. Its write loop drains the queue in
/// order while its read loop runs alongside, so a blocked write never stops
/// inbound frames.
async fn run_io(
    connection: Arc<Connection>,
    ctx: Arc<ConnectionContext>,
    stream: TcpStream,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    mut read_buffer: Vec<u8>,
    hello: Option<Vec<u8>>,
) {
    let remote = connection.remote().clone();
    if ctx.config.tcp_nodelay {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%remote, error = %e, "failed to set TCP_NODELAY");
        }
    }

    let (mut reader, mut writer) = stream.into_split();
    let mut shutdown = ctx.shutdown.clone();

    let failure = 'io: {
        if let Some(hello) = hello {
            if let Err(e) = writer.write_all(&hello).await {
                break 'io TransportError::io(&remote, e.to_string());
            }
        }

        // Bytes that arrived together with the handshake.
        if let Err(e) = process_read_buffer(&connection, &ctx, &mut read_buffer) {
            break 'io e;
        }

        let failed = tokio::select! {
            _ = wait_for_shutdown(&mut shutdown) => None,
            error = write_loop(&connection, &mut writer, &mut rx) => Some(error),
            error = read_loop(&connection, &ctx, &mut reader, &mut read_buffer) => Some(error),
        };
        match failed {
            Some(error) => error,
            None => {
                connection.set_state(ConnectionState::Closing);
                let _ = writer.shutdown().await;
                TransportError::Closed
            }
        }
    };

    teardown(&connection, &ctx, rx, failure);
}

async fn write_loop(
    connection: &Connection,
    writer: &mut OwnedWriteHalf,
    rx: &mut mpsc::UnboundedReceiver<Outbound>,
) -> TransportError {
    while let Some(first) = rx.recv().await {
        if let Err(e) = write_batch(connection, writer, rx, first).await {
            return e;
        }
    }
    TransportError::Closed
}

async fn read_loop(
    connection: &Connection,
    ctx: &ConnectionContext,
    reader: &mut OwnedReadHalf,
    read_buffer: &mut Vec<u8>,
) -> TransportError {
    let remote = connection.remote();
    let mut chunk = vec![0u8; ctx.config.read_buffer_size.max(1)];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => return TransportError::io(remote, "connection closed by peer"),
            Ok(n) => {
                read_buffer.extend_from_slice(&chunk[..n]);
                trace!(%remote, bytes = n, buffered = read_buffer.len(), "read");
                if let Err(e) = process_read_buffer(connection, ctx, read_buffer) {
                    return e;
                }
            }
            Err(e) => return TransportError::io(remote, e.to_string()),
        }
    }
}

/// Write `first` plus whatever else is already queued in one socket write.
async fn write_batch(
    connection: &Connection,
    writer: &mut OwnedWriteHalf,
    rx: &mut mpsc::UnboundedReceiver<Outbound>,
    first: Outbound,
) -> TransportResult<()> {
    let mut buffer = Vec::with_capacity(first.frame.len());
    let mut batch = Vec::new();
    let mut next = Some(first);

    while let Some(mut outbound) = next.take() {
        buffer.extend_from_slice(&outbound.frame);
        // Completion is all that is left to do with it.
        let size = outbound.frame.len();
        outbound.frame = Vec::new();
        batch.push((outbound, size));
        if buffer.len() >= MAX_BATCH_BYTES {
            break;
        }
        next = rx.try_recv().ok();
    }

    match writer.write_all(&buffer).await {
        Ok(()) => {
            {
                let mut shared = connection.lock();
                for (_, size) in &batch {
                    shared.metrics.record_frame_sent(*size);
                }
            }
            trace!(remote = %connection.remote(), frames = batch.len(), bytes = buffer.len(), "wrote batch");
            for (outbound, _) in batch {
                outbound.complete(Ok(connection.id()));
            }
            Ok(())
        }
        Err(e) => {
            let error = TransportError::io(connection.remote(), e.to_string());
            {
                let mut shared = connection.lock();
                for _ in &batch {
                    shared.metrics.record_frame_failed();
                }
            }
            for (outbound, _) in batch {
                outbound.complete(Err(error.clone()));
            }
            Err(error)
        }
    }
}

/// Publish every complete frame in the buffer.
fn process_read_buffer(
    connection: &Connection,
    ctx: &ConnectionContext,
    read_buffer: &mut Vec<u8>,
) -> TransportResult<()> {
    loop {
        match try_deserialize_frame_with_limit(read_buffer, ctx.config.max_frame_size) {
            Ok(Some((message, consumed))) => {
                read_buffer.drain(..consumed);
                connection.lock().metrics.record_frame_received(consumed);

                if message.qualifier() == qualifier::HELLO {
                    trace!(remote = %connection.remote(), "ignoring repeated hello");
                    continue;
                }
                ctx.inbound.publish(Inbound {
                    sender: connection.remote().clone(),
                    message,
                });
            }
            Ok(None) => return Ok(()),
            Err(e) => {
                warn!(remote = %connection.remote(), error = %e, "wire format error, tearing down connection");
                return Err(TransportError::io(
                    connection.remote(),
                    format!("framing error: {e}"),
                ));
            }
        }
    }
}

/// Close the connection and fail everything still queued on it.
fn teardown(
    connection: &Arc<Connection>,
    ctx: &ConnectionContext,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    error: TransportError,
) {
    connection.set_state(ConnectionState::Closed);
    let pooled = ctx.pool.remove_if_same(connection);

    rx.close();
    let mut failed = 0usize;
    while let Ok(outbound) = rx.try_recv() {
        connection.lock().metrics.record_frame_failed();
        outbound.complete(Err(error.clone()));
        failed += 1;
    }

    let remote = connection.remote();
    match &error {
        TransportError::Closed => {
            debug!(id = connection.id(), %remote, failed, "connection closed");
        }
        TransportError::Connect { .. } => {
            warn!(id = connection.id(), %remote, failed, %error, "connection failed");
        }
        _ => {
            debug!(id = connection.id(), %remote, direction = ?connection.direction(), failed, %error, "connection lost");
        }
    }

    if pooled {
        ctx.events.publish(ConnectionEvent::Disconnected {
            address: remote.clone(),
            connection: connection.id(),
            error,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn context(config: TransportConfig) -> (Arc<ConnectionContext>, watch::Sender<bool>) {
        let (shutdown_tx, shutdown) = watch::channel(false);
        let ctx = Arc::new(ConnectionContext {
            config,
            local_address: Some(Address::new("127.0.0.1", 4242)),
            pool: ConnectionPool::new(),
            inbound: Fanout::new(),
            events: Fanout::new(),
            shutdown,
        });
        (ctx, shutdown_tx)
    }

    fn queued(connection: &Connection) -> oneshot::Receiver<TransportResult<u64>> {
        let (tx, rx) = oneshot::channel();
        let frame = serialize_frame_with_limit(&Message::from_qualifier("q/test"), 1024)
            .expect("serialize");
        assert!(connection.enqueue(Outbound::new(frame, tx)).is_ok());
        rx
    }

    #[test]
    fn test_reconnect_backoff_doubles_up_to_max() {
        let mut state = ReconnectState::new(Duration::from_millis(100));
        let max = Duration::from_millis(300);
        assert_eq!(state.record_failure(max), Duration::from_millis(100));
        assert_eq!(state.record_failure(max), Duration::from_millis(200));
        assert_eq!(state.record_failure(max), Duration::from_millis(300));
        assert_eq!(state.record_failure(max), Duration::from_millis(300));
        assert_eq!(state.failure_count, 4);
    }

    #[tokio::test]
    async fn test_connect_failure_fails_queued_sends() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("local addr").port();
        drop(listener);

        let (ctx, _shutdown) = context(TransportConfig::local_network());
        let mut events = ctx.events.subscribe();
        let target = Address::new("127.0.0.1", port);

        let (connection, rx) = match ctx.pool.acquire(&target).expect("acquire") {
            crate::pool::Acquired::Created(connection, rx) => (connection, rx),
            crate::pool::Acquired::Existing(_) => panic!("pool should be empty"),
        };
        let first = queued(&connection);
        let second = queued(&connection);

        run_outbound(Arc::clone(&connection), rx, Arc::clone(&ctx)).await;

        for pending in [first, second] {
            let result = pending.await.expect("completion sent");
            assert!(result.expect_err("connect refused").is_connect());
        }
        assert_eq!(connection.state(), ConnectionState::Closed);
        assert!(ctx.pool.get(&target).is_none());
        assert_eq!(connection.metrics().connection_failures, 1);
        assert!(matches!(
            events.try_recv(),
            Some(ConnectionEvent::Disconnected { connection: id, .. }) if id == connection.id()
        ));
    }

    #[tokio::test]
    async fn test_shutdown_fails_queued_sends_with_closed() {
        let (ctx, shutdown) = context(TransportConfig::local_network());
        shutdown.send_replace(true);

        let target = Address::new("127.0.0.1", 9);
        let (connection, rx) = Connection::new(target, Direction::Outbound);
        let pending = queued(&connection);

        run_outbound(Arc::clone(&connection), rx, ctx).await;

        let result = pending.await.expect("completion sent");
        assert!(result.expect_err("stopped").is_closed());
    }

    #[tokio::test]
    async fn test_hello_identifies_sender() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let server_addr = Address::from(listener.local_addr().expect("local addr"));

        let (server_ctx, _server_shutdown) = context(TransportConfig::local_network());
        let mut inbound = server_ctx.inbound.subscribe();
        let accept_ctx = Arc::clone(&server_ctx);
        tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.expect("accept");
            run_inbound(accept_ctx, stream, peer).await;
        });

        let (client_ctx, _client_shutdown) = context(TransportConfig::local_network());
        let (connection, rx) = Connection::new(server_addr, Direction::Outbound);
        let id = connection.id();
        let sent = queued(&connection);
        tokio::spawn(run_outbound(connection, rx, client_ctx));

        let written_on = sent.await.expect("completion sent").expect("written");
        assert_eq!(written_on, id);
        let arrived = tokio::time::timeout(Duration::from_secs(5), inbound.recv())
            .await
            .expect("timely")
            .expect("open");
        assert_eq!(arrived.sender, Address::new("127.0.0.1", 4242));
        assert_eq!(arrived.message.qualifier(), "q/test");
        assert!(server_ctx.pool.get(&Address::new("127.0.0.1", 4242)).is_some());
    }
}

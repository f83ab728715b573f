//! Integration tests for the transport over loopback TCP.

mod common;

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{init_tracing, number, numbered, recv, WAIT};
use meshwire_transport::{
    Address, ConnectionEvent, ConnectionState, Message, NetworkSettings, Transport,
    TransportConfig,
};

const SENDER_HEADER: &str = "sender";

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_sender_order_preserved() {
    init_tracing();
    let server = common::server().await;
    let address = server.address().cloned().expect("listening");
    let mut inbound = server.listen();
    let client = common::client();

    for i in 0..1000 {
        drop(client.send(&address, numbered("seq", i)));
    }

    for expected in 0..1000 {
        let message = recv(&mut inbound).await;
        assert_eq!(number(&message), expected);
    }

    let metrics = client.connection_metrics(&address).expect("pooled connection");
    assert_eq!(metrics.frames_queued, 1000);
    assert_eq!(client.connection_state(&address), Some(ConnectionState::Connected));

    client.stop().await;
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_senders_keep_their_own_order() {
    init_tracing();
    let server = common::server().await;
    let address = server.address().cloned().expect("listening");
    let mut inbound = server.listen();
    let client = common::client();

    let senders: Vec<_> = (0..4u64)
        .map(|sender| {
            let client = client.clone();
            let address = address.clone();
            tokio::spawn(async move {
                for i in 0..250 {
                    let message = numbered("seq", i)
                        .to_builder()
                        .header(SENDER_HEADER, sender.to_string())
                        .build();
                    client.send(&address, message).await.expect("sent");
                }
            })
        })
        .collect();
    for sender in senders {
        sender.await.expect("sender task");
    }

    let mut next = [0u64; 4];
    for _ in 0..1000 {
        let message = recv(&mut inbound).await;
        let sender: usize = message
            .header(SENDER_HEADER)
            .expect("sender header")
            .parse()
            .expect("sender index");
        assert_eq!(number(&message), next[sender], "sender {sender} out of order");
        next[sender] += 1;
    }
    assert_eq!(next, [250; 4]);

    client.stop().await;
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_echo_stress() {
    init_tracing();
    let server = common::server().await;
    let address = server.address().cloned().expect("listening");

    let echo = server.clone();
    server.subscribe(move |inbound: meshwire_transport::Inbound| {
        drop(echo.send(&inbound.sender, inbound.message));
        Ok::<(), String>(())
    });

    let client = common::client();
    let mut replies = client.listen();
    for i in 0..5000 {
        drop(client.send(&address, numbered("echo", i)));
    }

    for expected in 0..5000 {
        let message = recv(&mut replies).await;
        assert_eq!(number(&message), expected);
    }
    assert_eq!(server.stats().connections_accepted, 1);
    assert_eq!(client.stats().connections_opened, 1);

    client.stop().await;
    server.stop().await;
}

/// Address of a port nobody listens on.
async fn unused_address() -> Address {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind a free port");
    let address = Address::from(listener.local_addr().expect("local addr"));
    drop(listener);
    address
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_send_to_unreachable_address_fails_each_time() {
    init_tracing();
    let client = common::client();
    let mut events = client.connection_events();
    let address = unused_address().await;

    for attempt in 0..10 {
        let err = client
            .send(&address, Message::from_qualifier("nobody"))
            .await
            .expect_err("nobody listens");
        assert!(err.is_connect(), "attempt {attempt}: {err}");
    }

    let event = tokio::time::timeout(WAIT, events.recv())
        .await
        .expect("event in time")
        .expect("transport running");
    assert!(matches!(
        event,
        ConnectionEvent::Disconnected { address: ref a, ref error, .. } if *a == address && error.is_connect()
    ));

    // A listener appearing later is reached by the next send.
    let server = Transport::bind(
        TransportConfig::local_network()
            .with_port(address.port())
            .with_port_auto_increment(false),
    )
    .await;
    if let Ok(server) = server {
        let mut inbound = server.listen();
        client
            .send(&address, Message::from_qualifier("late"))
            .await
            .expect("reachable now");
        assert_eq!(recv(&mut inbound).await.qualifier(), "late");
        server.stop().await;
    }
    client.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_emulated_loss_drops_about_half() {
    init_tracing();
    let server = common::server().await;
    let address = server.address().cloned().expect("listening");
    let mut inbound = server.listen();

    let client = common::emulated_client();
    client.set_network_settings(&address, NetworkSettings::new(50, Duration::ZERO));

    for i in 0..1000 {
        client
            .send(&address, numbered("lossy", i))
            .await
            .expect("dropped frames still succeed");
    }

    let dropped = client.stats().emulator_drops;
    assert!(dropped > 0, "nothing dropped");
    let delivered = 1000 - dropped;
    assert!(delivered < 550, "{delivered} of 1000 delivered at 50% loss");

    let mut last = None;
    for _ in 0..delivered {
        let value = number(&recv(&mut inbound).await);
        assert!(last.map_or(true, |last| value > last), "delivered out of order");
        last = Some(value);
    }
    assert!(inbound.try_recv().is_none());

    client.stop().await;
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_emulated_zero_loss_delivers_everything() {
    init_tracing();
    let server = common::server().await;
    let address = server.address().cloned().expect("listening");
    let mut inbound = server.listen();

    let client = common::emulated_client();
    client.set_network_settings(&address, NetworkSettings::NONE);

    for i in 0..1000 {
        drop(client.send(&address, numbered("lossless", i)));
    }
    for expected in 0..1000 {
        assert_eq!(number(&recv(&mut inbound).await), expected);
    }
    assert_eq!(client.stats().emulator_drops, 0);

    client.stop().await;
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_block_and_unblock() {
    init_tracing();
    let server = common::server().await;
    let address = server.address().cloned().expect("listening");
    let mut inbound = server.listen();

    let client = common::emulated_client();
    client
        .send(&address, numbered("before", 0))
        .await
        .expect("sent");
    assert_eq!(recv(&mut inbound).await.qualifier(), "before");

    client.block(&address);
    for i in 0..10 {
        client
            .send(&address, numbered("blocked", i))
            .await
            .expect("blocked sends report success");
    }
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(inbound.try_recv().is_none(), "blocked frame delivered");
    // Blocking drops frames but leaves the earlier connection alone.
    assert_eq!(client.connection_count(), 1);
    assert_eq!(client.connection_state(&address), Some(ConnectionState::Connected));

    client.unblock(&address);
    client
        .send(&address, numbered("unblocked", 10))
        .await
        .expect("sent");
    let message = recv(&mut inbound).await;
    assert_eq!(message.qualifier(), "unblocked");

    client.stop().await;
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_binds_get_distinct_ports() {
    init_tracing();
    // Somewhere in the upper half of the non-ephemeral range.
    let base = 20_000 + (std::process::id() % 200) as u16 * 50;
    let config = TransportConfig::local_network()
        .with_port(base)
        .with_port_count(100);

    // One task per bind so the attempts run in parallel on the workers.
    let binds: Vec<_> = (0..30)
        .map(|_| tokio::spawn(Transport::bind(config.clone())))
        .collect();
    let mut transports = Vec::with_capacity(binds.len());
    for bind in binds {
        transports.push(bind.await.expect("bind task").expect("bind within range"));
    }

    let ports: HashSet<u16> = transports
        .iter()
        .map(|t| t.address().expect("listening").port())
        .collect();
    assert_eq!(ports.len(), 30);
    assert!(ports.iter().all(|port| (base..base + 100).contains(port)));

    for transport in transports {
        transport.stop().await;
    }
}

#[tokio::test]
async fn test_invalid_listen_configuration() {
    init_tracing();
    let configs = [
        TransportConfig::default().with_listen_address("not-an-ip"),
        TransportConfig::default().with_listen_address("0.0.0.0"),
        TransportConfig::default()
            .with_listen_address("127.0.0.1")
            .with_listen_interface("lo"),
        TransportConfig::default().with_listen_interface("no-such-interface0"),
    ];
    for config in configs {
        let err = Transport::bind(config.clone())
            .await
            .expect_err("invalid configuration");
        assert!(err.is_config(), "{config:?}: {err}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failing_subscriber_does_not_affect_others() {
    init_tracing();
    let server = common::server().await;
    let address = server.address().cloned().expect("listening");

    let failing = server.subscribe(|_inbound| Err::<(), _>("cannot handle"));
    let panicking = server.subscribe(|_inbound| -> Result<(), String> { panic!("subscriber bug") });
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&seen);
    let healthy = server.subscribe(move |_inbound| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok::<(), String>(())
    });

    let client = common::client();
    for i in 0..3 {
        client.send(&address, numbered("fanout", i)).await.expect("sent");
    }

    tokio::time::timeout(WAIT, failing)
        .await
        .expect("failing subscriber ends")
        .expect("no panic escapes");
    tokio::time::timeout(WAIT, panicking)
        .await
        .expect("panicking subscriber ends")
        .expect("panic is contained");

    tokio::time::timeout(WAIT, async {
        while seen.load(Ordering::SeqCst) < 3 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("healthy subscriber sees every message");
    assert!(!healthy.is_finished());

    client.stop().await;
    server.stop().await;
    tokio::time::timeout(WAIT, healthy)
        .await
        .expect("subscriber completes on stop")
        .expect("clean exit");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stop_completes_subscriptions_and_fails_sends() {
    init_tracing();
    let server = common::server().await;
    let address = server.address().cloned().expect("listening");
    let mut inbound = server.listen();
    let mut events = server.connection_events();

    server.stop().await;
    server.stop().await;
    assert!(server.is_stopped());
    assert!(inbound.recv().await.is_none());
    assert!(events.recv().await.is_none());

    let err = server
        .send(&address, Message::from_qualifier("late"))
        .await
        .expect_err("stopped");
    assert!(err.is_closed());

    let client = common::client();
    let err = client
        .send(&address, Message::from_qualifier("late"))
        .await
        .expect_err("listener gone");
    assert!(err.is_connect(), "{err}");
    client.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_peer_stop_publishes_disconnect() {
    init_tracing();
    let server = common::server().await;
    let address = server.address().cloned().expect("listening");
    let client = common::client();
    let mut events = client.connection_events();

    client
        .send(&address, Message::from_qualifier("hello"))
        .await
        .expect("sent");
    let connected = tokio::time::timeout(WAIT, events.recv())
        .await
        .expect("event in time")
        .expect("running");
    let opened = match connected {
        ConnectionEvent::Connected {
            address: ref a,
            connection,
        } if *a == address => connection,
        other => panic!("unexpected event: {other:?}"),
    };

    server.stop().await;

    let disconnected = tokio::time::timeout(Duration::from_secs(3), events.recv())
        .await
        .expect("disconnect noticed")
        .expect("running");
    assert!(matches!(
        disconnected,
        ConnectionEvent::Disconnected { address: ref a, connection, .. }
            if *a == address && connection == opened
    ));
    assert_eq!(client.connection_count(), 0);
    client.stop().await;
}

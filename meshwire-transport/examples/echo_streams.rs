//! Echo Streams Example: request/response streams over real TCP.
//!
//! Runs a server and a client in one process, or as two processes:
//!
//! ```bash
//! # Both sides in one process
//! cargo run --example echo_streams
//!
//! # Terminal 1 - Start the server
//! cargo run --example echo_streams -- server
//!
//! # Terminal 2 - Run the client
//! cargo run --example echo_streams -- client
//! ```
//!
//! The server registers three handlers:
//! - `greeting/hello` answers with one value
//! - `counter` streams as many values as the request asks for
//! - `greeting` fails, and serves any `greeting/...` without its own handler

use std::env;
use std::time::Duration;

use futures::stream;
use meshwire_transport::{
    Address, ClientConfig, ClientStreamProcessor, HandlerError, HandlerSet, JsonCodec, Message,
    MessageCodec, ServerStreamProcessor, Transport, TransportConfig,
};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

// ============================================================================
// Configuration
// ============================================================================

const SERVER_PORT: u16 = 4700;

// ============================================================================
// Payloads
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct Greeting {
    name: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct Tick {
    seq: u32,
}

fn handlers() -> HandlerSet {
    HandlerSet::new()
        .unary("greeting/hello", |request: Message| async move {
            let greeting: Greeting = request.decode_payload(&JsonCodec)?;
            let reply = Message::builder()
                .encode_payload(&JsonCodec, &format!("hello, {}", greeting.name))?
                .build();
            Ok::<_, HandlerError>(Some(reply))
        })
        .stream("counter", |request: Message| {
            let count: u32 = request.decode_payload(&JsonCodec).unwrap_or(3);
            stream::iter((0..count).map(|seq| -> Result<Message, HandlerError> {
                Ok(Message::from_payload(JsonCodec.encode(&Tick { seq })?))
            }))
        })
        .unary("greeting", |request: Message| async move {
            Err(HandlerError::new(format!(
                "no greeting called {}",
                request.qualifier()
            )))
        })
}

// ============================================================================
// Server
// ============================================================================

async fn start_server() -> Result<(Transport, ServerStreamProcessor), Box<dyn std::error::Error>> {
    let config = TransportConfig::local_network().with_port(SERVER_PORT);
    let transport = Transport::bind(config).await?;
    let processor = ServerStreamProcessor::new(transport.clone());
    processor.create_subscriptions(handlers())?;
    println!("Server listening on {:?}", transport.address());
    Ok((transport, processor))
}

// ============================================================================
// Client
// ============================================================================

async fn run_client(server: &Address) -> Result<(), Box<dyn std::error::Error>> {
    let transport = Transport::client(TransportConfig::local_network())?;
    let client = ClientStreamProcessor::new(
        transport.clone(),
        ClientConfig::default().with_timeout(Duration::from_secs(5)),
    );

    let hello = Message::with_qualifier("greeting/hello")
        .encode_payload(&JsonCodec, &Greeting {
            name: "meshwire".to_string(),
        })?
        .build();
    if let Some(reply) = client.invoke(server, hello).single().await? {
        let text: String = reply.decode_payload(&JsonCodec)?;
        println!("greeting/hello -> {text}");
    }

    let request = Message::with_qualifier("counter")
        .encode_payload(&JsonCodec, &5u32)?
        .build();
    let mut ticks = client.invoke(server, request);
    while let Some(tick) = ticks.next().await {
        let tick: Tick = tick?.decode_payload(&JsonCodec)?;
        println!("counter -> tick {}", tick.seq);
    }

    match client
        .invoke(server, Message::from_qualifier("greeting/goodbye"))
        .single()
        .await
    {
        Ok(reply) => println!("greeting/goodbye -> unexpected {reply:?}"),
        Err(e) => println!("greeting/goodbye -> {e}"),
    }

    client.close();
    transport.stop().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();

    let server_address = Address::new("127.0.0.1", SERVER_PORT);
    match env::args().nth(1).as_deref() {
        Some("server") => {
            let (transport, _processor) = start_server().await?;
            tokio::signal::ctrl_c().await?;
            transport.stop().await;
        }
        Some("client") => run_client(&server_address).await?,
        _ => {
            let (transport, _processor) = start_server().await?;
            let address = transport.address().cloned().unwrap_or(server_address);
            run_client(&address).await?;
            transport.stop().await;
        }
    }
    Ok(())
}

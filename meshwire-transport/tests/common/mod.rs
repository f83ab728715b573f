//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::time::Duration;

use futures::stream;
use meshwire_transport::{
    ClientConfig, ClientStreamProcessor, HandlerError, HandlerSet, JsonCodec, Message,
    MessageCodec, ServerStreamProcessor, Subscription, Transport, TransportConfig,
};
use tracing_subscriber::EnvFilter;

/// Upper bound for anything a test waits on.
pub const WAIT: Duration = Duration::from_secs(10);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

pub async fn server() -> Transport {
    Transport::bind(TransportConfig::local_network())
        .await
        .expect("bind server")
}

pub fn client() -> Transport {
    Transport::client(TransportConfig::local_network()).expect("client transport")
}

pub fn emulated_client() -> Transport {
    Transport::client(TransportConfig::local_network().with_network_emulator(true))
        .expect("client transport")
}

/// Request carrying `value` as its JSON payload.
pub fn numbered(qualifier: &str, value: u64) -> Message {
    Message::with_qualifier(qualifier)
        .encode_payload(&JsonCodec, &value)
        .expect("encode")
        .build()
}

pub fn number(message: &Message) -> u64 {
    message.decode_payload(&JsonCodec).expect("numeric payload")
}

pub async fn recv(subscription: &mut Subscription<meshwire_transport::Inbound>) -> Message {
    tokio::time::timeout(WAIT, subscription.recv())
        .await
        .expect("message in time")
        .expect("transport running")
        .message
}

/// `echo` returns the request, `echoVoid` completes without a value,
/// `echoError` fails, `echoStream` streams `0..n` for a request carrying `n`,
/// `hang` never answers.
pub fn echo_handlers() -> HandlerSet {
    HandlerSet::new()
        .unary("echo", |request: Message| async move { Ok(Some(request)) })
        .unary("echoVoid", |_request: Message| async { Ok(None) })
        .unary("echoError", |_request: Message| async {
            Err(HandlerError::new("echo failed"))
        })
        .stream("echoStream", |request: Message| {
            let count: u64 = request.decode_payload(&JsonCodec).unwrap_or(0);
            stream::iter((0..count).map(|i| -> Result<Message, HandlerError> {
                let payload = JsonCodec.encode(&i)?;
                Ok(Message::from_payload(payload))
            }))
        })
        .stream("hang", |_request: Message| stream::pending())
}

pub struct EchoService {
    pub transport: Transport,
    pub processor: ServerStreamProcessor,
}

impl EchoService {
    pub async fn start() -> Self {
        let transport = server().await;
        let processor = ServerStreamProcessor::new(transport.clone());
        processor
            .create_subscriptions(echo_handlers())
            .expect("register echo handlers");
        Self {
            transport,
            processor,
        }
    }

    pub fn address(&self) -> meshwire_transport::Address {
        self.transport.address().cloned().expect("listening")
    }
}

pub fn stream_client(config: ClientConfig) -> ClientStreamProcessor {
    ClientStreamProcessor::new(client(), config)
}

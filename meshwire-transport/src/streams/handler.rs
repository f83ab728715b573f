//! Request handlers and the set they are registered from.

use std::future::Future;
use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt};
use futures::Stream;
use meshwire_core::{CodecError, Message};

/// Lazy sequence of response values produced for one request.
pub type ResponseStream = BoxStream<'static, Result<Message, HandlerError>>;

/// Failure raised by a handler. Sent to the caller as a failure message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    /// Error with the given description.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Description sent to the caller.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<CodecError> for HandlerError {
    fn from(err: CodecError) -> Self {
        HandlerError::new(err.to_string())
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        HandlerError::new(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        HandlerError::new(message)
    }
}

/// Turns a request into a stream of response values.
///
/// Implemented for every `Fn(Message) -> ResponseStream` closure.
pub trait StreamHandler: Send + Sync + 'static {
    /// Start handling `request`.
    fn handle(&self, request: Message) -> ResponseStream;
}

impl<F> StreamHandler for F
where
    F: Fn(Message) -> ResponseStream + Send + Sync + 'static,
{
    fn handle(&self, request: Message) -> ResponseStream {
        self(request)
    }
}

/// Handlers keyed by qualifier, registered together by
/// [`ServerStreamProcessor::create_subscriptions`](crate::ServerStreamProcessor::create_subscriptions).
///
/// ```
/// use futures::stream;
/// use meshwire_transport::{HandlerSet, Message};
///
/// let handlers = HandlerSet::new()
///     .unary("greeting/hello", |request: Message| async move {
///         Ok(Some(request.to_builder().payload("hello").build()))
///     })
///     .stream("quotes/ticks", |request: Message| {
///         stream::iter((0..3).map(move |_| Ok(request.clone())))
///     });
/// assert_eq!(handlers.len(), 2);
/// ```
#[derive(Default)]
pub struct HandlerSet {
    handlers: Vec<(String, Arc<dyn StreamHandler>)>,
}

impl HandlerSet {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a [`StreamHandler`] for `qualifier`.
    pub fn handler(mut self, qualifier: impl Into<String>, handler: impl StreamHandler) -> Self {
        self.handlers.push((qualifier.into(), Arc::new(handler)));
        self
    }

    /// Register a handler producing any stream of values.
    pub fn stream<F, S>(self, qualifier: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Message) -> S + Send + Sync + 'static,
        S: Stream<Item = Result<Message, HandlerError>> + Send + 'static,
    {
        self.handler(qualifier, move |request: Message| -> ResponseStream {
            handler(request).boxed()
        })
    }

    /// Register a handler producing at most one value.
    ///
    /// `Ok(None)` completes the stream without a value.
    pub fn unary<F, Fut>(self, qualifier: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Message>, HandlerError>> + Send + 'static,
    {
        self.handler(qualifier, move |request: Message| -> ResponseStream {
            stream::once(handler(request))
                .filter_map(|result| futures::future::ready(result.transpose()))
                .boxed()
        })
    }

    /// Registered qualifiers, in registration order.
    pub fn qualifiers(&self) -> impl Iterator<Item = &str> {
        self.handlers.iter().map(|(qualifier, _)| qualifier.as_str())
    }

    /// Number of handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub(crate) fn into_handlers(self) -> Vec<(String, Arc<dyn StreamHandler>)> {
        self.handlers
    }
}

impl std::fmt::Debug for HandlerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.qualifiers()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unary_none_yields_no_value() {
        let set = HandlerSet::new().unary("q/void", |_request: Message| async { Ok(None) });
        let (_, handler) = set.into_handlers().remove(0);
        let values: Vec<_> = handler.handle(Message::from_qualifier("q/void")).collect().await;
        assert!(values.is_empty());
    }

    #[tokio::test]
    async fn test_unary_error_is_single_item() {
        let set = HandlerSet::new().unary("q/fail", |_request: Message| async {
            Err(HandlerError::new("nope"))
        });
        let (_, handler) = set.into_handlers().remove(0);
        let values: Vec<_> = handler.handle(Message::from_qualifier("q/fail")).collect().await;
        assert_eq!(values, vec![Err(HandlerError::new("nope"))]);
    }

    #[tokio::test]
    async fn test_stream_handler_keeps_order() {
        let set = HandlerSet::new().stream("q/count", |_request: Message| {
            stream::iter((1..=3).map(|i| Ok(Message::from_qualifier(format!("q/{i}")))))
        });
        let (qualifier, handler) = set.into_handlers().remove(0);
        assert_eq!(qualifier, "q/count");
        let qualifiers: Vec<String> = handler
            .handle(Message::from_qualifier("q/count"))
            .map(|value| value.expect("value").qualifier().to_string())
            .collect()
            .await;
        assert_eq!(qualifiers, vec!["q/1", "q/2", "q/3"]);
    }
}

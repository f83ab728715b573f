//! Caller-side handle of one request/response stream.

use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use futures::Stream;
use meshwire_core::Message;
use tokio::sync::mpsc;

use super::error::StreamError;
use super::session::{CallEvent, CallState, SessionTable, SharedState};

/// Lazy sequence of response messages, ended by a completion or an error.
///
/// Dropping the call before its terminal event removes the session; later
/// arrivals for its correlation id are discarded. Nothing is sent upstream.
pub struct Call {
    correlation_id: String,
    token: u64,
    events: mpsc::UnboundedReceiver<CallEvent>,
    state: Arc<SharedState>,
    sessions: Weak<SessionTable>,
    finished: bool,
}

impl Call {
    pub(crate) fn new(
        correlation_id: String,
        token: u64,
        events: mpsc::UnboundedReceiver<CallEvent>,
        state: Arc<SharedState>,
        sessions: Weak<SessionTable>,
    ) -> Self {
        Self {
            correlation_id,
            token,
            events,
            state,
            sessions,
            finished: false,
        }
    }

    /// A call that failed before it was registered.
    pub(crate) fn failed(correlation_id: String, error: StreamError) -> Self {
        let (sink, events) = mpsc::unbounded_channel();
        // Receiver is alive, the send cannot fail.
        let _ = sink.send(CallEvent::Failed(error));
        Self {
            correlation_id,
            token: 0,
            events,
            state: SharedState::new(CallState::Failed),
            sessions: Weak::new(),
            finished: false,
        }
    }

    /// Correlation id linking the responses to the request.
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Current state of the session.
    pub fn state(&self) -> CallState {
        self.state.get()
    }

    /// Next response value.
    ///
    /// `None` after a successful completion. An error is yielded once, then
    /// the call is over.
    pub async fn next(&mut self) -> Option<Result<Message, StreamError>> {
        futures::future::poll_fn(|cx| self.poll_event(cx)).await
    }

    /// Every response value until completion.
    ///
    /// # Errors
    ///
    /// The error that ended the call; values received before it are lost.
    pub async fn collect(mut self) -> Result<Vec<Message>, StreamError> {
        let mut values = Vec::new();
        while let Some(item) = self.next().await {
            values.push(item?);
        }
        Ok(values)
    }

    /// The first response value, if any, once the call completed.
    ///
    /// # Errors
    ///
    /// The error that ended the call.
    pub async fn single(self) -> Result<Option<Message>, StreamError> {
        Ok(self.collect().await?.into_iter().next())
    }

    fn poll_event(&mut self, cx: &mut Context<'_>) -> Poll<Option<Result<Message, StreamError>>> {
        if self.finished {
            return Poll::Ready(None);
        }
        match self.events.poll_recv(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(CallEvent::Value(message))) => Poll::Ready(Some(Ok(message))),
            Poll::Ready(Some(CallEvent::Completed)) => {
                self.finished = true;
                Poll::Ready(None)
            }
            Poll::Ready(Some(CallEvent::Failed(error))) => {
                self.finished = true;
                Poll::Ready(Some(Err(error)))
            }
            // Processor dropped without closing the session.
            Poll::Ready(None) => {
                self.finished = true;
                Poll::Ready(Some(Err(crate::TransportError::Closed.into())))
            }
        }
    }
}

impl Stream for Call {
    type Item = Result<Message, StreamError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().poll_event(cx)
    }
}

impl Drop for Call {
    fn drop(&mut self) {
        if self.state.get().is_terminal() {
            return;
        }
        if let Some(sessions) = self.sessions.upgrade() {
            sessions.remove(&self.correlation_id, self.token);
        }
    }
}

impl std::fmt::Debug for Call {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Call")
            .field("correlation_id", &self.correlation_id)
            .field("state", &self.state())
            .finish()
    }
}

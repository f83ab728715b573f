//! Completion handle returned by [`Transport::send`](crate::Transport::send).

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::error::{TransportError, TransportResult};

enum SendState {
    /// Decided without a connection: a frame the emulator dropped, or an error.
    Ready(Option<TransportResult<Option<u64>>>),
    Pending(oneshot::Receiver<TransportResult<u64>>),
}

/// Resolves once the frame was written to the socket, or with the error that
/// prevented it.
///
/// The send proceeds whether or not this future is polled; dropping it just
/// discards the outcome.
pub struct SendFuture {
    state: SendState,
}

impl SendFuture {
    pub(crate) fn ready(result: TransportResult<()>) -> Self {
        Self {
            state: SendState::Ready(Some(result.map(|()| None))),
        }
    }

    pub(crate) fn pending(rx: oneshot::Receiver<TransportResult<u64>>) -> Self {
        Self {
            state: SendState::Pending(rx),
        }
    }

    /// Like awaiting the send, but also yields the id of the connection the
    /// frame was written on. `None` when no connection carried it.
    pub(crate) async fn written_on(mut self) -> TransportResult<Option<u64>> {
        futures::future::poll_fn(|cx| self.poll_outcome(cx)).await
    }

    fn poll_outcome(&mut self, cx: &mut Context<'_>) -> Poll<TransportResult<Option<u64>>> {
        match &mut self.state {
            SendState::Ready(result) => {
                Poll::Ready(result.take().unwrap_or(Err(TransportError::Closed)))
            }
            // A dropped completion means the connection task was torn down.
            SendState::Pending(rx) => Pin::new(rx).poll(cx).map(|outcome| match outcome {
                Ok(written) => written.map(Some),
                Err(_) => Err(TransportError::Closed),
            }),
        }
    }
}

impl Future for SendFuture {
    type Output = TransportResult<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.poll_outcome(cx).map(|outcome| outcome.map(|_| ()))
    }
}

impl std::fmt::Debug for SendFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &self.state {
            SendState::Ready(_) => "ready",
            SendState::Pending(_) => "pending",
        };
        f.debug_struct("SendFuture").field("state", &state).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dropped_completion_reports_closed() {
        let (tx, rx) = oneshot::channel::<TransportResult<u64>>();
        drop(tx);
        let result = SendFuture::pending(rx).await;
        assert!(result.expect_err("no completion").is_closed());
    }

    #[tokio::test]
    async fn test_ready_and_pending_outcomes() {
        SendFuture::ready(Ok(())).await.expect("ready ok");

        let (tx, rx) = oneshot::channel();
        tx.send(Ok(7)).expect("receiver alive");
        SendFuture::pending(rx).await.expect("completed ok");
    }

    #[tokio::test]
    async fn test_written_on_reports_the_connection() {
        let (tx, rx) = oneshot::channel();
        tx.send(Ok(7)).expect("receiver alive");
        assert_eq!(SendFuture::pending(rx).written_on().await.expect("written"), Some(7));

        assert_eq!(SendFuture::ready(Ok(())).written_on().await.expect("dropped"), None);
    }
}

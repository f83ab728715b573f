//! Fanout: multicast queue with one independent backlog per subscriber.
//!
//! Every [`Subscription`] owns its own FIFO backlog. Publishing clones the
//! item into each live backlog, so a slow or failed consumer never loses
//! messages for, or blocks, the others. Dropping a subscription detaches it;
//! closing the fanout completes every subscription once its backlog drains.
//!
//! ```
//! use meshwire_transport::Fanout;
//!
//! # futures::executor::block_on(async {
//! let fanout = Fanout::new();
//! let mut a = fanout.subscribe();
//! let mut b = fanout.subscribe();
//!
//! fanout.publish(1);
//! fanout.close();
//!
//! assert_eq!(a.recv().await, Some(1));
//! assert_eq!(a.recv().await, None);
//! assert_eq!(b.recv().await, Some(1));
//! # });
//! ```

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll, Waker};

use futures::Stream;

/// Internal state of one subscriber's backlog.
struct QueueState<T> {
    /// Pending items (FIFO).
    queue: VecDeque<T>,

    /// Consumer waiting for the next item.
    waker: Option<Waker>,

    /// No more items will be published.
    closed: bool,

    /// The subscription was dropped.
    detached: bool,

    /// Items delivered into this backlog.
    received: u64,
}

struct SubscriberQueue<T> {
    state: Mutex<QueueState<T>>,
}

impl<T> SubscriberQueue<T> {
    fn new(closed: bool) -> Self {
        Self {
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                waker: None,
                closed,
                detached: false,
                received: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Push an item, returning false once the subscriber is gone.
    fn push(&self, item: T) -> bool {
        let mut state = self.lock();
        if state.detached {
            return false;
        }
        state.queue.push_back(item);
        state.received += 1;
        if let Some(waker) = state.waker.take() {
            waker.wake();
        }
        true
    }

    fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        if let Some(waker) = state.waker.take() {
            waker.wake();
        }
    }

    fn poll_recv(&self, cx: &mut Context<'_>) -> Poll<Option<T>> {
        let mut state = self.lock();
        if let Some(item) = state.queue.pop_front() {
            return Poll::Ready(Some(item));
        }
        if state.closed {
            return Poll::Ready(None);
        }
        state.waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

struct FanoutInner<T> {
    subscribers: Vec<Arc<SubscriberQueue<T>>>,
    closed: bool,
}

/// Multicast publisher.
pub struct Fanout<T> {
    inner: Mutex<FanoutInner<T>>,
}

impl<T: Clone> Fanout<T> {
    /// Create an open fanout without subscribers.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(FanoutInner {
                subscribers: Vec::new(),
                closed: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FanoutInner<T>> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// New subscription receiving everything published from now on.
    ///
    /// Subscribing to a closed fanout yields an already-completed subscription.
    pub fn subscribe(&self) -> Subscription<T> {
        let mut inner = self.lock();
        let queue = Arc::new(SubscriberQueue::new(inner.closed));
        if !inner.closed {
            inner.subscribers.push(Arc::clone(&queue));
        }
        Subscription { queue }
    }

    /// Deliver `item` to every live subscription. Returns how many got it.
    pub fn publish(&self, item: T) -> usize {
        let mut inner = self.lock();
        if inner.closed {
            return 0;
        }
        let mut delivered = 0;
        inner.subscribers.retain(|queue| {
            let alive = queue.push(item.clone());
            if alive {
                delivered += 1;
            }
            alive
        });
        delivered
    }

    /// Complete every subscription. Later publishes are discarded.
    pub fn close(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        for queue in inner.subscribers.drain(..) {
            queue.close();
        }
    }

    /// Whether [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Live subscriptions, including dropped ones not yet pruned by a publish.
    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }
}

impl<T: Clone> Default for Fanout<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// One consumer's cursor over a [`Fanout`].
///
/// Also a [`futures::Stream`] that ends when the fanout closes.
pub struct Subscription<T> {
    queue: Arc<SubscriberQueue<T>>,
}

impl<T> Subscription<T> {
    /// Wait for the next item. `None` once the fanout is closed and the
    /// backlog is drained.
    pub fn recv(&mut self) -> RecvFuture<'_, T> {
        RecvFuture { subscription: self }
    }

    /// Next item if one is already queued.
    pub fn try_recv(&mut self) -> Option<T> {
        self.queue.lock().queue.pop_front()
    }

    /// Items waiting in the backlog.
    pub fn len(&self) -> usize {
        self.queue.lock().queue.len()
    }

    /// Whether the backlog is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the fanout was closed. Queued items can still be received.
    pub fn is_closed(&self) -> bool {
        self.queue.lock().closed
    }

    /// Items delivered to this subscription so far.
    pub fn received(&self) -> u64 {
        self.queue.lock().received
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        let mut state = self.queue.lock();
        state.detached = true;
        state.queue.clear();
    }
}

impl<T> Stream for Subscription<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.queue.poll_recv(cx)
    }
}

/// Future returned by [`Subscription::recv`].
pub struct RecvFuture<'a, T> {
    subscription: &'a mut Subscription<T>,
}

impl<T> Future for RecvFuture<'_, T> {
    type Output = Option<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.subscription.queue.poll_recv(cx)
    }
}

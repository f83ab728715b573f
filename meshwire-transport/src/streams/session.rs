//! Routing table of live call sessions, keyed by correlation id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use meshwire_core::Message;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::trace;

use super::error::StreamError;

/// Lifecycle of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallState {
    /// Request submitted, nothing received yet.
    Sent,
    /// At least one value received, terminal event pending.
    AwaitingTerminal,
    /// Ended by a completion message.
    Completed,
    /// Ended by an error.
    Failed,
}

impl CallState {
    /// Whether the call has observed its terminal event.
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallState::Completed | CallState::Failed)
    }

    fn as_u8(self) -> u8 {
        match self {
            CallState::Sent => 0,
            CallState::AwaitingTerminal => 1,
            CallState::Completed => 2,
            CallState::Failed => 3,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => CallState::Sent,
            1 => CallState::AwaitingTerminal,
            2 => CallState::Completed,
            _ => CallState::Failed,
        }
    }
}

/// State shared between a session entry and its [`Call`](crate::Call).
#[derive(Debug)]
pub(crate) struct SharedState(AtomicU8);

impl SharedState {
    pub(crate) fn new(state: CallState) -> Arc<Self> {
        Arc::new(Self(AtomicU8::new(state.as_u8())))
    }

    pub(crate) fn get(&self) -> CallState {
        CallState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn set(&self, state: CallState) {
        self.0.store(state.as_u8(), Ordering::Release);
    }
}

/// What the router hands to a call.
#[derive(Debug)]
pub(crate) enum CallEvent {
    Value(Message),
    Completed,
    Failed(StreamError),
}

/// One live call in the routing table.
pub(crate) struct SessionEntry {
    /// Distinguishes this session from a later one reusing the id.
    pub(crate) token: u64,
    /// Connection the request was written on, once known.
    pub(crate) connection: Option<u64>,
    pub(crate) sink: mpsc::UnboundedSender<CallEvent>,
    pub(crate) state: Arc<SharedState>,
    pub(crate) timer: Option<AbortHandle>,
}

impl SessionEntry {
    /// Deliver the terminal event. Consumes the entry so it happens once.
    fn finish(self, event: CallEvent) {
        if let Some(timer) = &self.timer {
            timer.abort();
        }
        let state = match &event {
            CallEvent::Failed(_) => CallState::Failed,
            _ => CallState::Completed,
        };
        self.state.set(state);
        // The call may already be gone; nothing to deliver to then.
        let _ = self.sink.send(event);
    }
}

/// Outcome of routing one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Routed {
    Value,
    Terminal,
    Unknown,
}

/// Live sessions of one client processor.
///
/// A session leaves the table exactly when its terminal event is decided, so
/// at most one terminal event is ever delivered per call.
pub(crate) struct SessionTable {
    sessions: Mutex<HashMap<String, SessionEntry>>,
}

impl SessionTable {
    pub(crate) fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, SessionEntry>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a session. Hands it back if the id is taken.
    pub(crate) fn insert(
        &self,
        correlation_id: String,
        entry: SessionEntry,
    ) -> Result<(), SessionEntry> {
        let mut sessions = self.lock();
        if sessions.contains_key(&correlation_id) {
            return Err(entry);
        }
        sessions.insert(correlation_id, entry);
        Ok(())
    }

    pub(crate) fn set_timer(&self, correlation_id: &str, token: u64, timer: AbortHandle) {
        let mut sessions = self.lock();
        match sessions.get_mut(correlation_id) {
            Some(entry) if entry.token == token => entry.timer = Some(timer),
            // Session already ended
            _ => timer.abort(),
        }
    }

    /// Route an inbound message to the session its correlation id names.
    pub(crate) fn route(&self, message: Message) -> Routed {
        let Some(correlation_id) = message.correlation_id() else {
            return Routed::Unknown;
        };

        let mut sessions = self.lock();
        if message.is_terminal() {
            let Some(entry) = sessions.remove(correlation_id) else {
                return Routed::Unknown;
            };
            drop(sessions);
            let event = if message.is_failure() {
                CallEvent::Failed(StreamError::from_failure_message(&message))
            } else {
                CallEvent::Completed
            };
            entry.finish(event);
            return Routed::Terminal;
        }

        let Some(entry) = sessions.get(correlation_id) else {
            return Routed::Unknown;
        };
        entry.state.set(CallState::AwaitingTerminal);
        let _ = entry.sink.send(CallEvent::Value(message));
        Routed::Value
    }

    /// Fail one session if it is still the one identified by `token`.
    pub(crate) fn fail(&self, correlation_id: &str, token: u64, error: StreamError) -> bool {
        let entry = {
            let mut sessions = self.lock();
            match sessions.get(correlation_id) {
                Some(entry) if entry.token == token => sessions.remove(correlation_id),
                _ => None,
            }
        };
        match entry {
            Some(entry) => {
                trace!(%correlation_id, %error, "failing call");
                entry.finish(CallEvent::Failed(error));
                true
            }
            None => false,
        }
    }

    /// Record that the session's request went out on `connection`.
    ///
    /// Returns false when the session already ended.
    pub(crate) fn bind_connection(
        &self,
        correlation_id: &str,
        token: u64,
        connection: u64,
    ) -> bool {
        let mut sessions = self.lock();
        match sessions.get_mut(correlation_id) {
            Some(entry) if entry.token == token => {
                entry.connection = Some(connection);
                true
            }
            _ => false,
        }
    }

    /// Fail every session whose request went out on `connection`.
    pub(crate) fn fail_connection(&self, connection: u64, error: &StreamError) -> usize {
        let failed: Vec<SessionEntry> = {
            let mut sessions = self.lock();
            let ids: Vec<String> = sessions
                .iter()
                .filter(|(_, entry)| entry.connection == Some(connection))
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| sessions.remove(id)).collect()
        };
        let count = failed.len();
        for entry in failed {
            entry.finish(CallEvent::Failed(error.clone()));
        }
        count
    }

    /// Fail every session.
    pub(crate) fn fail_all(&self, error: &StreamError) -> usize {
        let failed: Vec<SessionEntry> = self.lock().drain().map(|(_, entry)| entry).collect();
        let count = failed.len();
        for entry in failed {
            entry.finish(CallEvent::Failed(error.clone()));
        }
        count
    }

    /// Forget a session without a terminal event.
    pub(crate) fn remove(&self, correlation_id: &str, token: u64) -> bool {
        let mut sessions = self.lock();
        let same = sessions
            .get(correlation_id)
            .is_some_and(|entry| entry.token == token);
        if same {
            if let Some(entry) = sessions.remove(correlation_id) {
                if let Some(timer) = entry.timer {
                    timer.abort();
                }
            }
        }
        same
    }

    #[cfg(test)]
    fn contains(&self, correlation_id: &str) -> bool {
        self.lock().contains_key(correlation_id)
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }
}

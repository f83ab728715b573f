//! At most one live connection per remote address.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use meshwire_core::Address;
use tokio::sync::mpsc;

use crate::connection::{Connection, Direction, Outbound};
use crate::error::{TransportError, TransportResult};

/// Result of [`ConnectionPool::acquire`].
pub(crate) enum Acquired {
    /// A live connection already serves the address.
    Existing(Arc<Connection>),
    /// A new connection was registered; the caller must start its task.
    Created(Arc<Connection>, mpsc::UnboundedReceiver<Outbound>),
}

struct PoolState {
    connections: HashMap<Address, Arc<Connection>>,
    closed: bool,
}

/// Connections of one transport keyed by remote address.
pub(crate) struct ConnectionPool {
    state: Mutex<PoolState>,
}

impl ConnectionPool {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(PoolState {
                connections: HashMap::new(),
                closed: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The live connection for `address`, creating one when absent or closed.
    ///
    /// Concurrent callers for the same address share one connection attempt.
    pub(crate) fn acquire(&self, address: &Address) -> TransportResult<Acquired> {
        let mut state = self.lock();
        if state.closed {
            return Err(TransportError::Closed);
        }
        if let Some(existing) = state.connections.get(address) {
            if !existing.is_closed() {
                return Ok(Acquired::Existing(Arc::clone(existing)));
            }
        }
        let (connection, rx) = Connection::new(address.clone(), Direction::Outbound);
        state
            .connections
            .insert(address.clone(), Arc::clone(&connection));
        Ok(Acquired::Created(connection, rx))
    }

    /// Register an accepted connection unless a live one already serves its
    /// address.
    pub(crate) fn register_if_vacant(&self, connection: &Arc<Connection>) -> bool {
        let mut state = self.lock();
        if state.closed {
            return false;
        }
        let vacant = state
            .connections
            .get(connection.remote())
            .map_or(true, |existing| existing.is_closed());
        if vacant {
            state
                .connections
                .insert(connection.remote().clone(), Arc::clone(connection));
        }
        vacant
    }

    /// Remove the entry for the connection's address only if it is this very
    /// connection.
    pub(crate) fn remove_if_same(&self, connection: &Arc<Connection>) -> bool {
        let mut state = self.lock();
        let same = state
            .connections
            .get(connection.remote())
            .is_some_and(|existing| Arc::ptr_eq(existing, connection));
        if same {
            state.connections.remove(connection.remote());
        }
        same
    }

    pub(crate) fn get(&self, address: &Address) -> Option<Arc<Connection>> {
        self.lock().connections.get(address).cloned()
    }

    /// Refuse new connections. Existing ones stay registered until their
    /// tasks remove them.
    pub(crate) fn close(&self) -> Vec<Arc<Connection>> {
        let mut state = self.lock();
        state.closed = true;
        state.connections.values().cloned().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().connections.len()
    }
}

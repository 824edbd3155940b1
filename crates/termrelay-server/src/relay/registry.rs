//! Connection registry: which connection is bound to which session.
//!
//! The single source of truth for bindings. Sessions and connections never
//! point at each other; every lookup goes through this table. Both directions
//! live under one lock so bind/unbind/lookup are atomic with respect to each
//! other.

use super::connection::{ConnectionHandle, ConnectionId};
use parking_lot::Mutex;
use std::collections::HashMap;
use termrelay_core::{RelayError, RelayResult, SessionId};
use tracing::{debug, info};

#[derive(Default)]
struct Bindings {
    by_session: HashMap<SessionId, ConnectionHandle>,
    by_connection: HashMap<ConnectionId, SessionId>,
}

/// Registry of live session ↔ connection bindings.
#[derive(Default)]
pub struct ConnectionRegistry {
    bindings: Mutex<Bindings>,
}

impl ConnectionRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a connection to a session.
    ///
    /// Fails with `AlreadyBound` if the session has a live connection, and
    /// with `ConnectionBusy` if the connection is bound elsewhere. A failed
    /// bind leaves the table untouched.
    pub fn bind(&self, session_id: SessionId, handle: ConnectionHandle) -> RelayResult<()> {
        let mut bindings = self.bindings.lock();
        if bindings.by_session.contains_key(&session_id) {
            return Err(RelayError::AlreadyBound(session_id));
        }
        let connection_id = handle.id();
        if let Some(other) = bindings.by_connection.get(&connection_id) {
            if *other != session_id {
                return Err(RelayError::ConnectionBusy(connection_id));
            }
        }
        bindings.by_connection.insert(connection_id, session_id);
        bindings.by_session.insert(session_id, handle);
        info!(session_id = %session_id, connection_id, "connection bound");
        Ok(())
    }

    /// Remove a connection's binding. Idempotent.
    pub fn unbind(&self, connection_id: ConnectionId) -> Option<SessionId> {
        let mut bindings = self.bindings.lock();
        let session_id = bindings.by_connection.remove(&connection_id)?;
        bindings.by_session.remove(&session_id);
        debug!(session_id = %session_id, connection_id, "connection unbound");
        Some(session_id)
    }

    /// Remove whatever connection is bound to a session. Idempotent.
    pub fn unbind_session(&self, session_id: SessionId) -> Option<ConnectionId> {
        let mut bindings = self.bindings.lock();
        let handle = bindings.by_session.remove(&session_id)?;
        bindings.by_connection.remove(&handle.id());
        debug!(session_id = %session_id, connection_id = handle.id(), "session unbound");
        Some(handle.id())
    }

    /// The connection bound to a session.
    pub fn lookup(&self, session_id: SessionId) -> Option<ConnectionHandle> {
        self.bindings.lock().by_session.get(&session_id).cloned()
    }

    /// The session a connection is bound to.
    pub fn lookup_by_connection(&self, connection_id: ConnectionId) -> Option<SessionId> {
        self.bindings.lock().by_connection.get(&connection_id).copied()
    }

    /// Number of live bindings.
    pub fn len(&self) -> usize {
        self.bindings.lock().by_session.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

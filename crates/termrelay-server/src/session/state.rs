//! A single terminal session and its state machine.
//!
//! `Connecting → Attached → Detached → Closed`. All transitions happen under
//! the session's own lock; when a transition touches the registry the session
//! lock is taken first.

use super::pty::PtyHandle;
use super::ring_buffer::RingBuffer;
use crate::relay::{ConnectionHandle, ConnectionId, ConnectionRegistry};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::time::{Duration, Instant};
use termrelay_core::{Frame, RelayError, RelayResult, SessionId, SessionType, TerminalSize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Spawned, not yet bound to its first connection.
    Connecting,
    /// Bound; output flows to the connection.
    Attached { connection_id: ConnectionId },
    /// Connection lost; output is captured until reattach or grace expiry.
    Detached { since: Instant },
    Closed,
}

struct SessionInner {
    state: SessionState,
    last_activity: Instant,
    detached: RingBuffer,
}

/// One logical terminal instance.
pub struct Session {
    id: SessionId,
    owner_id: String,
    session_type: SessionType,
    ssh_profile_id: Option<String>,
    created_at: DateTime<Utc>,
    pty: PtyHandle,
    inner: Mutex<SessionInner>,
    /// Cancelled when the session closes; stops the output router.
    cancel: CancellationToken,
}

impl Session {
    pub fn new(
        id: SessionId,
        owner_id: String,
        session_type: SessionType,
        ssh_profile_id: Option<String>,
        pty: PtyHandle,
        detached_buffer_bytes: usize,
    ) -> Self {
        Self {
            id,
            owner_id,
            session_type,
            ssh_profile_id,
            created_at: Utc::now(),
            pty,
            inner: Mutex::new(SessionInner {
                state: SessionState::Connecting,
                last_activity: Instant::now(),
                detached: RingBuffer::new(detached_buffer_bytes),
            }),
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn session_type(&self) -> SessionType {
        self.session_type
    }

    pub fn ssh_profile_id(&self) -> Option<&str> {
        self.ssh_profile_id.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    pub fn last_activity(&self) -> Instant {
        self.inner.lock().last_activity
    }

    /// Record client or process activity.
    pub fn touch(&self) {
        self.inner.lock().last_activity = Instant::now();
    }

    pub fn terminal_size(&self) -> TerminalSize {
        self.pty.size()
    }

    pub fn pty(&self) -> &PtyHandle {
        &self.pty
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Bytes captured while detached and not yet replayed.
    pub fn buffered_bytes(&self) -> usize {
        self.inner.lock().detached.len()
    }

    /// Bind `conn` and move to `Attached`.
    ///
    /// `ack` is queued first, then anything captured while detached, so the
    /// client sees replayed output before live output. Both go into the
    /// connection's queue together or the attach fails and the captured
    /// output stays buffered. Returns the number of replayed bytes.
    pub fn attach(
        &self,
        registry: &ConnectionRegistry,
        conn: &ConnectionHandle,
        ack: Frame,
    ) -> RelayResult<usize> {
        let mut inner = self.inner.lock();
        match inner.state {
            SessionState::Closed => return Err(RelayError::SessionNotFound(self.id)),
            SessionState::Attached { .. } => return Err(RelayError::AlreadyBound(self.id)),
            SessionState::Connecting | SessionState::Detached { .. } => {}
        }

        registry.bind(self.id, conn.clone())?;

        let replay = inner.detached.read_all();
        let replayed = replay.len();
        let mut frames = vec![ack];
        if !replay.is_empty() {
            frames.push(Frame::output(
                self.id,
                String::from_utf8_lossy(&replay).into_owned(),
            ));
        }
        if !conn.try_send_all(frames) {
            registry.unbind(conn.id());
            warn!(
                session_id = %self.id,
                connection_id = conn.id(),
                "connection queue full, attach refused"
            );
            return Err(RelayError::BackpressureTimeout(Duration::ZERO));
        }

        let dropped = inner.detached.dropped();
        inner.detached.clear();
        if dropped > 0 {
            warn!(session_id = %self.id, dropped, "detached buffer overflowed, oldest output lost");
        }

        inner.state = SessionState::Attached {
            connection_id: conn.id(),
        };
        inner.last_activity = Instant::now();
        info!(session_id = %self.id, connection_id = conn.id(), replayed, "session attached");
        Ok(replayed)
    }

    /// Move `Attached` → `Detached` if `connection_id` is the bound one.
    pub fn detach(&self, registry: &ConnectionRegistry, connection_id: ConnectionId) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            SessionState::Attached { connection_id: bound } if bound == connection_id => {
                registry.unbind(connection_id);
                inner.state = SessionState::Detached {
                    since: Instant::now(),
                };
                info!(session_id = %self.id, connection_id, "session detached");
                true
            }
            _ => false,
        }
    }

    /// Where output should go right now.
    ///
    /// Returns the bound connection if it is live; otherwise captures `text`
    /// in the detached buffer (or drops it once closed) and returns `None`.
    pub fn route_output(&self, registry: &ConnectionRegistry, text: &str) -> Option<ConnectionHandle> {
        let mut inner = self.inner.lock();
        match inner.state {
            SessionState::Closed => None,
            SessionState::Attached { .. } => {
                inner.last_activity = Instant::now();
                match registry.lookup(self.id) {
                    Some(conn) if !conn.is_closed() => Some(conn),
                    _ => {
                        inner.detached.write(text.as_bytes());
                        None
                    }
                }
            }
            SessionState::Connecting | SessionState::Detached { .. } => {
                inner.detached.write(text.as_bytes());
                None
            }
        }
    }

    /// Move to `Closed` and stop the output router.
    ///
    /// Returns the previously bound connection so the caller can notify it.
    /// The registry binding is left for the caller to remove after the PTY
    /// has been closed. Returns `None` on a second call.
    pub fn mark_closed(&self, registry: &ConnectionRegistry) -> Option<Option<ConnectionHandle>> {
        self.mark_closed_if(registry, |_, _| true)
    }

    /// `mark_closed`, but only if `due(state, last_activity)` still holds
    /// under the session lock. Returns `None` if it does not.
    pub fn mark_closed_if<F>(
        &self,
        registry: &ConnectionRegistry,
        due: F,
    ) -> Option<Option<ConnectionHandle>>
    where
        F: FnOnce(SessionState, Instant) -> bool,
    {
        let mut inner = self.inner.lock();
        if inner.state == SessionState::Closed || !due(inner.state, inner.last_activity) {
            return None;
        }
        let previous = std::mem::replace(&mut inner.state, SessionState::Closed);
        self.cancel.cancel();
        match previous {
            SessionState::Attached { .. } => Some(registry.lookup(self.id)),
            _ => Some(None),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("owner_id", &self.owner_id)
            .field("session_type", &self.session_type)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::session::pty::testing::fake_channel;
    use termrelay_core::ErrorCode;

    fn session(buffer: usize) -> Session {
        let (parts, _remote, _state) = fake_channel();
        let pty = PtyHandle::from_parts(parts, TerminalSize::default()).unwrap();
        Session::new(
            SessionId::new(),
            "alice".into(),
            SessionType::LocalShell,
            None,
            pty,
            buffer,
        )
    }

    #[tokio::test]
    async fn attach_queues_ack_then_replay() {
        let registry = ConnectionRegistry::new();
        let s = session(64);
        assert!(s.route_output(&registry, "before ").is_none());
        assert!(s.route_output(&registry, "attach").is_none());

        let (conn, mut rx) = ConnectionHandle::new(1, "alice", None, 8);
        let replayed = s.attach(&registry, &conn, Frame::Pong).unwrap();
        assert_eq!(replayed, 13);
        assert_eq!(s.state(), SessionState::Attached { connection_id: 1 });

        assert!(matches!(rx.recv().await, Some(crate::relay::Outbound::Frame(Frame::Pong))));
        match rx.recv().await {
            Some(crate::relay::Outbound::Frame(Frame::Output { data, .. })) => {
                assert_eq!(data, "before attach")
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn full_queue_refuses_attach_and_keeps_buffer() {
        let registry = ConnectionRegistry::new();
        let s = session(64);
        s.route_output(&registry, "while you were away");

        let (conn, mut rx) = ConnectionHandle::new(1, "alice", None, 4);
        for _ in 0..4 {
            assert!(conn.try_send(Frame::Pong));
        }
        let err = s.attach(&registry, &conn, Frame::Ping).unwrap_err();
        assert!(matches!(err, RelayError::BackpressureTimeout(_)));
        assert_eq!(s.buffered_bytes(), 19);
        assert!(registry.is_empty());
        assert_eq!(s.state(), SessionState::Connecting);

        for _ in 0..4 {
            rx.recv().await;
        }
        assert_eq!(s.attach(&registry, &conn, Frame::Ping).unwrap(), 19);
        assert!(matches!(rx.recv().await, Some(crate::relay::Outbound::Frame(Frame::Ping))));
        match rx.recv().await {
            Some(crate::relay::Outbound::Frame(Frame::Output { data, .. })) => {
                assert_eq!(data, "while you were away")
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(s.buffered_bytes(), 0);
    }

    #[tokio::test]
    async fn conditional_close_rechecks_state() {
        let registry = ConnectionRegistry::new();
        let s = session(64);
        let (conn, _rx) = ConnectionHandle::new(1, "alice", None, 8);
        s.attach(&registry, &conn, Frame::Pong).unwrap();

        let detached_only =
            |state: SessionState, _: Instant| matches!(state, SessionState::Detached { .. });
        assert!(s.mark_closed_if(&registry, detached_only).is_none());
        assert!(!s.cancel_token().is_cancelled());
        assert_eq!(s.state(), SessionState::Attached { connection_id: 1 });

        s.detach(&registry, 1);
        assert!(matches!(s.mark_closed_if(&registry, detached_only), Some(None)));
        assert_eq!(s.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn attached_output_goes_to_connection() {
        let registry = ConnectionRegistry::new();
        let s = session(64);
        let (conn, _rx) = ConnectionHandle::new(1, "alice", None, 8);
        s.attach(&registry, &conn, Frame::Pong).unwrap();

        let routed = s.route_output(&registry, "live").unwrap();
        assert_eq!(routed.id(), 1);
        assert_eq!(s.buffered_bytes(), 0);
    }

    #[tokio::test]
    async fn dead_connection_output_is_buffered() {
        let registry = ConnectionRegistry::new();
        let s = session(64);
        let (conn, rx) = ConnectionHandle::new(1, "alice", None, 8);
        s.attach(&registry, &conn, Frame::Pong).unwrap();
        drop(rx);

        assert!(s.route_output(&registry, "lost?").is_none());
        assert_eq!(s.buffered_bytes(), 5);
    }

    #[tokio::test]
    async fn second_attach_is_rejected() {
        let registry = ConnectionRegistry::new();
        let s = session(64);
        let (first, _rx1) = ConnectionHandle::new(1, "alice", None, 8);
        let (second, _rx2) = ConnectionHandle::new(2, "alice", None, 8);
        s.attach(&registry, &first, Frame::Pong).unwrap();

        let err = s
            .attach(&registry, &second, Frame::error(ErrorCode::Internal, "x"))
            .unwrap_err();
        assert!(matches!(err, RelayError::AlreadyBound(_)));
        assert_eq!(registry.lookup(s.id()).map(|c| c.id()), Some(1));
    }

    #[tokio::test]
    async fn detach_only_for_bound_connection() {
        let registry = ConnectionRegistry::new();
        let s = session(64);
        let (conn, _rx) = ConnectionHandle::new(1, "alice", None, 8);
        s.attach(&registry, &conn, Frame::Pong).unwrap();

        assert!(!s.detach(&registry, 2));
        assert!(s.detach(&registry, 1));
        assert!(matches!(s.state(), SessionState::Detached { .. }));
        assert!(registry.lookup(s.id()).is_none());
        assert!(!s.detach(&registry, 1));
    }

    #[tokio::test]
    async fn closed_session_refuses_attach() {
        let registry = ConnectionRegistry::new();
        let s = session(64);
        assert!(matches!(s.mark_closed(&registry), Some(None)));
        assert!(s.mark_closed(&registry).is_none());
        assert!(s.cancel_token().is_cancelled());

        let (conn, _rx) = ConnectionHandle::new(1, "alice", None, 8);
        let err = s.attach(&registry, &conn, Frame::Pong).unwrap_err();
        assert!(matches!(err, RelayError::SessionNotFound(_)));
        assert!(registry.is_empty());
    }
}

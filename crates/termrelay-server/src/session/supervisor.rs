//! Session lifecycle management.
//!
//! The supervisor owns the session table and is the only caller of
//! `PtyHandle::spawn` and `PtyHandle::close`. It creates and resumes
//! sessions, forwards input and resizes, detaches on connection loss and
//! tears sessions down for every close reason.

use super::history::{SessionEvent, SessionEventKind, SessionEventSink};
use super::pty::{PtyHandle, SpawnTarget};
use super::router::{self, RouterExit};
use super::state::{Session, SessionState};
use crate::config::{RelayLimits, ShellConfig};
use crate::relay::{ConnectionHandle, ConnectionId, ConnectionRegistry};
use crate::ssh::SshConnector;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use termrelay_core::{
    ErrorCode, Frame, RelayError, RelayResult, SessionId, SessionType, TerminalSize,
};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

/// How long `destroy` waits for room in a connection's queue for the final
/// frame before cancelling the connection outright.
const FINAL_FRAME_WAIT: Duration = Duration::from_secs(1);

/// How long to wait for an exit status after the output stream ends.
const EXIT_STATUS_WAIT: Duration = Duration::from_millis(200);

/// Quiet period after SSH handshake output before the channel counts as up.
const SSH_SETTLE: Duration = Duration::from_millis(300);

/// Exit status of the `ssh` client when it fails to connect or authenticate,
/// reported when a channel ends without one.
const SSH_CLIENT_FAILURE: u32 = 255;

pub type SessionHandle = Arc<Session>;

/// Why a session was closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The client sent `disconnect`.
    ClientDisconnect,
    ProcessExited { code: Option<u32> },
    PtyFailure(String),
    IdleTimeout,
    GraceExpired,
    ServerShutdown,
}

impl CloseReason {
    /// Frame sent to the bound connection before the socket closes.
    pub fn final_frame(&self, session_id: SessionId) -> Option<Frame> {
        match self {
            CloseReason::ClientDisconnect | CloseReason::GraceExpired => None,
            CloseReason::ProcessExited { .. } | CloseReason::ServerShutdown => {
                Some(Frame::disconnect(Some(session_id), self.to_string()))
            }
            CloseReason::PtyFailure(msg) => Some(Frame::error(
                ErrorCode::PtyReadFailure,
                format!("terminal read failed: {msg}"),
            )),
            CloseReason::IdleTimeout => Some(Frame::error(
                ErrorCode::IdleTimeout,
                "session closed after inactivity",
            )),
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::ClientDisconnect => write!(f, "client disconnect"),
            CloseReason::ProcessExited { code: Some(code) } => {
                write!(f, "process exited with code {code}")
            }
            CloseReason::ProcessExited { code: None } => write!(f, "process exited"),
            CloseReason::PtyFailure(msg) => write!(f, "pty failure: {msg}"),
            CloseReason::IdleTimeout => write!(f, "idle timeout"),
            CloseReason::GraceExpired => write!(f, "grace window expired"),
            CloseReason::ServerShutdown => write!(f, "server shutdown"),
        }
    }
}

/// Manages all live sessions.
pub struct SessionSupervisor {
    sessions: RwLock<HashMap<SessionId, SessionHandle>>,
    registry: Arc<ConnectionRegistry>,
    limits: RelayLimits,
    shell: ShellConfig,
    ssh: Arc<dyn SshConnector>,
    events: Arc<dyn SessionEventSink>,
}

impl SessionSupervisor {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        limits: RelayLimits,
        shell: ShellConfig,
        ssh: Arc<dyn SshConnector>,
        events: Arc<dyn SessionEventSink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            registry,
            limits,
            shell,
            ssh,
            events,
        })
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn limits(&self) -> &RelayLimits {
        &self.limits
    }

    /// Handle a `connect` frame: resume the named session or create one.
    ///
    /// On success the connection is bound and the ack (a `connect` frame
    /// carrying the session id) has been queued, followed by any replay.
    pub async fn handle_connect(
        self: &Arc<Self>,
        conn: &ConnectionHandle,
        frame: &Frame,
    ) -> RelayResult<SessionHandle> {
        let Frame::Connect {
            session_id,
            session_type,
            ssh_profile_id,
            rows,
            cols,
        } = frame
        else {
            return Err(RelayError::Other(format!(
                "expected connect frame, got {}",
                frame.frame_type()
            )));
        };

        if self.registry.lookup_by_connection(conn.id()).is_some() {
            return Err(RelayError::ConnectionBusy(conn.id()));
        }

        let size = match (rows, cols) {
            (Some(rows), Some(cols)) => Some(TerminalSize::new(*rows, *cols)),
            _ => None,
        };

        match session_id {
            Some(id) => self.resume(conn, *id, size).await,
            None => {
                self.create(
                    conn,
                    *session_type,
                    ssh_profile_id.clone(),
                    size.unwrap_or_default(),
                )
                .await
            }
        }
    }

    async fn resume(
        &self,
        conn: &ConnectionHandle,
        session_id: SessionId,
        size: Option<TerminalSize>,
    ) -> RelayResult<SessionHandle> {
        // Sessions of other owners are indistinguishable from missing ones.
        let session = self
            .session(session_id)
            .await
            .filter(|s| s.owner_id() == conn.owner_id())
            .ok_or(RelayError::SessionNotFound(session_id))?;

        session.attach(&self.registry, conn, ack_frame(&session, size))?;
        // Only the connection that won the binding may change the size.
        if let Some(size) = size.filter(|size| *size != session.terminal_size()) {
            if let Err(e) = session.pty().resize(size) {
                debug!(session_id = %session_id, error = %e, "resize on resume failed");
            }
        }
        self.notify(
            &session,
            SessionEventKind::Attached {
                connection_id: conn.id(),
            },
        );
        info!(
            session_id = %session_id,
            connection_id = conn.id(),
            owner = %conn.owner_id(),
            remote = ?conn.remote(),
            "session resumed"
        );
        Ok(session)
    }

    async fn create(
        self: &Arc<Self>,
        conn: &ConnectionHandle,
        session_type: SessionType,
        ssh_profile_id: Option<String>,
        size: TerminalSize,
    ) -> RelayResult<SessionHandle> {
        if self.count().await >= self.limits.max_sessions {
            return Err(RelayError::Capacity(self.limits.max_sessions));
        }

        let target = match session_type {
            SessionType::LocalShell => SpawnTarget::LocalShell,
            SessionType::Ssh => SpawnTarget::Ssh {
                profile_id: ssh_profile_id
                    .clone()
                    .ok_or_else(|| RelayError::Spawn("ssh session requires ssh_profile_id".into()))?,
            },
        };

        let owner_id = conn.owner_id().to_string();
        let shell = self.shell.clone();
        let ssh = self.ssh.clone();
        let spawn_owner = owner_id.clone();
        let pty = tokio::task::spawn_blocking(move || {
            PtyHandle::spawn(&target, &spawn_owner, size, &shell, ssh.as_ref())
        })
        .await
        .map_err(|e| RelayError::Spawn(format!("spawn task failed: {e}")))??;

        let mut output = pty
            .take_output()
            .ok_or_else(|| RelayError::Spawn("PTY output already taken".into()))?;
        let preamble = match session_type {
            SessionType::Ssh => {
                match await_ssh_handshake(&pty, &mut output, self.ssh.handshake_window()).await {
                    Ok(preamble) => preamble,
                    Err(e) => {
                        pty.close().await;
                        return Err(e);
                    }
                }
            }
            SessionType::LocalShell => Vec::new(),
        };

        let spawned = Spawned {
            pty,
            output,
            preamble,
        };
        self.install(conn, owner_id, session_type, ssh_profile_id, spawned)
            .await
    }

    /// Register a freshly spawned PTY as a session, start its router and
    /// bind `conn` to it.
    async fn install(
        self: &Arc<Self>,
        conn: &ConnectionHandle,
        owner_id: String,
        session_type: SessionType,
        ssh_profile_id: Option<String>,
        spawned: Spawned,
    ) -> RelayResult<SessionHandle> {
        let Spawned {
            pty,
            output,
            preamble,
        } = spawned;
        let session = Arc::new(Session::new(
            SessionId::new(),
            owner_id,
            session_type,
            ssh_profile_id.clone(),
            pty,
            self.limits.detached_buffer_bytes,
        ));
        let session_id = session.id();

        {
            let mut sessions = self.sessions.write().await;
            // Re-checked here: spawns run concurrently.
            if sessions.len() >= self.limits.max_sessions {
                drop(sessions);
                session.pty().close().await;
                return Err(RelayError::Capacity(self.limits.max_sessions));
            }
            sessions.insert(session_id, session.clone());
        }
        info!(
            session_id = %session_id,
            owner = %session.owner_id(),
            session_type = %session_type,
            "session created"
        );
        self.notify(
            &session,
            SessionEventKind::Started {
                session_type,
                ssh_profile_id,
            },
        );

        self.spawn_router(session.clone(), preamble, output);

        if let Err(e) = session.attach(&self.registry, conn, ack_frame(&session, None)) {
            self.destroy(session_id, CloseReason::ClientDisconnect).await;
            return Err(e);
        }
        self.notify(
            &session,
            SessionEventKind::Attached {
                connection_id: conn.id(),
            },
        );
        Ok(session)
    }

    fn spawn_router(
        self: &Arc<Self>,
        session: SessionHandle,
        preamble: Vec<u8>,
        output: mpsc::Receiver<Vec<u8>>,
    ) {
        let supervisor: Weak<Self> = Arc::downgrade(self);
        let registry = self.registry.clone();
        tokio::spawn(async move {
            let exit = router::run(&session, &registry, preamble, output).await;
            if exit == RouterExit::Cancelled {
                return;
            }
            let reason = match session.pty().read_error() {
                Some(err) => CloseReason::PtyFailure(err),
                None => CloseReason::ProcessExited {
                    code: wait_for_exit(session.pty()).await,
                },
            };
            if let Some(supervisor) = supervisor.upgrade() {
                supervisor.destroy(session.id(), reason).await;
            }
        });
    }

    /// Forward keystrokes from `conn` to its bound session.
    pub async fn apply_input(
        &self,
        conn: &ConnectionHandle,
        session_id: Option<SessionId>,
        data: &str,
    ) -> RelayResult<()> {
        let session = self.bound_session(conn, session_id).await?;
        session.touch();
        session.pty().write(data.as_bytes()).await
    }

    /// Propagate a window-size change from `conn` to its bound session.
    pub async fn apply_resize(
        &self,
        conn: &ConnectionHandle,
        session_id: Option<SessionId>,
        size: TerminalSize,
    ) -> RelayResult<()> {
        let session = self.bound_session(conn, session_id).await?;
        session.touch();
        session.pty().resize(size)
    }

    /// The session `conn` is bound to, checked against the id the client
    /// named (if any).
    async fn bound_session(
        &self,
        conn: &ConnectionHandle,
        session_id: Option<SessionId>,
    ) -> RelayResult<SessionHandle> {
        let bound = self
            .registry
            .lookup_by_connection(conn.id())
            .ok_or(RelayError::NotAttached)?;
        if matches!(session_id, Some(named) if named != bound) {
            return Err(RelayError::NotAttached);
        }
        self.session(bound)
            .await
            .ok_or(RelayError::SessionNotFound(bound))
    }

    /// Connection lost: move its session to `Detached`, or close it if the
    /// process is already gone. Returns the affected session.
    pub async fn detach(&self, connection_id: ConnectionId) -> Option<SessionId> {
        let session_id = self.registry.lookup_by_connection(connection_id)?;
        let Some(session) = self.session(session_id).await else {
            self.registry.unbind(connection_id);
            return None;
        };
        if !session.detach(&self.registry, connection_id) {
            return None;
        }
        self.notify(&session, SessionEventKind::Detached { connection_id });

        if !session.pty().is_alive() {
            let code = session.pty().exit_code();
            self.destroy(session_id, CloseReason::ProcessExited { code })
                .await;
        }
        Some(session_id)
    }

    /// Close a session: final frame to the bound connection, PTY close, then
    /// registry cleanup. Returns `false` if the session was already gone.
    pub async fn destroy(&self, session_id: SessionId, reason: CloseReason) -> bool {
        self.close_if(session_id, reason, |_, _| true).await
    }

    /// `destroy`, if `due(state, last_activity)` still holds once the
    /// session is locked.
    async fn close_if<F>(&self, session_id: SessionId, reason: CloseReason, due: F) -> bool
    where
        F: FnOnce(SessionState, Instant) -> bool,
    {
        let Some(session) = self.session(session_id).await else {
            return false;
        };
        let Some(bound) = session.mark_closed_if(&self.registry, due) else {
            return false;
        };
        self.sessions.write().await.remove(&session_id);

        if let Some(conn) = bound {
            conn.close(reason.final_frame(session_id), FINAL_FRAME_WAIT)
                .await;
        }
        session.pty().close().await;
        self.registry.unbind_session(session_id);

        self.notify(
            &session,
            SessionEventKind::Ended {
                reason: reason.to_string(),
            },
        );
        let lifetime_secs = (chrono::Utc::now() - session.created_at()).num_seconds();
        info!(
            session_id = %session_id,
            owner = %session.owner_id(),
            reason = %reason,
            lifetime_secs,
            "session closed"
        );
        true
    }

    /// Close detached sessions past the grace window and attached sessions
    /// idle past the idle timeout. Returns how many were closed.
    pub async fn evict_idle(&self) -> usize {
        let grace = &grace_expired(self.limits.grace_window);
        let idle = &idle_expired(self.limits.idle_timeout);
        let expired: Vec<(SessionId, CloseReason)> = {
            let sessions = self.sessions.read().await;
            sessions
                .values()
                .filter_map(|s| {
                    let (state, last_activity) = (s.state(), s.last_activity());
                    if grace(state, last_activity) {
                        Some((s.id(), CloseReason::GraceExpired))
                    } else if idle(state, last_activity) {
                        Some((s.id(), CloseReason::IdleTimeout))
                    } else {
                        None
                    }
                })
                .collect()
        };

        let mut closed = 0;
        for (id, reason) in expired {
            // A client may have come back since the snapshot.
            let grace_expiry = reason == CloseReason::GraceExpired;
            let due = move |state, last_activity| {
                if grace_expiry {
                    grace(state, last_activity)
                } else {
                    idle(state, last_activity)
                }
            };
            warn!(session_id = %id, reason = %reason, "evicting session");
            if self.close_if(id, reason, due).await {
                closed += 1;
            }
        }
        if closed > 0 {
            debug!(count = closed, "sweep closed sessions");
        }
        closed
    }

    /// Close every session.
    pub async fn shutdown(&self) {
        let ids: Vec<SessionId> = self.sessions.read().await.keys().copied().collect();
        info!(count = ids.len(), "closing all sessions");
        for id in ids {
            self.destroy(id, CloseReason::ServerShutdown).await;
        }
    }

    pub async fn session(&self, session_id: SessionId) -> Option<SessionHandle> {
        self.sessions.read().await.get(&session_id).cloned()
    }

    /// Number of live sessions.
    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    fn notify(&self, session: &Session, kind: SessionEventKind) {
        self.events
            .notify(SessionEvent::now(session.id(), session.owner_id(), kind));
    }
}

/// A spawned channel not yet installed as a session.
struct Spawned {
    pty: PtyHandle,
    output: mpsc::Receiver<Vec<u8>>,
    /// Output read while confirming the channel.
    preamble: Vec<u8>,
}

/// Detached past the grace window.
fn grace_expired(window: Duration) -> impl Fn(SessionState, Instant) -> bool {
    move |state, _| matches!(state, SessionState::Detached { since } if since.elapsed() >= window)
}

/// Attached with no activity for `timeout`.
fn idle_expired(timeout: Duration) -> impl Fn(SessionState, Instant) -> bool {
    move |state, last_activity| {
        matches!(state, SessionState::Attached { .. }) && last_activity.elapsed() >= timeout
    }
}

/// The `connect` frame echoed back once a connection is bound. `size` is the
/// size the client asked for, if any.
fn ack_frame(session: &Session, size: Option<TerminalSize>) -> Frame {
    let size = size.unwrap_or_else(|| session.terminal_size());
    Frame::Connect {
        session_id: Some(session.id()),
        session_type: session.session_type(),
        ssh_profile_id: session.ssh_profile_id().map(str::to_string),
        rows: Some(size.rows),
        cols: Some(size.cols),
    }
}

/// Watch a fresh SSH channel until it proves itself.
///
/// The `ssh` client exits with status 255 when it cannot reach or
/// authenticate to the host. A channel still running once its output has
/// gone quiet, or at the end of `window`, is connected. Returns the output
/// read meanwhile.
async fn await_ssh_handshake(
    pty: &PtyHandle,
    output: &mut mpsc::Receiver<Vec<u8>>,
    window: Duration,
) -> RelayResult<Vec<u8>> {
    let mut preamble = Vec::new();
    if window.is_zero() {
        return Ok(preamble);
    }

    let deadline = tokio::time::Instant::now() + window;
    let mut ended = false;
    loop {
        let wait_until = if preamble.is_empty() {
            deadline
        } else {
            deadline.min(tokio::time::Instant::now() + SSH_SETTLE)
        };
        match tokio::time::timeout_at(wait_until, output.recv()).await {
            Ok(Some(chunk)) => preamble.extend_from_slice(&chunk),
            Ok(None) => {
                ended = true;
                break;
            }
            Err(_) => break,
        }
    }
    if !ended && pty.is_alive() {
        return Ok(preamble);
    }

    match wait_for_exit(pty).await {
        Some(0) => Ok(preamble),
        code => {
            let text = String::from_utf8_lossy(&preamble);
            let detail = text
                .lines()
                .map(str::trim)
                .rev()
                .find(|line| !line.is_empty())
                .unwrap_or("ssh exited during handshake");
            let status = code.unwrap_or(SSH_CLIENT_FAILURE);
            Err(RelayError::SshConnect(format!("{detail} (exit status {status})")))
        }
    }
}

/// The stream can end a moment before the process is reaped.
async fn wait_for_exit(pty: &PtyHandle) -> Option<u32> {
    let deadline = Instant::now() + EXIT_STATUS_WAIT;
    loop {
        if let Some(code) = pty.exit_code() {
            return Some(code);
        }
        if Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

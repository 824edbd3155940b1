//! Per-connection pumps.
//!
//! Every accepted WebSocket gets two tasks: the inbound pump (this module's
//! `serve_connection` loop) which decodes frames and dispatches them to the
//! supervisor, and the outbound pump which drains the connection's bounded
//! queue onto the socket. Output from the PTY never touches the socket
//! directly; it always goes through the queue.

use super::connection::{ConnectionHandle, ConnectionId, Outbound};
use crate::auth::ServerRateLimits;
use crate::config::RelayLimits;
use crate::session::{CloseReason, SessionSupervisor};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use termrelay_core::{
    decode, decode_bytes, encode, DecodeError, Frame, RelayError, RelayResult, SessionId,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Maximum accepted inbound message size (1 MiB).
pub const MAX_WS_FRAME_SIZE: usize = 1_048_576;

/// Wait for queue room when closing a connection from the engine.
const CLOSE_WAIT: Duration = Duration::from_secs(1);

/// Drives WebSocket connections against the session supervisor.
pub struct RelayEngine {
    supervisor: Arc<SessionSupervisor>,
    rate_limits: Arc<Mutex<ServerRateLimits>>,
    next_connection_id: AtomicU64,
    shutdown: CancellationToken,
}

impl RelayEngine {
    pub fn new(
        supervisor: Arc<SessionSupervisor>,
        rate_limits: Arc<Mutex<ServerRateLimits>>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            supervisor,
            rate_limits,
            next_connection_id: AtomicU64::new(1),
            shutdown,
        })
    }

    pub fn supervisor(&self) -> &Arc<SessionSupervisor> {
        &self.supervisor
    }

    fn limits(&self) -> &RelayLimits {
        self.supervisor.limits()
    }

    /// Serve one authenticated WebSocket until it closes.
    pub async fn serve_connection<S>(
        self: Arc<Self>,
        ws: WebSocketStream<S>,
        owner_id: String,
        remote: Option<SocketAddr>,
    ) where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let (conn, outbound) = ConnectionHandle::new(
            connection_id,
            &owner_id,
            remote,
            self.limits().send_queue_frames,
        );
        info!(connection_id, owner = %owner_id, remote = ?remote, "connection opened");

        let (sink, stream) = ws.split();
        let mut writer = tokio::spawn(write_pump(
            sink,
            outbound,
            conn.cancel_token().clone(),
            self.limits().backpressure_timeout,
            connection_id,
        ));

        let closing = self.read_pump(stream, &conn).await;

        // A queued close request is flushed before the token is cancelled.
        let flushed = if closing {
            tokio::time::timeout(self.limits().backpressure_timeout, &mut writer)
                .await
                .ok()
        } else {
            None
        };
        conn.cancel_token().cancel();
        if let Some(session_id) = self.supervisor.detach(connection_id).await {
            debug!(connection_id, session_id = %session_id, "connection lost while attached");
        }
        let joined = match flushed {
            Some(joined) => joined,
            None => writer.await,
        };
        if let Err(e) = joined {
            warn!(connection_id, error = %e, "writer task failed");
        }
        info!(connection_id, owner = %owner_id, "connection closed");
    }

    /// Returns `true` if it stopped after queueing a close request for the
    /// writer.
    async fn read_pump<St>(&self, mut stream: St, conn: &ConnectionHandle) -> bool
    where
        St: Stream<Item = Result<Message, WsError>> + Unpin,
    {
        let cancel = conn.cancel_token().clone();
        let heartbeat = self.limits().client_timeout;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return false,
                _ = self.shutdown.cancelled() => {
                    let farewell = Frame::disconnect(None, CloseReason::ServerShutdown.to_string());
                    conn.close(Some(farewell), CLOSE_WAIT).await;
                    return true;
                }
                next = next_message(&mut stream, heartbeat) => next,
            };

            let message = match next {
                Err(elapsed) => {
                    warn!(connection_id = conn.id(), timeout = ?elapsed, "client heartbeat timed out");
                    break;
                }
                Ok(None) => {
                    debug!(connection_id = conn.id(), "peer closed");
                    break;
                }
                Ok(Some(Err(e))) => {
                    debug!(connection_id = conn.id(), error = %e, "WebSocket read failed");
                    break;
                }
                Ok(Some(Ok(message))) => message,
            };

            let decoded = match message {
                Message::Text(text) if text.len() > MAX_WS_FRAME_SIZE => {
                    Err(oversized(text.len()))
                }
                Message::Text(text) => decode(&text),
                Message::Binary(data) if data.len() > MAX_WS_FRAME_SIZE => {
                    Err(oversized(data.len()))
                }
                Message::Binary(data) => decode_bytes(&data),
                Message::Close(_) => {
                    debug!(connection_id = conn.id(), "close frame received");
                    break;
                }
                // Control frames are answered by tungstenite itself.
                _ => continue,
            };

            match decoded {
                Ok(frame) => self.dispatch(conn, frame).await,
                Err(DecodeError::UnknownFrameType(kind)) => {
                    warn!(connection_id = conn.id(), frame_type = %kind, "ignoring unknown frame type");
                }
                Err(e @ DecodeError::MalformedFrame(_)) => {
                    warn!(connection_id = conn.id(), error = %e, "malformed frame");
                    self.report(conn, &RelayError::from(e)).await;
                }
            }
        }
        false
    }

    async fn dispatch(&self, conn: &ConnectionHandle, frame: Frame) {
        match frame {
            Frame::Connect { .. } => self.handle_connect(conn, &frame).await,
            Frame::Input { session_id, data } => {
                if let Err(e) = self.supervisor.apply_input(conn, session_id, &data).await {
                    self.report(conn, &e).await;
                }
            }
            Frame::Resize { session_id, data } => {
                if let Err(e) = self.supervisor.apply_resize(conn, session_id, data).await {
                    self.report(conn, &e).await;
                }
            }
            Frame::Disconnect { session_id, reason } => {
                self.handle_disconnect(conn, session_id, &reason).await
            }
            Frame::Ping => {
                let _ = conn.send(Frame::Pong).await;
            }
            Frame::Pong => {}
            Frame::Output { .. } | Frame::Error { .. } => {
                debug!(
                    connection_id = conn.id(),
                    frame_type = frame.frame_type(),
                    "ignoring server-only frame"
                );
            }
        }
    }

    async fn handle_connect(&self, conn: &ConnectionHandle, frame: &Frame) {
        if !self.rate_limits.lock().check_connect(conn.owner_id()) {
            warn!(connection_id = conn.id(), owner = %conn.owner_id(), "connect rate limited");
            self.report(conn, &RelayError::RateLimited("too many connect attempts".into()))
                .await;
            return;
        }

        match self.supervisor.handle_connect(conn, frame).await {
            Ok(session) => {
                debug!(connection_id = conn.id(), session_id = %session.id(), "connect handled");
            }
            Err(e @ (RelayError::Spawn(_) | RelayError::SshConnect(_))) => {
                warn!(connection_id = conn.id(), error = %e, "session spawn failed");
                conn.close(Some(Frame::error(e.code(), e.to_string())), CLOSE_WAIT)
                    .await;
            }
            Err(e) => {
                info!(connection_id = conn.id(), error = %e, "connect rejected");
                self.report(conn, &e).await;
            }
        }
    }

    async fn handle_disconnect(
        &self,
        conn: &ConnectionHandle,
        named: Option<SessionId>,
        reason: &str,
    ) {
        let bound = self.supervisor.registry().lookup_by_connection(conn.id());
        match (bound, named) {
            (Some(bound), Some(named)) if bound != named => {
                self.report(conn, &RelayError::NotAttached).await;
            }
            (Some(bound), _) => {
                info!(connection_id = conn.id(), session_id = %bound, reason, "client disconnect");
                self.supervisor
                    .destroy(bound, CloseReason::ClientDisconnect)
                    .await;
            }
            (None, _) => conn.close(None, CLOSE_WAIT).await,
        }
    }

    /// Send an `error` frame; the connection stays open.
    async fn report(&self, conn: &ConnectionHandle, err: &RelayError) {
        let _ = conn.send(Frame::error(err.code(), err.to_string())).await;
    }
}

fn oversized(len: usize) -> DecodeError {
    DecodeError::MalformedFrame(format!(
        "message too large: {len} bytes (max {MAX_WS_FRAME_SIZE})"
    ))
}

/// Next inbound message, bounded by the heartbeat timeout when one is set.
async fn next_message<St>(
    stream: &mut St,
    heartbeat: Option<Duration>,
) -> Result<Option<Result<Message, WsError>>, Duration>
where
    St: Stream<Item = Result<Message, WsError>> + Unpin,
{
    match heartbeat {
        Some(limit) => tokio::time::timeout(limit, stream.next())
            .await
            .map_err(|_| limit),
        None => Ok(stream.next().await),
    }
}

/// Outbound pump: drain the queue onto the socket.
///
/// A send that does not complete within `send_timeout` is fatal to the
/// connection. On exit the connection token is cancelled so the inbound
/// pump stops too.
async fn write_pump<Si>(
    mut sink: Si,
    mut outbound: mpsc::Receiver<Outbound>,
    cancel: CancellationToken,
    send_timeout: Duration,
    connection_id: ConnectionId,
) where
    Si: Sink<Message, Error = WsError> + Unpin,
{
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = outbound.recv() => next,
        };
        match next {
            None => break,
            Some(Outbound::Frame(frame)) => {
                if let Err(e) = send_frame(&mut sink, &frame, send_timeout, &cancel).await {
                    warn!(connection_id, error = %e, code = ?e.code(), "dropping connection");
                    break;
                }
            }
            Some(Outbound::Close(final_frame)) => {
                if let Some(frame) = final_frame {
                    if let Err(e) = send_frame(&mut sink, &frame, send_timeout, &cancel).await {
                        debug!(connection_id, error = %e, "final frame not delivered");
                    }
                }
                if let Ok(Err(e)) = tokio::time::timeout(send_timeout, sink.close()).await {
                    debug!(connection_id, error = %e, "WebSocket close failed");
                }
                break;
            }
        }
    }
    cancel.cancel();
    outbound.close();
    debug!(connection_id, "writer stopped");
}

async fn send_frame<Si>(
    sink: &mut Si,
    frame: &Frame,
    send_timeout: Duration,
    cancel: &CancellationToken,
) -> RelayResult<()>
where
    Si: Sink<Message, Error = WsError> + Unpin,
{
    let text = encode(frame);
    tokio::select! {
        _ = cancel.cancelled() => Err(RelayError::Transport("connection cancelled".into())),
        sent = tokio::time::timeout(send_timeout, sink.send(Message::Text(text.into()))) => match sent {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(RelayError::Transport(format!("WS send failed: {e}"))),
            Err(_) => Err(RelayError::BackpressureTimeout(send_timeout)),
        },
    }
}

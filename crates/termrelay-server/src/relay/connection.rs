//! Live connection handles.
//!
//! A `ConnectionHandle` is the server-side view of one WebSocket: its id, the
//! authenticated owner, and the bounded queue feeding the connection's writer
//! task. Handles are cheap to clone and are what the registry stores.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use termrelay_core::Frame;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub type ConnectionId = u64;

/// Messages consumed by a connection's writer task.
#[derive(Debug)]
pub enum Outbound {
    /// Encode and send.
    Frame(Frame),
    /// Send the optional final frame, close the socket and stop.
    Close(Option<Frame>),
}

/// Handle to a live connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    owner_id: Arc<str>,
    remote: Option<SocketAddr>,
    outbound: mpsc::Sender<Outbound>,
    cancel: CancellationToken,
}

impl ConnectionHandle {
    /// Create a handle and the receiving end of its outbound queue.
    pub fn new(
        id: ConnectionId,
        owner_id: &str,
        remote: Option<SocketAddr>,
        queue: usize,
    ) -> (Self, mpsc::Receiver<Outbound>) {
        let (outbound, rx) = mpsc::channel(queue.max(1));
        let handle = Self {
            id,
            owner_id: Arc::from(owner_id),
            remote,
            outbound,
            cancel: CancellationToken::new(),
        };
        (handle, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn remote(&self) -> Option<SocketAddr> {
        self.remote
    }

    /// Queue a frame, suspending while the queue is full.
    ///
    /// Gives the frame back if the writer has gone away.
    pub async fn send(&self, frame: Frame) -> Result<(), Frame> {
        match self.outbound.send(Outbound::Frame(frame)).await {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendError(Outbound::Frame(frame))) => Err(frame),
            Err(mpsc::error::SendError(Outbound::Close(_))) => {
                unreachable!("send only queues Outbound::Frame")
            }
        }
    }

    /// Queue a frame without waiting. Returns `false` if it was not queued.
    pub fn try_send(&self, frame: Frame) -> bool {
        self.outbound.try_send(Outbound::Frame(frame)).is_ok()
    }

    /// Queue `frames` back to back, or none of them if the queue lacks room.
    pub fn try_send_all(&self, frames: Vec<Frame>) -> bool {
        match self.outbound.try_reserve_many(frames.len()) {
            Ok(permits) => {
                for (permit, frame) in permits.zip(frames) {
                    permit.send(Outbound::Frame(frame));
                }
                true
            }
            Err(_) => false,
        }
    }

    /// Ask the writer to flush `final_frame` and close the socket.
    ///
    /// If the queue does not accept the request within `wait`, the
    /// connection is cancelled outright.
    pub async fn close(&self, final_frame: Option<Frame>, wait: Duration) {
        let queued = tokio::time::timeout(wait, self.outbound.send(Outbound::Close(final_frame)))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false);
        if !queued {
            debug!(connection_id = self.id, "close request not queued, cancelling");
            self.cancel.cancel();
        }
    }

    /// Token cancelled when this connection is torn down.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Whether the connection is being or has been torn down.
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.outbound.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn close_falls_back_to_cancel_when_queue_is_full() {
        let (handle, _rx) = ConnectionHandle::new(1, "alice", None, 1);
        assert!(handle.try_send(Frame::Ping));
        assert!(!handle.try_send(Frame::Pong));

        handle.close(None, Duration::from_millis(20)).await;
        assert!(handle.cancel_token().is_cancelled());
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn batch_is_queued_whole_or_not_at_all() {
        let (handle, mut rx) = ConnectionHandle::new(3, "alice", None, 2);
        assert!(handle.try_send(Frame::Ping));
        assert!(!handle.try_send_all(vec![Frame::Pong, Frame::Pong]));

        assert!(matches!(rx.recv().await, Some(Outbound::Frame(Frame::Ping))));
        assert!(handle.try_send_all(vec![Frame::Pong, Frame::Ping]));
        assert!(matches!(rx.recv().await, Some(Outbound::Frame(Frame::Pong))));
        assert!(matches!(rx.recv().await, Some(Outbound::Frame(Frame::Ping))));
    }

    #[tokio::test]
    async fn send_returns_frame_when_writer_is_gone() {
        let (handle, rx) = ConnectionHandle::new(2, "alice", None, 4);
        drop(rx);
        assert_eq!(handle.send(Frame::Ping).await, Err(Frame::Ping));
        assert!(handle.is_closed());
    }
}

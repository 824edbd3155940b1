//! Per-session output router.
//!
//! Reads PTY chunks, decodes them as UTF-8 and hands each piece to whatever
//! connection is bound at that moment, or to the detached buffer when none
//! is. Sending to a full connection queue suspends the router, which stops
//! the PTY reader thread, which stops the process: end-to-end backpressure.

use super::state::Session;
use crate::relay::ConnectionRegistry;
use termrelay_core::{Frame, Utf8Stream};
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Why the router stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterExit {
    /// The output stream ended (process exit or read failure).
    StreamEnded,
    /// The session was closed from elsewhere.
    Cancelled,
}

/// Run until the PTY output ends or the session is cancelled. `preamble` is
/// output already read from the stream before the router took it over.
pub async fn run(
    session: &Session,
    registry: &ConnectionRegistry,
    preamble: Vec<u8>,
    mut output: mpsc::Receiver<Vec<u8>>,
) -> RouterExit {
    let cancel = session.cancel_token().clone();
    let mut decoder = Utf8Stream::new();

    let text = decoder.push(&preamble);
    if !text.is_empty() && !deliver(session, registry, text).await {
        return RouterExit::Cancelled;
    }

    loop {
        let chunk = tokio::select! {
            biased;
            _ = cancel.cancelled() => return RouterExit::Cancelled,
            chunk = output.recv() => chunk,
        };
        let Some(chunk) = chunk else { break };
        let text = decoder.push(&chunk);
        if text.is_empty() {
            continue;
        }
        if !deliver(session, registry, text).await {
            return RouterExit::Cancelled;
        }
    }

    let tail = decoder.finish();
    if !tail.is_empty() && !deliver(session, registry, tail).await {
        return RouterExit::Cancelled;
    }
    debug!(session_id = %session.id(), "output stream ended");
    RouterExit::StreamEnded
}

/// Deliver one piece of output. Returns `false` if cancelled mid-send.
async fn deliver(session: &Session, registry: &ConnectionRegistry, mut text: String) -> bool {
    let cancel = session.cancel_token();
    loop {
        let Some(conn) = session.route_output(registry, &text) else {
            return true;
        };
        let frame = Frame::output(session.id(), text);
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return false,
            result = conn.send(frame) => result,
        };
        match result {
            Ok(()) => return true,
            // The writer went away between lookup and send; re-route so the
            // bytes land in the detached buffer.
            Err(Frame::Output { data, .. }) => {
                trace!(session_id = %session.id(), connection_id = conn.id(), "re-routing output");
                text = data;
            }
            Err(_) => return true,
        }
    }
}

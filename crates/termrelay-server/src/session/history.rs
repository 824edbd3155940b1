//! Session history notifications for the persistence collaborator.
//!
//! The relay reports lifecycle events (started, attached, detached, ended)
//! through `SessionEventSink`. Delivery is fire-and-forget: a sink must never
//! block the relay. `JsonlHistory` appends newline-delimited JSON from a
//! background task.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use termrelay_core::{SessionId, SessionType};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Events buffered before new ones are dropped.
const HISTORY_QUEUE: usize = 1024;

/// Lifecycle event kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEventKind {
    Started {
        session_type: SessionType,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ssh_profile_id: Option<String>,
    },
    Attached {
        connection_id: u64,
    },
    Detached {
        connection_id: u64,
    },
    Ended {
        reason: String,
    },
}

/// A single timestamped history entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEvent {
    pub at: DateTime<Utc>,
    pub session_id: SessionId,
    pub owner_id: String,
    #[serde(flatten)]
    pub kind: SessionEventKind,
}

impl SessionEvent {
    pub fn now(session_id: SessionId, owner_id: &str, kind: SessionEventKind) -> Self {
        Self {
            at: Utc::now(),
            session_id,
            owner_id: owner_id.to_string(),
            kind,
        }
    }
}

/// Receives session lifecycle events. Implementations must not block.
pub trait SessionEventSink: Send + Sync {
    fn notify(&self, event: SessionEvent);
}

/// Discards every event.
pub struct NullSink;

impl SessionEventSink for NullSink {
    fn notify(&self, _event: SessionEvent) {}
}

/// Appends events to `<dir>/sessions.jsonl`.
pub struct JsonlHistory {
    tx: mpsc::Sender<SessionEvent>,
    path: PathBuf,
}

impl JsonlHistory {
    /// Start the writer task. Must be called inside a Tokio runtime.
    pub fn spawn(dir: &Path) -> std::io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join("sessions.jsonl");
        let (tx, mut rx) = mpsc::channel::<SessionEvent>(HISTORY_QUEUE);

        let writer_path = path.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match serde_json::to_string(&event) {
                    Ok(mut line) => {
                        line.push('\n');
                        if let Err(e) = append_line(&writer_path, &line).await {
                            error!(path = %writer_path.display(), error = %e, "failed to write session history");
                        }
                    }
                    Err(e) => error!(error = %e, "failed to serialize session event"),
                }
            }
            debug!(path = %writer_path.display(), "session history writer stopped");
        });

        Ok(Self { tx, path })
    }

    /// Path of the history file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SessionEventSink for JsonlHistory {
    fn notify(&self, event: SessionEvent) {
        if let Err(e) = self.tx.try_send(event) {
            warn!(error = %e, "session history queue full, dropping event");
        }
    }
}

async fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}

/// Load a history file, skipping malformed lines.
pub async fn load_history(path: &Path) -> std::io::Result<Vec<SessionEvent>> {
    let content = tokio::fs::read_to_string(path).await?;
    let mut entries = Vec::new();
    for line in content.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<SessionEvent>(line) {
            Ok(entry) => entries.push(entry),
            Err(e) => {
                error!(error = %e, "skipping malformed history line");
            }
        }
    }
    Ok(entries)
}

//! Session management: PTY lifecycle, state machine, output routing,
//! detached buffering and history.

pub mod history;
pub mod pty;
pub mod ring_buffer;
pub mod router;
pub mod state;
pub mod supervisor;

pub use history::{JsonlHistory, NullSink, SessionEvent, SessionEventKind, SessionEventSink};
pub use pty::{PtyHandle, SpawnTarget};
pub use ring_buffer::RingBuffer;
pub use state::{Session, SessionState};
pub use supervisor::{CloseReason, SessionHandle, SessionSupervisor};

//! PTY wrapper using portable-pty.
//!
//! A `PtyHandle` owns exactly one terminal channel: a local pseudo-terminal
//! running a shell, or a channel handed over by the SSH collaborator. Blocking
//! reads and writes run on dedicated threads; the async side sees a bounded
//! output channel and a bounded input queue.

use crate::config::ShellConfig;
use crate::ssh::SshConnector;
use parking_lot::Mutex;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use termrelay_core::{RelayError, RelayResult, TerminalSize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Read buffer size for PTY reads.
const READ_CHUNK: usize = 4096;

/// Chunks buffered between the reader thread and the output router.
const OUTPUT_QUEUE: usize = 32;

/// Pending keystroke writes before `write` starts to suspend.
const INPUT_QUEUE: usize = 256;

/// What a new session should run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpawnTarget {
    LocalShell,
    Ssh { profile_id: String },
}

/// Control surface of a terminal channel.
pub trait ChannelControl: Send {
    /// Propagate a window-size change.
    fn resize(&mut self, size: TerminalSize) -> RelayResult<()>;

    /// `Some(exit code)` once the process or remote channel has ended.
    fn try_wait(&mut self) -> Option<u32>;

    /// Kill and reap the process and release the channel's descriptors.
    fn terminate(&mut self) -> RelayResult<()>;
}

/// A freshly opened terminal channel, split for the I/O threads.
pub struct ChannelParts {
    pub reader: Box<dyn Read + Send>,
    pub writer: Box<dyn Write + Send>,
    pub control: Box<dyn ChannelControl>,
}

/// Control for a process running on a local pseudo-terminal.
struct LocalPtyControl {
    master: Option<Box<dyn MasterPty + Send>>,
    child: Box<dyn Child + Send + Sync>,
    exit_code: Option<u32>,
}

impl ChannelControl for LocalPtyControl {
    fn resize(&mut self, size: TerminalSize) -> RelayResult<()> {
        let Some(master) = self.master.as_ref() else {
            return Ok(());
        };
        master
            .resize(PtySize {
                rows: size.rows,
                cols: size.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| RelayError::Other(format!("PTY resize failed: {e}")))
    }

    fn try_wait(&mut self) -> Option<u32> {
        if self.exit_code.is_none() {
            if let Ok(Some(status)) = self.child.try_wait() {
                self.exit_code = Some(status.exit_code());
            }
        }
        self.exit_code
    }

    fn terminate(&mut self) -> RelayResult<()> {
        if self.try_wait().is_none() {
            if let Err(e) = self.child.kill() {
                debug!(error = %e, "kill failed (process may have exited)");
            }
            let status = self.child.wait()?;
            self.exit_code = Some(status.exit_code());
        }
        // Dropping the master closes the pty fd and wakes the reader thread.
        self.master.take();
        Ok(())
    }
}

/// Run `cmd` on a new local pseudo-terminal.
pub fn open_command(cmd: CommandBuilder, size: TerminalSize) -> RelayResult<ChannelParts> {
    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(PtySize {
            rows: size.rows,
            cols: size.cols,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|e| RelayError::Spawn(format!("failed to open PTY: {e}")))?;

    let child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| RelayError::Spawn(format!("failed to spawn command: {e}")))?;
    // The slave must be closed on our side so EOF reaches the reader.
    drop(pair.slave);

    let reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| RelayError::Spawn(format!("failed to clone PTY reader: {e}")))?;
    let writer = pair
        .master
        .take_writer()
        .map_err(|e| RelayError::Spawn(format!("failed to take PTY writer: {e}")))?;

    Ok(ChannelParts {
        reader,
        writer,
        control: Box::new(LocalPtyControl {
            master: Some(pair.master),
            child,
            exit_code: None,
        }),
    })
}

fn shell_command(shell: &ShellConfig) -> CommandBuilder {
    let mut cmd = CommandBuilder::new(&shell.program);
    cmd.args(&shell.args);
    for (key, value) in &shell.env {
        cmd.env(key, value);
    }
    cmd.env("TERM", "xterm-256color");
    if let Some(home) = dirs::home_dir() {
        cmd.cwd(home);
    }
    cmd
}

/// A managed terminal channel.
pub struct PtyHandle {
    input_tx: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    output_rx: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    control: Arc<Mutex<Box<dyn ChannelControl>>>,
    size: Mutex<TerminalSize>,
    read_error: Arc<Mutex<Option<String>>>,
    closed: AtomicBool,
}

impl PtyHandle {
    /// Spawn a new channel for `target`. Blocking: call from `spawn_blocking`.
    pub fn spawn(
        target: &SpawnTarget,
        owner_id: &str,
        size: TerminalSize,
        shell: &ShellConfig,
        ssh: &dyn SshConnector,
    ) -> RelayResult<Self> {
        let parts = match target {
            SpawnTarget::LocalShell => open_command(shell_command(shell), size)?,
            SpawnTarget::Ssh { profile_id } => ssh
                .open_channel(owner_id, profile_id, size)
                .map_err(|e| match e {
                    RelayError::Spawn(_) => e,
                    other => RelayError::Spawn(other.to_string()),
                })?,
        };
        info!(target = ?target, rows = size.rows, cols = size.cols, "PTY spawned");
        Self::from_parts(parts, size)
    }

    /// Wrap an already opened channel and start its I/O threads.
    pub fn from_parts(parts: ChannelParts, size: TerminalSize) -> RelayResult<Self> {
        let ChannelParts {
            mut reader,
            mut writer,
            control,
        } = parts;

        let (output_tx, output_rx) = mpsc::channel::<Vec<u8>>(OUTPUT_QUEUE);
        let read_error = Arc::new(Mutex::new(None));
        let reader_error = read_error.clone();
        std::thread::Builder::new()
            .name("pty-reader".into())
            .spawn(move || {
                let mut buf = [0u8; READ_CHUNK];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            // Blocks while the router is behind: backpressure.
                            if output_tx.blocking_send(buf[..n].to_vec()).is_err() {
                                break;
                            }
                        }
                        Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                        Err(e) => {
                            *reader_error.lock() = Some(e.to_string());
                            break;
                        }
                    }
                }
                debug!("PTY reader finished");
            })?;

        let (input_tx, mut input_rx) = mpsc::channel::<Vec<u8>>(INPUT_QUEUE);
        std::thread::Builder::new()
            .name("pty-writer".into())
            .spawn(move || {
                while let Some(data) = input_rx.blocking_recv() {
                    if let Err(e) = writer.write_all(&data).and_then(|_| writer.flush()) {
                        debug!(error = %e, "PTY write failed");
                        break;
                    }
                }
            })?;

        Ok(Self {
            input_tx: Mutex::new(Some(input_tx)),
            output_rx: Mutex::new(Some(output_rx)),
            control: Arc::new(Mutex::new(control)),
            size: Mutex::new(size),
            read_error,
            closed: AtomicBool::new(false),
        })
    }

    /// Queue keystrokes for the process. Suspends only when the queue is full.
    pub async fn write(&self, data: &[u8]) -> RelayResult<()> {
        let tx = self.input_tx.lock().clone().ok_or(RelayError::PtyClosed)?;
        tx.send(data.to_vec())
            .await
            .map_err(|_| RelayError::PtyClosed)
    }

    /// The output stream. Yields chunks until the channel ends; can be taken
    /// once.
    pub fn take_output(&self) -> Option<mpsc::Receiver<Vec<u8>>> {
        self.output_rx.lock().take()
    }

    /// Resize the terminal. A no-op once the process has exited.
    pub fn resize(&self, size: TerminalSize) -> RelayResult<()> {
        if !self.is_alive() {
            return Ok(());
        }
        self.control.lock().resize(size)?;
        *self.size.lock() = size;
        debug!(rows = size.rows, cols = size.cols, "PTY resized");
        Ok(())
    }

    /// Current terminal size.
    pub fn size(&self) -> TerminalSize {
        *self.size.lock()
    }

    /// Whether the underlying process/channel is still running.
    pub fn is_alive(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.control.lock().try_wait().is_none()
    }

    pub fn exit_code(&self) -> Option<u32> {
        self.control.lock().try_wait()
    }

    /// The error that ended the output stream, if it was not a clean EOF.
    pub fn read_error(&self) -> Option<String> {
        self.read_error.lock().clone()
    }

    /// Release the process and descriptors. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Ends the writer thread, which drops its fd.
        self.input_tx.lock().take();

        let control = self.control.clone();
        match tokio::task::spawn_blocking(move || control.lock().terminate()).await {
            Ok(Ok(())) => debug!("PTY closed"),
            Ok(Err(e)) => warn!(error = %e, "PTY terminate failed"),
            Err(e) => warn!(error = %e, "PTY terminate task panicked"),
        }
    }
}

impl Drop for PtyHandle {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            if let Err(e) = self.control.lock().terminate() {
                warn!(error = %e, "PTY terminate on drop failed");
            }
        }
    }
}

#[cfg(all(test, unix))]
pub(crate) mod testing {
    //! In-memory channels backed by a Unix socket pair.

    use super::*;
    use std::os::unix::net::UnixStream;
    use std::sync::atomic::AtomicU32;

    /// Shared view of a fake channel's control state.
    #[derive(Clone, Default)]
    pub struct FakeState {
        pub terminated: Arc<AtomicBool>,
        /// Exit code + 1; 0 means still running.
        pub exit: Arc<AtomicU32>,
        pub size: Arc<Mutex<Option<TerminalSize>>>,
    }

    impl FakeState {
        pub fn set_exited(&self, code: u32) {
            self.exit.store(code + 1, Ordering::SeqCst);
        }

        pub fn terminated(&self) -> bool {
            self.terminated.load(Ordering::SeqCst)
        }

        pub fn last_size(&self) -> Option<TerminalSize> {
            *self.size.lock()
        }
    }

    struct FakeControl {
        socket: UnixStream,
        state: FakeState,
    }

    impl ChannelControl for FakeControl {
        fn resize(&mut self, size: TerminalSize) -> RelayResult<()> {
            *self.state.size.lock() = Some(size);
            Ok(())
        }

        fn try_wait(&mut self) -> Option<u32> {
            if self.state.terminated() {
                return Some(137);
            }
            match self.state.exit.load(Ordering::SeqCst) {
                0 => None,
                n => Some(n - 1),
            }
        }

        fn terminate(&mut self) -> RelayResult<()> {
            self.state.terminated.store(true, Ordering::SeqCst);
            let _ = self.socket.shutdown(std::net::Shutdown::Both);
            Ok(())
        }
    }

    /// A channel whose far end is returned to the test as the "remote".
    pub fn fake_channel() -> (ChannelParts, UnixStream, FakeState) {
        let (local, remote) = UnixStream::pair().expect("socketpair");
        let state = FakeState::default();
        let parts = ChannelParts {
            reader: Box::new(local.try_clone().expect("clone")),
            writer: Box::new(local.try_clone().expect("clone")),
            control: Box::new(FakeControl {
                socket: local,
                state: state.clone(),
            }),
        };
        (parts, remote, state)
    }
}

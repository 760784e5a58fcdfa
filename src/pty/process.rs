//! PTY process management
//!
//! Spawns a shell command line attached to a freshly allocated pseudo-terminal
//! and hands out the pieces a session needs:
//! - a blocking reader and a blocking writer on the pty master
//! - a waiter that reports the child's exit status
//! - a kill handle usable while the waiter owns the child

use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, ExitStatus, MasterPty, PtySize};
use std::io::{self, Read, Write};
use std::path::Path;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::debug;

/// Errors that can occur during PTY operations
#[derive(Error, Debug)]
pub enum PtyError {
    #[error("Failed to open PTY: {0}")]
    OpenFailed(String),

    #[error("Failed to spawn process: {0}")]
    SpawnFailed(String),

    #[error("Failed to kill process: {0}")]
    KillFailed(String),

    #[error("Failed to write to PTY: {0}")]
    WriteFailed(String),

    #[error("PTY already closed")]
    Closed,

    #[error("Failed to wait for process: {0}")]
    WaitFailed(String),

    #[error("PTY {0} already taken")]
    AlreadyTaken(&'static str),

    #[error("PTY system error: {0}")]
    SystemError(String),
}

/// Result type for PTY operations
pub type PtyResult<T> = Result<T, PtyError>;

/// Terminal size configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

impl TerminalSize {
    /// Create a new terminal size
    pub fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }

    /// Convert to portable-pty PtySize
    fn to_pty_size(self) -> PtySize {
        PtySize {
            rows: self.rows,
            cols: self.cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

/// A child process running on the slave side of a pty
pub struct PtyProcess {
    /// Process ID, if the platform reports one
    pid: Option<u32>,
    /// The master PTY handle, `None` once stopped
    master: Option<Box<dyn MasterPty + Send>>,
    /// Reader half of the master until a relay takes it
    reader: Option<Box<dyn Read + Send>>,
    /// Writer half of the master until a relay takes it
    writer: Option<Box<dyn Write + Send>>,
    /// The child until a waiter takes ownership of it
    child: Option<Box<dyn Child + Send + Sync>>,
    /// Kills the child regardless of who owns it
    killer: Box<dyn ChildKiller + Send + Sync>,
}

impl PtyProcess {
    /// Spawn `shell -c command` attached to a new pty
    ///
    /// The command line is handed to the shell untouched, so quoting, pipes
    /// and other metacharacters behave as they would at a prompt.
    pub fn spawn(
        shell: &str,
        command: &str,
        working_dir: Option<&Path>,
        size: TerminalSize,
    ) -> PtyResult<Self> {
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(size.to_pty_size())
            .map_err(|e| PtyError::OpenFailed(e.to_string()))?;

        let mut cmd = CommandBuilder::new(shell);
        cmd.arg("-c");
        cmd.arg(command);
        match working_dir {
            Some(dir) => cmd.cwd(dir),
            None => {
                let cwd =
                    std::env::current_dir().map_err(|e| PtyError::SystemError(e.to_string()))?;
                cmd.cwd(cwd);
            }
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;

        // The child holds its own copy; ours would keep the master from seeing EOF
        drop(pair.slave);

        let mut process = Self {
            pid: child.process_id(),
            killer: child.clone_killer(),
            child: Some(child),
            master: None,
            reader: None,
            writer: None,
        };

        // From here on a failure drops `process`, which reaps the child
        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtyError::SystemError(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::SystemError(e.to_string()))?;

        process.reader = Some(reader);
        process.writer = Some(writer);
        process.master = Some(pair.master);

        debug!("Spawned `{} -c {}` with pid {:?}", shell, command, process.pid);
        Ok(process)
    }

    /// Get the process ID
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Take the reader half of the pty master
    pub fn take_reader(&mut self) -> PtyResult<Box<dyn Read + Send>> {
        self.reader.take().ok_or(PtyError::AlreadyTaken("reader"))
    }

    /// Take the writer half of the pty master (the child's stdin)
    ///
    /// Writes block while the child is not reading its terminal, so the
    /// writer belongs on its own thread.
    pub fn take_writer(&mut self) -> PtyResult<Box<dyn Write + Send>> {
        if self.is_stopped() {
            return Err(PtyError::Closed);
        }
        self.writer.take().ok_or(PtyError::AlreadyTaken("writer"))
    }

    /// Move the child onto a waiter thread and return a handle to its result
    pub fn start_waiter(&mut self) -> PtyResult<ProcessWaiter> {
        let mut child = self.child.take().ok_or(PtyError::AlreadyTaken("child"))?;
        let (tx, rx) = oneshot::channel();

        std::thread::spawn(move || {
            let _ = tx.send(child.wait());
        });

        Ok(ProcessWaiter { rx })
    }

    /// Kill the child process
    ///
    /// On unix the whole process group led by the child gets SIGKILL, so
    /// commands the shell forked die with it. Elsewhere portable-pty's killer
    /// is used.
    pub fn kill(&mut self) -> PtyResult<()> {
        match self.pid {
            Some(pid) if cfg!(unix) => kill_process_group(pid),
            _ => self
                .killer
                .kill()
                .map_err(|e| PtyError::KillFailed(e.to_string())),
        }
    }

    /// Close the pty master
    ///
    /// Safe to call any number of times; only the first call releases anything.
    pub fn stop(&mut self) {
        let closed = self.master.take().is_some();
        self.writer = None;
        self.reader = None;
        if closed {
            debug!("Closed PTY master for pid {:?}", self.pid);
        }
    }

    /// Check whether the pty master has been closed
    pub fn is_stopped(&self) -> bool {
        self.master.is_none()
    }
}

impl Drop for PtyProcess {
    fn drop(&mut self) {
        self.stop();

        // Never waited on: kill and reap in the background so no zombie is left
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            std::thread::spawn(move || {
                let _ = child.wait();
            });
        }
    }
}

#[cfg(unix)]
fn kill_process_group(pid: u32) -> PtyResult<()> {
    use nix::sys::signal::{kill, killpg, Signal};
    use nix::unistd::Pid;

    let pid = Pid::from_raw(pid as i32);
    killpg(pid, Signal::SIGKILL)
        .or_else(|_| kill(pid, Signal::SIGKILL))
        .map_err(|e| PtyError::KillFailed(e.to_string()))
}

#[cfg(not(unix))]
fn kill_process_group(_pid: u32) -> PtyResult<()> {
    Err(PtyError::KillFailed("process groups are unix only".to_string()))
}

/// Receives the exit status of a child moved onto a waiter thread
pub struct ProcessWaiter {
    rx: oneshot::Receiver<io::Result<ExitStatus>>,
}

impl ProcessWaiter {
    /// Wait for the child to finish
    ///
    /// Cancel safe: dropping the future and calling again keeps waiting for
    /// the same result.
    pub async fn wait(&mut self) -> PtyResult<ExitStatus> {
        match (&mut self.rx).await {
            Ok(Ok(status)) => Ok(status),
            Ok(Err(e)) => Err(PtyError::WaitFailed(e.to_string())),
            Err(_) => Err(PtyError::WaitFailed("waiter thread exited".to_string())),
        }
    }
}

//! Session controller
//!
//! Owns the child process and its pty for the lifetime of one connection and
//! runs the relays and the arbiter against that connection.

use std::path::PathBuf;
use std::time::Duration;

use futures_util::{Sink, Stream, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::arbiter::{self, Phase, SessionStatus};
use super::relay::{self, PtyInput, RelayError, RelayEvent};
use crate::config::{
    DEFAULT_CLOSE_TIMEOUT_SECS, DEFAULT_READ_BUFFER_SIZE, DEFAULT_REAP_TIMEOUT_SECS, DEFAULT_SHELL,
};
use crate::pty::{ProcessWaiter, PtyError, PtyProcess, TerminalSize};

/// How long teardown waits for the pty reader thread before abandoning it
const RELAY_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Errors that can occur while starting a session
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Failed to spawn process: {0}")]
    Spawn(#[from] PtyError),

    #[error("Failed to start PTY relay thread: {0}")]
    Relay(#[from] std::io::Error),
}

/// Result type for session operations
pub type SessionResult<T> = Result<T, SessionError>;

/// Everything a session needs to know to run its command
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Shell that interprets `command`
    pub shell: String,
    /// Command line to execute
    pub command: String,
    /// Working directory of the child (defaults to ours)
    pub working_dir: Option<PathBuf>,
    /// Initial terminal size
    pub size: TerminalSize,
    /// Bytes requested per pty read
    pub read_buffer_size: usize,
    /// Grace period for the child once the session is terminating
    pub reap_timeout: Duration,
    /// Deadline for sending the close frame
    pub close_timeout: Duration,
}

impl SessionConfig {
    /// Create a config for `command` with default settings
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            shell: DEFAULT_SHELL.to_string(),
            command: command.into(),
            working_dir: None,
            size: TerminalSize::default(),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            reap_timeout: Duration::from_secs(DEFAULT_REAP_TIMEOUT_SECS),
            close_timeout: Duration::from_secs(DEFAULT_CLOSE_TIMEOUT_SECS),
        }
    }

    /// Set the shell used to run the command
    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    /// Set the child's working directory
    pub fn with_working_dir(mut self, working_dir: Option<PathBuf>) -> Self {
        self.working_dir = working_dir;
        self
    }

    /// Set the initial terminal size
    pub fn with_size(mut self, size: TerminalSize) -> Self {
        self.size = size;
        self
    }

    /// Set the number of bytes requested per pty read
    pub fn with_read_buffer_size(mut self, read_buffer_size: usize) -> Self {
        self.read_buffer_size = read_buffer_size;
        self
    }

    /// Set the grace period before the child is killed
    pub fn with_reap_timeout(mut self, reap_timeout: Duration) -> Self {
        self.reap_timeout = reap_timeout;
        self
    }

    /// Set the deadline for sending the close frame
    pub fn with_close_timeout(mut self, close_timeout: Duration) -> Self {
        self.close_timeout = close_timeout;
        self
    }
}

/// One remote connection bridged to one process in a pty
pub struct Session {
    id: Uuid,
    config: SessionConfig,
    process: PtyProcess,
    waiter: ProcessWaiter,
    outbound: mpsc::Receiver<RelayEvent<String>>,
    /// Input queue for the pty writer thread, `None` once forwarding ended
    input: Option<PtyInput>,
    status: SessionStatus,
    /// Set once the child has been reaped
    reaped: bool,
}

impl Session {
    /// Spawn the configured command and start reading its pty
    ///
    /// Either everything is set up or nothing is: on error the child, if one
    /// was spawned, is killed and reaped.
    pub fn start(config: SessionConfig) -> SessionResult<Self> {
        let id = Uuid::new_v4();

        let mut process = PtyProcess::spawn(
            &config.shell,
            &config.command,
            config.working_dir.as_deref(),
            config.size,
        )?;
        let reader = process.take_reader()?;
        let outbound = relay::spawn_outbound(reader, config.read_buffer_size)?;
        let input = relay::spawn_pty_writer(process.take_writer()?)?;
        let waiter = process.start_waiter()?;

        info!(session = %id, pid = ?process.pid(), "Started `{}`", config.command);

        Ok(Self {
            id,
            config,
            process,
            waiter,
            outbound,
            input: Some(input),
            status: SessionStatus::default(),
            reaped: false,
        })
    }

    /// Get the session ID
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Get the child's process ID
    pub fn pid(&self) -> Option<u32> {
        self.process.pid()
    }

    /// Bridge `connection` to the pty until the session ends
    ///
    /// Returns the status that was sent to the peer in the close frame.
    pub async fn run<C>(self, connection: C) -> SessionStatus
    where
        C: Stream<Item = Result<Message, WsError>> + Sink<Message> + Send + 'static,
        <C as Sink<Message>>::Error: std::fmt::Display,
    {
        let span = info_span!("session", id = %self.id);
        self.bridge(connection).instrument(span).await
    }

    async fn bridge<C>(mut self, connection: C) -> SessionStatus
    where
        C: Stream<Item = Result<Message, WsError>> + Sink<Message> + Send + 'static,
        <C as Sink<Message>>::Error: std::fmt::Display,
    {
        let (mut sink, stream) = connection.split::<Message>();
        let (mut inbound, inbound_task) = relay::spawn_inbound(stream);

        debug!("Phase: {}", Phase::Running);
        let reason = match self.input.as_mut() {
            Some(input) => {
                arbiter::forward(&mut sink, input, &mut self.outbound, &mut inbound).await
            }
            None => RelayError::PtyWrite(PtyError::Closed),
        };
        info!("Relay stopped: {}", reason);

        // Nothing more is forwarded from here on
        drop(inbound);
        if let Some(input) = self.input.take() {
            if input.pending() > 0 {
                debug!("Discarding {} bytes of unwritten input", input.pending());
            }
        }
        debug!("Phase: {}", Phase::Draining);

        debug!("Phase: {}", Phase::Reaping);
        self.status =
            arbiter::reap(&mut self.process, &mut self.waiter, self.config.reap_timeout).await;
        self.reaped = true;
        info!("Exited with: {}", self.status);

        debug!("Phase: {}", Phase::Closing);
        arbiter::send_close(&mut sink, self.status, self.config.close_timeout).await;

        inbound_task.abort();
        if let Err(e) = inbound_task.await {
            if !e.is_cancelled() {
                warn!("Inbound relay failed: {}", e);
            }
        }
        drop(sink);

        self.stop();
        self.join_outbound().await;
        debug!("Phase: {}", Phase::Done);

        self.status
    }

    /// Close the pty master and stop the pty writer
    ///
    /// Safe to call again after the session has ended.
    pub fn stop(&mut self) {
        self.input = None;
        if self.process.is_stopped() {
            debug!("Session already stopped");
            return;
        }
        self.process.stop();
    }

    /// Wait briefly for the pty reader thread to finish
    async fn join_outbound(&mut self) {
        let outbound = &mut self.outbound;
        let drained = timeout(RELAY_JOIN_TIMEOUT, async {
            while outbound.recv().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!("PTY reader still blocked after {:?}, abandoning it", RELAY_JOIN_TIMEOUT);
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // Started but never run to completion; the waiter thread reaps it
        if !self.reaped {
            if let Err(e) = self.process.kill() {
                debug!("Failed to kill unfinished session {}: {}", self.id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_config_new() {
        let config = SessionConfig::new("ls");
        assert_eq!(config.command, "ls");
        assert_eq!(config.shell, "bash");
        assert_eq!(config.read_buffer_size, 512);
        assert_eq!(config.reap_timeout, Duration::from_secs(10));
        assert_eq!(config.close_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_session_config_builders() {
        let config = SessionConfig::new("ls")
            .with_reap_timeout(Duration::from_millis(250))
            .with_shell("/bin/bash");
        assert_eq!(config.reap_timeout, Duration::from_millis(250));
        assert_eq!(config.shell, "/bin/bash");
    }

    #[tokio::test]
    async fn test_start_spawns_process() {
        let session = Session::start(SessionConfig::new("sleep 1000")).unwrap();
        assert!(session.pid().is_some());
        assert_eq!(session.status, SessionStatus::Success);
    }

    #[tokio::test]
    async fn test_start_fails_without_shell() {
        let config = SessionConfig::new("true").with_shell("/nonexistent/shell");
        let result = Session::start(config);
        assert!(matches!(result, Err(SessionError::Spawn(PtyError::SpawnFailed(_)))));
    }

    #[tokio::test]
    async fn test_stop_twice() {
        let mut session = Session::start(SessionConfig::new("sleep 1000")).unwrap();
        session.stop();
        session.stop();
        assert!(session.process.is_stopped());
        assert!(session.input.is_none());
    }
}

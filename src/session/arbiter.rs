//! Termination arbiter
//!
//! Drives a session through its phases:
//!
//! ```text
//! RUNNING -> DRAINING -> REAPING -> CLOSING -> DONE
//! ```
//!
//! While running it forwards relay data in both directions. The first relay
//! to stop ends forwarding; the child is then given a grace period to exit
//! before it is killed, and the outcome is sent to the peer as the reason of
//! a normal close frame.

use std::borrow::Cow;
use std::fmt;
use std::time::Duration;

use futures_util::{Sink, SinkExt};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::relay::{PtyInput, RelayError, RelayEvent};
use crate::pty::{ProcessWaiter, PtyProcess, PtyResult};

/// Phase of a session's termination state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Forwarding data between the relays
    Running,
    /// A relay stopped; nothing is forwarded anymore
    Draining,
    /// Waiting for the child, killing it if it takes too long
    Reaping,
    /// Sending the exit status to the peer
    Closing,
    /// Session resources released
    Done,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Running => "running",
            Phase::Draining => "draining",
            Phase::Reaping => "reaping",
            Phase::Closing => "closing",
            Phase::Done => "done",
        };
        f.write_str(name)
    }
}

/// Reconciled outcome of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionStatus {
    /// The child exited successfully on its own
    #[default]
    Success,
    /// The child failed, could not be waited on, or had to be killed
    Failure,
}

impl SessionStatus {
    /// Numeric exit status sent to the peer
    pub fn code(self) -> u8 {
        match self {
            SessionStatus::Success => 0,
            SessionStatus::Failure => 1,
        }
    }

    /// Status for the result of waiting on the child
    pub fn from_wait(result: &PtyResult<portable_pty::ExitStatus>) -> Self {
        match result {
            Ok(status) if status.success() => SessionStatus::Success,
            _ => SessionStatus::Failure,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Forward relay data until either relay stops (RUNNING)
///
/// Both channels are polled fairly; whichever has an event first is served.
/// Pty output goes to `sink` and peer input is queued for the pty writer, so
/// a child that stops reading never holds up the loop. Returns the reason
/// forwarding ended.
pub async fn forward<Si>(
    sink: &mut Si,
    input: &mut PtyInput,
    outbound: &mut mpsc::Receiver<RelayEvent<String>>,
    inbound: &mut mpsc::Receiver<RelayEvent<Vec<u8>>>,
) -> RelayError
where
    Si: Sink<Message> + Unpin,
    Si::Error: fmt::Display,
{
    loop {
        tokio::select! {
            event = inbound.recv() => match event {
                Some(RelayEvent::Data(data)) => {
                    if let Err(reason) = input.send(data) {
                        return reason;
                    }
                }
                Some(RelayEvent::Stopped(reason)) => return reason,
                None => return RelayError::ConnectionClosed,
            },
            event = outbound.recv() => match event {
                Some(RelayEvent::Data(output)) => {
                    if let Err(e) = sink.send(Message::Text(output)).await {
                        return RelayError::ConnectionSend(e.to_string());
                    }
                }
                Some(RelayEvent::Stopped(reason)) => return reason,
                None => return RelayError::PtyClosed,
            },
            e = input.failed() => return RelayError::PtyWrite(e),
        }
    }
}

/// Wait for the child to exit, killing it after `grace` (DRAINING, REAPING)
///
/// The child is always reaped before this returns, even when it had to be
/// killed or the kill failed.
pub async fn reap(
    process: &mut PtyProcess,
    waiter: &mut ProcessWaiter,
    grace: Duration,
) -> SessionStatus {
    match timeout(grace, waiter.wait()).await {
        Ok(result) => {
            if let Err(e) = &result {
                warn!("{}", e);
            }
            SessionStatus::from_wait(&result)
        }
        Err(_) => {
            warn!("Process still running after {:?}, killing it", grace);
            if let Err(e) = process.kill() {
                warn!("Failed to kill: {}", e);
            }
            if let Err(e) = waiter.wait().await {
                debug!("Wait after kill: {}", e);
            }
            info!("Process killed");
            SessionStatus::Failure
        }
    }
}

/// Close frame carrying the session status
pub fn close_frame(status: SessionStatus) -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::Normal,
        reason: Cow::Owned(status.to_string()),
    }))
}

/// Send the status close frame within `deadline` (CLOSING)
///
/// Failures are logged only. Returns whether the frame went out.
pub async fn send_close<Si>(sink: &mut Si, status: SessionStatus, deadline: Duration) -> bool
where
    Si: Sink<Message> + Unpin,
    Si::Error: fmt::Display,
{
    match timeout(deadline, sink.send(close_frame(status))).await {
        Ok(Ok(())) => {
            debug!("Sent close frame with status {}", status);
            true
        }
        Ok(Err(e)) => {
            warn!("Failed to send close frame: {}", e);
            false
        }
        Err(_) => {
            warn!("Timed out sending close frame after {:?}", deadline);
            false
        }
    }
}

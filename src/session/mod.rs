//! Voice session orchestration
//!
//! A single [`SessionController`] owns every component and reacts to one
//! [`SessionEvent`] at a time. Callers drive it through a cloneable
//! [`SessionHandle`] and observe it through a `watch` channel.

mod controller;
mod event;
mod state;

use serde::Serialize;
use tokio::sync::watch;

pub use controller::{SessionComponents, SessionContext, SessionController};
pub use event::{Command, EventReceiver, EventSender, SessionEvent};
pub use state::{Effect, Rejected, SessionState, Trigger, transition};

use crate::{Error, Result};

/// Error shown to the user after a session-fatal failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusError {
    pub code: String,
    pub message: String,
}

impl From<&Error> for StatusError {
    fn from(error: &Error) -> Self {
        Self {
            code: error.code().to_string(),
            message: error.to_string(),
        }
    }
}

/// Snapshot of the session published after every change
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub state: SessionState,
    /// Non-fatal problem; the session keeps its mode
    pub advisory: Option<String>,
    /// Fatal problem; the session is idle until restarted
    pub error: Option<StatusError>,
    /// The live connection dropped and has not come back yet
    pub degraded: bool,
}

/// Cloneable command and status handle for a running controller
#[derive(Debug, Clone)]
pub struct SessionHandle {
    events: EventSender,
    status: watch::Receiver<SessionStatus>,
}

impl SessionHandle {
    pub(crate) const fn new(events: EventSender, status: watch::Receiver<SessionStatus>) -> Self {
        Self { events, status }
    }

    fn command(&self, command: Command) -> Result<()> {
        self.events
            .send(SessionEvent::Command(command))
            .map_err(|_| Error::SessionClosed)
    }

    /// Begin wake listening
    ///
    /// # Errors
    ///
    /// Returns `Error::SessionClosed` if the controller has exited
    pub fn start(&self) -> Result<()> {
        self.command(Command::Start)
    }

    /// Leave the live conversation and go back to wake listening
    ///
    /// # Errors
    ///
    /// Returns `Error::SessionClosed` if the controller has exited
    pub fn return_to_wake(&self) -> Result<()> {
        self.command(Command::ReturnToWake)
    }

    /// Release everything and go idle
    ///
    /// # Errors
    ///
    /// Returns `Error::SessionClosed` if the controller has exited
    pub fn stop(&self) -> Result<()> {
        self.command(Command::Stop)
    }

    /// Stop and end the controller's dispatch loop
    ///
    /// # Errors
    ///
    /// Returns `Error::SessionClosed` if the controller has exited
    pub fn shutdown(&self) -> Result<()> {
        self.command(Command::Shutdown)
    }

    /// Latest status
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    /// Receiver that wakes on every status change
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    /// Wait until the session reaches `state`
    ///
    /// # Errors
    ///
    /// Returns `Error::SessionClosed` if the controller exits first
    pub async fn wait_for(&self, state: SessionState) -> Result<SessionStatus> {
        let mut status = self.status.clone();
        status
            .wait_for(|s| s.state == state)
            .await
            .map(|s| s.clone())
            .map_err(|_| Error::SessionClosed)
    }
}

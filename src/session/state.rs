//! Session state machine
//!
//! `transition` is pure: it maps the current state and a trigger to the next
//! state plus the effects the controller must perform. Triggers that make no
//! sense in the current state are rejected, which is what keeps a late wake
//! activation or a racing recognizer restart from re-entering a state.

use std::fmt;

use serde::Serialize;

/// Lifecycle of the single voice session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Idle,
    WakeListening,
    Connecting,
    Active,
    Closing,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::WakeListening => "wake_listening",
            Self::Connecting => "connecting",
            Self::Active => "active",
            Self::Closing => "closing",
        };
        f.write_str(name)
    }
}

/// Something that may move the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// User asked to start listening
    StartRequested,
    /// The wake listener heard its phrase
    WakeActivated,
    /// The transport reached the established state
    ConnectionEstablished,
    /// The connect attempt failed or timed out
    ConnectionFailed,
    /// Termination phrase or explicit request to go back to wake listening
    ReturnToWake,
    /// Explicit full stop
    StopRequested,
    /// A session-fatal error
    Fatal,
    /// Teardown finished; `keep_listening` picks the next state
    Released { keep_listening: bool },
}

/// Work the controller performs after a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Start the wake listener now
    StartListener,
    /// Stop the wake listener
    StopListener,
    /// Start the wake listener after the connect-failure fallback delay
    ScheduleListenerResume,
    /// Open the realtime transport
    BeginConnect,
    /// Send session configuration and request the opening response
    ConfigureSession,
    /// Shared teardown: queue, transport, listener, turn state
    Teardown,
}

/// A trigger that does not apply in the current state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rejected {
    pub state: SessionState,
    pub trigger: Trigger,
}

impl fmt::Display for Rejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} not valid in {}", self.trigger, self.state)
    }
}

/// Next state and effects for `trigger` in `state`
///
/// # Errors
///
/// Returns [`Rejected`] when the trigger does not apply
pub fn transition(
    state: SessionState,
    trigger: Trigger,
) -> Result<(SessionState, Vec<Effect>), Rejected> {
    use Effect::{BeginConnect, ConfigureSession, ScheduleListenerResume, StartListener, StopListener, Teardown};
    use SessionState::{Active, Closing, Connecting, Idle, WakeListening};

    let next = match (state, trigger) {
        (Idle, Trigger::StartRequested) => (WakeListening, vec![StartListener]),

        // Listener stops before the transport touches the microphone
        (WakeListening, Trigger::WakeActivated) => (Connecting, vec![StopListener, BeginConnect]),

        (Connecting, Trigger::ConnectionEstablished) => (Active, vec![ConfigureSession]),
        (Connecting, Trigger::ConnectionFailed) => {
            (WakeListening, vec![Teardown, ScheduleListenerResume])
        }

        (Active, Trigger::ReturnToWake) => (Closing, vec![Teardown]),

        (WakeListening | Connecting | Active, Trigger::StopRequested | Trigger::Fatal) => {
            (Closing, vec![Teardown])
        }

        (Closing, Trigger::Released { keep_listening: true }) => (WakeListening, vec![StartListener]),
        (Closing, Trigger::Released { keep_listening: false }) => (Idle, vec![]),

        _ => return Err(Rejected { state, trigger }),
    };
    Ok(next)
}

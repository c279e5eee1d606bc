//! Events consumed by the session dispatch loop
//!
//! Every independent source (user commands, recognizer callbacks, transport
//! reads, timers, finished background work) posts into one queue so the
//! controller observes them strictly one at a time.

use tokio::sync::mpsc;

use crate::Result;
use crate::speculative::Priority;
use crate::transport::{ConnectionHandle, InboundEvent};
use crate::voice::RecognizerEvent;

/// Sender half of the session event queue
pub type EventSender = mpsc::UnboundedSender<SessionEvent>;

/// Receiver half of the session event queue
pub type EventReceiver = mpsc::UnboundedReceiver<SessionEvent>;

/// Explicit user requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Begin wake listening from `Idle`
    Start,
    /// Leave the live conversation but keep wake listening
    ReturnToWake,
    /// Release everything and go `Idle`
    Stop,
    /// Stop and exit the dispatch loop
    Shutdown,
}

/// Anything the dispatch loop reacts to
#[derive(Debug)]
pub enum SessionEvent {
    /// User command
    Command(Command),

    /// Recognizer callback tagged with the run that produced it
    Recognizer {
        generation: u64,
        event: RecognizerEvent,
    },

    /// Backoff after a spontaneous recognizer end elapsed
    ListenerRestartDue { generation: u64 },

    /// Delayed wake-listening resume after a failed connect
    ListenerResumeDue { epoch: u64 },

    /// Outcome of a connect attempt
    Connected {
        attempt: u64,
        result: Result<ConnectionHandle>,
    },

    /// Inbound transport event tagged with its connection
    Transport {
        generation: u64,
        event: InboundEvent,
    },

    /// Tool execution finished (successfully or not)
    ToolCompleted {
        epoch: u64,
        call_id: String,
        name: String,
        outcome: std::result::Result<serde_json::Value, String>,
    },

    /// Follow-up filler scheduled for an ordering call
    FillerDue {
        call_id: String,
        text: &'static str,
        priority: Priority,
    },

    /// Queue-wide filler timeout for a call
    SpeculationTimeout { call_id: String },

    /// Local utterance finished or failed
    UtteranceFinished { ticket: u64 },
}

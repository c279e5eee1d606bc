//! Function calls from the realtime model
//!
//! The model streams a call's arguments as fragments. The assembler collects
//! them, asks for filler speech as soon as a call starts, dispatches the
//! finished call over HTTP and answers the model exactly once per call id.

mod catalog;
mod dispatch;

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::{Value, json};

pub use catalog::{
    DEFAULT_INSTRUCTIONS, OPENING_INSTRUCTIONS, ToolKind, session_configuration, tool_schemas,
};
pub use dispatch::{HttpToolDispatcher, ToolDispatcher, ToolRoute, route};

use crate::Error;
use crate::bridge::{CartPublisher, CartUpdateNotification};
use crate::session::{EventSender, SessionEvent};
use crate::speculative::SpeculativeAudioQueue;
use crate::transport::{OutboundMessage, OutboundSink};

/// Name used when the model never named the function
const UNNAMED_FUNCTION: &str = "unknown_function";

/// Answer for a call that arrives while another is still running
const BUSY_ERROR: &str = "another request is still being processed; retry once it finishes";

/// A function call being assembled
#[derive(Debug, Clone, PartialEq)]
pub struct PendingFunctionCall {
    pub call_id: String,
    pub name: Option<String>,
    /// Argument fragments in arrival order
    pub fragments: Vec<String>,
    pub parsed_arguments: Option<Value>,
}

impl PendingFunctionCall {
    fn new(call_id: &str, name: Option<&str>) -> Self {
        Self {
            call_id: call_id.to_string(),
            name: name.map(str::to_string),
            fragments: Vec::new(),
            parsed_arguments: None,
        }
    }

    /// Concatenated argument text
    #[must_use]
    pub fn raw_arguments(&self) -> String {
        self.fragments.concat()
    }

    /// Whether the call has been dispatched and awaits its result
    #[must_use]
    pub const fn is_dispatched(&self) -> bool {
        self.parsed_arguments.is_some()
    }

    fn name_or_default(&self) -> &str {
        self.name.as_deref().unwrap_or(UNNAMED_FUNCTION)
    }
}

/// What an argument fragment did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentOutcome {
    /// First fragment of a new call
    Started,
    /// Appended to the open call
    Appended,
    /// Dropped (answered, already dispatched, or another call is open)
    Ignored,
}

/// Parse streamed arguments, falling back to the completion payload, then `{}`
#[must_use]
pub fn parse_arguments(buffered: &str, supplied: Option<&str>) -> Value {
    let parse = |text: &str| {
        serde_json::from_str::<Value>(text)
            .ok()
            .filter(Value::is_object)
    };

    if let Some(args) = parse(buffered) {
        return args;
    }
    if !buffered.trim().is_empty() {
        let err = Error::ArgumentParse(format!("{} buffered bytes", buffered.len()));
        tracing::warn!(error = %err, "falling back from streamed arguments");
    }
    if let Some(args) = supplied.and_then(parse) {
        return args;
    }
    json!({})
}

/// Reassembles and executes one function call at a time
pub struct FunctionCallAssembler {
    dispatcher: Arc<dyn ToolDispatcher>,
    publisher: Arc<dyn CartPublisher>,
    events: EventSender,
    client_id: String,
    pending: Option<PendingFunctionCall>,
    answered: HashSet<String>,
}

impl FunctionCallAssembler {
    /// Create an assembler
    #[must_use]
    pub fn new(
        dispatcher: Arc<dyn ToolDispatcher>,
        publisher: Arc<dyn CartPublisher>,
        events: EventSender,
        client_id: impl Into<String>,
    ) -> Self {
        Self {
            dispatcher,
            publisher,
            events,
            client_id: client_id.into(),
            pending: None,
            answered: HashSet::new(),
        }
    }

    /// The open call, if any
    #[must_use]
    pub const fn pending(&self) -> Option<&PendingFunctionCall> {
        self.pending.as_ref()
    }

    /// Whether a result was already sent for `call_id`
    #[must_use]
    pub fn is_answered(&self, call_id: &str) -> bool {
        self.answered.contains(call_id)
    }

    /// Apply one argument fragment
    ///
    /// The first fragment of a call requests filler speech before anything
    /// else happens.
    pub fn on_fragment(
        &mut self,
        call_id: &str,
        name: Option<&str>,
        delta: &str,
        queue: &mut SpeculativeAudioQueue,
    ) -> FragmentOutcome {
        if self.answered.contains(call_id) {
            tracing::debug!(call_id, "fragment for answered call");
            return FragmentOutcome::Ignored;
        }

        match self.pending.as_mut() {
            None => {
                let mut call = PendingFunctionCall::new(call_id, name);
                queue.request(call_id, call.name.as_deref().unwrap_or_default());
                call.fragments.push(delta.to_string());
                tracing::debug!(call_id, function = ?call.name, "function call started");
                self.pending = Some(call);
                FragmentOutcome::Started
            }
            Some(call) if call.call_id == call_id && !call.is_dispatched() => {
                if call.name.is_none() {
                    call.name = name.map(str::to_string);
                }
                call.fragments.push(delta.to_string());
                FragmentOutcome::Appended
            }
            Some(call) => {
                tracing::warn!(
                    call_id,
                    open = %call.call_id,
                    "fragment does not belong to the open call"
                );
                FragmentOutcome::Ignored
            }
        }
    }

    /// Finalize the call and dispatch it
    ///
    /// The tool result arrives later as [`SessionEvent::ToolCompleted`]
    /// tagged with `epoch`. A completion for a different call while one is
    /// open is answered right away with an error so the model is never left
    /// waiting. Returns whether a dispatch was started.
    pub fn on_completed(
        &mut self,
        call_id: &str,
        name: Option<&str>,
        arguments: Option<&str>,
        epoch: u64,
        transport: &mut dyn OutboundSink,
        queue: &mut SpeculativeAudioQueue,
    ) -> bool {
        if self.answered.contains(call_id) {
            tracing::debug!(call_id, "completion for answered call");
            return false;
        }

        if self.pending.is_none() {
            // Completed without any streamed fragment
            let call = PendingFunctionCall::new(call_id, name);
            queue.request(call_id, call.name.as_deref().unwrap_or_default());
            self.pending = Some(call);
        }

        let busy = self
            .pending
            .as_ref()
            .filter(|call| call.call_id != call_id)
            .map(|call| call.call_id.clone());
        if let Some(open) = busy {
            self.reject_busy(call_id, &open, transport);
            return false;
        }

        let Some(call) = self.pending.as_mut() else {
            return false;
        };
        if call.is_dispatched() {
            tracing::debug!(call_id, "completion for a call already dispatched");
            return false;
        }
        if call.name.is_none() {
            call.name = name.map(str::to_string);
        }

        let parameters = parse_arguments(&call.raw_arguments(), arguments);
        call.parsed_arguments = Some(parameters.clone());

        let name = call.name_or_default().to_string();
        let call_id = call.call_id.clone();
        let dispatcher = Arc::clone(&self.dispatcher);
        let events = self.events.clone();

        tracing::info!(call_id = %call_id, function = %name, "function call dispatched");
        tokio::spawn(async move {
            let outcome = dispatcher
                .dispatch(&name, parameters)
                .await
                .map_err(|e| e.to_string());
            let _ = events.send(SessionEvent::ToolCompleted {
                epoch,
                call_id,
                name,
                outcome,
            });
        });
        true
    }

    /// Deliver a tool result back into the conversation
    ///
    /// Stops the call's filler timers, publishes any cart change, sends the
    /// output keyed by `call_id` and requests the follow-up response. Returns
    /// false if the result does not match the open call.
    pub fn on_result(
        &mut self,
        call_id: &str,
        name: &str,
        outcome: std::result::Result<Value, String>,
        transport: &mut dyn OutboundSink,
        queue: &mut SpeculativeAudioQueue,
    ) -> bool {
        let matches_open = self
            .pending
            .as_ref()
            .is_some_and(|call| call.call_id == call_id && call.is_dispatched());
        if self.answered.contains(call_id) || !matches_open {
            tracing::debug!(call_id, "discarding result for a call that is not open");
            return false;
        }

        queue.resolve(call_id);

        let output = match outcome {
            Ok(result) => {
                if let Some(notification) =
                    CartUpdateNotification::from_tool_result(&result, &self.client_id)
                {
                    self.publisher.publish(notification);
                }
                tracing::info!(call_id, function = name, "tool succeeded");
                result.to_string()
            }
            Err(message) => {
                tracing::warn!(call_id, function = name, error = %message, "tool failed");
                json!({ "success": false, "error": message }).to_string()
            }
        };

        self.answered.insert(call_id.to_string());
        let delivered = transport.send_message(&OutboundMessage::FunctionCallOutput {
            call_id: call_id.to_string(),
            output,
        });
        if delivered {
            transport.send_message(&OutboundMessage::ResponseCreate {
                instructions: Some(ToolKind::classify(name).response_instructions().to_string()),
            });
        } else {
            tracing::warn!(call_id, "function call output not delivered");
        }

        self.pending = None;
        true
    }

    fn reject_busy(&mut self, call_id: &str, open: &str, transport: &mut dyn OutboundSink) {
        tracing::warn!(call_id, open, "rejecting function call while another is open");
        self.answered.insert(call_id.to_string());
        let output = json!({ "success": false, "error": BUSY_ERROR }).to_string();
        let delivered = transport.send_message(&OutboundMessage::FunctionCallOutput {
            call_id: call_id.to_string(),
            output,
        });
        if !delivered {
            tracing::warn!(call_id, "function call output not delivered");
        }
    }

    /// Drop turn-scoped state
    pub fn reset(&mut self) {
        if let Some(call) = self.pending.take() {
            tracing::debug!(call_id = %call.call_id, "abandoning open function call");
        }
        self.answered.clear();
    }
}

//! Transport event taxonomy
//!
//! Inbound events are the orchestrator's own vocabulary; connectors map the
//! remote endpoint's native events onto it. Outbound messages serialize to
//! the remote endpoint's wire format.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Error codes after which the session cannot continue
const FATAL_ERROR_CODES: &[&str] = &[
    "invalid_api_key",
    "session_expired",
    "token_expired",
    "authentication_error",
    "insufficient_quota",
];

/// Events the orchestrator interprets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum InboundEvent {
    #[serde(rename = "connection.established")]
    ConnectionEstablished,

    #[serde(rename = "connection.disconnected")]
    ConnectionDisconnected,

    #[serde(rename = "connection.failed")]
    ConnectionFailed {
        #[serde(default)]
        reason: Option<String>,
    },

    #[serde(rename = "speech.started")]
    SpeechStarted,

    #[serde(rename = "speech.stopped")]
    SpeechStopped,

    #[serde(rename = "transcript.delta")]
    TranscriptDelta { delta: String },

    #[serde(rename = "transcript.completed")]
    TranscriptCompleted { transcript: String },

    #[serde(rename = "transcript.failed")]
    TranscriptFailed {
        #[serde(default)]
        error: Option<String>,
    },

    #[serde(rename = "function_call.delta")]
    FunctionCallDelta {
        #[serde(rename = "callId")]
        call_id: String,
        #[serde(default)]
        name: Option<String>,
        delta: String,
    },

    #[serde(rename = "function_call.completed")]
    FunctionCallCompleted {
        #[serde(rename = "callId")]
        call_id: String,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        arguments: Option<String>,
    },

    #[serde(rename = "audio.started")]
    AudioStarted,

    #[serde(rename = "audio.stopped")]
    AudioStopped,

    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        code: Option<String>,
        message: String,
    },
}

impl InboundEvent {
    /// Wire tag of this event
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::ConnectionEstablished => "connection.established",
            Self::ConnectionDisconnected => "connection.disconnected",
            Self::ConnectionFailed { .. } => "connection.failed",
            Self::SpeechStarted => "speech.started",
            Self::SpeechStopped => "speech.stopped",
            Self::TranscriptDelta { .. } => "transcript.delta",
            Self::TranscriptCompleted { .. } => "transcript.completed",
            Self::TranscriptFailed { .. } => "transcript.failed",
            Self::FunctionCallDelta { .. } => "function_call.delta",
            Self::FunctionCallCompleted { .. } => "function_call.completed",
            Self::AudioStarted => "audio.started",
            Self::AudioStopped => "audio.stopped",
            Self::Error { .. } => "error",
        }
    }

    /// Whether this is an error the session cannot survive
    #[must_use]
    pub fn is_fatal_error(&self) -> bool {
        match self {
            Self::Error {
                code: Some(code), ..
            } => FATAL_ERROR_CODES.contains(&code.as_str()),
            _ => false,
        }
    }
}

/// Messages sent to the remote endpoint
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    /// Voice, turn detection, tools and instructions
    SessionUpdate(Value),
    /// Start or continue a response turn
    ResponseCreate { instructions: Option<String> },
    /// Result of a function call
    FunctionCallOutput { call_id: String, output: String },
}

impl OutboundMessage {
    /// Short name used in logs and tests
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::SessionUpdate(_) => "session.update",
            Self::ResponseCreate { .. } => "response.create",
            Self::FunctionCallOutput { .. } => "function_call_output",
        }
    }

    /// Serialize to the remote endpoint's wire format
    #[must_use]
    pub fn to_wire(&self) -> Value {
        match self {
            Self::SessionUpdate(session) => json!({
                "type": "session.update",
                "session": session,
            }),
            Self::ResponseCreate {
                instructions: Some(instructions),
            } => json!({
                "type": "response.create",
                "response": { "instructions": instructions },
            }),
            Self::ResponseCreate { instructions: None } => json!({
                "type": "response.create",
            }),
            Self::FunctionCallOutput { call_id, output } => json!({
                "type": "conversation.item.create",
                "item": {
                    "type": "function_call_output",
                    "call_id": call_id,
                    "output": output,
                },
            }),
        }
    }
}

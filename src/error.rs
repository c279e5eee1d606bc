//! Error types for the voice session orchestrator

use thiserror::Error;

/// Result type alias for orchestrator operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the voice orchestrator
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Microphone access denied or unavailable
    #[error("microphone permission denied: {0}")]
    PermissionDenied(String),

    /// Connection did not reach the established state in time
    #[error("connection timed out after {0:?}")]
    ConnectionTimeout(std::time::Duration),

    /// Connection negotiation failed
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Recognizer reported no speech or was aborted
    #[error("transient recognition error: {0}")]
    RecognitionTransient(String),

    /// Recognizer failed for a reason other than permission or silence
    #[error("recognition error: {0}")]
    Recognition(String),

    /// Streamed function-call arguments did not parse
    #[error("argument parse failure: {0}")]
    ArgumentParse(String),

    /// Tool execution endpoint failed
    #[error("tool dispatch failed: {0}")]
    ToolDispatch(String),

    /// Remote endpoint reported an unrecoverable error
    #[error("fatal transport error: {0}")]
    FatalTransport(String),

    /// Audio device error
    #[error("audio error: {0}")]
    Audio(String),

    /// Text-to-speech error
    #[error("TTS error: {0}")]
    Tts(String),

    /// The session dispatch loop is no longer running
    #[error("session controller is not running")]
    SessionClosed,

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// WebSocket error
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

impl Error {
    /// Whether this error ends the session and returns the controller to `Idle`
    #[must_use]
    pub const fn is_session_fatal(&self) -> bool {
        matches!(self, Self::PermissionDenied(_) | Self::FatalTransport(_))
    }

    /// Short machine-readable code used in status reports and API errors
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::PermissionDenied(_) => "permission_denied",
            Self::ConnectionTimeout(_) => "connection_timeout",
            Self::ConnectionFailed(_) => "connection_failed",
            Self::RecognitionTransient(_) => "recognition_transient",
            Self::Recognition(_) => "recognition",
            Self::ArgumentParse(_) => "argument_parse",
            Self::ToolDispatch(_) => "tool_dispatch",
            Self::FatalTransport(_) => "fatal_transport",
            Self::Audio(_) => "audio",
            Self::Tts(_) => "tts",
            Self::SessionClosed => "session_closed",
            Self::Io(_) => "io",
            Self::Http(_) => "http",
            Self::Serialization(_) => "serialization",
            Self::Toml(_) => "toml",
            Self::WebSocket(_) => "websocket",
        }
    }
}

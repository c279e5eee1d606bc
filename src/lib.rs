//! Venue Voice - real-time voice session orchestrator for a point-of-sale assistant
//!
//! This library provides the pieces of a hands-free ordering session:
//! - Wake phrase listening over a continuous recognizer
//! - A live bidirectional audio session with a conversational endpoint
//! - Assembly and execution of streamed function calls against the POS backend
//! - Filler speech while tool calls are in flight
//! - Cart update broadcasts to other clients
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │          Control API  │  CLI  │  Ctrl-C             │
//! └────────────────────┬────────────────────────────────┘
//!                      │ SessionHandle
//! ┌────────────────────▼────────────────────────────────┐
//! │                SessionController                    │
//! │  WakeWordListener │ RealtimeTransport │ Assembler   │
//! │             SpeculativeAudioQueue                   │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │  Realtime endpoint │ POS tool API │ Broadcast bridge│
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod bridge;
pub mod config;
pub mod error;
pub mod session;
pub mod speculative;
pub mod tools;
pub mod transport;
pub mod voice;
pub mod wake;

pub use config::Config;
pub use error::{Error, Result};
pub use session::{SessionController, SessionHandle, SessionState, SessionStatus};

//! Voice capabilities
//!
//! The orchestrator only sees the traits defined here. Platform adapters
//! (cpal capture/playback, HTTP speech services) implement them; tests
//! substitute in-memory fakes.

mod capture;
mod playback;
mod recognizer;
mod tts;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::Result;
use crate::session::{EventSender, SessionEvent};

pub use capture::{CAPTURE_SAMPLE_RATE, CpalMicrophone, samples_to_wav};
pub(crate) use capture::to_pcm16;
pub use playback::{Lane, PLAYBACK_SAMPLE_RATE, SpeakerLane, SpeakerOutput, decode_mp3};
pub use recognizer::{SegmentRecognizer, Transcriber, calculate_energy};
pub use tts::HttpSynthesizer;

/// Stream of mono f32 microphone frames
pub type AudioFrames = mpsc::Receiver<Vec<f32>>;

/// Exclusive use of the microphone
///
/// Dropping the lease releases the device.
pub struct MicrophoneLease {
    frames: Option<AudioFrames>,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl MicrophoneLease {
    /// Wrap a frame stream and the action that gives the device back
    #[must_use]
    pub fn new(frames: AudioFrames, release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            frames: Some(frames),
            release: Some(Box::new(release)),
        }
    }

    /// Take the frame stream (once)
    pub fn take_frames(&mut self) -> Option<AudioFrames> {
        self.frames.take()
    }

    /// Give the device back; later calls are no-ops
    pub fn release(&mut self) {
        self.frames = None;
        if let Some(release) = self.release.take() {
            release();
        }
    }

    /// Whether the device is still held
    #[must_use]
    pub const fn is_held(&self) -> bool {
        self.release.is_some()
    }
}

impl Drop for MicrophoneLease {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for MicrophoneLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MicrophoneLease")
            .field("held", &self.is_held())
            .finish()
    }
}

/// Source of microphone audio
pub trait MicrophoneSource: Send + Sync {
    /// Acquire the microphone
    ///
    /// # Errors
    ///
    /// Returns `Error::PermissionDenied` when access is refused and
    /// `Error::Audio` when the device is busy or broken
    fn open(&self) -> Result<MicrophoneLease>;
}

/// Why a recognizer run failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognitionError {
    /// Microphone or service access refused
    PermissionDenied(String),
    /// Nothing intelligible was heard
    NoSpeech,
    /// The run was cut short
    Aborted,
    /// Anything else
    Other(String),
}

impl RecognitionError {
    /// No-speech and aborted runs are part of normal operation
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::NoSpeech | Self::Aborted)
    }
}

/// Callback from a running recognizer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognizerEvent {
    /// Partial or final transcript
    Result { transcript: String, is_final: bool },
    /// The recognizer stopped (requested or spontaneous)
    End,
    /// Recognition failed
    Error(RecognitionError),
}

/// Where a recognizer run delivers its callbacks
#[derive(Debug, Clone)]
pub struct RecognizerSink {
    tx: EventSender,
    generation: u64,
}

impl RecognizerSink {
    /// Bind a sink to a recognizer run
    #[must_use]
    pub const fn new(tx: EventSender, generation: u64) -> Self {
        Self { tx, generation }
    }

    /// Run this sink belongs to
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Deliver an event; false once the session loop is gone
    pub fn emit(&self, event: RecognizerEvent) -> bool {
        self.tx
            .send(SessionEvent::Recognizer {
                generation: self.generation,
                event,
            })
            .is_ok()
    }
}

/// Continuous speech recognition
pub trait SpeechRecognizer: Send {
    /// Begin recognition, delivering callbacks to `sink`
    ///
    /// # Errors
    ///
    /// Returns error if recognition cannot start
    fn start(&mut self, sink: RecognizerSink) -> Result<()>;

    /// Stop recognition; must be safe when not running
    fn stop(&mut self);

    /// Tear down and rebuild internal state after a failed start
    ///
    /// # Errors
    ///
    /// Returns error if the recognizer cannot be rebuilt
    fn reinitialize(&mut self) -> Result<()> {
        self.stop();
        Ok(())
    }
}

/// Local speech output for short utterances
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Speak `text`, resolving when playback ends or is cancelled
    ///
    /// # Errors
    ///
    /// Returns error if synthesis or playback fails
    async fn speak(&self, text: &str) -> Result<()>;

    /// Stop any in-progress utterance immediately
    fn cancel(&self);
}

/// A playback queue
pub trait AudioOutput: Send + Sync {
    /// Append mono PCM16 samples at the playback rate
    fn push_pcm16(&self, samples: &[i16]);

    /// Append mono f32 samples at the playback rate
    fn push_samples(&self, samples: &[f32]);

    /// Drop everything buffered
    fn clear(&self);

    /// Whether everything queued has been played
    fn is_drained(&self) -> bool;
}

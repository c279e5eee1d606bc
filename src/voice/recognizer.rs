//! Segmenting speech recognizer
//!
//! Gates microphone frames by energy, cuts utterances at trailing silence,
//! and transcribes each utterance over HTTP. Like platform recognizers it
//! ends on its own after a stretch without speech; the wake listener is
//! expected to restart it.

use std::sync::Arc;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use tokio::task::JoinHandle;

use super::{
    AudioFrames, CAPTURE_SAMPLE_RATE, MicrophoneLease, MicrophoneSource, RecognitionError,
    RecognizerEvent, RecognizerSink, SpeechRecognizer, samples_to_wav,
};
use crate::config::SpeechConfig;
use crate::{Error, Result};

/// Minimum audio energy threshold to consider speech
const ENERGY_THRESHOLD: f32 = 0.03;

/// Minimum duration of speech to transcribe (0.3 seconds)
const MIN_SPEECH_SAMPLES: usize = CAPTURE_SAMPLE_RATE as usize * 3 / 10;

/// Silence duration that ends an utterance (0.5 seconds)
const SILENCE_SAMPLES: usize = CAPTURE_SAMPLE_RATE as usize / 2;

/// Longest utterance kept before forcing a cut (8 seconds)
const MAX_SEGMENT_SAMPLES: usize = CAPTURE_SAMPLE_RATE as usize * 8;

/// Default run length without speech before the recognizer ends itself
const DEFAULT_IDLE_LIMIT: Duration = Duration::from_secs(8);

/// Response from the transcription API
#[derive(serde::Deserialize)]
struct TranscriptionResponse {
    text: String,
}

/// Transcribes WAV audio over an OpenAI-compatible HTTP API
pub struct Transcriber {
    client: reqwest::Client,
    api_url: String,
    api_key: SecretString,
    model: String,
}

impl Transcriber {
    /// Create a transcriber from speech configuration
    ///
    /// # Errors
    ///
    /// Returns error if the API key is missing
    pub fn new(config: &SpeechConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| Error::Config("API key required for transcription".to_string()))?;

        Ok(Self {
            client: reqwest::Client::new(),
            api_url: config.api_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.stt_model.clone(),
        })
    }

    /// Transcribe WAV bytes to text
    ///
    /// # Errors
    ///
    /// Returns `Error::PermissionDenied` on 401/403, `Error::Recognition` otherwise
    pub async fn transcribe(&self, wav: Vec<u8>) -> Result<String> {
        tracing::trace!(audio_bytes = wav.len(), "starting transcription");

        let form = reqwest::multipart::Form::new()
            .part(
                "file",
                reqwest::multipart::Part::bytes(wav)
                    .file_name("audio.wav")
                    .mime_str("audio/wav")
                    .map_err(|e| Error::Recognition(e.to_string()))?,
            )
            .text("model", self.model.clone());

        let response = self
            .client
            .post(format!("{}/audio/transcriptions", self.api_url))
            .bearer_auth(self.api_key.expose_secret())
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(Error::PermissionDenied(format!("transcription rejected: {status}")));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Recognition(format!("transcription error {status}: {body}")));
        }

        let result: TranscriptionResponse = response.json().await?;
        tracing::debug!(transcript = %result.text, "transcription complete");
        Ok(result.text)
    }
}

/// Outcome of feeding one frame to the segmenter
#[derive(Debug, PartialEq)]
enum SegmentStep {
    /// Nothing to report
    Pending,
    /// A complete utterance is ready
    Utterance(Vec<f32>),
    /// The idle limit passed without speech
    Idle,
}

/// Energy-gated utterance segmentation
#[derive(Debug)]
struct Segmenter {
    speech: Vec<f32>,
    in_speech: bool,
    silence: usize,
    idle: usize,
    idle_limit: usize,
}

impl Segmenter {
    fn new(idle_limit: Duration) -> Self {
        #[allow(clippy::cast_possible_truncation)]
        let idle_limit = (idle_limit.as_millis() as usize) * CAPTURE_SAMPLE_RATE as usize / 1000;
        Self {
            speech: Vec::new(),
            in_speech: false,
            silence: 0,
            idle: 0,
            idle_limit,
        }
    }

    fn push(&mut self, frame: &[f32]) -> SegmentStep {
        let is_speech = calculate_energy(frame) > ENERGY_THRESHOLD;

        if !self.in_speech {
            if is_speech {
                self.in_speech = true;
                self.silence = 0;
                self.idle = 0;
                self.speech.clear();
                self.speech.extend_from_slice(frame);
                return SegmentStep::Pending;
            }
            self.idle += frame.len();
            if self.idle > self.idle_limit {
                self.idle = 0;
                return SegmentStep::Idle;
            }
            return SegmentStep::Pending;
        }

        self.speech.extend_from_slice(frame);
        if is_speech {
            self.silence = 0;
        } else {
            self.silence += frame.len();
        }

        let ended = self.silence > SILENCE_SAMPLES || self.speech.len() > MAX_SEGMENT_SAMPLES;
        if !ended {
            return SegmentStep::Pending;
        }

        self.in_speech = false;
        self.silence = 0;
        let speech = std::mem::take(&mut self.speech);
        if speech.len() > MIN_SPEECH_SAMPLES {
            SegmentStep::Utterance(speech)
        } else {
            tracing::trace!(samples = speech.len(), "discarding short noise burst");
            SegmentStep::Pending
        }
    }
}

/// Recognizer built from the microphone and an HTTP transcriber
pub struct SegmentRecognizer {
    microphone: Arc<dyn MicrophoneSource>,
    transcriber: Arc<Transcriber>,
    idle_limit: Duration,
    /// Held outside the run so `stop` gives the device back immediately
    lease: Option<MicrophoneLease>,
    task: Option<JoinHandle<()>>,
}

impl SegmentRecognizer {
    /// Create a recognizer
    #[must_use]
    pub fn new(microphone: Arc<dyn MicrophoneSource>, transcriber: Arc<Transcriber>) -> Self {
        Self {
            microphone,
            transcriber,
            idle_limit: DEFAULT_IDLE_LIMIT,
            lease: None,
            task: None,
        }
    }

    /// Override how long a run lasts without speech
    #[must_use]
    pub const fn with_idle_limit(mut self, idle_limit: Duration) -> Self {
        self.idle_limit = idle_limit;
        self
    }
}

impl SpeechRecognizer for SegmentRecognizer {
    fn start(&mut self, sink: RecognizerSink) -> Result<()> {
        self.stop();

        let mut lease = self.microphone.open()?;
        let frames = lease
            .take_frames()
            .ok_or_else(|| Error::Recognition("microphone lease has no frames".to_string()))?;

        let transcriber = Arc::clone(&self.transcriber);
        let segmenter = Segmenter::new(self.idle_limit);
        self.task = Some(tokio::spawn(run_recognition(
            frames,
            segmenter,
            transcriber,
            sink,
        )));
        self.lease = Some(lease);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        // Released synchronously; the transport may open the device next
        if let Some(mut lease) = self.lease.take() {
            lease.release();
        }
    }
}

impl Drop for SegmentRecognizer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_recognition(
    mut frames: AudioFrames,
    mut segmenter: Segmenter,
    transcriber: Arc<Transcriber>,
    sink: RecognizerSink,
) {
    tracing::debug!(generation = sink.generation(), "recognition run started");

    loop {
        let Some(frame) = frames.recv().await else {
            sink.emit(RecognizerEvent::Error(RecognitionError::Aborted));
            break;
        };

        match segmenter.push(&frame) {
            SegmentStep::Pending => {}
            SegmentStep::Idle => {
                tracing::debug!(generation = sink.generation(), "no speech, ending run");
                break;
            }
            SegmentStep::Utterance(speech) => {
                let wav = match samples_to_wav(&speech, CAPTURE_SAMPLE_RATE) {
                    Ok(w) => w,
                    Err(e) => {
                        sink.emit(RecognizerEvent::Error(RecognitionError::Other(e.to_string())));
                        continue;
                    }
                };

                match transcriber.transcribe(wav).await {
                    Ok(text) if text.trim().is_empty() => {
                        sink.emit(RecognizerEvent::Error(RecognitionError::NoSpeech));
                    }
                    Ok(text) => {
                        sink.emit(RecognizerEvent::Result {
                            transcript: text,
                            is_final: true,
                        });
                    }
                    Err(Error::PermissionDenied(msg)) => {
                        sink.emit(RecognizerEvent::Error(RecognitionError::PermissionDenied(msg)));
                        break;
                    }
                    Err(e) => {
                        sink.emit(RecognizerEvent::Error(RecognitionError::Other(e.to_string())));
                    }
                }
            }
        }
    }

    sink.emit(RecognizerEvent::End);
}

/// Calculate RMS energy of audio samples
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn calculate_energy(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}

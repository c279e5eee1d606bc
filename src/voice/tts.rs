//! Text-to-speech (TTS) for short local utterances

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::Notify;

use super::{AudioOutput, SpeechSynthesizer, decode_mp3};
use crate::config::SpeechConfig;
use crate::{Error, Result};

/// How often playback completion is polled
const DRAIN_POLL: Duration = Duration::from_millis(50);

/// Synthesizes speech over an OpenAI-compatible HTTP API and plays it locally
///
/// `cancel` clears only this synthesizer's output, so give it a queue of
/// its own (see [`Lane::Filler`](super::Lane::Filler)).
pub struct HttpSynthesizer {
    client: reqwest::Client,
    api_url: String,
    api_key: SecretString,
    model: String,
    voice: String,
    speed: f32,
    output: Arc<dyn AudioOutput>,
    /// Bumped by every cancel; an utterance only plays while it is unchanged
    cancel_epoch: AtomicU64,
    cancelled: Notify,
}

impl HttpSynthesizer {
    /// Create a synthesizer from speech configuration
    ///
    /// # Errors
    ///
    /// Returns error if the API key is missing
    pub fn new(config: &SpeechConfig, output: Arc<dyn AudioOutput>) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| Error::Config("API key required for TTS".to_string()))?;

        Ok(Self {
            client: reqwest::Client::new(),
            api_url: config.api_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.tts_model.clone(),
            voice: config.tts_voice.clone(),
            speed: config.tts_speed,
            output,
            cancel_epoch: AtomicU64::new(0),
            cancelled: Notify::new(),
        })
    }

    /// Fetch MP3 audio for `text`
    ///
    /// # Errors
    ///
    /// Returns error if the request fails
    pub async fn synthesize(&self, text: &str) -> Result<Vec<u8>> {
        #[derive(serde::Serialize)]
        struct TtsRequest<'a> {
            model: &'a str,
            input: &'a str,
            voice: &'a str,
            speed: f32,
        }

        let request = TtsRequest {
            model: &self.model,
            input: text,
            voice: &self.voice,
            speed: self.speed,
        };

        let response = self
            .client
            .post(format!("{}/audio/speech", self.api_url))
            .bearer_auth(self.api_key.expose_secret())
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Tts(format!("TTS error {status}: {body}")));
        }

        let audio = response.bytes().await?;
        Ok(audio.to_vec())
    }
}

#[async_trait]
impl SpeechSynthesizer for HttpSynthesizer {
    async fn speak(&self, text: &str) -> Result<()> {
        let epoch = self.cancel_epoch.load(Ordering::SeqCst);
        tracing::debug!(text, "speaking");

        let audio = self.synthesize(text).await?;
        let samples = decode_mp3(&audio)?;

        if self.cancel_epoch.load(Ordering::SeqCst) != epoch {
            tracing::debug!("utterance cancelled before playback");
            return Ok(());
        }

        self.output.push_samples(&samples);

        loop {
            tokio::select! {
                () = self.cancelled.notified() => return Ok(()),
                () = tokio::time::sleep(DRAIN_POLL) => {
                    if self.cancel_epoch.load(Ordering::SeqCst) != epoch || self.output.is_drained() {
                        return Ok(());
                    }
                }
            }
        }
    }

    fn cancel(&self) {
        self.cancel_epoch.fetch_add(1, Ordering::SeqCst);
        self.output.clear();
        self.cancelled.notify_waiters();
    }
}

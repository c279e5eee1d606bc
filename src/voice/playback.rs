//! Audio playback to speakers

use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::{Arc, Mutex};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};

use super::AudioOutput;
use crate::{Error, Result};

/// Sample rate for playback (matches TTS output and realtime PCM16)
pub const PLAYBACK_SAMPLE_RATE: u32 = 24000;

/// Which source a stream of samples belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lane {
    /// Audio streamed back from the realtime endpoint
    Remote,
    /// Locally synthesized filler speech
    Filler,
}

/// Two sample queues summed into one output stream
#[derive(Debug, Default)]
struct Mixer {
    remote: VecDeque<f32>,
    filler: VecDeque<f32>,
}

impl Mixer {
    fn lane_mut(&mut self, lane: Lane) -> &mut VecDeque<f32> {
        match lane {
            Lane::Remote => &mut self.remote,
            Lane::Filler => &mut self.filler,
        }
    }

    fn next_sample(&mut self) -> f32 {
        let remote = self.remote.pop_front().unwrap_or(0.0);
        let filler = self.filler.pop_front().unwrap_or(0.0);
        (remote + filler).clamp(-1.0, 1.0)
    }
}

/// Stops the output stream once the last handle is gone
struct PlaybackThread {
    stop: std::sync::mpsc::Sender<()>,
}

impl Drop for PlaybackThread {
    fn drop(&mut self) {
        let _ = self.stop.send(());
    }
}

/// Plays queued samples on the default output device
///
/// The output stream runs on its own thread for as long as any lane handle
/// is alive. Remote audio and filler speech are queued separately and mixed,
/// so clearing one never drops samples from the other.
pub struct SpeakerOutput {
    mixer: Arc<Mutex<Mixer>>,
    playback: Arc<PlaybackThread>,
}

impl SpeakerOutput {
    /// Open the default output device and start the playback stream
    ///
    /// # Errors
    ///
    /// Returns error if the audio device cannot be opened
    pub fn new() -> Result<Self> {
        let config = output_config()?;
        let mixer = Arc::new(Mutex::new(Mixer::default()));
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<()>>();

        let shared = Arc::clone(&mixer);
        std::thread::Builder::new()
            .name("speaker-output".to_string())
            .spawn(move || {
                let stream = match build_output_stream(&config, shared) {
                    Ok(s) => s,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                let _ = stop_rx.recv();
                drop(stream);
            })?;

        ready_rx
            .recv()
            .map_err(|_| Error::Audio("playback thread exited".to_string()))??;

        tracing::debug!(sample_rate = PLAYBACK_SAMPLE_RATE, "audio playback initialized");
        Ok(Self {
            mixer,
            playback: Arc::new(PlaybackThread { stop: stop_tx }),
        })
    }

    /// Handle that queues into and clears only `lane`
    #[must_use]
    pub fn lane(&self, lane: Lane) -> SpeakerLane {
        SpeakerLane {
            mixer: Arc::clone(&self.mixer),
            lane,
            _playback: Some(Arc::clone(&self.playback)),
        }
    }
}

/// One lane of a [`SpeakerOutput`]
#[derive(Clone)]
pub struct SpeakerLane {
    mixer: Arc<Mutex<Mixer>>,
    lane: Lane,
    _playback: Option<Arc<PlaybackThread>>,
}

impl AudioOutput for SpeakerLane {
    fn push_pcm16(&self, samples: &[i16]) {
        if let Ok(mut mixer) = self.mixer.lock() {
            mixer
                .lane_mut(self.lane)
                .extend(samples.iter().map(|&s| f32::from(s) / 32768.0));
        }
    }

    fn push_samples(&self, samples: &[f32]) {
        if let Ok(mut mixer) = self.mixer.lock() {
            mixer.lane_mut(self.lane).extend(samples.iter().copied());
        }
    }

    fn clear(&self) {
        if let Ok(mut mixer) = self.mixer.lock() {
            mixer.lane_mut(self.lane).clear();
        }
    }

    fn is_drained(&self) -> bool {
        self.mixer
            .lock()
            .map_or(true, |mut mixer| mixer.lane_mut(self.lane).is_empty())
    }
}

fn output_config() -> Result<StreamConfig> {
    let host = cpal::default_host();

    let device = host
        .default_output_device()
        .ok_or_else(|| Error::Audio("no output device available".to_string()))?;

    let supported_config = device
        .supported_output_configs()
        .map_err(|e| Error::Audio(e.to_string()))?
        .find(|c| {
            c.channels() == 1
                && c.min_sample_rate() <= SampleRate(PLAYBACK_SAMPLE_RATE)
                && c.max_sample_rate() >= SampleRate(PLAYBACK_SAMPLE_RATE)
        })
        .or_else(|| {
            // Fallback: try stereo
            device.supported_output_configs().ok()?.find(|c| {
                c.channels() == 2
                    && c.min_sample_rate() <= SampleRate(PLAYBACK_SAMPLE_RATE)
                    && c.max_sample_rate() >= SampleRate(PLAYBACK_SAMPLE_RATE)
            })
        })
        .ok_or_else(|| Error::Audio("no suitable output config found".to_string()))?;

    Ok(supported_config
        .with_sample_rate(SampleRate(PLAYBACK_SAMPLE_RATE))
        .config())
}

fn build_output_stream(
    config: &StreamConfig,
    mixer: Arc<Mutex<Mixer>>,
) -> Result<cpal::Stream> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| Error::Audio("no output device".to_string()))?;

    let channels = config.channels as usize;

    let stream = device
        .build_output_stream(
            config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let Ok(mut mixer) = mixer.lock() else {
                    data.fill(0.0);
                    return;
                };
                for frame in data.chunks_mut(channels) {
                    frame.fill(mixer.next_sample());
                }
            },
            |err| {
                tracing::error!(error = %err, "audio playback error");
            },
            None,
        )
        .map_err(|e| Error::Audio(e.to_string()))?;

    stream.play().map_err(|e| Error::Audio(e.to_string()))?;
    Ok(stream)
}

/// Decode MP3 bytes to mono f32 samples
///
/// # Errors
///
/// Returns error if the data is not valid MP3
pub fn decode_mp3(mp3_data: &[u8]) -> Result<Vec<f32>> {
    let mut decoder = minimp3::Decoder::new(Cursor::new(mp3_data));
    let mut samples = Vec::new();

    loop {
        match decoder.next_frame() {
            Ok(frame) => {
                if frame.channels == 2 {
                    // Stereo: average channels
                    samples.extend(frame.data.chunks(2).map(|chunk| {
                        let left = f32::from(chunk[0]) / 32768.0;
                        let right = f32::from(chunk.get(1).copied().unwrap_or(chunk[0])) / 32768.0;
                        f32::midpoint(left, right)
                    }));
                } else {
                    samples.extend(frame.data.iter().map(|&s| f32::from(s) / 32768.0));
                }
            }
            Err(minimp3::Error::Eof) => break,
            Err(e) => return Err(Error::Audio(format!("MP3 decode error: {e}"))),
        }
    }

    Ok(samples)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lanes() -> (SpeakerLane, SpeakerLane) {
        let mixer = Arc::new(Mutex::new(Mixer::default()));
        let lane = |lane| SpeakerLane {
            mixer: Arc::clone(&mixer),
            lane,
            _playback: None,
        };
        (lane(Lane::Remote), lane(Lane::Filler))
    }

    #[test]
    fn clearing_filler_keeps_remote_audio() {
        let (remote, filler) = lanes();

        filler.push_samples(&[0.25; 4]);
        remote.push_pcm16(&[16384; 6]);
        filler.clear();

        assert!(filler.is_drained());
        assert!(!remote.is_drained());

        let mut mixer = remote.mixer.lock().unwrap();
        let played: Vec<f32> = (0..6).map(|_| mixer.next_sample()).collect();
        assert!(played.iter().all(|s| (s - 0.5).abs() < f32::EPSILON));
        assert!(mixer.remote.is_empty());
    }

    #[test]
    fn lanes_mix_and_drain_independently() {
        let (remote, filler) = lanes();

        remote.push_samples(&[0.75; 3]);
        filler.push_samples(&[0.5]);

        let first = remote.mixer.lock().unwrap().next_sample();
        assert!((first - 1.0).abs() < f32::EPSILON, "sum is clamped");

        // Filler finished while remote audio is still queued
        assert!(filler.is_drained());
        assert!(!remote.is_drained());
    }

    #[test]
    fn empty_mp3_decodes_to_nothing() {
        let samples = decode_mp3(&[]).unwrap();
        assert!(samples.is_empty());
    }
}

//! Audio capture from microphone

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};
use tokio::sync::mpsc;

use super::{MicrophoneLease, MicrophoneSource};
use crate::{Error, Result};

/// Sample rate for audio capture (24kHz PCM16 is what the realtime endpoint expects)
pub const CAPTURE_SAMPLE_RATE: u32 = 24000;

/// Frames buffered between the capture thread and its consumer
const FRAME_BUFFER: usize = 64;

/// Captures audio from the default input device
///
/// cpal streams aren't `Send`, so each lease hosts its stream on a dedicated
/// thread and forwards frames over a channel.
pub struct CpalMicrophone {
    config: StreamConfig,
    in_use: Arc<AtomicBool>,
}

impl CpalMicrophone {
    /// Probe the default input device
    ///
    /// # Errors
    ///
    /// Returns `Error::PermissionDenied` if no input device is accessible
    pub fn new() -> Result<Self> {
        let host = cpal::default_host();

        let device = host
            .default_input_device()
            .ok_or_else(|| Error::PermissionDenied("no input device available".to_string()))?;

        let supported_config = device
            .supported_input_configs()
            .map_err(|e| Error::Audio(e.to_string()))?
            .find(|c| {
                c.channels() == 1
                    && c.min_sample_rate() <= SampleRate(CAPTURE_SAMPLE_RATE)
                    && c.max_sample_rate() >= SampleRate(CAPTURE_SAMPLE_RATE)
            })
            .ok_or_else(|| Error::Audio("no suitable audio config found".to_string()))?;

        let config = supported_config
            .with_sample_rate(SampleRate(CAPTURE_SAMPLE_RATE))
            .config();

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate = CAPTURE_SAMPLE_RATE,
            channels = config.channels,
            "microphone initialized"
        );

        Ok(Self {
            config,
            in_use: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Check if a lease is currently outstanding
    #[must_use]
    pub fn is_capturing(&self) -> bool {
        self.in_use.load(Ordering::SeqCst)
    }
}

impl MicrophoneSource for CpalMicrophone {
    fn open(&self) -> Result<MicrophoneLease> {
        if self
            .in_use
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::Audio("microphone already in use".to_string()));
        }

        let (frame_tx, frame_rx) = mpsc::channel::<Vec<f32>>(FRAME_BUFFER);
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<()>>();
        let config = self.config.clone();

        let spawned = std::thread::Builder::new()
            .name("mic-capture".to_string())
            .spawn(move || {
                let stream = match build_input_stream(&config, frame_tx) {
                    Ok(s) => s,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                // Hold the stream until the lease is released
                let _ = stop_rx.recv();
                drop(stream);
                tracing::debug!("microphone capture stopped");
            });

        let started = spawned.map_err(Error::from).and_then(|_| {
            ready_rx
                .recv()
                .map_err(|_| Error::Audio("capture thread exited".to_string()))
                .and_then(|r| r)
        });

        if let Err(e) = started {
            self.in_use.store(false, Ordering::SeqCst);
            return Err(e);
        }

        tracing::debug!("microphone capture started");
        let in_use = Arc::clone(&self.in_use);
        Ok(MicrophoneLease::new(frame_rx, move || {
            let _ = stop_tx.send(());
            in_use.store(false, Ordering::SeqCst);
        }))
    }
}

fn build_input_stream(
    config: &StreamConfig,
    frames: mpsc::Sender<Vec<f32>>,
) -> Result<cpal::Stream> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| Error::PermissionDenied("no input device".to_string()))?;

    let stream = device
        .build_input_stream(
            config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                // Drop frames rather than block the audio thread
                let _ = frames.try_send(data.to_vec());
            },
            |err| {
                tracing::error!(error = %err, "audio capture error");
            },
            None,
        )
        .map_err(|e| match e {
            cpal::BuildStreamError::DeviceNotAvailable => {
                Error::PermissionDenied("input device not available".to_string())
            }
            other => Error::Audio(other.to_string()),
        })?;

    stream.play().map_err(|e| Error::Audio(e.to_string()))?;
    Ok(stream)
}

/// Convert f32 samples to WAV bytes for STT APIs
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn samples_to_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Audio(e.to_string()))?;

        for &sample in samples {
            writer
                .write_sample(to_pcm16(sample))
                .map_err(|e| Error::Audio(e.to_string()))?;
        }

        writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}

/// Convert an f32 sample in [-1.0, 1.0] to i16
#[allow(clippy::cast_possible_truncation)]
pub(crate) fn to_pcm16(sample: f32) -> i16 {
    (sample * 32767.0).clamp(-32768.0, 32767.0) as i16
}

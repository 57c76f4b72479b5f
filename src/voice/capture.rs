//! Audio capture from microphone

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};
use tokio::sync::mpsc;

use super::{AudioSource, FRAME_SAMPLES, SAMPLE_RATE, StreamResampler};
use crate::{Error, Result};

/// Frames buffered between the device callback and the reader
const CHANNEL_FRAMES: usize = 256;

/// Captures 16kHz mono frames from the default input device
///
/// The cpal stream lives on a dedicated thread because streams are not
/// `Send` on every platform. Dropping the source stops capture.
pub struct MicrophoneSource {
    frames: mpsc::Receiver<Vec<f32>>,
    _stop: std::sync::mpsc::Sender<()>,
}

impl MicrophoneSource {
    /// Open the default input device and start capturing
    ///
    /// # Errors
    ///
    /// Returns error if audio device cannot be opened
    pub fn open() -> Result<Self> {
        let (frame_tx, frame_rx) = mpsc::channel(CHANNEL_FRAMES);
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
        let (ready_tx, ready_rx) = std::sync::mpsc::sync_channel::<Result<()>>(1);

        std::thread::Builder::new()
            .name("arc-capture".to_string())
            .spawn(move || match build_stream(frame_tx) {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    // Returns once the source is dropped
                    let _ = stop_rx.recv();
                    drop(stream);
                    tracing::debug!("audio capture stopped");
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })?;

        ready_rx
            .recv()
            .map_err(|_| Error::Audio("capture thread exited during startup".to_string()))??;

        Ok(Self {
            frames: frame_rx,
            _stop: stop_tx,
        })
    }
}

#[async_trait]
impl AudioSource for MicrophoneSource {
    async fn next_frame(&mut self) -> Option<Vec<f32>> {
        self.frames.recv().await
    }
}

fn build_stream(frames: mpsc::Sender<Vec<f32>>) -> Result<cpal::Stream> {
    let host = cpal::default_host();

    let device = host
        .default_input_device()
        .ok_or_else(|| Error::Audio("no input device available".to_string()))?;

    // Prefer a native 16kHz config; otherwise take the default and resample
    let config: StreamConfig = match device
        .supported_input_configs()
        .map_err(|e| Error::Audio(e.to_string()))?
        .find(|c| c.min_sample_rate() <= SampleRate(SAMPLE_RATE) && c.max_sample_rate() >= SampleRate(SAMPLE_RATE))
    {
        Some(supported) => supported.with_sample_rate(SampleRate(SAMPLE_RATE)).config(),
        None => device
            .default_input_config()
            .map_err(|e| Error::Audio(e.to_string()))?
            .config(),
    };

    let channels = usize::from(config.channels.max(1));
    let device_rate = config.sample_rate.0;

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        sample_rate = device_rate,
        channels,
        "audio capture initialized"
    );

    // One resampler for the life of the stream keeps filter state across callbacks
    let mut resampler = StreamResampler::new(device_rate, SAMPLE_RATE)?;
    let mut pending: Vec<f32> = Vec::with_capacity(FRAME_SAMPLES * 2);
    let stream = device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                #[allow(clippy::cast_precision_loss)]
                let mono: Vec<f32> = data
                    .chunks(channels)
                    .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
                    .collect();
                match resampler.push(&mono) {
                    Ok(samples) => pending.extend(samples),
                    Err(e) => {
                        tracing::warn!(error = %e, "dropping capture buffer");
                        return;
                    }
                }

                while pending.len() >= FRAME_SAMPLES {
                    let frame: Vec<f32> = pending.drain(..FRAME_SAMPLES).collect();
                    // Reader fell behind; dropping is better than blocking the device
                    let _ = frames.try_send(frame);
                }
            },
            |err| {
                tracing::error!(error = %err, "audio capture error");
            },
            None,
        )
        .map_err(|e| Error::Audio(e.to_string()))?;

    stream.play().map_err(|e| Error::Audio(e.to_string()))?;
    tracing::debug!("audio capture started");
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
            // Convert f32 [-1.0, 1.0] to i16
            #[allow(clippy::cast_possible_truncation)]
            let sample_i16 = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
            writer
                .write_sample(sample_i16)
                .map_err(|e| Error::Audio(e.to_string()))?;
        }

        writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}

//! Audio playback to speakers

use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};

use super::{AudioSink, Pcm};
use crate::{Error, Result};

/// Sample rate for playback (matches common TTS output)
const PLAYBACK_SAMPLE_RATE: u32 = 24000;

/// Queued audio kept ahead of the device, in milliseconds
const HIGH_WATER_MS: u32 = 60;

type SampleQueue = Arc<Mutex<VecDeque<f32>>>;

/// Plays audio to the default output device
///
/// Samples are queued and pulled by the device callback. The queue is kept
/// short so [`AudioSink::clear`] silences output within one buffer.
pub struct SpeakerSink {
    queue: SampleQueue,
    sample_rate: u32,
    _stop: std::sync::mpsc::Sender<()>,
}

impl SpeakerSink {
    /// Open the default output device
    ///
    /// # Errors
    ///
    /// Returns error if audio device cannot be opened
    pub fn open() -> Result<Self> {
        let queue: SampleQueue = Arc::new(Mutex::new(VecDeque::new()));
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
        let (ready_tx, ready_rx) = std::sync::mpsc::sync_channel::<Result<u32>>(1);

        let callback_queue = Arc::clone(&queue);
        std::thread::Builder::new()
            .name("arc-playback".to_string())
            .spawn(move || match build_stream(callback_queue) {
                Ok((stream, rate)) => {
                    let _ = ready_tx.send(Ok(rate));
                    let _ = stop_rx.recv();
                    drop(stream);
                    tracing::debug!("audio playback stopped");
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })?;

        let sample_rate = ready_rx
            .recv()
            .map_err(|_| Error::Audio("playback thread exited during startup".to_string()))??;

        Ok(Self {
            queue,
            sample_rate,
            _stop: stop_tx,
        })
    }

    fn queued(&self) -> usize {
        self.queue.lock().map(|q| q.len()).unwrap_or_default()
    }
}

#[async_trait]
impl AudioSink for SpeakerSink {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    async fn write(&mut self, samples: &[f32]) -> Result<()> {
        let high_water = usize::try_from(self.sample_rate * HIGH_WATER_MS / 1000).unwrap_or(usize::MAX);
        while self.queued() > high_water {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        self.queue
            .lock()
            .map_err(|_| Error::Audio("playback queue poisoned".to_string()))?
            .extend(samples.iter().copied());
        Ok(())
    }

    fn clear(&mut self) {
        if let Ok(mut queue) = self.queue.lock() {
            queue.clear();
        }
    }

    async fn drain(&mut self) -> Result<()> {
        while self.queued() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Ok(())
    }
}

fn build_stream(queue: SampleQueue) -> Result<(cpal::Stream, u32)> {
    let host = cpal::default_host();

    let device = host
        .default_output_device()
        .ok_or_else(|| Error::Audio("no output device available".to_string()))?;

    let supports_rate = |c: &cpal::SupportedStreamConfigRange| {
        c.min_sample_rate() <= SampleRate(PLAYBACK_SAMPLE_RATE)
            && c.max_sample_rate() >= SampleRate(PLAYBACK_SAMPLE_RATE)
    };

    let config: StreamConfig = device
        .supported_output_configs()
        .map_err(|e| Error::Audio(e.to_string()))?
        .find(|c| c.channels() == 1 && supports_rate(c))
        .or_else(|| {
            // Fallback: try stereo
            device
                .supported_output_configs()
                .ok()?
                .find(|c| c.channels() == 2 && supports_rate(c))
        })
        .map(|c| c.with_sample_rate(SampleRate(PLAYBACK_SAMPLE_RATE)).config())
        .map_or_else(
            || {
                device
                    .default_output_config()
                    .map(|c| c.config())
                    .map_err(|e| Error::Audio(e.to_string()))
            },
            Ok,
        )?;

    let channels = usize::from(config.channels.max(1));
    let rate = config.sample_rate.0;

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        sample_rate = rate,
        channels,
        "audio playback initialized"
    );

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let Ok(mut queue) = queue.lock() else {
                    data.fill(0.0);
                    return;
                };
                for frame in data.chunks_mut(channels) {
                    let sample = queue.pop_front().unwrap_or(0.0);
                    frame.fill(sample);
                }
            },
            |err| {
                tracing::error!(error = %err, "audio playback error");
            },
            None,
        )
        .map_err(|e| Error::Audio(e.to_string()))?;

    stream.play().map_err(|e| Error::Audio(e.to_string()))?;
    Ok((stream, rate))
}

/// Decode synthesized audio (WAV or MP3) to mono samples
///
/// # Errors
///
/// Returns error if the bytes are neither valid WAV nor MP3
pub fn decode_audio(bytes: &[u8]) -> Result<Pcm> {
    if bytes.starts_with(b"RIFF") {
        decode_wav(bytes)
    } else {
        decode_mp3(bytes)
    }
}

#[allow(clippy::cast_precision_loss)]
fn decode_wav(bytes: &[u8]) -> Result<Pcm> {
    let reader = hound::WavReader::new(Cursor::new(bytes)).map_err(|e| Error::Audio(format!("WAV decode error: {e}")))?;
    let spec = reader.spec();
    let channels = usize::from(spec.channels.max(1));

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| Error::Audio(format!("WAV decode error: {e}")))?,
        hound::SampleFormat::Int => {
            let scale = (1_i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| Error::Audio(format!("WAV decode error: {e}")))?
        }
    };

    Ok(Pcm::new(downmix(&interleaved, channels), spec.sample_rate))
}

/// Decode MP3 bytes to f32 samples
fn decode_mp3(mp3_data: &[u8]) -> Result<Pcm> {
    let mut decoder = minimp3::Decoder::new(Cursor::new(mp3_data));
    let mut samples = Vec::new();
    let mut sample_rate = 0;

    loop {
        match decoder.next_frame() {
            Ok(frame) => {
                sample_rate = u32::try_from(frame.sample_rate).unwrap_or(PLAYBACK_SAMPLE_RATE);
                let as_f32: Vec<f32> = frame.data.iter().map(|&s| f32::from(s) / 32768.0).collect();
                samples.extend(downmix(&as_f32, frame.channels.max(1)));
            }
            Err(minimp3::Error::Eof) => break,
            Err(e) => return Err(Error::Audio(format!("MP3 decode error: {e}"))),
        }
    }

    if sample_rate == 0 {
        return Err(Error::Audio("no audio frames decoded".to_string()));
    }

    Ok(Pcm::new(samples, sample_rate))
}

#[allow(clippy::cast_precision_loss)]
fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

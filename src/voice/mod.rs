//! Voice processing module
//!
//! Audio capture and playback sit behind [`AudioSource`] and [`AudioSink`];
//! speech recognition and synthesis behind [`Transcriber`] and
//! [`Synthesizer`]. [`SpeechLoop`] ties them together with barge-in, and
//! [`VoiceSession`] drives the orchestrator from it.

mod capture;
mod detector;
mod playback;
mod resample;
mod session;
mod speech_loop;
mod stt;
mod tts;

use async_trait::async_trait;

pub use capture::{MicrophoneSource, samples_to_wav};
pub use detector::{DetectorConfig, DetectorEvent, UtteranceDetector};
pub use playback::{SpeakerSink, decode_audio};
pub use resample::{StreamResampler, resample};
pub use session::{VoiceSession, is_stop_phrase};
pub use speech_loop::{Playback, PlaybackOutcome, SpeechEvent, SpeechLoop, Utterance};
pub use stt::{HttpTranscriber, Transcriber};
pub use tts::{HttpSynthesizer, Synthesizer};

use crate::Result;

/// Capture sample rate (16kHz mono speech)
pub const SAMPLE_RATE: u32 = 16000;

/// Samples per capture frame (30ms at 16kHz)
pub const FRAME_SAMPLES: usize = 480;

/// Mono PCM audio at a known rate
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Pcm {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl Pcm {
    #[must_use]
    pub const fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Playback length
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn duration(&self) -> std::time::Duration {
        if self.sample_rate == 0 {
            return std::time::Duration::ZERO;
        }
        std::time::Duration::from_secs_f64(self.samples.len() as f64 / f64::from(self.sample_rate))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Produces mono frames at [`SAMPLE_RATE`]
#[async_trait]
pub trait AudioSource: Send {
    /// Next captured frame; `None` once the source is exhausted
    async fn next_frame(&mut self) -> Option<Vec<f32>>;
}

/// Plays mono samples at its own rate
#[async_trait]
pub trait AudioSink: Send {
    /// Rate samples must be written at
    fn sample_rate(&self) -> u32;

    /// Queue one buffer, waiting while the device is behind
    ///
    /// # Errors
    ///
    /// Returns error if the output device failed
    async fn write(&mut self, samples: &[f32]) -> Result<()>;

    /// Drop queued audio that has not reached the device yet
    fn clear(&mut self);

    /// Wait until queued audio has played
    ///
    /// # Errors
    ///
    /// Returns error if the output device failed
    async fn drain(&mut self) -> Result<()>;
}

/// RMS energy of a frame
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}

//! Energy-based utterance detection
//!
//! Frames above an RMS threshold count as speech. A few consecutive speech
//! frames open an utterance; enough trailing silence closes it.

use super::rms;

/// Detector tuning, in samples at 16kHz
#[derive(Debug, Clone, Copy)]
pub struct DetectorConfig {
    /// Minimum RMS energy to consider a frame speech
    pub energy_threshold: f32,
    /// Consecutive speech frames needed to start an utterance
    pub onset_frames: usize,
    /// Trailing silence that ends an utterance
    pub silence_samples: usize,
    /// Utterances with less speech than this are dropped
    pub min_speech_samples: usize,
    /// Hard cap on utterance length
    pub max_utterance_samples: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            energy_threshold: 0.03,
            onset_frames: 3,
            silence_samples: 8000,          // 0.5 seconds
            min_speech_samples: 4800,       // 0.3 seconds
            max_utterance_samples: 480_000, // 30 seconds
        }
    }
}

/// Boundary found in the frame stream
#[derive(Debug, Clone, PartialEq)]
pub enum DetectorEvent {
    /// Speech began
    Started,
    /// Speech ended; carries the whole utterance
    Ended(Vec<f32>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Onset,
    Speaking,
}

/// Splits a frame stream into utterances
#[derive(Debug)]
pub struct UtteranceDetector {
    config: DetectorConfig,
    state: State,
    buffer: Vec<f32>,
    speech_frames: usize,
    silence_counter: usize,
}

impl UtteranceDetector {
    #[must_use]
    pub const fn new(config: DetectorConfig) -> Self {
        Self {
            config,
            state: State::Idle,
            buffer: Vec::new(),
            speech_frames: 0,
            silence_counter: 0,
        }
    }

    /// Feed one frame
    pub fn process(&mut self, frame: &[f32]) -> Option<DetectorEvent> {
        let energy = rms(frame);
        let is_speech = energy > self.config.energy_threshold;

        match self.state {
            State::Idle => {
                if is_speech {
                    self.state = State::Onset;
                    self.buffer.clear();
                    self.buffer.extend_from_slice(frame);
                    self.speech_frames = 1;
                    self.silence_counter = 0;
                    return self.check_onset();
                }
            }
            State::Onset => {
                if is_speech {
                    self.buffer.extend_from_slice(frame);
                    self.speech_frames += 1;
                    return self.check_onset();
                }
                // A blip, not speech
                self.reset();
            }
            State::Speaking => {
                self.buffer.extend_from_slice(frame);
                if is_speech {
                    self.silence_counter = 0;
                } else {
                    self.silence_counter += frame.len();
                }

                tracing::trace!(
                    buffer_len = self.buffer.len(),
                    silence = self.silence_counter,
                    energy,
                    "speaking"
                );

                let ended = self.silence_counter > self.config.silence_samples;
                if ended || self.buffer.len() >= self.config.max_utterance_samples {
                    let speech = self.buffer.len().saturating_sub(self.silence_counter);
                    let samples = std::mem::take(&mut self.buffer);
                    self.reset();

                    if speech < self.config.min_speech_samples {
                        tracing::trace!(speech, "utterance too short, dropped");
                        return None;
                    }

                    tracing::debug!(samples = samples.len(), "utterance complete");
                    return Some(DetectorEvent::Ended(samples));
                }
            }
        }

        None
    }

    fn check_onset(&mut self) -> Option<DetectorEvent> {
        if self.speech_frames >= self.config.onset_frames {
            self.state = State::Speaking;
            tracing::trace!("speech started");
            Some(DetectorEvent::Started)
        } else {
            None
        }
    }

    /// Whether an utterance is in progress
    #[must_use]
    pub fn is_speaking(&self) -> bool {
        self.state == State::Speaking
    }

    /// Return to idle, dropping buffered audio
    pub fn reset(&mut self) {
        self.state = State::Idle;
        self.buffer.clear();
        self.speech_frames = 0;
        self.silence_counter = 0;
    }
}

impl Default for UtteranceDetector {
    fn default() -> Self {
        Self::new(DetectorConfig::default())
    }
}

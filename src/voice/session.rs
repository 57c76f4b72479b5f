//! Voice front end: turns utterances into orchestrator turns and speaks replies

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use regex::Regex;
use tokio_util::sync::CancellationToken;

use super::speech_loop::{SpeechEvent, SpeechLoop, Utterance};
use super::{SAMPLE_RATE, Synthesizer, Transcriber};
use crate::agent::{Orchestrator, TurnOutcome, TurnReport};
use crate::config::VoiceConfig;
use crate::{Error, Result};

/// Spoken after a stop phrase
const CANCELLED_REPLY: &str = "Okay, cancelled.";

/// Spoken when the wake word arrives on its own
const ACKNOWLEDGE_REPLY: &str = "Yes?";

const STOP_PHRASES: &[&str] = &["stop", "cancel", "never mind", "nevermind"];

/// Whether `text` is just a request to stop
#[must_use]
pub fn is_stop_phrase(text: &str) -> bool {
    let normalized = text
        .chars()
        .map(|c| if c.is_alphanumeric() { c.to_ascii_lowercase() } else { ' ' })
        .collect::<String>();
    let normalized = normalized.split_whitespace().collect::<Vec<_>>().join(" ");
    STOP_PHRASES.contains(&normalized.as_str())
}

/// Drives an [`Orchestrator`] from a [`SpeechLoop`]
pub struct VoiceSession {
    orchestrator: Orchestrator,
    speech: SpeechLoop,
    transcriber: Arc<dyn Transcriber>,
    synthesizer: Arc<dyn Synthesizer>,
    wake_word: Option<Regex>,
    follow_up: Duration,
    transcribe_timeout: Duration,
    awake_until: Option<Instant>,
    pending: VecDeque<Utterance>,
    last_transcribed: Option<u64>,
}

impl VoiceSession {
    /// Create a session
    ///
    /// # Errors
    ///
    /// Returns `Config` if the wake word cannot be compiled
    pub fn new(
        orchestrator: Orchestrator,
        speech: SpeechLoop,
        transcriber: Arc<dyn Transcriber>,
        synthesizer: Arc<dyn Synthesizer>,
        config: &VoiceConfig,
    ) -> Result<Self> {
        let wake_word = config
            .wake_word
            .as_deref()
            .map(str::trim)
            .filter(|w| !w.is_empty())
            .map(wake_word_pattern)
            .transpose()?;

        Ok(Self {
            orchestrator,
            speech,
            transcriber,
            synthesizer,
            wake_word,
            follow_up: config.follow_up,
            transcribe_timeout: config.transcribe_timeout,
            awake_until: None,
            pending: VecDeque::new(),
            last_transcribed: None,
        })
    }

    /// Handle utterances until the audio source ends, then end the session
    pub async fn run(&mut self) {
        tracing::info!(wake_word = self.wake_word.is_some(), "voice session started");

        loop {
            let utterance = if let Some(utterance) = self.pending.pop_front() {
                utterance
            } else {
                match self.speech.next_event().await {
                    Some(SpeechEvent::UtteranceEnd { id, samples }) => Utterance { id, samples },
                    Some(SpeechEvent::Interrupt { id }) => {
                        tracing::debug!(utterance = id, "reply interrupted");
                        continue;
                    }
                    Some(SpeechEvent::UtteranceStart { .. }) => continue,
                    None => break,
                }
            };

            self.handle_utterance(utterance).await;
        }

        self.orchestrator.end_session();
        tracing::info!("voice session ended");
    }

    /// Transcribe one utterance and act on it
    ///
    /// Returns the reply that was queued for playback, if any.
    pub async fn handle_utterance(&mut self, utterance: Utterance) -> Option<String> {
        if self.last_transcribed.is_some_and(|last| utterance.id <= last) {
            tracing::debug!(utterance = utterance.id, "already transcribed, skipping");
            return None;
        }
        self.last_transcribed = Some(utterance.id);

        let text = match tokio::time::timeout(
            self.transcribe_timeout,
            self.transcriber.transcribe(&utterance.samples, SAMPLE_RATE),
        )
        .await
        {
            Ok(Ok(text)) => text,
            Ok(Err(e)) => {
                tracing::warn!(utterance = utterance.id, error = %e, "transcription failed");
                return None;
            }
            Err(_) => {
                tracing::warn!(utterance = utterance.id, "transcription timed out");
                return None;
            }
        };

        if text.trim().is_empty() {
            return None;
        }

        let Some(request) = self.gate(&text) else {
            tracing::debug!(transcript = %text, "no wake word, ignoring");
            return None;
        };

        if is_stop_phrase(&request) {
            self.speech.interrupt();
            tracing::info!("stop phrase, cancelled");
            self.say(CANCELLED_REPLY).await;
            return Some(CANCELLED_REPLY.to_string());
        }

        if request.is_empty() {
            self.say(ACKNOWLEDGE_REPLY).await;
            return Some(ACKNOWLEDGE_REPLY.to_string());
        }

        tracing::info!(user = %request, "heard");
        let report = self.run_turn(&request).await;
        if report.outcome == TurnOutcome::Interrupted || report.reply.is_empty() {
            return None;
        }

        tracing::info!(assistant = %report.reply, "replying");
        self.say(&report.reply).await;
        Some(report.reply)
    }

    /// Run a turn while watching for new speech
    ///
    /// New speech cancels the turn; finished utterances are queued so the
    /// newest request is handled next.
    async fn run_turn(&mut self, text: &str) -> TurnReport {
        let cancel = CancellationToken::new();
        let Self {
            orchestrator,
            speech,
            pending,
            ..
        } = self;

        let turn = orchestrator.run_turn(text, &cancel);
        tokio::pin!(turn);
        let mut source_open = true;

        loop {
            tokio::select! {
                report = &mut turn => return report,
                event = speech.next_event(), if source_open => match event {
                    Some(SpeechEvent::UtteranceStart { id }) => {
                        tracing::info!(utterance = id, "new speech, interrupting turn");
                        cancel.cancel();
                    }
                    Some(SpeechEvent::UtteranceEnd { id, samples }) => {
                        pending.push_back(Utterance { id, samples });
                    }
                    Some(SpeechEvent::Interrupt { .. }) => {}
                    None => source_open = false,
                },
            }
        }
    }

    /// Strip the wake word, or reject text without one
    fn gate(&mut self, text: &str) -> Option<String> {
        let Some(pattern) = &self.wake_word else {
            return Some(text.trim().to_string());
        };

        let now = Instant::now();
        if self.awake_until.is_some_and(|until| now < until) {
            return Some(text.trim().to_string());
        }

        let found = pattern.find(text)?;
        self.awake_until = Some(now + self.follow_up);
        tracing::info!("wake word detected");
        Some(text[found.end()..].trim().to_string())
    }

    /// Synthesize and queue `text`, extending the follow-up window past its end
    async fn say(&mut self, text: &str) {
        match tokio::time::timeout(self.transcribe_timeout, self.synthesizer.synthesize(text)).await {
            Ok(Ok(pcm)) => {
                let duration = pcm.duration();
                let _playback = self.speech.speak(pcm);
                self.awake_until = Some(Instant::now() + duration + self.follow_up);
            }
            Ok(Err(e)) => tracing::warn!(error = %e, "speech synthesis failed"),
            Err(_) => tracing::warn!("speech synthesis timed out"),
        }
    }

    #[must_use]
    pub const fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// Whether a wake word is currently not required
    #[must_use]
    pub fn is_awake(&self) -> bool {
        self.wake_word.is_none() || self.awake_until.is_some_and(|until| Instant::now() < until)
    }
}

/// Case-insensitive pattern for the wake word, tolerant of punctuation
fn wake_word_pattern(wake_word: &str) -> Result<Regex> {
    let words: Vec<String> = wake_word.split_whitespace().map(regex::escape).collect();
    Regex::new(&format!(r"(?i)\b{}\b[\s,.!?;:]*", words.join(r"[\s,.!?;:-]+")))
        .map_err(|e| Error::Config(format!("invalid wake word {wake_word:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_phrases() {
        assert!(is_stop_phrase("Stop."));
        assert!(is_stop_phrase("never  mind!"));
        assert!(is_stop_phrase("Cancel"));
        assert!(!is_stop_phrase("stop the music in the kitchen"));
        assert!(!is_stop_phrase(""));
    }

    #[test]
    fn wake_word_matching() {
        let pattern = wake_word_pattern("hey arc").unwrap();

        let m = pattern.find("Hey, ARC! What time is it?").unwrap();
        assert_eq!("Hey, ARC! What time is it?"[m.end()..].trim(), "What time is it?");

        assert!(pattern.find("hello world").is_none());
        assert!(pattern.find("hey archie").is_none());
    }
}

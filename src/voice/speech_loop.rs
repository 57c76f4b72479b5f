//! Speech I/O loop with barge-in
//!
//! One task reads the audio source and splits it into utterances; another
//! owns the sink and plays queued replies. When speech starts while a reply
//! is queued or playing, the capture task cancels playback before it
//! reports the new utterance.

use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{AudioSink, AudioSource, DetectorEvent, Pcm, UtteranceDetector, resample};

/// Events buffered between the capture task and the session
const EVENT_BUFFER: usize = 64;

/// Boundaries in the user's speech
#[derive(Debug, Clone, PartialEq)]
pub enum SpeechEvent {
    UtteranceStart { id: u64 },
    UtteranceEnd { id: u64, samples: Vec<f32> },
    /// Utterance `id` started while a reply was playing; playback was cancelled
    Interrupt { id: u64 },
}

/// A complete utterance at 16kHz
#[derive(Debug, Clone, PartialEq)]
pub struct Utterance {
    pub id: u64,
    pub samples: Vec<f32>,
}

/// How a queued reply finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackOutcome {
    Completed,
    Interrupted,
    Failed,
}

/// Handle to one queued reply
#[derive(Debug)]
pub struct Playback {
    cancel: CancellationToken,
    done: oneshot::Receiver<PlaybackOutcome>,
}

impl Playback {
    /// Wait for the reply to finish or be cut off
    pub async fn wait(self) -> PlaybackOutcome {
        self.done.await.unwrap_or(PlaybackOutcome::Failed)
    }

    /// Stop this reply
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

struct PlaybackJob {
    id: u64,
    pcm: Pcm,
    cancel: CancellationToken,
    done: oneshot::Sender<PlaybackOutcome>,
}

/// Replies queued or playing, by playback id
type ActiveSet = Arc<Mutex<Vec<(u64, CancellationToken)>>>;

fn cancel_all(active: &ActiveSet) -> usize {
    active
        .lock()
        .map(|mut set| {
            let n = set.len();
            for (_, token) in set.drain(..) {
                token.cancel();
            }
            n
        })
        .unwrap_or_default()
}

fn finish(active: &ActiveSet, id: u64) {
    if let Ok(mut set) = active.lock() {
        set.retain(|(playback, _)| *playback != id);
    }
}

/// Running capture and playback tasks
pub struct SpeechLoop {
    events: mpsc::Receiver<SpeechEvent>,
    jobs: mpsc::UnboundedSender<PlaybackJob>,
    active: ActiveSet,
    next_playback: u64,
    capture: JoinHandle<()>,
    playback: JoinHandle<()>,
}

impl SpeechLoop {
    /// Spawn the capture and playback tasks
    #[must_use]
    pub fn start(source: Box<dyn AudioSource>, sink: Box<dyn AudioSink>, detector: UtteranceDetector) -> Self {
        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
        let (job_tx, job_rx) = mpsc::unbounded_channel();
        let active: ActiveSet = Arc::default();

        let capture = tokio::spawn(capture_task(source, detector, event_tx, Arc::clone(&active)));
        let playback = tokio::spawn(playback_task(sink, job_rx, Arc::clone(&active)));

        Self {
            events: event_rx,
            jobs: job_tx,
            active,
            next_playback: 0,
            capture,
            playback,
        }
    }

    /// Next speech event; `None` once the audio source has ended
    pub async fn next_event(&mut self) -> Option<SpeechEvent> {
        self.events.recv().await
    }

    /// Next complete utterance, skipping start and interrupt events
    pub async fn next_utterance(&mut self) -> Option<Utterance> {
        loop {
            if let SpeechEvent::UtteranceEnd { id, samples } = self.next_event().await? {
                return Some(Utterance { id, samples });
            }
        }
    }

    /// Queue a reply for playback
    pub fn speak(&mut self, pcm: Pcm) -> Playback {
        self.next_playback += 1;
        let id = self.next_playback;
        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = oneshot::channel();

        if let Ok(mut set) = self.active.lock() {
            set.push((id, cancel.clone()));
        }

        let job = PlaybackJob {
            id,
            pcm,
            cancel: cancel.clone(),
            done: done_tx,
        };
        if self.jobs.send(job).is_err() {
            tracing::warn!("playback task is gone, reply dropped");
            finish(&self.active, id);
        }

        Playback {
            cancel,
            done: done_rx,
        }
    }

    /// Cancel every queued or playing reply
    ///
    /// Returns whether anything was cancelled.
    pub fn interrupt(&self) -> bool {
        cancel_all(&self.active) > 0
    }

    /// Whether a reply is queued or playing
    #[must_use]
    pub fn is_speaking(&self) -> bool {
        self.active.lock().is_ok_and(|set| !set.is_empty())
    }
}

impl Drop for SpeechLoop {
    fn drop(&mut self) {
        cancel_all(&self.active);
        self.capture.abort();
        self.playback.abort();
    }
}

async fn capture_task(
    mut source: Box<dyn AudioSource>,
    mut detector: UtteranceDetector,
    events: mpsc::Sender<SpeechEvent>,
    active: ActiveSet,
) {
    let mut next_id = 0u64;
    let mut current: Option<u64> = None;

    while let Some(frame) = source.next_frame().await {
        let sent = match detector.process(&frame) {
            Some(DetectorEvent::Started) => {
                next_id += 1;
                let id = next_id;
                current = Some(id);

                // Silence the reply before anything else
                let interrupted = cancel_all(&active) > 0;
                let mut ok = events.send(SpeechEvent::UtteranceStart { id }).await.is_ok();
                if interrupted {
                    tracing::info!(utterance = id, "barge-in, playback cancelled");
                    ok = ok && events.send(SpeechEvent::Interrupt { id }).await.is_ok();
                }
                ok
            }
            Some(DetectorEvent::Ended(samples)) => {
                let id = current.take().unwrap_or_else(|| {
                    next_id += 1;
                    next_id
                });
                events.send(SpeechEvent::UtteranceEnd { id, samples }).await.is_ok()
            }
            None => true,
        };

        if !sent {
            tracing::debug!("speech consumer gone, stopping capture");
            return;
        }
    }

    tracing::debug!("audio source ended");
}

async fn playback_task(mut sink: Box<dyn AudioSink>, mut jobs: mpsc::UnboundedReceiver<PlaybackJob>, active: ActiveSet) {
    while let Some(job) = jobs.recv().await {
        let outcome = play(sink.as_mut(), &job).await;
        tracing::debug!(playback = job.id, outcome = ?outcome, "playback finished");
        finish(&active, job.id);
        let _ = job.done.send(outcome);
    }
}

/// Write a reply one buffer at a time, checking for cancellation between buffers
async fn play(sink: &mut dyn AudioSink, job: &PlaybackJob) -> PlaybackOutcome {
    let rate = sink.sample_rate();
    let samples = match resample(&job.pcm.samples, job.pcm.sample_rate, rate) {
        Ok(samples) => samples,
        Err(e) => {
            tracing::warn!(error = %e, "reply could not be resampled");
            return PlaybackOutcome::Failed;
        }
    };
    // 20ms buffers
    let chunk = usize::try_from(rate / 50).unwrap_or(1).max(1);

    for buffer in samples.chunks(chunk) {
        if job.cancel.is_cancelled() {
            sink.clear();
            return PlaybackOutcome::Interrupted;
        }

        let cancelled = tokio::select! {
            biased;
            () = job.cancel.cancelled() => true,
            result = sink.write(buffer) => {
                if let Err(e) = result {
                    tracing::warn!(error = %e, "playback write failed");
                    return PlaybackOutcome::Failed;
                }
                false
            }
        };

        if cancelled {
            sink.clear();
            return PlaybackOutcome::Interrupted;
        }
    }

    let cancelled = tokio::select! {
        biased;
        () = job.cancel.cancelled() => true,
        result = sink.drain() => {
            if let Err(e) = result {
                tracing::warn!(error = %e, "playback drain failed");
                return PlaybackOutcome::Failed;
            }
            false
        }
    };

    if cancelled {
        sink.clear();
        PlaybackOutcome::Interrupted
    } else {
        PlaybackOutcome::Completed
    }
}

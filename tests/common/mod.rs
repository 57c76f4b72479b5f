//! Shared test utilities
//!
//! Fakes for every seam the agent and voice loop talk through, so tests run
//! without a model server, audio hardware, or speech endpoints.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_agent::agent::{ModelProvider, ModelRequest, ModelResponse, RawToolCall, ReasoningEngine};
use arc_agent::config::AgentConfig;
use arc_agent::db::{self, FactCipher};
use arc_agent::error::ToolFailure;
use arc_agent::tools::{NativeTool, ToolDescriptor, ToolKind, ToolRegistry};
use arc_agent::voice::{AudioSink, AudioSource, DetectorConfig, FRAME_SAMPLES, Pcm, Synthesizer, Transcriber};
use arc_agent::{Error, MemoryStore, Orchestrator, Result};
use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::mpsc;

/// Set up an in-memory memory store
#[must_use]
pub fn setup_test_store() -> MemoryStore {
    setup_test_store_with_pool().0
}

/// Store plus its pool, for breaking the database underneath it
pub fn setup_test_store_with_pool() -> (MemoryStore, db::DbPool) {
    let pool = db::init_memory().expect("failed to init test db");
    let store = MemoryStore::new(pool.clone(), FactCipher::from_key(&[7u8; 32]));
    (store, pool)
}

/// Run SQL on a test pool
pub fn exec(pool: &db::DbPool, sql: &str) {
    pool.get().expect("test connection").execute_batch(sql).expect("test sql");
}

/// Tool call as a model would emit it
pub fn call(id: &str, name: &str, arguments: Value) -> RawToolCall {
    RawToolCall {
        id: id.to_string(),
        name: name.to_string(),
        arguments: arguments.to_string(),
    }
}

/// Replays queued responses and records every request
#[derive(Default)]
pub struct ScriptedProvider {
    responses: Mutex<VecDeque<ModelResponse>>,
    /// Returned once the queue is empty
    fallback: Option<ModelResponse>,
    requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedProvider {
    pub fn new(responses: impl IntoIterator<Item = ModelResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().collect()),
            ..Self::default()
        }
    }

    /// Always answer with `response`
    pub fn repeating(response: ModelResponse) -> Self {
        Self {
            fallback: Some(response),
            ..Self::default()
        }
    }

    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    async fn complete(&self, request: &ModelRequest) -> Result<ModelResponse> {
        self.requests.lock().unwrap().push(request.clone());
        let next = self.responses.lock().unwrap().pop_front();
        next.or_else(|| self.fallback.clone())
            .ok_or_else(|| Error::ReasoningProvider("script exhausted".to_string()))
    }
}

/// Answers with a closure over the request
pub struct FnProvider<F>(pub F);

#[async_trait]
impl<F> ModelProvider for FnProvider<F>
where
    F: Fn(&ModelRequest) -> ModelResponse + Send + Sync,
{
    async fn complete(&self, request: &ModelRequest) -> Result<ModelResponse> {
        Ok((self.0)(request))
    }
}

/// Shared record of tool activity, in the order it happened
pub type ToolLog = Arc<Mutex<Vec<String>>>;

/// Sleeps, then echoes; logs `start:<name>` and `end:<name>`
pub struct SleepTool {
    pub name: String,
    pub delay: Duration,
    pub log: ToolLog,
}

#[async_trait]
impl NativeTool for SleepTool {
    async fn call(&self, _arguments: Value) -> std::result::Result<String, ToolFailure> {
        self.log.lock().unwrap().push(format!("start:{}", self.name));
        tokio::time::sleep(self.delay).await;
        self.log.lock().unwrap().push(format!("end:{}", self.name));
        Ok(format!("{} done", self.name))
    }
}

/// Describe a [`SleepTool`] with an empty argument schema
pub fn sleep_tool(name: &str, kind: ToolKind, delay: Duration, log: &ToolLog) -> ToolDescriptor {
    ToolDescriptor::native(
        name,
        format!("sleeps for {}ms", delay.as_millis()),
        json!({ "type": "object", "properties": {} }),
        kind,
        Arc::new(SleepTool {
            name: name.to_string(),
            delay,
            log: Arc::clone(log),
        }),
    )
}

/// Orchestrator over `registry` and `store`, driven by `provider`
pub fn orchestrator(
    provider: Arc<dyn ModelProvider>,
    registry: ToolRegistry,
    store: MemoryStore,
    config: AgentConfig,
) -> Orchestrator {
    let engine = ReasoningEngine::new(provider, config.name.clone(), Duration::from_secs(5));
    Orchestrator::new(Arc::new(registry), engine, store, config)
}

/// Detector tuned for short synthetic utterances
#[must_use]
pub fn fast_detector() -> DetectorConfig {
    DetectorConfig {
        energy_threshold: 0.03,
        onset_frames: 2,
        silence_samples: FRAME_SAMPLES * 2,
        min_speech_samples: FRAME_SAMPLES * 2,
        max_utterance_samples: FRAME_SAMPLES * 200,
    }
}

/// Frames that open and close one utterance under [`fast_detector`]
pub fn utterance_frames(speech: usize) -> Vec<Vec<f32>> {
    let loud = std::iter::repeat_n(vec![0.3f32; FRAME_SAMPLES], speech);
    let quiet = std::iter::repeat_n(vec![0.0f32; FRAME_SAMPLES], 3);
    loud.chain(quiet).collect()
}

/// Audio source fed frame by frame from the test
pub struct ChannelSource(pub mpsc::UnboundedReceiver<Vec<f32>>);

impl ChannelSource {
    pub fn new() -> (mpsc::UnboundedSender<Vec<f32>>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self(rx))
    }
}

#[async_trait]
impl AudioSource for ChannelSource {
    async fn next_frame(&mut self) -> Option<Vec<f32>> {
        self.0.recv().await
    }
}

/// What the recording sink was asked to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkOp {
    Write(usize),
    Clear,
    Drain,
}

/// Sink that plays in simulated real time and records every operation
pub struct RecordingSink {
    pub sample_rate: u32,
    /// Delay per write
    pub pace: Duration,
    pub ops: Arc<Mutex<Vec<SinkOp>>>,
}

impl RecordingSink {
    pub fn new(pace: Duration) -> (Arc<Mutex<Vec<SinkOp>>>, Self) {
        let ops = Arc::new(Mutex::new(Vec::new()));
        let sink = Self {
            sample_rate: 16_000,
            pace,
            ops: Arc::clone(&ops),
        };
        (ops, sink)
    }
}

#[async_trait]
impl AudioSink for RecordingSink {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    async fn write(&mut self, samples: &[f32]) -> Result<()> {
        tokio::time::sleep(self.pace).await;
        self.ops.lock().unwrap().push(SinkOp::Write(samples.len()));
        Ok(())
    }

    fn clear(&mut self) {
        self.ops.lock().unwrap().push(SinkOp::Clear);
    }

    async fn drain(&mut self) -> Result<()> {
        self.ops.lock().unwrap().push(SinkOp::Drain);
        Ok(())
    }
}

/// Samples written before the first clear
pub fn written_before_clear(ops: &[SinkOp]) -> Option<usize> {
    let clear = ops.iter().position(|op| *op == SinkOp::Clear)?;
    Some(
        ops[..clear]
            .iter()
            .map(|op| match op {
                SinkOp::Write(n) => *n,
                _ => 0,
            })
            .sum(),
    )
}

/// Returns queued transcripts in order, recording each call
#[derive(Default)]
pub struct ScriptedTranscriber {
    pub texts: Mutex<VecDeque<String>>,
    pub calls: Mutex<usize>,
}

impl ScriptedTranscriber {
    pub fn new(texts: &[&str]) -> Self {
        Self {
            texts: Mutex::new(texts.iter().map(ToString::to_string).collect()),
            calls: Mutex::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl Transcriber for ScriptedTranscriber {
    async fn transcribe(&self, _samples: &[f32], _sample_rate: u32) -> Result<String> {
        *self.calls.lock().unwrap() += 1;
        Ok(self.texts.lock().unwrap().pop_front().unwrap_or_default())
    }
}

/// Produces a fixed-length tone per request and records the text
pub struct ToneSynthesizer {
    pub length: Duration,
    pub spoken: Mutex<Vec<String>>,
}

impl ToneSynthesizer {
    pub fn new(length: Duration) -> Self {
        Self {
            length,
            spoken: Mutex::new(Vec::new()),
        }
    }

    pub fn spoken(&self) -> Vec<String> {
        self.spoken.lock().unwrap().clone()
    }
}

#[async_trait]
impl Synthesizer for ToneSynthesizer {
    async fn synthesize(&self, text: &str) -> Result<Pcm> {
        self.spoken.lock().unwrap().push(text.to_string());
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let n = (self.length.as_secs_f64() * 16_000.0) as usize;
        Ok(Pcm::new(vec![0.1; n], 16_000))
    }
}

/// Poll `condition` until it holds or two seconds pass
pub async fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

//! Agent orchestrator: runs one user turn through reasoning and tool dispatch

use std::sync::Arc;

use futures::StreamExt;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use super::reasoning::{Decision, ProposedCall, ReasoningEngine};
use super::transcript::{ConversationTurn, ToolCallRequest, ToolInvocation, Transcript};
use crate::config::AgentConfig;
use crate::db::{Episode, EpisodeOutcome, MemoryStore};
use crate::error::ToolFailure;
use crate::tools::{ToolDescriptor, ToolRegistry};
use crate::{Error, Result};

/// Spoken when a turn fails for reasons the model cannot recover from
pub const FAILURE_REPLY: &str = "I couldn't complete that.";

/// Where the orchestrator is within a user turn
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    AwaitingInput,
    Reasoning,
    DispatchingTools,
    Replying,
    AbortedTurn,
}

/// How a turn ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    /// The model produced a direct reply
    Replied,
    /// The step bound was hit; a fallback reply was given
    StepBoundExceeded,
    /// Provider or memory failure; the failure reply was given
    Aborted,
    /// Cancelled by the caller; nothing should be spoken
    Interrupted,
}

/// Everything that happened during one turn
#[derive(Debug, Clone)]
pub struct TurnReport {
    pub reply: String,
    pub outcome: TurnOutcome,
    /// Reasoning calls made
    pub steps: usize,
    /// Invocations made during this turn, in request order
    pub invocations: Vec<ToolInvocation>,
    /// Keys written to memory from the final reply
    pub remembered: Vec<String>,
}

/// Owns the session transcript and drives turns to completion
pub struct Orchestrator {
    registry: Arc<ToolRegistry>,
    engine: ReasoningEngine,
    memory: MemoryStore,
    config: AgentConfig,
    transcript: Transcript,
    state: TurnState,
}

impl Orchestrator {
    #[must_use]
    pub fn new(registry: Arc<ToolRegistry>, engine: ReasoningEngine, memory: MemoryStore, config: AgentConfig) -> Self {
        Self {
            registry,
            engine,
            memory,
            config,
            transcript: Transcript::new(),
            state: TurnState::AwaitingInput,
        }
    }

    /// Run a turn to completion and return the reply text
    pub async fn process_turn(&mut self, input: &str) -> String {
        self.run_turn(input, &CancellationToken::new()).await.reply
    }

    /// Run a turn that `cancel` may interrupt
    ///
    /// Cancellation abandons reasoning and any in-flight cancellable tool
    /// calls. Memory tools always run to completion. The user turn and any
    /// finished tool turns stay in the transcript.
    pub async fn run_turn(&mut self, input: &str, cancel: &CancellationToken) -> TurnReport {
        let user_turn_id = self.transcript.push(ConversationTurn::user(input));
        let first_invocation = self.transcript.invocations().len();
        tracing::debug!(turn = %user_turn_id, chars = input.len(), "user turn");

        // Recalled facts are prompt context only, never transcript entries
        let facts = match self.memory.relevant(input, self.config.memory_context_items) {
            Ok(facts) => facts,
            Err(e) => return self.abort(&e, 0, first_invocation),
        };

        let registry = Arc::clone(&self.registry);
        let descriptors: Vec<&ToolDescriptor> = registry.descriptors().collect();
        let mut steps = 0;

        while steps < self.config.max_steps {
            if cancel.is_cancelled() {
                return self.interrupted(steps, first_invocation);
            }
            steps += 1;
            self.transition(TurnState::Reasoning);

            let decision = tokio::select! {
                biased;
                () = cancel.cancelled() => None,
                d = self.engine.decide(self.transcript.turns(), &descriptors, &facts) => Some(d),
            };

            let decision = match decision {
                None => return self.interrupted(steps, first_invocation),
                Some(Ok(decision)) => decision,
                Some(Err(e)) => return self.abort(&e, steps, first_invocation),
            };

            match decision {
                Decision::DirectReply { text, remember } => {
                    self.transition(TurnState::Replying);

                    let mut remembered = Vec::with_capacity(remember.len());
                    for fact in remember {
                        match self.memory.put(&fact.key, &fact.value, Some(&user_turn_id)) {
                            Ok(stored) => {
                                tracing::info!(key = %stored.key, "remembered fact");
                                remembered.push(stored.key);
                            }
                            Err(e) => return self.abort(&e, steps, first_invocation),
                        }
                    }

                    self.transcript.push(ConversationTurn::assistant(text.clone()));
                    self.transition(TurnState::AwaitingInput);

                    return TurnReport {
                        reply: text,
                        outcome: TurnOutcome::Replied,
                        steps,
                        invocations: self.invocations_since(first_invocation),
                        remembered,
                    };
                }
                Decision::ToolCalls { preamble, calls } => {
                    self.transition(TurnState::DispatchingTools);

                    let requests = calls.iter().map(ProposedCall::to_request).collect();
                    let assistant_id = self
                        .transcript
                        .push(ConversationTurn::assistant_with_calls(preamble, requests));

                    let results = dispatch(&registry, &calls, self.config.max_parallel_tools, cancel).await;
                    for (call, result) in calls.iter().zip(results) {
                        self.record(call, result, &assistant_id);
                    }
                }
            }
        }

        let err = Error::StepBoundExceeded(self.config.max_steps);
        tracing::warn!(error = %err, "giving up on turn");
        self.transition(TurnState::AbortedTurn);

        let reply = format!(
            "I couldn't complete that within {} steps. Could you try breaking it into smaller requests?",
            self.config.max_steps
        );
        self.transcript.push(ConversationTurn::assistant(reply.clone()));
        self.transition(TurnState::AwaitingInput);

        TurnReport {
            reply,
            outcome: TurnOutcome::StepBoundExceeded,
            steps,
            invocations: self.invocations_since(first_invocation),
            remembered: Vec::new(),
        }
    }

    /// Drop the transcript and invocation ledger
    pub fn end_session(&mut self) {
        tracing::info!(turns = self.transcript.len(), "session ended");
        self.transcript.clear();
        self.transition(TurnState::AwaitingInput);
    }

    #[must_use]
    pub const fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    #[must_use]
    pub const fn state(&self) -> TurnState {
        self.state
    }

    #[must_use]
    pub const fn memory(&self) -> &MemoryStore {
        &self.memory
    }

    #[must_use]
    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    fn transition(&mut self, next: TurnState) {
        tracing::trace!(from = ?self.state, to = ?next, "turn state");
        self.state = next;
    }

    fn invocations_since(&self, first: usize) -> Vec<ToolInvocation> {
        self.transcript.invocations()[first..].to_vec()
    }

    /// Finish a call: ledger entry, tool turn, episode
    fn record(&mut self, call: &ProposedCall, result: Result<String>, requesting_turn_id: &str) {
        let mut invocation = ToolInvocation::pending(&call.to_request(), requesting_turn_id);

        let (content, episode) = match result {
            Ok(output) => {
                tracing::info!(invocation = %summarize_invocation(&call.name, &call.arguments), "tool call succeeded");
                let episode = Episode::new(&call.name, EpisodeOutcome::Succeeded, &output);
                invocation.succeed(output.clone());
                (output, episode)
            }
            Err(e) => {
                tracing::warn!(
                    invocation = %summarize_invocation(&call.name, &call.arguments),
                    kind = e.kind(),
                    error = %e,
                    "tool call failed"
                );
                let episode = Episode::new(&call.name, EpisodeOutcome::Failed, &e.to_string());
                invocation.fail(e.to_string());
                (error_turn(&e), episode)
            }
        };

        if let Err(e) = self.memory.log_episode(&episode) {
            tracing::warn!(tool = %call.name, error = %e, "failed to log episode");
        }

        self.transcript
            .record(invocation, ConversationTurn::tool(call.id.clone(), content));
    }

    fn abort(&mut self, error: &Error, steps: usize, first_invocation: usize) -> TurnReport {
        tracing::warn!(kind = error.kind(), error = %error, "turn aborted");
        self.transition(TurnState::AbortedTurn);
        self.transcript.push(ConversationTurn::assistant(FAILURE_REPLY));
        self.transition(TurnState::AwaitingInput);

        TurnReport {
            reply: FAILURE_REPLY.to_string(),
            outcome: TurnOutcome::Aborted,
            steps,
            invocations: self.invocations_since(first_invocation),
            remembered: Vec::new(),
        }
    }

    fn interrupted(&mut self, steps: usize, first_invocation: usize) -> TurnReport {
        tracing::info!(steps, "turn interrupted");
        self.transition(TurnState::AwaitingInput);

        TurnReport {
            reply: String::new(),
            outcome: TurnOutcome::Interrupted,
            steps,
            invocations: self.invocations_since(first_invocation),
            remembered: Vec::new(),
        }
    }
}

impl ProposedCall {
    fn to_request(&self) -> ToolCallRequest {
        ToolCallRequest {
            id: self.id.clone(),
            name: self.name.clone(),
            arguments: self.arguments.clone(),
        }
    }
}

/// Run a batch of calls, returning results in request order
///
/// Runs of consecutive read-only calls execute concurrently, up to
/// `max_parallel` at a time; everything else runs one at a time.
async fn dispatch(
    registry: &ToolRegistry,
    calls: &[ProposedCall],
    max_parallel: usize,
    cancel: &CancellationToken,
) -> Vec<Result<String>> {
    let independent = |call: &ProposedCall| {
        call.schema_error.is_none()
            && registry
                .get(&call.name)
                .is_some_and(|d| d.kind.is_independent())
    };

    let mut results = Vec::with_capacity(calls.len());
    let mut i = 0;
    while i < calls.len() {
        if independent(&calls[i]) {
            let end = calls[i..]
                .iter()
                .position(|c| !independent(c))
                .map_or(calls.len(), |offset| i + offset);

            let pending: Vec<_> = calls[i..end]
                .iter()
                .map(|call| execute(registry, call, cancel))
                .collect();
            let batch: Vec<Result<String>> = futures::stream::iter(pending)
                .buffered(max_parallel.max(1))
                .collect()
                .await;
            results.extend(batch);
            i = end;
        } else {
            results.push(execute(registry, &calls[i], cancel).await);
            i += 1;
        }
    }
    results
}

async fn execute(registry: &ToolRegistry, call: &ProposedCall, cancel: &CancellationToken) -> Result<String> {
    if let Some(message) = &call.schema_error {
        return Err(Error::SchemaValidation {
            tool: call.name.clone(),
            message: message.clone(),
        });
    }

    let cancellable = registry
        .get(&call.name)
        .is_none_or(|d| d.kind.is_cancellable());
    if !cancellable {
        return registry.invoke(&call.name, call.arguments.clone()).await;
    }

    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(Error::tool(&call.name, ToolFailure::Cancelled)),
        result = registry.invoke(&call.name, call.arguments.clone()) => result,
    }
}

/// Structured body of a tool-error turn
fn error_turn(error: &Error) -> String {
    json!({
        "error": error.kind(),
        "message": error.to_string(),
    })
    .to_string()
}

/// Short log label for a call: tool name plus its most telling argument
fn summarize_invocation(name: &str, arguments: &serde_json::Value) -> String {
    for field in &["query", "path", "url", "key"] {
        if let Some(s) = arguments.get(field).and_then(|v| v.as_str()) {
            let truncated: String = s.chars().take(60).collect();
            return format!("{name}: {truncated}");
        }
    }
    name.to_string()
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};

    use super::*;

    #[test]
    fn summarize_invocation_extracts_query() {
        let s = summarize_invocation("memory_search", &json!({ "query": "favorite color" }));
        assert_eq!(s, "memory_search: favorite color");
    }

    #[test]
    fn summarize_invocation_extracts_path() {
        let s = summarize_invocation("read_file", &json!({ "path": "/home/user/file.txt" }));
        assert_eq!(s, "read_file: /home/user/file.txt");
    }

    #[test]
    fn summarize_invocation_falls_back_to_name() {
        let s = summarize_invocation("current_time", &json!({}));
        assert_eq!(s, "current_time");
    }

    #[test]
    fn error_turn_is_structured() {
        let body = error_turn(&Error::tool("slow", ToolFailure::Timeout(std::time::Duration::from_secs(2))));
        let value: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["error"], "ToolExecutionError");
        assert!(value["message"].as_str().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn schema_errors_are_not_invoked() {
        let registry = ToolRegistry::new(std::time::Duration::from_secs(1));
        let call = ProposedCall {
            id: "c1".to_string(),
            name: "anything".to_string(),
            arguments: json!({}),
            schema_error: Some("$.city: required".to_string()),
        };

        let results = dispatch(&registry, &[call], 2, &CancellationToken::new()).await;
        assert!(matches!(results[0], Err(Error::SchemaValidation { .. })));
    }

    #[tokio::test]
    async fn unknown_tool_is_not_found() {
        let registry = ToolRegistry::new(std::time::Duration::from_secs(1));
        let call = ProposedCall {
            id: "c1".to_string(),
            name: "teleport".to_string(),
            arguments: json!({}),
            schema_error: None,
        };

        let results = dispatch(&registry, &[call], 2, &CancellationToken::new()).await;
        assert!(matches!(&results[0], Err(Error::ToolNotFound(name)) if name == "teleport"));
    }
}

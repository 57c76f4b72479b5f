//! Reasoning engine adapter
//!
//! Turns the transcript, the registered tools and any recalled facts into a
//! model request, and the model's answer into a [`Decision`] the orchestrator
//! can act on.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;
use serde_json::Value;
use uuid::Uuid;

use super::provider::{ModelProvider, ModelRequest, RawToolCall, ToolSpec};
use super::transcript::ConversationTurn;
use crate::db::{MemoryFact, MemoryStore, normalize_key};
use crate::tools::{ToolDescriptor, schema};
use crate::{Error, Result};

static REMEMBER_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)<remember\s+key\s*=\s*"([^"]+)"\s*>(.*?)</remember>"#)
        .expect("valid regex")
});

/// A fact the model asked to keep
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RememberedFact {
    pub key: String,
    pub value: String,
}

/// A tool call the model proposed
#[derive(Debug, Clone, PartialEq)]
pub struct ProposedCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
    /// Set when the arguments are unparseable or violate the input schema;
    /// such calls are answered with an error turn instead of being invoked
    pub schema_error: Option<String>,
}

/// What the model wants to do next
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    DirectReply {
        text: String,
        remember: Vec<RememberedFact>,
    },
    ToolCalls {
        /// Any text the model emitted alongside the calls
        preamble: String,
        calls: Vec<ProposedCall>,
    },
}

/// Wraps a [`ModelProvider`] with prompt assembly and output parsing
pub struct ReasoningEngine {
    provider: Arc<dyn ModelProvider>,
    assistant_name: String,
    extra_instructions: Option<String>,
    timeout: Duration,
}

impl ReasoningEngine {
    #[must_use]
    pub fn new(provider: Arc<dyn ModelProvider>, assistant_name: impl Into<String>, timeout: Duration) -> Self {
        Self {
            provider,
            assistant_name: assistant_name.into(),
            extra_instructions: None,
            timeout,
        }
    }

    /// Append operator instructions to the system prompt
    #[must_use]
    pub fn with_instructions(mut self, instructions: Option<String>) -> Self {
        self.extra_instructions = instructions.filter(|s| !s.trim().is_empty());
        self
    }

    /// Ask the model for the next step
    ///
    /// # Errors
    ///
    /// Returns `ReasoningProvider` if the provider fails, times out, or
    /// returns neither text nor tool calls
    pub async fn decide(
        &self,
        transcript: &[ConversationTurn],
        descriptors: &[&ToolDescriptor],
        facts: &[MemoryFact],
    ) -> Result<Decision> {
        let mut tools: Vec<ToolSpec> = descriptors
            .iter()
            .map(|d| ToolSpec {
                name: d.name.clone(),
                description: d.description.clone(),
                parameters: d.input_schema.clone(),
            })
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));

        let request = ModelRequest {
            system_prompt: self.system_prompt(facts),
            turns: transcript.to_vec(),
            tools,
        };

        let response = tokio::time::timeout(self.timeout, self.provider.complete(&request))
            .await
            .map_err(|_| {
                Error::ReasoningProvider(format!("no response within {}s", self.timeout.as_secs()))
            })??;

        if !response.tool_calls.is_empty() {
            let calls = response
                .tool_calls
                .into_iter()
                .map(|raw| propose(raw, descriptors))
                .collect::<Vec<_>>();
            tracing::debug!(calls = calls.len(), "model requested tools");
            return Ok(Decision::ToolCalls {
                preamble: response.content.map(|c| strip_markers(&c).0).unwrap_or_default(),
                calls,
            });
        }

        match response.content {
            Some(content) => {
                let (text, remember) = strip_markers(&content);
                Ok(Decision::DirectReply { text, remember })
            }
            None => Err(Error::ReasoningProvider(
                "model returned neither text nor tool calls".to_string(),
            )),
        }
    }

    fn system_prompt(&self, facts: &[MemoryFact]) -> String {
        let mut prompt = format!(
            "You are {name}, a helpful voice assistant running on the user's computer. \
             Replies are spoken aloud, so keep them short and conversational and avoid markdown.\n\n\
             Use the available tools when they help. When the user tells you a durable fact \
             about themselves (their name, preferences, people, plans), add a marker at the end \
             of your reply like <remember key=\"user_name\">Alex</remember>. Keys are snake_case. \
             Markers are removed before the reply is spoken.",
            name = self.assistant_name
        );

        if !facts.is_empty() {
            prompt.push_str("\n\nThings you remember about the user:\n");
            prompt.push_str(&MemoryStore::format_for_prompt(facts));
        }

        if let Some(extra) = &self.extra_instructions {
            prompt.push_str("\n\n");
            prompt.push_str(extra);
        }

        prompt
    }
}

/// Parse and validate one raw call
fn propose(raw: RawToolCall, descriptors: &[&ToolDescriptor]) -> ProposedCall {
    let id = if raw.id.trim().is_empty() {
        format!("call_{}", Uuid::new_v4().simple())
    } else {
        raw.id
    };

    let text = raw.arguments.trim();
    let parsed = if text.is_empty() {
        Ok(Value::Object(serde_json::Map::new()))
    } else {
        serde_json::from_str::<Value>(text)
    };

    let (arguments, schema_error) = match parsed {
        Ok(arguments) => {
            // Unknown tools are left for the registry to report as not found
            let schema_error = descriptors
                .iter()
                .find(|d| d.name == raw.name)
                .and_then(|d| schema::validate(&d.input_schema, &arguments).err());
            (arguments, schema_error)
        }
        Err(e) => (
            Value::String(raw.arguments.clone()),
            Some(format!("arguments are not valid JSON: {e}")),
        ),
    };

    ProposedCall {
        id,
        name: raw.name,
        arguments,
        schema_error,
    }
}

/// Remove remember markers, returning the visible text and the facts
fn strip_markers(content: &str) -> (String, Vec<RememberedFact>) {
    let remember = REMEMBER_MARKER
        .captures_iter(content)
        .filter_map(|caps| {
            let key = normalize_key(&caps[1]);
            let value = caps[2].trim().to_string();
            (!key.is_empty() && !value.is_empty()).then_some(RememberedFact { key, value })
        })
        .collect();

    let stripped = REMEMBER_MARKER.replace_all(content, "");
    let text = stripped
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string();
    (text, remember)
}

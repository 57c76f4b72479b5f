//! Language model provider adapter
//!
//! [`ModelProvider`] is the seam between the reasoning engine and an actual
//! model server. [`OpenAiCompatProvider`] speaks the OpenAI chat completions
//! wire format, which local servers (Ollama, LM Studio, llama.cpp) accept.

use async_trait::async_trait;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::transcript::{ConversationTurn, Role};
use crate::config::LlmConfig;
use crate::{Error, Result};

/// Tool advertised to the model
#[derive(Debug, Clone, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// One reasoning request
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub system_prompt: String,
    pub turns: Vec<ConversationTurn>,
    /// Sorted by name
    pub tools: Vec<ToolSpec>,
}

/// Tool call as returned by the model, arguments still raw JSON text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

/// Model output for one request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelResponse {
    pub content: Option<String>,
    pub tool_calls: Vec<RawToolCall>,
}

impl ModelResponse {
    /// Plain text reply
    #[must_use]
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            tool_calls: Vec::new(),
        }
    }

    /// Reply requesting tools
    #[must_use]
    pub const fn calls(tool_calls: Vec<RawToolCall>) -> Self {
        Self {
            content: None,
            tool_calls,
        }
    }
}

/// Something that can answer a reasoning request
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Run one completion
    ///
    /// # Errors
    ///
    /// Returns `ReasoningProvider` if the model is unreachable or the
    /// response is unusable
    async fn complete(&self, request: &ModelRequest) -> Result<ModelResponse>;
}

/// OpenAI-compatible chat completions client
pub struct OpenAiCompatProvider {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<SecretString>,
    temperature: f32,
    max_tokens: u32,
}

impl OpenAiCompatProvider {
    /// Create a provider from LLM configuration
    ///
    /// # Errors
    ///
    /// Returns error if the base URL is invalid or the HTTP client cannot be built
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let parsed = url::Url::parse(&config.base_url)
            .map_err(|e| Error::Config(format!("invalid llm base_url {}: {e}", config.base_url)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(Error::Config(format!(
                "llm base_url must be http(s): {}",
                config.base_url
            )));
        }

        let client = reqwest::Client::builder().timeout(config.timeout).build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key: config.api_key.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        })
    }

    /// Model identifier requests are sent with
    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl ModelProvider for OpenAiCompatProvider {
    async fn complete(&self, request: &ModelRequest) -> Result<ModelResponse> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = ChatCompletionRequest {
            model: &self.model,
            messages: wire_messages(request),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            stream: false,
            tools: request
                .tools
                .iter()
                .map(|t| WireTool {
                    kind: "function",
                    function: WireFunction {
                        name: &t.name,
                        description: &t.description,
                        parameters: &t.parameters,
                    },
                })
                .collect(),
        };

        let mut req = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key.expose_secret());
        }

        tracing::debug!(model = %self.model, turns = request.turns.len(), tools = request.tools.len(), "chat completion request");

        let response = req
            .send()
            .await
            .map_err(|e| Error::ReasoningProvider(format!("request failed: {e}")))?;

        match response.status() {
            StatusCode::OK => {
                let parsed: ChatCompletionResponse = response
                    .json()
                    .await
                    .map_err(|e| Error::ReasoningProvider(format!("malformed response: {e}")))?;
                let choice = parsed
                    .choices
                    .into_iter()
                    .next()
                    .ok_or_else(|| Error::ReasoningProvider("response had no choices".to_string()))?;

                Ok(ModelResponse {
                    content: choice.message.content.filter(|c| !c.trim().is_empty()),
                    tool_calls: choice
                        .message
                        .tool_calls
                        .unwrap_or_default()
                        .into_iter()
                        .map(|tc| RawToolCall {
                            id: tc.id.unwrap_or_default(),
                            name: tc.function.name,
                            arguments: tc.function.arguments.into_text(),
                        })
                        .collect(),
                })
            }
            StatusCode::UNAUTHORIZED => Err(Error::ReasoningProvider(
                "authentication failed, check the API key".to_string(),
            )),
            status => {
                let detail = response
                    .json::<Value>()
                    .await
                    .ok()
                    .and_then(|v| {
                        v.pointer("/error/message")
                            .and_then(Value::as_str)
                            .map(ToString::to_string)
                    })
                    .unwrap_or_else(|| "unknown error".to_string());
                Err(Error::ReasoningProvider(format!("{status}: {detail}")))
            }
        }
    }
}

/// Render the system prompt plus transcript in chat completions form
fn wire_messages(request: &ModelRequest) -> Vec<WireMessage> {
    let mut messages = Vec::with_capacity(request.turns.len() + 1);
    messages.push(WireMessage {
        role: "system",
        content: Some(request.system_prompt.clone()),
        tool_calls: None,
        tool_call_id: None,
    });

    for turn in &request.turns {
        let tool_calls = (!turn.tool_calls.is_empty()).then(|| {
            turn.tool_calls
                .iter()
                .map(|c| WireToolCall {
                    id: Some(c.id.clone()),
                    kind: Some("function".to_string()),
                    function: WireCallFunction {
                        name: c.name.clone(),
                        arguments: WireArguments::Text(c.arguments.to_string()),
                    },
                })
                .collect()
        });

        // Assistant turns that only call tools carry null content
        let content = if tool_calls.is_some() && turn.content.is_empty() {
            None
        } else {
            Some(turn.content.clone())
        };

        messages.push(WireMessage {
            role: turn.role.as_str(),
            content,
            tool_calls,
            tool_call_id: if turn.role == Role::Tool {
                turn.tool_call_id.clone()
            } else {
                None
            },
        });
    }

    messages
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage>,
    temperature: f32,
    max_tokens: u32,
    stream: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool<'a>>,
}

#[derive(Serialize)]
struct WireMessage {
    role: &'static str,
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Serialize)]
struct WireTool<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    function: WireFunction<'a>,
}

#[derive(Serialize)]
struct WireFunction<'a> {
    name: &'a str,
    description: &'a str,
    parameters: &'a Value,
}

#[derive(Serialize, Deserialize)]
struct WireToolCall {
    #[serde(default)]
    id: Option<String>,
    #[serde(rename = "type", default)]
    kind: Option<String>,
    function: WireCallFunction,
}

#[derive(Serialize, Deserialize)]
struct WireCallFunction {
    name: String,
    #[serde(default)]
    arguments: WireArguments,
}

/// Arguments are a JSON string per the API, but some local servers send an object
#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum WireArguments {
    Text(String),
    Object(Value),
}

impl Default for WireArguments {
    fn default() -> Self {
        Self::Text("{}".to_string())
    }
}

impl WireArguments {
    fn into_text(self) -> String {
        match self {
            Self::Text(s) => s,
            Self::Object(v) => v.to_string(),
        }
    }
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCall>>,
}

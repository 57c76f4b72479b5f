//! Session transcript and tool invocation ledger

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Who produced a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

impl Role {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

/// A tool call requested by an assistant turn
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// One entry in the session transcript
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationTurn {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// Set on tool turns: the call this turn answers
    pub tool_call_id: Option<String>,
    /// Set on assistant turns that requested tools
    pub tool_calls: Vec<ToolCallRequest>,
}

impl ConversationTurn {
    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: format!("turn_{}", Uuid::new_v4()),
            role,
            content: content.into(),
            timestamp: Utc::now(),
            tool_call_id: None,
            tool_calls: Vec::new(),
        }
    }

    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Assistant turn requesting tool calls
    #[must_use]
    pub fn assistant_with_calls(content: impl Into<String>, calls: Vec<ToolCallRequest>) -> Self {
        Self {
            tool_calls: calls,
            ..Self::new(Role::Assistant, content)
        }
    }

    /// Tool result (or error) answering `call_id`
    #[must_use]
    pub fn tool(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(call_id.into()),
            ..Self::new(Role::Tool, content)
        }
    }
}

/// Lifecycle of a tool invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvocationStatus {
    Pending,
    Succeeded,
    Failed,
}

impl InvocationStatus {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Record of one tool call and its outcome
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    /// Call id, shared with the answering tool turn
    pub id: String,
    pub tool_name: String,
    pub arguments: Value,
    pub requesting_turn_id: String,
    pub status: InvocationStatus,
    pub result: Option<String>,
    pub error: Option<String>,
}

impl ToolInvocation {
    #[must_use]
    pub fn pending(call: &ToolCallRequest, requesting_turn_id: &str) -> Self {
        Self {
            id: call.id.clone(),
            tool_name: call.name.clone(),
            arguments: call.arguments.clone(),
            requesting_turn_id: requesting_turn_id.to_string(),
            status: InvocationStatus::Pending,
            result: None,
            error: None,
        }
    }

    pub fn succeed(&mut self, output: String) {
        self.status = InvocationStatus::Succeeded;
        self.result = Some(output);
    }

    pub fn fail(&mut self, error: String) {
        self.status = InvocationStatus::Failed;
        self.error = Some(error);
    }
}

/// Ordered turns of one session plus the invocations they reference
#[derive(Debug, Default)]
pub struct Transcript {
    turns: Vec<ConversationTurn>,
    invocations: Vec<ToolInvocation>,
}

impl Transcript {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a turn, returning its id
    pub fn push(&mut self, turn: ConversationTurn) -> String {
        let id = turn.id.clone();
        self.turns.push(turn);
        id
    }

    /// Record a terminal invocation together with the tool turn answering it
    pub fn record(&mut self, invocation: ToolInvocation, turn: ConversationTurn) {
        debug_assert!(invocation.status.is_terminal());
        self.invocations.push(invocation);
        self.turns.push(turn);
    }

    #[must_use]
    pub fn turns(&self) -> &[ConversationTurn] {
        &self.turns
    }

    #[must_use]
    pub fn invocations(&self) -> &[ToolInvocation] {
        &self.invocations
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.turns.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Whether every recorded invocation has finished
    #[must_use]
    pub fn all_terminal(&self) -> bool {
        self.invocations.iter().all(|i| i.status.is_terminal())
    }

    pub fn clear(&mut self) {
        self.turns.clear();
        self.invocations.clear();
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn record_pairs_invocation_with_tool_turn() {
        let mut transcript = Transcript::new();
        let call = ToolCallRequest {
            id: "call_1".to_string(),
            name: "current_time".to_string(),
            arguments: json!({}),
        };
        let assistant = transcript.push(ConversationTurn::assistant_with_calls("", vec![call.clone()]));

        let mut invocation = ToolInvocation::pending(&call, &assistant);
        invocation.succeed("noon".to_string());
        transcript.record(invocation, ConversationTurn::tool("call_1", "noon"));

        assert_eq!(transcript.len(), 2);
        assert_eq!(transcript.invocations().len(), 1);
        assert!(transcript.all_terminal());
        assert_eq!(transcript.turns()[1].tool_call_id.as_deref(), Some("call_1"));

        transcript.clear();
        assert!(transcript.is_empty());
        assert!(transcript.invocations().is_empty());
    }
}

//! Agent core: transcript, reasoning, and the turn orchestrator

pub mod interrupt;
pub mod orchestrator;
pub mod provider;
pub mod reasoning;
pub mod transcript;

pub use interrupt::{Interrupted, Interrupter};
pub use orchestrator::{FAILURE_REPLY, Orchestrator, TurnOutcome, TurnReport, TurnState};
pub use provider::{ModelProvider, ModelRequest, ModelResponse, OpenAiCompatProvider, RawToolCall, ToolSpec};
pub use reasoning::{Decision, ProposedCall, ReasoningEngine, RememberedFact};
pub use transcript::{ConversationTurn, InvocationStatus, Role, ToolCallRequest, ToolInvocation, Transcript};

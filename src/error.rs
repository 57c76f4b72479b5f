//! Error types for the ARC agent

use std::time::Duration;

use thiserror::Error;

/// Result type alias for ARC operations
pub type Result<T> = std::result::Result<T, Error>;

/// Why a tool invocation failed
///
/// Native and protocol tools share this taxonomy so callers of the registry
/// cannot tell them apart by failure shape.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ToolFailure {
    /// The call did not finish within its time bound
    #[error("timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// The external transport to a protocol server failed
    #[error("transport failure: {0}")]
    Transport(String),

    /// The tool ran and reported an error
    #[error("{0}")]
    Failed(String),

    /// The call was abandoned because the user interrupted the turn
    #[error("cancelled by interruption")]
    Cancelled,
}

/// Errors that can occur in the ARC agent
#[derive(Debug, Error)]
pub enum Error {
    /// No tool is registered under the requested name
    #[error("tool not found: {0}")]
    ToolNotFound(String),

    /// A tool with the same name is already registered
    #[error("duplicate tool: {0}")]
    DuplicateTool(String),

    /// Tool arguments do not satisfy the declared input schema
    #[error("schema validation failed for {tool}: {message}")]
    SchemaValidation { tool: String, message: String },

    /// Tool execution failed (timeout, transport, native error, cancellation)
    #[error("tool {tool} failed: {failure}")]
    ToolExecution { tool: String, failure: ToolFailure },

    /// Reasoning provider unreachable or returned an unusable response
    #[error("reasoning provider error: {0}")]
    ReasoningProvider(String),

    /// Memory store encryption or storage failure
    #[error("memory store error: {0}")]
    MemoryStore(String),

    /// A user turn needed more reasoning steps than allowed
    #[error("step bound of {0} exceeded")]
    StepBoundExceeded(usize),

    /// Context protocol (JSON-RPC) error reported by a server
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Audio error
    #[error("audio error: {0}")]
    Audio(String),

    /// Speech-to-text error
    #[error("STT error: {0}")]
    Stt(String),

    /// Text-to-speech error
    #[error("TTS error: {0}")]
    Tts(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// `SQLite` error
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl Error {
    /// Build a tool execution error
    #[must_use]
    pub fn tool(tool: impl Into<String>, failure: ToolFailure) -> Self {
        Self::ToolExecution {
            tool: tool.into(),
            failure,
        }
    }

    /// Whether the orchestrator recovers from this error by feeding it back
    /// to the model as a tool-role turn
    #[must_use]
    pub const fn is_tool_level(&self) -> bool {
        matches!(
            self,
            Self::ToolNotFound(_) | Self::SchemaValidation { .. } | Self::ToolExecution { .. }
        )
    }

    /// Short machine-readable kind, used in structured tool-error turns
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::ToolNotFound(_) => "ToolNotFound",
            Self::DuplicateTool(_) => "DuplicateTool",
            Self::SchemaValidation { .. } => "SchemaValidationError",
            Self::ToolExecution { .. } => "ToolExecutionError",
            Self::ReasoningProvider(_) => "ReasoningProviderError",
            Self::MemoryStore(_) | Self::Sqlite(_) => "MemoryStoreError",
            Self::StepBoundExceeded(_) => "StepBoundExceeded",
            Self::Protocol(_) => "ProtocolError",
            Self::Config(_) => "ConfigError",
            Self::Audio(_) | Self::Stt(_) | Self::Tts(_) => "SpeechError",
            Self::Io(_) => "IoError",
            Self::Http(_) => "HttpError",
            Self::Serialization(_) | Self::Toml(_) => "SerializationError",
        }
    }
}

//! Tool registry: native and protocol-backed capabilities behind one interface

pub mod memory;
pub mod schema;
pub mod system;
pub mod web;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::ToolFailure;
use crate::mcp::ProtocolClient;
use crate::{Error, Result};

pub use memory::memory_tools;
pub use system::system_tools;
pub use web::web_tools;

/// Classification used to determine execution strategy within a tool batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolKind {
    /// Read-only; consecutive reads may run in parallel.
    Read,
    /// Mutating; runs alone, in request order.
    Mutate,
    /// Touches the memory store; runs alone and is never cancelled by barge-in.
    Memory,
}

impl ToolKind {
    /// Whether calls of this kind may overlap with neighbouring calls
    #[must_use]
    pub const fn is_independent(self) -> bool {
        matches!(self, Self::Read)
    }

    /// Whether an interruption may abandon an in-flight call
    #[must_use]
    pub const fn is_cancellable(self) -> bool {
        !matches!(self, Self::Memory)
    }
}

/// A capability implemented in-process
#[async_trait]
pub trait NativeTool: Send + Sync {
    /// Run the tool with already-validated arguments
    async fn call(&self, arguments: Value) -> std::result::Result<String, ToolFailure>;
}

/// Where a protocol tool lives
#[derive(Clone)]
pub struct ProtocolBinding {
    /// Configured server name
    pub server: String,
    /// Tool name as the server knows it
    pub remote_name: String,
    pub client: Arc<ProtocolClient>,
}

/// How a tool is executed
#[derive(Clone)]
pub enum Capability {
    Native(Arc<dyn NativeTool>),
    Protocol(ProtocolBinding),
}

impl std::fmt::Debug for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Native(_) => f.write_str("Native"),
            Self::Protocol(b) => write!(f, "Protocol({}::{})", b.server, b.remote_name),
        }
    }
}

/// Metadata and dispatch target for one tool
#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    /// Unique name the model calls the tool by
    pub name: String,
    pub description: String,
    /// JSON Schema for the arguments object
    pub input_schema: Value,
    pub capability: Capability,
    pub kind: ToolKind,
    /// Overrides the registry's default timeout
    pub timeout: Option<Duration>,
}

impl ToolDescriptor {
    /// Describe an in-process tool
    pub fn native(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        kind: ToolKind,
        tool: Arc<dyn NativeTool>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
            capability: Capability::Native(tool),
            kind,
            timeout: None,
        }
    }

    /// Override the per-call timeout
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Name-indexed set of tools, populated at startup and read-only afterwards
pub struct ToolRegistry {
    tools: BTreeMap<String, ToolDescriptor>,
    default_timeout: Duration,
}

impl ToolRegistry {
    /// Create an empty registry
    #[must_use]
    pub const fn new(default_timeout: Duration) -> Self {
        Self {
            tools: BTreeMap::new(),
            default_timeout,
        }
    }

    /// Add a tool
    ///
    /// # Errors
    ///
    /// Returns `DuplicateTool` if the name is taken
    pub fn register(&mut self, descriptor: ToolDescriptor) -> Result<()> {
        if self.tools.contains_key(&descriptor.name) {
            return Err(Error::DuplicateTool(descriptor.name));
        }
        tracing::debug!(tool = %descriptor.name, kind = ?descriptor.kind, "registered tool");
        self.tools.insert(descriptor.name.clone(), descriptor);
        Ok(())
    }

    /// Add several tools, stopping at the first duplicate
    ///
    /// # Errors
    ///
    /// Returns `DuplicateTool` if any name is taken
    pub fn register_all(&mut self, descriptors: impl IntoIterator<Item = ToolDescriptor>) -> Result<()> {
        descriptors.into_iter().try_for_each(|d| self.register(d))
    }

    /// Look up a tool by name
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ToolDescriptor> {
        self.tools.get(name)
    }

    /// All tools, sorted by name
    pub fn descriptors(&self) -> impl Iterator<Item = &ToolDescriptor> {
        self.tools.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Check that `name` exists and `arguments` satisfy its schema
    ///
    /// # Errors
    ///
    /// Returns `ToolNotFound` or `SchemaValidation`
    pub fn validate(&self, name: &str, arguments: &Value) -> Result<&ToolDescriptor> {
        let descriptor = self
            .get(name)
            .ok_or_else(|| Error::ToolNotFound(name.to_string()))?;

        schema::validate(&descriptor.input_schema, arguments).map_err(|message| {
            Error::SchemaValidation {
                tool: name.to_string(),
                message,
            }
        })?;

        Ok(descriptor)
    }

    /// Validate and run a tool under its timeout
    ///
    /// # Errors
    ///
    /// Returns `ToolNotFound`, `SchemaValidation`, or `ToolExecution`
    pub async fn invoke(&self, name: &str, arguments: Value) -> Result<String> {
        let descriptor = self.validate(name, &arguments)?;
        let timeout = descriptor.timeout.unwrap_or(self.default_timeout);

        let call = async {
            match &descriptor.capability {
                Capability::Native(tool) => tool.call(arguments).await,
                Capability::Protocol(binding) => {
                    binding.client.call_tool(&binding.remote_name, arguments).await
                }
            }
        };

        let started = std::time::Instant::now();
        let outcome = match tokio::time::timeout(timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(ToolFailure::Timeout(timeout)),
        };

        match outcome {
            Ok(output) => {
                tracing::debug!(
                    tool = %name,
                    elapsed_ms = started.elapsed().as_millis(),
                    "tool succeeded"
                );
                Ok(output)
            }
            Err(failure) => {
                tracing::warn!(tool = %name, error = %failure, "tool failed");
                Err(Error::tool(name, failure))
            }
        }
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.tools.keys().collect::<Vec<_>>())
            .field("default_timeout", &self.default_timeout)
            .finish()
    }
}

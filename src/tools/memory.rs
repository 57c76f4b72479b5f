//! Built-in memory management tools for the LLM

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};

use super::{NativeTool, ToolDescriptor, ToolKind};
use crate::db::{MemoryFact, MemoryStore, normalize_key};
use crate::error::ToolFailure;

/// Which memory operation a tool instance performs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MemoryOp {
    Store,
    Search,
    Forget,
    List,
}

/// One memory tool bound to the store
struct MemoryTool {
    store: MemoryStore,
    op: MemoryOp,
}

#[derive(Deserialize)]
struct StoreArgs {
    key: String,
    value: String,
}

#[derive(Deserialize)]
struct SearchArgs {
    query: String,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Deserialize)]
struct ForgetArgs {
    key: String,
}

fn fact_json(fact: &MemoryFact) -> Value {
    json!({
        "key": fact.key,
        "value": fact.value,
        "updated_at": fact.updated_at.to_rfc3339(),
    })
}

fn parse<T: serde::de::DeserializeOwned>(arguments: Value) -> Result<T, ToolFailure> {
    serde_json::from_value(arguments).map_err(|e| ToolFailure::Failed(format!("invalid arguments: {e}")))
}

fn failed(e: &crate::Error) -> ToolFailure {
    ToolFailure::Failed(e.to_string())
}

/// Same canonical form the remember markers use
fn fact_key(raw: &str) -> Result<String, ToolFailure> {
    let key = normalize_key(raw);
    if key.is_empty() {
        return Err(ToolFailure::Failed(format!("invalid fact key: {raw:?}")));
    }
    Ok(key)
}

#[async_trait]
impl NativeTool for MemoryTool {
    async fn call(&self, arguments: Value) -> Result<String, ToolFailure> {
        match self.op {
            MemoryOp::Store => {
                let args: StoreArgs = parse(arguments)?;
                let key = fact_key(&args.key)?;
                let fact = self.store.put(&key, &args.value, None).map_err(|e| failed(&e))?;
                tracing::info!(key = %fact.key, "memory stored via tool");
                Ok(json!({ "stored": fact.key }).to_string())
            }
            MemoryOp::Search => {
                let args: SearchArgs = parse(arguments)?;
                let limit = args.limit.unwrap_or(5).clamp(1, 50);
                let facts = self.store.search(&args.query, limit).map_err(|e| failed(&e))?;
                Ok(Value::Array(facts.iter().map(fact_json).collect()).to_string())
            }
            MemoryOp::Forget => {
                let args: ForgetArgs = parse(arguments)?;
                let key = fact_key(&args.key)?;
                let removed = self.store.forget(&key).map_err(|e| failed(&e))?;
                Ok(json!({ "forgotten": removed, "key": key }).to_string())
            }
            MemoryOp::List => {
                let facts = self.store.list().map_err(|e| failed(&e))?;
                Ok(Value::Array(facts.iter().map(fact_json).collect()).to_string())
            }
        }
    }
}

/// Descriptors for `memory_store`, `memory_search`, `memory_forget`, `memory_list`
#[must_use]
pub fn memory_tools(store: &MemoryStore) -> Vec<ToolDescriptor> {
    let tool = |op| -> Arc<dyn NativeTool> {
        Arc::new(MemoryTool {
            store: store.clone(),
            op,
        })
    };

    vec![
        ToolDescriptor::native(
            "memory_store",
            "Save a durable fact about the user to long-term memory. Use a short snake_case key, e.g. user_name.",
            json!({
                "type": "object",
                "properties": {
                    "key": { "type": "string", "description": "snake_case fact key" },
                    "value": { "type": "string", "description": "The fact to remember" }
                },
                "required": ["key", "value"],
                "additionalProperties": false
            }),
            ToolKind::Memory,
            tool(MemoryOp::Store),
        ),
        ToolDescriptor::native(
            "memory_search",
            "Search long-term memory for facts relevant to a query.",
            json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string", "description": "Search query" },
                    "limit": { "type": "integer", "description": "Max results (default: 5)" }
                },
                "required": ["query"],
                "additionalProperties": false
            }),
            ToolKind::Memory,
            tool(MemoryOp::Search),
        ),
        ToolDescriptor::native(
            "memory_forget",
            "Delete a fact from long-term memory by key.",
            json!({
                "type": "object",
                "properties": {
                    "key": { "type": "string", "description": "Key of the fact to delete" }
                },
                "required": ["key"],
                "additionalProperties": false
            }),
            ToolKind::Memory,
            tool(MemoryOp::Forget),
        ),
        ToolDescriptor::native(
            "memory_list",
            "List every fact in long-term memory.",
            json!({ "type": "object", "properties": {}, "additionalProperties": false }),
            ToolKind::Memory,
            tool(MemoryOp::List),
        ),
    ]
}

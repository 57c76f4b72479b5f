//! Context protocol tools driven through the orchestrator

use std::sync::Arc;
use std::time::Duration;

use arc_agent::agent::{InvocationStatus, ModelResponse, Role};
use arc_agent::config::AgentConfig;
use arc_agent::mcp::{ChannelTransport, McpManager, ProtocolClient, Transport};
use arc_agent::tools::{ToolKind, ToolRegistry};
use serde_json::{Value, json};

mod common;

use common::{ScriptedProvider, call, orchestrator, setup_test_store};

/// In-process server exposing `lookup` (read-only) and `hang` (never answers)
fn spawn_server(transport: ChannelTransport) {
    tokio::spawn(async move {
        while let Ok(Some(line)) = transport.recv().await {
            let msg: Value = serde_json::from_str(&line).unwrap();
            let Some(id) = msg.get("id").cloned() else { continue };
            let result = match msg["method"].as_str().unwrap_or_default() {
                "initialize" => json!({ "protocolVersion": "2024-11-05", "capabilities": {} }),
                "tools/list" => json!({
                    "tools": [
                        {
                            "name": "lookup",
                            "description": "Look up a word",
                            "inputSchema": {
                                "type": "object",
                                "properties": { "word": { "type": "string" } },
                                "required": ["word"]
                            },
                            "annotations": { "readOnlyHint": true }
                        },
                        { "name": "hang", "inputSchema": { "type": "object" } }
                    ]
                }),
                "tools/call" if msg["params"]["name"] == "hang" => continue,
                "tools/call" => json!({
                    "content": [{
                        "type": "text",
                        "text": format!("{} means hello", msg["params"]["arguments"]["word"].as_str().unwrap_or("?"))
                    }]
                }),
                _ => json!({}),
            };
            let reply = json!({ "jsonrpc": "2.0", "id": id, "result": result });
            if transport.send(reply.to_string()).await.is_err() {
                break;
            }
        }
    });
}

async fn registry_with_server() -> (ToolRegistry, McpManager) {
    let (client_end, server_end) = ChannelTransport::pair();
    spawn_server(server_end);

    let client = ProtocolClient::connect("dict", Arc::new(client_end)).await.unwrap();
    let mut registry = ToolRegistry::new(Duration::from_millis(100));
    let mut manager = McpManager::default();
    let added = manager.attach(client, &mut registry).await.unwrap();
    assert_eq!(added, 2);
    (registry, manager)
}

#[tokio::test]
async fn protocol_tools_register_like_native_ones() {
    let (registry, manager) = registry_with_server().await;

    assert_eq!(manager.servers().collect::<Vec<_>>(), ["dict"]);
    assert_eq!(registry.get("dict__lookup").unwrap().kind, ToolKind::Read);
    assert_eq!(registry.get("dict__hang").unwrap().kind, ToolKind::Mutate);

    let out = registry
        .invoke("dict__lookup", json!({ "word": "hola" }))
        .await
        .unwrap();
    assert_eq!(out, "hola means hello");
}

#[tokio::test]
async fn protocol_results_and_timeouts_reach_the_model() {
    let (registry, _manager) = registry_with_server().await;

    let provider = Arc::new(ScriptedProvider::new([
        ModelResponse::calls(vec![
            call("c1", "dict__lookup", json!({ "word": "hola" })),
            call("c2", "dict__hang", json!({})),
            call("c3", "dict__lookup", json!({})),
        ]),
        ModelResponse::text("Hola means hello."),
    ]));
    let mut agent = orchestrator(provider.clone(), registry, setup_test_store(), AgentConfig::default());

    let reply = agent.process_turn("what does hola mean?").await;
    assert_eq!(reply, "Hola means hello.");

    let requests = provider.requests();
    let tool_turns: Vec<_> = requests[1].turns.iter().filter(|t| t.role == Role::Tool).collect();
    assert_eq!(tool_turns.len(), 3);
    assert_eq!(tool_turns[0].content, "hola means hello");

    let timeout: Value = serde_json::from_str(&tool_turns[1].content).unwrap();
    assert_eq!(timeout["error"], "ToolExecutionError");

    // Missing required argument is caught before the server sees it
    let invalid: Value = serde_json::from_str(&tool_turns[2].content).unwrap();
    assert_eq!(invalid["error"], "SchemaValidationError");

    let statuses: Vec<_> = agent.transcript().invocations().iter().map(|i| i.status).collect();
    assert_eq!(
        statuses,
        [InvocationStatus::Succeeded, InvocationStatus::Failed, InvocationStatus::Failed]
    );
}

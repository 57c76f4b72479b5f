//! JSON-RPC client for one context protocol server
//!
//! A reader task owns the receive side of the transport and routes responses
//! to waiting callers by request id. When the transport goes away every
//! outstanding call fails with a transport error.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::protocol::{
    CallToolResult, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, ListToolsResult,
    McpToolDefinition, PROTOCOL_VERSION,
};
use super::transport::Transport;
use crate::error::ToolFailure;
use crate::tools::{Capability, ProtocolBinding, ToolDescriptor, ToolKind};
use crate::{Error, Result};

type Reply = std::result::Result<Value, ToolFailure>;
type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Reply>>>>;

/// Time bound for handshake and discovery requests
const SETUP_TIMEOUT: Duration = Duration::from_secs(15);

/// Connected client for one server
pub struct ProtocolClient {
    server: String,
    transport: Arc<dyn Transport>,
    next_id: AtomicU64,
    pending: PendingMap,
    closed: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl std::fmt::Debug for ProtocolClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolClient")
            .field("server", &self.server)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Drop for ProtocolClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Removes a pending entry if the caller stops waiting (timeout, cancellation)
struct PendingGuard {
    pending: PendingMap,
    id: u64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&self.id);
        }
    }
}

impl ProtocolClient {
    /// Start the reader task without handshaking
    #[must_use]
    pub fn new(server: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        let server = server.into();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let reader = tokio::spawn(read_loop(
            server.clone(),
            Arc::clone(&transport),
            Arc::clone(&pending),
            Arc::clone(&closed),
        ));

        Self {
            server,
            transport,
            next_id: AtomicU64::new(1),
            pending,
            closed,
            reader,
        }
    }

    /// Start the client and perform the `initialize` handshake
    ///
    /// # Errors
    ///
    /// Returns `Protocol` if the server rejects or never answers the handshake
    pub async fn connect(server: impl Into<String>, transport: Arc<dyn Transport>) -> Result<Arc<Self>> {
        let client = Arc::new(Self::new(server, transport));
        client.initialize().await?;
        Ok(client)
    }

    /// Server name this client was configured under
    #[must_use]
    pub fn server(&self) -> &str {
        &self.server
    }

    /// Whether the transport has gone away
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn initialize(&self) -> Result<()> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION")
            }
        });

        let result = self.setup_request("initialize", Some(params)).await?;
        let server_version = result
            .get("protocolVersion")
            .and_then(Value::as_str)
            .unwrap_or("unknown");

        let notification = JsonRpcNotification::new("notifications/initialized", None);
        self.transport
            .send(serde_json::to_string(&notification)?)
            .await?;

        tracing::info!(server = %self.server, protocol = %server_version, "protocol server initialized");
        Ok(())
    }

    /// Fetch every tool the server exposes, following pagination
    ///
    /// # Errors
    ///
    /// Returns `Protocol` if listing fails
    pub async fn list_tools(&self) -> Result<Vec<McpToolDefinition>> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
            let page: ListToolsResult =
                serde_json::from_value(self.setup_request("tools/list", params).await?)?;
            tools.extend(page.tools);

            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }

        Ok(tools)
    }

    /// Discover tools and describe them for the registry
    ///
    /// Tools are named `{server}__{tool}`. Tools annotated read-only are
    /// classified [`ToolKind::Read`]; everything else is [`ToolKind::Mutate`].
    ///
    /// # Errors
    ///
    /// Returns `Protocol` if listing fails
    pub async fn descriptors(self: &Arc<Self>) -> Result<Vec<ToolDescriptor>> {
        let definitions = self.list_tools().await?;
        tracing::info!(server = %self.server, count = definitions.len(), "discovered protocol tools");

        Ok(definitions
            .into_iter()
            .map(|def| {
                let read_only = def.annotations.as_ref().is_some_and(|a| a.read_only_hint);
                ToolDescriptor {
                    name: qualified_name(&self.server, &def.name),
                    description: def
                        .description
                        .unwrap_or_else(|| format!("{} tool from {}", def.name, self.server)),
                    input_schema: def.input_schema,
                    capability: Capability::Protocol(ProtocolBinding {
                        server: self.server.clone(),
                        remote_name: def.name,
                        client: Arc::clone(self),
                    }),
                    kind: if read_only { ToolKind::Read } else { ToolKind::Mutate },
                    timeout: None,
                }
            })
            .collect())
    }

    /// Forward a `tools/call`
    ///
    /// # Errors
    ///
    /// `Transport` if the connection is lost, `Failed` for JSON-RPC errors and
    /// results flagged `isError`
    pub async fn call_tool(&self, name: &str, arguments: Value) -> std::result::Result<String, ToolFailure> {
        let params = json!({ "name": name, "arguments": arguments });
        let value = self.request("tools/call", Some(params)).await?;
        let result: CallToolResult = serde_json::from_value(value)
            .map_err(|e| ToolFailure::Failed(format!("malformed tools/call result: {e}")))?;

        let text = result.text();
        if result.is_error {
            Err(ToolFailure::Failed(text))
        } else {
            Ok(text)
        }
    }

    async fn setup_request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        match tokio::time::timeout(SETUP_TIMEOUT, self.request(method, params)).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(failure)) => Err(Error::Protocol(format!("{}: {method}: {failure}", self.server))),
            Err(_) => Err(Error::Protocol(format!("{}: {method}: no response", self.server))),
        }
    }

    /// Add a waiter for `id` unless the reader has already shut down
    ///
    /// The reader flags `closed` before draining the table under the same
    /// lock, so a waiter inserted here is either drained or refused.
    fn register(&self, id: u64) -> std::result::Result<oneshot::Receiver<Reply>, ToolFailure> {
        let mut pending = self
            .pending
            .lock()
            .map_err(|_| ToolFailure::Transport("pending table poisoned".to_string()))?;
        if self.is_closed() {
            return Err(ToolFailure::Transport("connection closed".to_string()));
        }

        let (tx, rx) = oneshot::channel();
        pending.insert(id, tx);
        Ok(rx)
    }

    /// Send a request and wait for its response
    async fn request(&self, method: &str, params: Option<Value>) -> Reply {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let rx = self.register(id)?;
        let _guard = PendingGuard {
            pending: Arc::clone(&self.pending),
            id,
        };

        let line = serde_json::to_string(&JsonRpcRequest::new(id, method, params))
            .map_err(|e| ToolFailure::Failed(e.to_string()))?;
        tracing::trace!(server = %self.server, id, method, "protocol request");

        self.transport
            .send(line)
            .await
            .map_err(|e| ToolFailure::Transport(e.to_string()))?;

        rx.await
            .unwrap_or_else(|_| Err(ToolFailure::Transport("connection closed".to_string())))
    }
}

/// Route incoming responses until the transport closes
async fn read_loop(server: String, transport: Arc<dyn Transport>, pending: PendingMap, closed: Arc<AtomicBool>) {
    let reason = loop {
        match transport.recv().await {
            Ok(Some(line)) => {
                let message: JsonRpcMessage = match serde_json::from_str(&line) {
                    Ok(m) => m,
                    Err(e) => {
                        tracing::warn!(server = %server, error = %e, "ignoring malformed message");
                        continue;
                    }
                };

                let Some(id) = message.response_id() else {
                    tracing::debug!(
                        server = %server,
                        method = message.method.as_deref().unwrap_or("?"),
                        "ignoring server-initiated message"
                    );
                    continue;
                };

                let reply = match (message.error, message.result) {
                    (Some(error), _) => Err(ToolFailure::Failed(format!(
                        "{} (code {})",
                        error.message, error.code
                    ))),
                    (None, Some(result)) => Ok(result),
                    (None, None) => Ok(Value::Null),
                };

                let waiter = pending.lock().ok().and_then(|mut p| p.remove(&id));
                match waiter {
                    // Receiver may have given up already; a late reply is dropped
                    Some(tx) => {
                        let _ = tx.send(reply);
                    }
                    None => tracing::debug!(server = %server, id, "response for unknown request"),
                }
            }
            Ok(None) => break "connection closed".to_string(),
            Err(e) => break e.to_string(),
        }
    };

    closed.store(true, Ordering::Release);
    tracing::warn!(server = %server, reason = %reason, "protocol transport lost");

    let waiters: Vec<_> = pending
        .lock()
        .map(|mut p| p.drain().map(|(_, tx)| tx).collect())
        .unwrap_or_default();
    for tx in waiters {
        let _ = tx.send(Err(ToolFailure::Transport(reason.clone())));
    }
}

/// `{server}__{tool}`, restricted to characters model providers accept
#[must_use]
pub fn qualified_name(server: &str, tool: &str) -> String {
    format!("{server}__{tool}")
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::transport::ChannelTransport;

    /// Minimal in-process server answering initialize, tools/list and tools/call
    fn spawn_server(transport: ChannelTransport) {
        tokio::spawn(async move {
            while let Ok(Some(line)) = transport.recv().await {
                let msg: Value = serde_json::from_str(&line).unwrap();
                let Some(id) = msg.get("id").cloned() else { continue };
                let result = match msg["method"].as_str().unwrap() {
                    "initialize" => json!({ "protocolVersion": PROTOCOL_VERSION }),
                    "tools/list" => json!({
                        "tools": [
                            { "name": "status", "inputSchema": { "type": "object" },
                              "annotations": { "readOnlyHint": true } },
                            { "name": "commit", "description": "Make a commit" }
                        ]
                    }),
                    "tools/call" if msg["params"]["name"] == "hang" => continue,
                    "tools/call" => json!({
                        "content": [{ "type": "text", "text": format!("ran {}", msg["params"]["name"]) }]
                    }),
                    _ => json!(null),
                };
                let reply = json!({ "jsonrpc": "2.0", "id": id, "result": result });
                transport.send(reply.to_string()).await.unwrap();
            }
        });
    }

    #[tokio::test]
    async fn discovers_and_calls_tools() {
        let (client_end, server_end) = ChannelTransport::pair();
        spawn_server(server_end);

        let client = ProtocolClient::connect("git", Arc::new(client_end)).await.unwrap();
        let descriptors = client.descriptors().await.unwrap();

        let names: Vec<&str> = descriptors.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["git__status", "git__commit"]);
        assert_eq!(descriptors[0].kind, ToolKind::Read);
        assert_eq!(descriptors[1].kind, ToolKind::Mutate);

        let out = client.call_tool("status", json!({})).await.unwrap();
        assert_eq!(out, "ran \"status\"");
    }

    #[tokio::test]
    async fn peer_hangup_fails_pending_calls() {
        let (client_end, server_end) = ChannelTransport::pair();
        let server_end = Arc::new(server_end);
        let client = Arc::new(ProtocolClient::new("dead", Arc::new(client_end)));

        let call = {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.call_tool("anything", json!({})).await })
        };

        // Consume the request, then hang up
        assert!(server_end.recv().await.unwrap().is_some());
        drop(server_end);

        let failure = call.await.unwrap().unwrap_err();
        assert!(matches!(failure, ToolFailure::Transport(_)));
        assert!(client.is_closed());
    }

    #[tokio::test]
    async fn calls_after_shutdown_fail_fast() {
        let (client_end, server_end) = ChannelTransport::pair();
        let client = ProtocolClient::new("gone", Arc::new(client_end));

        // Reader has flagged the connection closed but not drained yet
        client.closed.store(true, Ordering::Release);

        let outcome = tokio::time::timeout(Duration::from_secs(1), client.call_tool("anything", json!({})))
            .await
            .expect("call should not wait for a reply");
        assert!(matches!(outcome, Err(ToolFailure::Transport(_))));
        assert!(client.pending.lock().unwrap().is_empty());

        // Nothing reached the server
        drop(client);
        assert!(server_end.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn calls_after_peer_hangup_fail_fast() {
        let (client_end, server_end) = ChannelTransport::pair();
        let client = ProtocolClient::new("dead", Arc::new(client_end));
        drop(server_end);

        while !client.is_closed() {
            tokio::task::yield_now().await;
        }

        let failure = client.call_tool("anything", json!({})).await.unwrap_err();
        assert!(matches!(failure, ToolFailure::Transport(_)));
        assert!(client.pending.lock().unwrap().is_empty());
    }

    #[test]
    fn qualified_names_are_sanitized() {
        assert_eq!(qualified_name("git", "status"), "git__status");
        assert_eq!(qualified_name("my server", "do.thing"), "my_server__do_thing");
    }
}

//! Context protocol (MCP) integration
//!
//! External tool servers are started from configuration, handshaken, and
//! their tools registered alongside the native ones.

mod client;
pub mod protocol;
pub mod transport;

use std::sync::Arc;

pub use client::{ProtocolClient, qualified_name};
pub use transport::{ChannelTransport, StdioTransport, Transport};

use crate::Result;
use crate::config::{McpConfig, McpServerConfig};
use crate::tools::ToolRegistry;

/// Owns the connections to every running protocol server
#[derive(Debug, Default)]
pub struct McpManager {
    clients: Vec<Arc<ProtocolClient>>,
}

impl McpManager {
    /// Start every enabled server and register its tools
    ///
    /// Servers that fail to start, handshake, or list tools are logged and
    /// skipped. Tools whose names collide with existing ones are skipped.
    pub async fn start(config: &McpConfig, registry: &mut ToolRegistry) -> Self {
        let mut manager = Self::default();
        if !config.enabled {
            tracing::debug!("context protocol disabled");
            return manager;
        }

        for (name, server) in config.servers.iter().filter(|(_, s)| s.enabled) {
            match start_server(name, server).await {
                Ok(client) => {
                    if let Err(e) = manager.attach(client, registry).await {
                        tracing::warn!(server = %name, error = %e, "tool discovery failed, skipping");
                    }
                }
                Err(e) => {
                    tracing::warn!(server = %name, error = %e, "failed to start protocol server, skipping");
                }
            }
        }

        manager
    }

    /// Discover tools on a connected client and register them
    ///
    /// Returns the number of tools registered.
    ///
    /// # Errors
    ///
    /// Returns error if discovery fails
    pub async fn attach(&mut self, client: Arc<ProtocolClient>, registry: &mut ToolRegistry) -> Result<usize> {
        let mut registered = 0;
        for descriptor in client.descriptors().await? {
            let name = descriptor.name.clone();
            match registry.register(descriptor) {
                Ok(()) => registered += 1,
                Err(e) => tracing::warn!(tool = %name, error = %e, "skipping protocol tool"),
            }
        }

        tracing::info!(server = %client.server(), tools = registered, "protocol server attached");
        self.clients.push(client);
        Ok(registered)
    }

    /// Names of connected servers
    pub fn servers(&self) -> impl Iterator<Item = &str> {
        self.clients.iter().map(|c| c.server())
    }

    /// Number of connected servers
    #[must_use]
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

async fn start_server(name: &str, server: &McpServerConfig) -> Result<Arc<ProtocolClient>> {
    tracing::info!(server = %name, command = %server.command, "starting protocol server");
    let transport = StdioTransport::spawn(&server.command, &server.args, &server.env)?;
    ProtocolClient::connect(name, Arc::new(transport)).await
}

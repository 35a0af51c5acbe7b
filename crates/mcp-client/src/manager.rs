//! Tool-server manager — one connection per configured server, tool
//! discovery at handshake time, and dispatch.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::RwLock;

use mx_domain::config::{McpConfig, McpServerConfig, McpTransportKind};

use crate::protocol::{self, RemoteToolDef, ToolCallOutcome, ToolsListResult};
use crate::transport::{SseTransport, StdioTransport, ToolTransport, TransportError};

#[derive(Debug, thiserror::Error)]
pub enum McpError {
    #[error("tool-server transport: {0}")]
    Transport(#[from] TransportError),

    #[error("tool-server protocol: {0}")]
    Protocol(String),

    #[error("tool server not found: {0}")]
    ServerNotFound(String),

    #[error("tool server is down: {0}")]
    ServerDown(String),
}

impl From<McpError> for mx_domain::error::Error {
    fn from(e: McpError) -> Self {
        mx_domain::error::Error::ToolExecution {
            tool: "remote".into(),
            message: e.to_string(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// McpServer
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One connected tool server and the tools it advertised.
pub struct McpServer {
    pub id: String,
    tools: RwLock<Vec<RemoteToolDef>>,
    transport: Box<dyn ToolTransport>,
}

impl McpServer {
    /// Connect, handshake, and discover tools.
    async fn connect(config: &McpServerConfig) -> Result<Self, McpError> {
        let transport: Box<dyn ToolTransport> = match config.transport {
            McpTransportKind::Stdio => Box::new(StdioTransport::spawn(config)?),
            McpTransportKind::Sse => {
                tracing::warn!(
                    server_id = %config.id,
                    "SSE transport is stubbed; server will be non-functional"
                );
                Box::new(SseTransport)
            }
        };

        let init = transport
            .request("initialize", Some(protocol::initialize_params()))
            .await?;
        init.into_result()
            .map_err(|e| McpError::Protocol(format!("initialize failed: {e}")))?;
        transport.notify("notifications/initialized").await?;

        let server = Self {
            id: config.id.clone(),
            tools: RwLock::new(Vec::new()),
            transport,
        };
        let count = server.refresh_tools().await?;
        tracing::info!(server_id = %config.id, tool_count = count, "tool server connected");
        Ok(server)
    }

    /// Re-run `tools/list` and cache the result. Returns the tool count.
    pub async fn refresh_tools(&self) -> Result<usize, McpError> {
        let resp = self.transport.request("tools/list", None).await?;
        let value = resp
            .into_result()
            .map_err(|e| McpError::Protocol(format!("tools/list failed: {e}")))?;
        let listed: ToolsListResult = serde_json::from_value(value)
            .map_err(|e| McpError::Protocol(format!("bad tools/list payload: {e}")))?;
        let count = listed.tools.len();
        *self.tools.write().await = listed.tools;
        Ok(count)
    }

    pub async fn tools(&self) -> Vec<RemoteToolDef> {
        self.tools.read().await.clone()
    }

    pub fn is_alive(&self) -> bool {
        self.transport.is_alive()
    }

    pub async fn call_tool(
        &self,
        tool_name: &str,
        arguments: Value,
    ) -> Result<ToolCallOutcome, McpError> {
        if !self.transport.is_alive() {
            return Err(McpError::ServerDown(self.id.clone()));
        }

        let params = serde_json::json!({ "name": tool_name, "arguments": arguments });
        let resp = self.transport.request("tools/call", Some(params)).await?;
        let value = resp
            .into_result()
            .map_err(|e| McpError::Protocol(format!("tools/call failed: {e}")))?;
        serde_json::from_value(value)
            .map_err(|e| McpError::Protocol(format!("bad tools/call payload: {e}")))
    }

    async fn shutdown(&self) {
        tracing::info!(server_id = %self.id, "shutting down tool server");
        self.transport.shutdown().await;
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// McpManager
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Holds every configured tool-server connection.
pub struct McpManager {
    servers: HashMap<String, Arc<McpServer>>,
}

impl McpManager {
    /// A manager with no remote servers.
    pub fn empty() -> Self {
        Self {
            servers: HashMap::new(),
        }
    }

    /// Connect every configured server. Failures are logged and skipped —
    /// a dead tool server never blocks session startup.
    pub async fn from_config(config: &McpConfig) -> Self {
        let mut servers = HashMap::new();
        for server_config in &config.servers {
            tracing::info!(
                server_id = %server_config.id,
                command = %server_config.command,
                "connecting tool server"
            );
            match McpServer::connect(server_config).await {
                Ok(server) => {
                    servers.insert(server_config.id.clone(), Arc::new(server));
                }
                Err(e) => {
                    tracing::warn!(
                        server_id = %server_config.id,
                        error = %e,
                        "tool server failed to connect, skipping"
                    );
                }
            }
        }
        Self { servers }
    }

    /// All advertised tools across alive servers as `(server_id, tool)`.
    pub async fn list_tools(&self) -> Vec<(String, RemoteToolDef)> {
        let mut out = Vec::new();
        for server in self.servers.values() {
            if !server.is_alive() {
                continue;
            }
            for tool in server.tools().await {
                out.push((server.id.clone(), tool));
            }
        }
        out
    }

    /// Refresh the tool list on every alive server (the warm-up step
    /// `execute_tool_without_loading` skips).
    pub async fn refresh_all(&self) {
        for server in self.servers.values() {
            if !server.is_alive() {
                continue;
            }
            if let Err(e) = server.refresh_tools().await {
                tracing::warn!(server_id = %server.id, error = %e, "tool refresh failed");
            }
        }
    }

    pub async fn call_tool(
        &self,
        server_id: &str,
        tool_name: &str,
        arguments: Value,
    ) -> Result<ToolCallOutcome, McpError> {
        let server = self
            .servers
            .get(server_id)
            .ok_or_else(|| McpError::ServerNotFound(server_id.to_owned()))?
            .clone();
        server.call_tool(tool_name, arguments).await
    }

    pub fn server_count(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Shut down all servers concurrently.
    pub async fn shutdown(&self) {
        let futs: Vec<_> = self.servers.values().map(|s| s.shutdown()).collect();
        futures_util::future::join_all(futs).await;
    }
}

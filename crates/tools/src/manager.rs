//! The unified tool manager.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde_json::Value;

use mx_domain::config::{ConflictResolution, ToolsConfig};
use mx_domain::error::{Error, Result};
use mx_domain::message::ToolDefinition;
use mx_domain::trace::TraceEvent;
use mx_events::{topics, EventBus};
use mx_mcp_client::McpManager;

use crate::internal::{InternalTool, ToolInvocation};

/// Where a name resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolRoute {
    Internal(String),
    Remote { server_id: String, tool_name: String },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// UnifiedToolManager
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Registry that combines internal and remote tools behind one
/// execution interface.
pub struct UnifiedToolManager {
    internal: RwLock<Vec<Arc<dyn InternalTool>>>,
    remote: Arc<McpManager>,
    config: ToolsConfig,
    bus: Arc<EventBus>,
    /// Whether the remote tool lists have been refreshed this process.
    warmed: AtomicBool,
}

impl UnifiedToolManager {
    pub fn new(remote: Arc<McpManager>, config: ToolsConfig, bus: Arc<EventBus>) -> Self {
        Self {
            internal: RwLock::new(Vec::new()),
            remote,
            config,
            bus,
            warmed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &ToolsConfig {
        &self.config
    }

    // ── Registration ──────────────────────────────────────────────

    /// Register an internal tool. Re-registering a name replaces the
    /// previous implementation.
    pub fn register(&self, tool: Arc<dyn InternalTool>) {
        let mut internal = self.internal.write();
        internal.retain(|t| t.name() != tool.name());
        internal.push(tool);
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.internal.read().iter().any(|t| t.name() == name)
    }

    // ── Listing ───────────────────────────────────────────────────

    /// Agent-accessible tools only: visible internal tools plus remote
    /// tools, with collisions resolved by the configured strategy.
    ///
    /// In aggregator mode the surface narrows to the remote tools (plus
    /// the `ask_matrix` umbrella when registered).
    pub async fn all_tools(&self) -> Vec<ToolDefinition> {
        let aggregator = self.config.server_mode == mx_domain::config::ServerMode::Aggregator;
        let mut defs: Vec<ToolDefinition> = Vec::new();
        let internal_names: Vec<String> = {
            let internal = self.internal.read();
            for tool in internal
                .iter()
                .filter(|t| t.agent_visible())
                .filter(|t| !aggregator || t.name() == "ask_matrix")
            {
                defs.push(ToolDefinition {
                    name: tool.name().to_owned(),
                    description: tool.description().to_owned(),
                    parameters: tool.parameters(),
                });
            }
            internal.iter().map(|t| t.name().to_owned()).collect()
        };

        for (server_id, tool) in self.remote.list_tools().await {
            let collides = internal_names.iter().any(|n| n == &tool.name);
            let name = if collides {
                match self.config.conflict_resolution {
                    ConflictResolution::PrefixInternal => {
                        format!("{server_id}:{}", tool.name)
                    }
                    ConflictResolution::PreferRemote => {
                        // Remote wins the bare name; drop the internal entry.
                        defs.retain(|d| d.name != tool.name);
                        tool.name.clone()
                    }
                    ConflictResolution::FirstWins => {
                        // Internal tools register before servers connect.
                        continue;
                    }
                    ConflictResolution::Error => {
                        tracing::warn!(
                            tool = %tool.name,
                            server_id = %server_id,
                            "tool name collision with strategy=error, remote hidden"
                        );
                        continue;
                    }
                }
            } else {
                tool.name.clone()
            };
            defs.push(ToolDefinition {
                name,
                description: tool.description.clone(),
                parameters: tool.input_schema.clone(),
            });
        }
        defs
    }

    /// Tool list shaped for a provider's wire schema.
    pub async fn tools_for_provider(&self, provider: &str) -> Vec<Value> {
        let defs = self.all_tools().await;
        match provider.to_lowercase().as_str() {
            "anthropic" | "aws" => defs
                .iter()
                .map(|d| {
                    serde_json::json!({
                        "name": d.name,
                        "description": d.description,
                        "input_schema": d.parameters,
                    })
                })
                .collect(),
            // OpenRouter and Qwen accept the OpenAI function schema.
            _ => defs
                .iter()
                .map(|d| {
                    serde_json::json!({
                        "type": "function",
                        "function": {
                            "name": d.name,
                            "description": d.description,
                            "parameters": d.parameters,
                        },
                    })
                })
                .collect(),
        }
    }

    // ── Resolution ────────────────────────────────────────────────

    async fn resolve(&self, name: &str) -> Result<ToolRoute> {
        // Explicit `server:tool` routing bypasses collision handling.
        if let Some((server_id, tool_name)) = name.split_once(':') {
            if !tool_name.is_empty() {
                return Ok(ToolRoute::Remote {
                    server_id: server_id.to_owned(),
                    tool_name: tool_name.to_owned(),
                });
            }
        }

        let has_internal = self.has_tool(name);
        let remote_owner = self
            .remote
            .list_tools()
            .await
            .into_iter()
            .find(|(_, tool)| tool.name == name)
            .map(|(server_id, _)| server_id);

        match (has_internal, remote_owner) {
            (true, None) => Ok(ToolRoute::Internal(name.to_owned())),
            (false, Some(server_id)) => Ok(ToolRoute::Remote {
                server_id,
                tool_name: name.to_owned(),
            }),
            (true, Some(server_id)) => match self.config.conflict_resolution {
                ConflictResolution::PrefixInternal | ConflictResolution::FirstWins => {
                    Ok(ToolRoute::Internal(name.to_owned()))
                }
                ConflictResolution::PreferRemote => Ok(ToolRoute::Remote {
                    server_id,
                    tool_name: name.to_owned(),
                }),
                ConflictResolution::Error => Err(Error::ToolExecution {
                    tool: name.to_owned(),
                    message: format!("name is ambiguous (internal and server {server_id})"),
                }),
            },
            (false, None) => Err(Error::ToolNotFound(name.to_owned())),
        }
    }

    // ── Execution ─────────────────────────────────────────────────

    /// Execute a tool with the full warm-up (remote tool lists refreshed
    /// once per process before first routing).
    pub async fn execute_tool(
        &self,
        name: &str,
        args: Value,
        session_id: Option<&str>,
    ) -> Result<Value> {
        if !self.warmed.swap(true, Ordering::SeqCst) {
            self.remote.refresh_all().await;
        }
        self.execute_resolved(name, args, session_id).await
    }

    /// Execute without the populate-all-tools warm-up. Background memory
    /// jobs use this so each turn skips the enumeration cost.
    pub async fn execute_tool_without_loading(&self, name: &str, args: Value) -> Result<Value> {
        self.execute_resolved(name, args, None).await
    }

    async fn execute_resolved(
        &self,
        name: &str,
        args: Value,
        session_id: Option<&str>,
    ) -> Result<Value> {
        let route = self.resolve(name).await?;
        let timeout = Duration::from_millis(self.config.execution_timeout_ms);
        let started = Instant::now();

        let outcome = tokio::time::timeout(timeout, self.dispatch(&route, args, session_id)).await;

        let duration_ms = started.elapsed().as_millis() as u64;
        let result = match outcome {
            Ok(result) => result,
            Err(_) => Err(Error::ToolTimeout {
                tool: name.to_owned(),
                timeout_ms: self.config.execution_timeout_ms,
            }),
        };

        let source = match &route {
            ToolRoute::Internal(_) => "internal",
            ToolRoute::Remote { .. } => "remote",
        };
        TraceEvent::ToolDispatched {
            tool_name: name.to_owned(),
            source: source.to_owned(),
            duration_ms,
            is_error: result.is_err(),
        }
        .emit();

        let data = serde_json::json!({
            "tool": name,
            "source": source,
            "duration_ms": duration_ms,
        });
        let topic = if result.is_ok() {
            topics::TOOL_EXECUTED
        } else {
            topics::TOOL_FAILED
        };
        match session_id {
            Some(sid) => self.bus.emit_session(sid, topic, data),
            None => self.bus.emit_service(topic, data),
        }

        result
    }

    async fn dispatch(
        &self,
        route: &ToolRoute,
        args: Value,
        session_id: Option<&str>,
    ) -> Result<Value> {
        match route {
            ToolRoute::Internal(name) => {
                let tool = {
                    let internal = self.internal.read();
                    internal
                        .iter()
                        .find(|t| t.name() == name.as_str())
                        .cloned()
                };
                let tool = tool.ok_or_else(|| Error::ToolNotFound(name.clone()))?;
                let ctx = ToolInvocation {
                    session_id: session_id.map(str::to_owned),
                };
                tool.execute(args, &ctx).await
            }
            ToolRoute::Remote {
                server_id,
                tool_name,
            } => {
                let outcome = self
                    .remote
                    .call_tool(server_id, tool_name, args)
                    .await
                    .map_err(mx_domain::error::Error::from)?;
                if outcome.is_error {
                    return Err(Error::ToolExecution {
                        tool: tool_name.clone(),
                        message: outcome.content,
                    });
                }
                Ok(Value::String(outcome.content))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoTool {
        name: &'static str,
        visible: bool,
    }

    #[async_trait::async_trait]
    impl InternalTool for EchoTool {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "echoes its arguments"
        }
        fn agent_visible(&self) -> bool {
            self.visible
        }
        async fn execute(&self, args: Value, ctx: &ToolInvocation) -> Result<Value> {
            Ok(serde_json::json!({
                "echo": args,
                "session": ctx.session_id,
            }))
        }
    }

    struct SleepyTool;

    #[async_trait::async_trait]
    impl InternalTool for SleepyTool {
        fn name(&self) -> &str {
            "sleepy"
        }
        fn description(&self) -> &str {
            "never finishes in time"
        }
        async fn execute(&self, _args: Value, _ctx: &ToolInvocation) -> Result<Value> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Value::Null)
        }
    }

    fn manager_with(config: ToolsConfig) -> UnifiedToolManager {
        UnifiedToolManager::new(
            Arc::new(McpManager::empty()),
            config,
            Arc::new(EventBus::new()),
        )
    }

    #[tokio::test]
    async fn executes_internal_tool_with_session_context() {
        let manager = manager_with(ToolsConfig::default());
        manager.register(Arc::new(EchoTool {
            name: "echo",
            visible: true,
        }));

        let out = manager
            .execute_tool("echo", serde_json::json!({"x": 1}), Some("s1"))
            .await
            .unwrap();
        assert_eq!(out["echo"]["x"], 1);
        assert_eq!(out["session"], "s1");
    }

    #[tokio::test]
    async fn unknown_tool_is_an_error() {
        let manager = manager_with(ToolsConfig::default());
        let err = manager
            .execute_tool("nope", Value::Null, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ToolNotFound(_)));
    }

    #[tokio::test]
    async fn timeout_raises_tool_timeout() {
        let config = ToolsConfig {
            execution_timeout_ms: 20,
            ..ToolsConfig::default()
        };
        let manager = manager_with(config);
        manager.register(Arc::new(SleepyTool));

        let err = manager
            .execute_tool("sleepy", Value::Null, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ToolTimeout { .. }));
    }

    #[tokio::test]
    async fn hidden_tools_are_callable_but_not_listed() {
        let manager = manager_with(ToolsConfig::default());
        manager.register(Arc::new(EchoTool {
            name: "background_only",
            visible: false,
        }));

        assert!(manager.all_tools().await.is_empty());
        assert!(manager
            .execute_tool_without_loading("background_only", Value::Null)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn provider_shapes_differ() {
        let manager = manager_with(ToolsConfig::default());
        manager.register(Arc::new(EchoTool {
            name: "echo",
            visible: true,
        }));

        let openai = manager.tools_for_provider("openai").await;
        assert_eq!(openai[0]["type"], "function");
        assert_eq!(openai[0]["function"]["name"], "echo");

        let anthropic = manager.tools_for_provider("anthropic").await;
        assert_eq!(anthropic[0]["name"], "echo");
        assert!(anthropic[0].get("input_schema").is_some());

        let openrouter = manager.tools_for_provider("openrouter").await;
        assert_eq!(openrouter[0]["type"], "function");
    }

    #[tokio::test]
    async fn aggregator_mode_hides_builtin_tools() {
        let config = ToolsConfig {
            server_mode: mx_domain::config::ServerMode::Aggregator,
            ..ToolsConfig::default()
        };
        let manager = manager_with(config);
        manager.register(Arc::new(EchoTool {
            name: "echo",
            visible: true,
        }));
        manager.register(Arc::new(EchoTool {
            name: "ask_matrix",
            visible: true,
        }));

        let defs = manager.all_tools().await;
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].name, "ask_matrix");

        // Hidden from the surface, still executable by name.
        assert!(manager
            .execute_tool_without_loading("echo", Value::Null)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn reregistering_replaces_previous_tool() {
        let manager = manager_with(ToolsConfig::default());
        manager.register(Arc::new(EchoTool {
            name: "echo",
            visible: true,
        }));
        manager.register(Arc::new(EchoTool {
            name: "echo",
            visible: false,
        }));
        assert!(manager.all_tools().await.is_empty());
        assert!(manager.has_tool("echo"));
    }
}

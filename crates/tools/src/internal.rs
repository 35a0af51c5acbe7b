//! The internal tool interface.

use serde_json::Value;

use mx_domain::error::Result;

/// Context handed to a tool execution.
#[derive(Debug, Clone, Default)]
pub struct ToolInvocation {
    /// Session on whose behalf the tool runs, when known.
    pub session_id: Option<String>,
}

impl ToolInvocation {
    pub fn for_session(session_id: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
        }
    }
}

/// A tool implemented inside the process.
///
/// Tools that exist purely for background pipelines set
/// `agent_visible = false`; they stay callable by name but never appear
/// in the tool list handed to the LLM.
#[async_trait::async_trait]
pub trait InternalTool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON Schema for the tool's arguments.
    fn parameters(&self) -> Value {
        serde_json::json!({ "type": "object", "properties": {} })
    }

    fn agent_visible(&self) -> bool {
        true
    }

    async fn execute(&self, args: Value, ctx: &ToolInvocation) -> Result<Value>;
}

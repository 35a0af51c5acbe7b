//! The umbrella `ask_matrix` tool.
//!
//! When enabled, remote callers (and the model itself) can route a
//! question through a full Matrix session — memory pipelines included —
//! as a single tool call.

use std::sync::{Arc, Weak};

use serde_json::{json, Value};

use mx_domain::config::LlmConfig;
use mx_domain::error::{Error, Result};
use mx_tools::{InternalTool, ToolInvocation};

use crate::services::SharedServices;
use crate::session::{Session, SessionOptions};

pub const ASK_MATRIX_TOOL: &str = "ask_matrix";

struct AskMatrixTool {
    // Weak: the services own the tool manager that owns this tool.
    services: Weak<SharedServices>,
    llm: LlmConfig,
}

#[async_trait::async_trait]
impl InternalTool for AskMatrixTool {
    fn name(&self) -> &str {
        ASK_MATRIX_TOOL
    }

    fn description(&self) -> &str {
        "Ask the Matrix agent a question in a dedicated session and return its answer."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "input": { "type": "string", "description": "The question or instruction" },
                "session_id": { "type": "string", "description": "Session to continue (optional)" }
            },
            "required": ["input"]
        })
    }

    async fn execute(&self, args: Value, _ctx: &ToolInvocation) -> Result<Value> {
        let services = self.services.upgrade().ok_or_else(|| Error::ToolExecution {
            tool: ASK_MATRIX_TOOL.into(),
            message: "runtime is shutting down".into(),
        })?;

        let input = args
            .get("input")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::ToolExecution {
                tool: ASK_MATRIX_TOOL.into(),
                message: "missing required argument: input".into(),
            })?;
        let session_id = args
            .get("session_id")
            .and_then(|v| v.as_str())
            .map(str::to_owned)
            .unwrap_or_else(|| format!("ask-{}", uuid::Uuid::new_v4()));

        let session = Session::new(
            services,
            SessionOptions {
                id: Some(session_id.clone()),
                llm: self.llm.clone(),
                ..SessionOptions::default()
            },
        );
        session.init().await?;
        let output = session.run(input, None, None).await?;
        // The memory job keeps running on its own; this call only needs
        // the answer.
        drop(output.background);

        Ok(json!({ "sessionId": session_id, "response": output.response }))
    }
}

/// Register `ask_matrix` when `USE_ASK_MATRIX` (or config) enables it.
pub fn register_ask_matrix(services: &Arc<SharedServices>, llm: LlmConfig) {
    if !services.config.tools.use_ask_matrix {
        return;
    }
    services.tools.register(Arc::new(AskMatrixTool {
        services: Arc::downgrade(services),
        llm,
    }));
    tracing::info!("ask_matrix tool registered");
}

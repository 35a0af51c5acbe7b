//! The per-session LLM service — the tool-calling loop.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use mx_context::{formatter_for, ContextManager};
use mx_domain::config::LlmConfig;
use mx_domain::error::{Error, Result};
use mx_domain::message::Message;
use mx_domain::trace::TraceEvent;
use mx_events::{topics, EventBus};
use mx_tools::UnifiedToolManager;

use crate::backend::{ChatBackend, ProviderRequest, ProviderResponse, TextCompletion, ToolChoice};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LlmService
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Drives one session's conversations against a [`ChatBackend`].
///
/// `generate` appends to the transcript, loops over tool calls up to
/// `max_iterations`, and emits `llm:*` events on the bus. Transport
/// failures retry with a linear backoff; from the second attempt on, the
/// request drops its tools and forbids tool choice so a flapping provider
/// cannot trap the loop.
pub struct LlmService {
    session_id: String,
    backend: Arc<dyn ChatBackend>,
    context: Arc<ContextManager>,
    tools: Arc<UnifiedToolManager>,
    bus: Arc<EventBus>,
    config: LlmConfig,
}

impl LlmService {
    pub fn new(
        session_id: impl Into<String>,
        backend: Arc<dyn ChatBackend>,
        context: Arc<ContextManager>,
        tools: Arc<UnifiedToolManager>,
        bus: Arc<EventBus>,
        config: LlmConfig,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            backend,
            context,
            tools,
            bus,
            config,
        }
    }

    pub fn config(&self) -> &LlmConfig {
        &self.config
    }

    // ── The tool-calling loop ──────────────────────────────────────

    pub async fn generate(&self, input: &str, image: Option<(&str, &str)>) -> Result<String> {
        self.context.add_user_message(input, image).await?;

        let message_id = uuid::Uuid::new_v4().to_string();
        self.bus.emit_session(
            &self.session_id,
            topics::LLM_RESPONSE_STARTED,
            json!({ "messageId": message_id }),
        );

        let tool_schemas = self.tools.tools_for_provider(&self.config.provider).await;
        let mut total_tool_calls = 0usize;

        for iteration in 0..self.config.max_iterations {
            tracing::debug!(
                session_id = %self.session_id,
                iteration,
                "tool loop iteration"
            );

            let convo = self.context.formatted_messages();
            let req = ProviderRequest {
                model: self.config.model.clone(),
                system: convo.system,
                messages: convo.messages,
                tools: tool_schemas.clone(),
                tool_choice: ToolChoice::Auto,
                temperature: self.config.temperature,
                max_tokens: self.config.max_tokens,
            };

            let resp = self.call_with_retry(req).await?;

            if let Some(thinking) = &resp.thinking {
                self.emit_thinking(thinking);
            }

            if resp.tool_calls.is_empty() {
                self.context
                    .add_assistant_message(&resp.content, Vec::new())
                    .await?;
                self.bus.emit_session(
                    &self.session_id,
                    topics::LLM_RESPONSE_COMPLETED,
                    json!({ "messageId": message_id, "length": resp.content.len() }),
                );
                TraceEvent::TurnCompleted {
                    session_id: self.session_id.clone(),
                    iterations: iteration + 1,
                    tool_calls: total_tool_calls,
                }
                .emit();
                return Ok(resp.content);
            }

            // Content that precedes tool calls is the model reasoning
            // about what to do next.
            if !resp.content.is_empty() {
                tracing::debug!(
                    session_id = %self.session_id,
                    text = %resp.content,
                    "assistant thinking before tool calls"
                );
                self.emit_thinking(&resp.content);
            }

            total_tool_calls += resp.tool_calls.len();
            self.context
                .add_assistant_message(&resp.content, resp.tool_calls.clone())
                .await?;
            self.run_tool_calls(&resp).await?;
        }

        self.bus.emit_session(
            &self.session_id,
            topics::LLM_RESPONSE_ERROR,
            json!({ "messageId": message_id, "reason": "iteration limit" }),
        );
        Err(Error::IterationLimitExceeded(self.config.max_iterations))
    }

    /// Execute each requested tool and append its result. Argument-parse
    /// failures and execution errors become error tool-result messages so
    /// the model can react; they never abort the loop.
    async fn run_tool_calls(&self, resp: &ProviderResponse) -> Result<()> {
        for tc in &resp.tool_calls {
            let args: serde_json::Value = match serde_json::from_str(&tc.arguments) {
                Ok(v) => v,
                Err(e) => {
                    let payload = json!({ "error": format!("invalid tool arguments: {e}") });
                    self.context
                        .add_tool_result(&tc.id, &tc.name, &payload.to_string())
                        .await?;
                    continue;
                }
            };

            let payload = match self
                .tools
                .execute_tool(&tc.name, args, Some(&self.session_id))
                .await
            {
                Ok(result) => result.to_string(),
                Err(e) => {
                    tracing::warn!(
                        session_id = %self.session_id,
                        tool = %tc.name,
                        error = %e,
                        "tool execution failed"
                    );
                    json!({ "error": e.to_string() }).to_string()
                }
            };
            self.context
                .add_tool_result(&tc.id, &tc.name, &payload)
                .await?;
        }
        Ok(())
    }

    fn emit_thinking(&self, text: &str) {
        self.bus.emit_session(
            &self.session_id,
            topics::LLM_THINKING,
            json!({ "content": text }),
        );
    }

    // ── Retry ──────────────────────────────────────────────────────

    async fn call_with_retry(&self, mut req: ProviderRequest) -> Result<ProviderResponse> {
        let attempts = self.config.max_retries.max(1);
        let mut last_err = None;

        for attempt in 1..=attempts {
            // Break pathological loops: later attempts go out without
            // tools and with tool choice forced off.
            if attempt >= 2 {
                req.tools.clear();
                req.tool_choice = ToolChoice::None;
            }

            match self.backend.chat(&req).await {
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    tracing::warn!(
                        session_id = %self.session_id,
                        attempt,
                        error = %e,
                        "provider call failed"
                    );
                    last_err = Some(e);
                    if attempt < attempts {
                        let backoff = self.config.retry_backoff_ms * attempt as u64;
                        tokio::time::sleep(Duration::from_millis(backoff)).await;
                    }
                }
            }
        }

        self.bus.emit_session(
            &self.session_id,
            topics::LLM_RESPONSE_ERROR,
            json!({ "reason": "transport" }),
        );
        Err(last_err.unwrap_or_else(|| Error::ProviderTransport {
            provider: self.config.provider.clone(),
            message: "retry budget exhausted".into(),
        }))
    }

    // ── Direct generation ──────────────────────────────────────────

    /// One-shot completion that bypasses the context manager and carries
    /// no tools. Reserved for internal subsystems (memory decision LLM,
    /// reasoning evaluation).
    pub async fn direct_generate(&self, prompt: &str, system: Option<&str>) -> Result<String> {
        let formatter = formatter_for(&self.config.provider)?;
        let convo = formatter.format(system, &[Message::user(prompt)]);
        let req = ProviderRequest {
            model: self.config.model.clone(),
            system: convo.system,
            messages: convo.messages,
            tools: Vec::new(),
            tool_choice: ToolChoice::None,
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        };
        let resp = self.call_with_retry(req).await?;
        Ok(resp.content)
    }
}

#[async_trait::async_trait]
impl TextCompletion for LlmService {
    async fn complete(&self, prompt: &str, system: Option<&str>) -> Result<String> {
        self.direct_generate(prompt, system).await
    }
}

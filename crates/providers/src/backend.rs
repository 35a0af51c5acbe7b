use std::sync::Arc;

use serde_json::Value;

use mx_domain::config::LlmConfig;
use mx_domain::error::Result;
use mx_domain::message::ToolCall;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request / Response types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ToolChoice {
    #[default]
    Auto,
    /// Forbid tool calls (set on retry attempts to break pathological loops).
    None,
}

/// A fully shaped provider request. `messages` (and for the Anthropic
/// family `system`) come from the context manager's formatter; `tools`
/// from the unified tool manager's provider shaping.
#[derive(Debug, Clone, Default)]
pub struct ProviderRequest {
    pub model: String,
    pub system: Option<String>,
    pub messages: Vec<Value>,
    pub tools: Vec<Value>,
    pub tool_choice: ToolChoice,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

/// A provider-agnostic response.
#[derive(Debug, Clone, Default)]
pub struct ProviderResponse {
    /// Textual content (may precede tool calls).
    pub content: String,
    /// Thinking text surfaced by Anthropic-family models.
    pub thinking: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Traits
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Wire adapter for one provider endpoint.
#[async_trait::async_trait]
pub trait ChatBackend: Send + Sync {
    fn backend_id(&self) -> &str;

    async fn chat(&self, req: &ProviderRequest) -> Result<ProviderResponse>;
}

/// Plain prompt-in, text-out completion — the seam the memory decision
/// engine and the reasoning evaluator consume.
#[async_trait::async_trait]
pub trait TextCompletion: Send + Sync {
    async fn complete(&self, prompt: &str, system: Option<&str>) -> Result<String>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Backend construction
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Build the wire adapter for the configured provider.
pub fn backend_for(config: &LlmConfig) -> Result<Arc<dyn ChatBackend>> {
    match config.provider.to_lowercase().as_str() {
        "anthropic" | "aws" => Ok(Arc::new(
            crate::anthropic::AnthropicBackend::from_config(config)?,
        )),
        "azure" => Ok(Arc::new(crate::openai_compat::OpenAiCompatBackend::azure(
            config,
        )?)),
        "openai" | "openrouter" | "ollama" | "lmstudio" | "qwen" | "gemini" => Ok(Arc::new(
            crate::openai_compat::OpenAiCompatBackend::from_config(config)?,
        )),
        other => Err(mx_domain::error::Error::UnsupportedProvider(
            other.to_string(),
        )),
    }
}

/// Default endpoint for each OpenAI-compatible provider.
pub(crate) fn default_base_url(provider: &str) -> &'static str {
    match provider {
        "openrouter" => "https://openrouter.ai/api/v1",
        "ollama" => "http://localhost:11434/v1",
        "lmstudio" => "http://localhost:1234/v1",
        "qwen" => "https://dashscope.aliyuncs.com/compatible-mode/v1",
        "gemini" => "https://generativelanguage.googleapis.com/v1beta/openai",
        _ => "https://api.openai.com/v1",
    }
}

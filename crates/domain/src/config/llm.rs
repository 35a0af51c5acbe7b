use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LLM provider settings
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Configuration snapshot a session holds for its LLM backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Provider name, matched case-insensitively against the formatter
    /// families (`openai`, `openrouter`, `ollama`, `lmstudio`, `qwen`,
    /// `gemini`, `azure`, `anthropic`, `aws`).
    #[serde(default = "d_provider")]
    pub provider: String,
    #[serde(default = "d_model")]
    pub model: String,
    /// API key or a placeholder resolved by the deployment.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Base URL override for self-hosted or proxy endpoints.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Maximum tool-calling iterations per turn.
    #[serde(default = "d_5")]
    pub max_iterations: usize,
    /// Transport retry attempts per LLM call.
    #[serde(default = "d_3")]
    pub max_retries: u32,
    /// Linear backoff unit between retries (attempt × this value).
    #[serde(default = "d_500")]
    pub retry_backoff_ms: u64,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: d_provider(),
            model: d_model(),
            api_key: None,
            base_url: None,
            max_iterations: 5,
            max_retries: 3,
            retry_backoff_ms: 500,
            temperature: None,
            max_tokens: None,
        }
    }
}

/// Settings for the reasoning-trace evaluator — typically a smaller,
/// non-thinking model distinct from the conversational one.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EvaluationConfig {
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
}

impl EvaluationConfig {
    /// Resolve the evaluator's LLM config, filling gaps from the primary.
    pub fn resolve(&self, primary: &LlmConfig) -> LlmConfig {
        LlmConfig {
            provider: self
                .provider
                .clone()
                .unwrap_or_else(|| primary.provider.clone()),
            model: self.model.clone().unwrap_or_else(|| primary.model.clone()),
            api_key: self.api_key.clone().or_else(|| primary.api_key.clone()),
            base_url: self.base_url.clone().or_else(|| primary.base_url.clone()),
            ..primary.clone()
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_provider() -> String {
    "openai".into()
}
fn d_model() -> String {
    "gpt-4o".into()
}
fn d_5() -> usize {
    5
}
fn d_3() -> u32 {
    3
}
fn d_500() -> u64 {
    500
}

//! Anthropic-family adapter (Anthropic API and Bedrock-compatible
//! endpoints).
//!
//! The Messages API carries structured content arrays; system text rides
//! in a separate top-level field. Thinking blocks come back as content
//! and are surfaced on the response for the service to log and emit.

use serde_json::Value;

use mx_domain::config::LlmConfig;
use mx_domain::error::{Error, Result};
use mx_domain::message::ToolCall;

use crate::backend::{ChatBackend, ProviderRequest, ProviderResponse, ToolChoice};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const DEFAULT_MAX_TOKENS: u32 = 4096;

pub struct AnthropicBackend {
    id: String,
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl AnthropicBackend {
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let provider = config.provider.to_lowercase();
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .map_err(|e| Error::ProviderTransport {
                provider: provider.clone(),
                message: e.to_string(),
            })?;
        Ok(Self {
            id: provider,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_owned())
                .trim_end_matches('/')
                .to_owned(),
            api_key: config.api_key.clone(),
            client,
        })
    }

    fn authed_post(&self, url: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .post(url)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json");
        if let Some(key) = &self.api_key {
            builder = builder.header("x-api-key", key);
        }
        builder
    }

    fn build_body(&self, req: &ProviderRequest) -> Value {
        let mut body = serde_json::json!({
            "model": req.model,
            "messages": req.messages,
            "max_tokens": req.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        });
        if let Some(system) = &req.system {
            body["system"] = Value::String(system.clone());
        }
        // The Messages API has no "none" tool choice; omitting the tool
        // list altogether forces a text answer.
        if !req.tools.is_empty() && req.tool_choice != ToolChoice::None {
            body["tools"] = Value::Array(req.tools.clone());
        }
        if let Some(temp) = req.temperature {
            body["temperature"] = serde_json::json!(temp);
        }
        body
    }

    fn transport_err(&self, message: impl std::fmt::Display) -> Error {
        Error::ProviderTransport {
            provider: self.id.clone(),
            message: message.to_string(),
        }
    }
}

#[async_trait::async_trait]
impl ChatBackend for AnthropicBackend {
    fn backend_id(&self) -> &str {
        &self.id
    }

    async fn chat(&self, req: &ProviderRequest) -> Result<ProviderResponse> {
        let url = format!("{}/v1/messages", self.base_url);
        let body = self.build_body(req);
        tracing::debug!(provider = %self.id, url = %url, "messages request");

        let resp = self
            .authed_post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.transport_err(e))?;

        let status = resp.status();
        let text = resp.text().await.map_err(|e| self.transport_err(e))?;
        if !status.is_success() {
            return Err(self.transport_err(format!("HTTP {} - {text}", status.as_u16())));
        }

        let json: Value = serde_json::from_str(&text)?;
        parse_messages_response(&json)
    }
}

fn parse_messages_response(body: &Value) -> Result<ProviderResponse> {
    let empty = Vec::new();
    let blocks = body
        .get("content")
        .and_then(|v| v.as_array())
        .unwrap_or(&empty);

    let mut text_parts: Vec<&str> = Vec::new();
    let mut thinking_parts: Vec<&str> = Vec::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();

    for block in blocks {
        match block.get("type").and_then(|v| v.as_str()).unwrap_or("") {
            "text" => {
                if let Some(t) = block.get("text").and_then(|v| v.as_str()) {
                    text_parts.push(t);
                }
            }
            "thinking" => {
                if let Some(t) = block.get("thinking").and_then(|v| v.as_str()) {
                    thinking_parts.push(t);
                }
            }
            "tool_use" => {
                let arguments = block
                    .get("input")
                    .cloned()
                    .unwrap_or(Value::Object(Default::default()))
                    .to_string();
                tool_calls.push(ToolCall {
                    id: block
                        .get("id")
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_owned(),
                    name: block
                        .get("name")
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_owned(),
                    arguments,
                });
            }
            _ => {}
        }
    }

    let finish_reason = body
        .get("stop_reason")
        .and_then(|v| v.as_str())
        .map(|s| match s {
            "end_turn" => "stop".to_owned(),
            "tool_use" => "tool_calls".to_owned(),
            other => other.to_owned(),
        });

    Ok(ProviderResponse {
        content: text_parts.join(""),
        thinking: if thinking_parts.is_empty() {
            None
        } else {
            Some(thinking_parts.join("\n"))
        },
        tool_calls,
        finish_reason,
    })
}

//! OpenAI-compatible adapter.
//!
//! Works with OpenAI, OpenRouter, Ollama, LM Studio, Qwen, Gemini's
//! OpenAI endpoint, and Azure OpenAI. Azure shares the wire format but
//! uses a deployment-scoped URL and the `api-key` header, and omits
//! `model` from the body.

use serde_json::Value;

use mx_domain::config::LlmConfig;
use mx_domain::error::{Error, Result};
use mx_domain::message::ToolCall;

use crate::backend::{
    default_base_url, ChatBackend, ProviderRequest, ProviderResponse, ToolChoice,
};

const AZURE_API_VERSION: &str = "2024-10-21";

pub struct OpenAiCompatBackend {
    id: String,
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
    is_azure: bool,
}

impl OpenAiCompatBackend {
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        Self::build(config, false)
    }

    pub fn azure(config: &LlmConfig) -> Result<Self> {
        Self::build(config, true)
    }

    fn build(config: &LlmConfig, is_azure: bool) -> Result<Self> {
        let provider = config.provider.to_lowercase();
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| default_base_url(&provider).to_owned());
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .map_err(|e| Error::ProviderTransport {
                provider: provider.clone(),
                message: e.to_string(),
            })?;

        Ok(Self {
            id: provider,
            base_url: base_url.trim_end_matches('/').to_owned(),
            api_key: config.api_key.clone(),
            client,
            is_azure,
        })
    }

    fn chat_url(&self, model: &str) -> String {
        if self.is_azure {
            format!(
                "{}/openai/deployments/{model}/chat/completions?api-version={AZURE_API_VERSION}",
                self.base_url
            )
        } else {
            format!("{}/chat/completions", self.base_url)
        }
    }

    fn authed_post(&self, url: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .post(url)
            .header("Content-Type", "application/json");
        if let Some(key) = &self.api_key {
            builder = if self.is_azure {
                builder.header("api-key", key)
            } else {
                builder.header("Authorization", format!("Bearer {key}"))
            };
        }
        builder
    }

    fn build_body(&self, req: &ProviderRequest) -> Value {
        let mut body = serde_json::json!({
            "messages": req.messages,
        });
        // Azure embeds the deployment name in the URL.
        if !self.is_azure {
            body["model"] = Value::String(req.model.clone());
        }
        if !req.tools.is_empty() {
            body["tools"] = Value::Array(req.tools.clone());
        }
        if req.tool_choice == ToolChoice::None {
            body["tool_choice"] = Value::String("none".into());
        }
        if let Some(temp) = req.temperature {
            body["temperature"] = serde_json::json!(temp);
        }
        if let Some(max) = req.max_tokens {
            body["max_tokens"] = serde_json::json!(max);
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
impl ChatBackend for OpenAiCompatBackend {
    fn backend_id(&self) -> &str {
        &self.id
    }

    async fn chat(&self, req: &ProviderRequest) -> Result<ProviderResponse> {
        let url = self.chat_url(&req.model);
        let body = self.build_body(req);
        tracing::debug!(provider = %self.id, url = %url, "chat request");

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
        parse_chat_response(&json)
    }
}

fn parse_chat_response(body: &Value) -> Result<ProviderResponse> {
    let message = body
        .pointer("/choices/0/message")
        .ok_or_else(|| Error::Other("malformed chat completion: no choices".into()))?;

    let content = message
        .get("content")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_owned();

    let tool_calls = message
        .get("tool_calls")
        .and_then(|v| v.as_array())
        .map(|calls| {
            calls
                .iter()
                .map(|call| ToolCall {
                    id: call
                        .get("id")
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_owned(),
                    name: call
                        .pointer("/function/name")
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_owned(),
                    arguments: call
                        .pointer("/function/arguments")
                        .and_then(|v| v.as_str())
                        .unwrap_or("{}")
                        .to_owned(),
                })
                .collect()
        })
        .unwrap_or_default();

    let finish_reason = body
        .pointer("/choices/0/finish_reason")
        .and_then(|v| v.as_str())
        .map(str::to_owned);

    Ok(ProviderResponse {
        content,
        thinking: None,
        tool_calls,
        finish_reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_text_response() {
        let body = serde_json::json!({
            "choices": [{
                "message": {"role": "assistant", "content": "hello"},
                "finish_reason": "stop"
            }]
        });
        let resp = parse_chat_response(&body).unwrap();
        assert_eq!(resp.content, "hello");
        assert!(resp.tool_calls.is_empty());
        assert_eq!(resp.finish_reason.as_deref(), Some("stop"));
    }

    #[test]
    fn parses_tool_calls_with_string_arguments() {
        let body = serde_json::json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {"name": "search", "arguments": "{\"q\":\"rust\"}"}
                    }]
                },
                "finish_reason": "tool_calls"
            }]
        });
        let resp = parse_chat_response(&body).unwrap();
        assert_eq!(resp.tool_calls.len(), 1);
        assert_eq!(resp.tool_calls[0].name, "search");
        assert_eq!(resp.tool_calls[0].arguments, "{\"q\":\"rust\"}");
    }

    #[test]
    fn missing_choices_is_an_error() {
        let body = serde_json::json!({"error": {"message": "rate limited"}});
        assert!(parse_chat_response(&body).is_err());
    }

    #[test]
    fn azure_url_embeds_deployment() {
        let config = LlmConfig {
            provider: "azure".into(),
            base_url: Some("https://example.openai.azure.com".into()),
            ..LlmConfig::default()
        };
        let backend = OpenAiCompatBackend::azure(&config).unwrap();
        let url = backend.chat_url("gpt-4o");
        assert!(url.contains("/openai/deployments/gpt-4o/chat/completions"));
        assert!(url.contains("api-version="));
    }

    #[test]
    fn tool_choice_none_is_written_to_body() {
        let config = LlmConfig::default();
        let backend = OpenAiCompatBackend::from_config(&config).unwrap();
        let req = ProviderRequest {
            model: "gpt-4o".into(),
            tool_choice: ToolChoice::None,
            ..ProviderRequest::default()
        };
        let body = backend.build_body(&req);
        assert_eq!(body["tool_choice"], "none");
        assert!(body.get("tools").is_none());
    }
}

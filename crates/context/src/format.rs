//! Per-provider message shaping.
//!
//! The OpenAI family concatenates text and uses `tool_calls`; Azure shares
//! that wire shape (only the HTTP layer differs); the Anthropic family
//! carries structured content arrays with text/thinking blocks and moves
//! the system prompt into a separate top-level field. The formatter owns
//! every one of those differences — the LLM service never inspects blocks.

use serde_json::{json, Value};

use mx_domain::error::{Error, Result};
use mx_domain::message::{ContentPart, Message, MessageContent, Role};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderFamily {
    OpenAi,
    Azure,
    Anthropic,
}

/// A provider-ready conversation: shaped messages plus, for the Anthropic
/// family, the system text that goes in the request's top-level field.
#[derive(Debug, Clone)]
pub struct FormattedConversation {
    pub system: Option<String>,
    pub messages: Vec<Value>,
}

pub trait MessageFormatter: std::fmt::Debug + Send + Sync {
    fn family(&self) -> ProviderFamily;
    fn format(&self, system_prompt: Option<&str>, messages: &[Message]) -> FormattedConversation;
}

/// Resolve the formatter for a provider string (lowercased match).
pub fn formatter_for(provider: &str) -> Result<Box<dyn MessageFormatter>> {
    match provider.to_lowercase().as_str() {
        "openai" | "openrouter" | "ollama" | "lmstudio" | "qwen" | "gemini" => {
            Ok(Box::new(OpenAiFormatter {
                family: ProviderFamily::OpenAi,
            }))
        }
        "azure" => Ok(Box::new(OpenAiFormatter {
            family: ProviderFamily::Azure,
        })),
        "anthropic" | "aws" => Ok(Box::new(AnthropicFormatter)),
        other => Err(Error::UnsupportedProvider(other.to_string())),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// OpenAI family (also Azure — same wire shape)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug)]
struct OpenAiFormatter {
    family: ProviderFamily,
}

impl MessageFormatter for OpenAiFormatter {
    fn family(&self) -> ProviderFamily {
        self.family
    }

    fn format(&self, system_prompt: Option<&str>, messages: &[Message]) -> FormattedConversation {
        let mut shaped = Vec::with_capacity(messages.len() + 1);
        if let Some(system) = system_prompt {
            if !system.is_empty() {
                shaped.push(json!({"role": "system", "content": system}));
            }
        }
        for msg in messages {
            shaped.push(match msg.role {
                Role::System => json!({
                    "role": "system",
                    "content": msg.content.extract_all_text(),
                }),
                Role::User => user_to_openai(msg),
                Role::Assistant => assistant_to_openai(msg),
                Role::Tool => tool_result_to_openai(msg),
            });
        }
        FormattedConversation {
            system: None,
            messages: shaped,
        }
    }
}

fn user_to_openai(msg: &Message) -> Value {
    match &msg.content {
        MessageContent::Text(t) => json!({"role": "user", "content": t}),
        MessageContent::Parts(parts) => {
            let content: Vec<Value> = parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => {
                        Some(json!({"type": "text", "text": text}))
                    }
                    ContentPart::Image { image, mime_type } => Some(json!({
                        "type": "image_url",
                        "image_url": {"url": format!("data:{mime_type};base64,{image}")},
                    })),
                    // Thinking blocks are an Anthropic concept; the OpenAI
                    // family never sees them on the wire.
                    _ => None,
                })
                .collect();
            json!({"role": "user", "content": content})
        }
    }
}

fn assistant_to_openai(msg: &Message) -> Value {
    let text = msg.content.extract_all_text();
    let mut obj = json!({"role": "assistant"});
    obj["content"] = if text.is_empty() {
        Value::Null
    } else {
        Value::String(text)
    };
    if !msg.tool_calls.is_empty() {
        let calls: Vec<Value> = msg
            .tool_calls
            .iter()
            .map(|tc| {
                json!({
                    "id": tc.id,
                    "type": "function",
                    "function": {"name": tc.name, "arguments": tc.arguments},
                })
            })
            .collect();
        obj["tool_calls"] = Value::Array(calls);
    }
    obj
}

fn tool_result_to_openai(msg: &Message) -> Value {
    json!({
        "role": "tool",
        "tool_call_id": msg.tool_call_id.as_deref().unwrap_or(""),
        "name": msg.name.as_deref().unwrap_or(""),
        "content": msg.content.extract_all_text(),
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Anthropic family
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug)]
struct AnthropicFormatter;

impl MessageFormatter for AnthropicFormatter {
    fn family(&self) -> ProviderFamily {
        ProviderFamily::Anthropic
    }

    fn format(&self, system_prompt: Option<&str>, messages: &[Message]) -> FormattedConversation {
        let mut system_parts: Vec<String> = Vec::new();
        if let Some(system) = system_prompt {
            if !system.is_empty() {
                system_parts.push(system.to_owned());
            }
        }

        let mut shaped = Vec::with_capacity(messages.len());
        for msg in messages {
            match msg.role {
                Role::System => system_parts.push(msg.content.extract_all_text()),
                Role::User => shaped.push(user_to_anthropic(msg)),
                Role::Assistant => shaped.push(assistant_to_anthropic(msg)),
                // Tool results are user messages with tool_result blocks.
                Role::Tool => shaped.push(json!({
                    "role": "user",
                    "content": [{
                        "type": "tool_result",
                        "tool_use_id": msg.tool_call_id.as_deref().unwrap_or(""),
                        "content": msg.content.extract_all_text(),
                    }],
                })),
            }
        }

        FormattedConversation {
            system: if system_parts.is_empty() {
                None
            } else {
                Some(system_parts.join("\n\n"))
            },
            messages: shaped,
        }
    }
}

fn user_to_anthropic(msg: &Message) -> Value {
    match &msg.content {
        MessageContent::Text(t) => json!({"role": "user", "content": t}),
        MessageContent::Parts(parts) => {
            let content: Vec<Value> = parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => {
                        Some(json!({"type": "text", "text": text}))
                    }
                    ContentPart::Image { image, mime_type } => Some(json!({
                        "type": "image",
                        "source": {
                            "type": "base64",
                            "media_type": mime_type,
                            "data": image,
                        },
                    })),
                    _ => None,
                })
                .collect();
            json!({"role": "user", "content": content})
        }
    }
}

fn assistant_to_anthropic(msg: &Message) -> Value {
    let mut content: Vec<Value> = Vec::new();

    match &msg.content {
        MessageContent::Text(t) => {
            if !t.is_empty() {
                content.push(json!({"type": "text", "text": t}));
            }
        }
        MessageContent::Parts(parts) => {
            for part in parts {
                match part {
                    ContentPart::Text { text } => {
                        content.push(json!({"type": "text", "text": text}));
                    }
                    ContentPart::Thinking { thinking } => {
                        content.push(json!({"type": "thinking", "thinking": thinking}));
                    }
                    ContentPart::RedactedThinking { data } => {
                        content.push(json!({"type": "redacted_thinking", "data": data}));
                    }
                    ContentPart::Image { .. } => {}
                }
            }
        }
    }

    for tc in &msg.tool_calls {
        // Arguments are stored as a JSON-encoded string; Anthropic wants
        // the parsed object in `input`.
        let input: Value =
            serde_json::from_str(&tc.arguments).unwrap_or(Value::Object(Default::default()));
        content.push(json!({
            "type": "tool_use",
            "id": tc.id,
            "name": tc.name,
            "input": input,
        }));
    }

    json!({"role": "assistant", "content": content})
}

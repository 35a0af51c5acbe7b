//! Comprehensive interaction collection.
//!
//! One turn becomes an ordered list of strings: the user text, a
//! one-line summary per tool call, a compact summary per tool result,
//! then the assistant text. The knowledge tools consume this list.

use serde_json::Value;

use mx_domain::message::{Message, Role};

/// Everything the memory pipelines need from one completed turn.
#[derive(Debug, Clone, Default)]
pub struct TurnRecord {
    pub user_input: String,
    pub assistant_response: String,
    /// `(tool_name, parsed_arguments)` per call, in order.
    pub tool_calls: Vec<(String, Value)>,
    /// `(tool_name, result_payload)` per result, in order.
    pub tool_results: Vec<(String, String)>,
}

impl TurnRecord {
    /// Build a record from the transcript tail of the latest turn — the
    /// suffix starting at the last user message.
    pub fn from_transcript_tail(messages: &[Message]) -> Self {
        let start = messages
            .iter()
            .rposition(|m| m.role == Role::User)
            .unwrap_or(0);

        let mut record = TurnRecord::default();
        for msg in &messages[start..] {
            match msg.role {
                Role::User => record.user_input = msg.content.extract_all_text(),
                Role::Assistant => {
                    for tc in &msg.tool_calls {
                        let args: Value = serde_json::from_str(&tc.arguments)
                            .unwrap_or(Value::Object(Default::default()));
                        record.tool_calls.push((tc.name.clone(), args));
                    }
                    let text = msg.content.extract_all_text();
                    if !text.is_empty() {
                        record.assistant_response = text;
                    }
                }
                Role::Tool => {
                    record.tool_results.push((
                        msg.name.clone().unwrap_or_default(),
                        msg.content.extract_all_text(),
                    ));
                }
                Role::System => {}
            }
        }
        record
    }
}

/// Flatten a turn into the ordered interaction list.
pub fn collect_interaction(turn: &TurnRecord) -> Vec<String> {
    let mut lines = Vec::new();
    lines.push(format!("User: {}", turn.user_input));
    for (name, args) in &turn.tool_calls {
        lines.push(summarize_tool_call(name, args));
    }
    for (name, payload) in &turn.tool_results {
        lines.push(summarize_tool_result(name, payload));
    }
    lines.push(format!("Assistant: {}", turn.assistant_response));
    lines
}

/// `name with key=value` for up to three arguments.
fn summarize_tool_call(name: &str, args: &Value) -> String {
    let pairs = match args.as_object() {
        Some(map) if !map.is_empty() => map
            .iter()
            .take(3)
            .map(|(k, v)| format!("{k}={}", compact_value(v)))
            .collect::<Vec<_>>()
            .join(", "),
        _ => return format!("Tool call: {name}"),
    };
    format!("Tool call: {name} with {pairs}")
}

/// Compact per-result summary: line counts for file reads, result counts
/// for searches, a truncated preview otherwise.
fn summarize_tool_result(name: &str, payload: &str) -> String {
    if let Ok(json) = serde_json::from_str::<Value>(payload) {
        if let Some(lines) = json.get("lines").and_then(|v| v.as_u64()) {
            return format!("Tool result: {name} returned {lines} lines");
        }
        if let Some(results) = json.get("results").and_then(|v| v.as_array()) {
            return format!("Tool result: {name} returned {} results", results.len());
        }
        if let Some(count) = json.get("count").and_then(|v| v.as_u64()) {
            return format!("Tool result: {name} returned {count} results");
        }
        if json.get("error").is_some() {
            return format!("Tool result: {name} failed");
        }
    }

    let line_count = payload.lines().count();
    if line_count > 3 {
        return format!("Tool result: {name} returned {line_count} lines");
    }
    format!("Tool result: {name}: {}", truncate(payload, 120))
}

fn compact_value(v: &Value) -> String {
    match v {
        Value::String(s) => truncate(s, 40),
        other => truncate(&other.to_string(), 40),
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_owned();
    }
    let cut: String = s.chars().take(max).collect();
    format!("{cut}…")
}

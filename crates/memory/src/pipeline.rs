//! Post-turn orchestration for the knowledge tools.
//!
//! The session's background job builds a [`PipelineInput`] and calls
//! [`KnowledgePipeline::run`], then the reflection pipeline. Tool
//! executions go through `execute_tool_without_loading` so background
//! work never pays the remote-enumeration cost.

use std::sync::Arc;

use serde_json::{json, Value};

use mx_domain::config::MemoryConfig;
use mx_events::{topics, EventBus};
use mx_tools::UnifiedToolManager;

use crate::embedding::EmbeddingManager;
use crate::interaction::{collect_interaction, TurnRecord};
use crate::knowledge::{KNOWLEDGE_TOOL, WORKSPACE_TOOL};

/// Per-run overrides a caller may attach to one turn's pipeline run.
#[derive(Debug, Clone, Default)]
pub struct RunOverrides {
    /// Overlaid onto the merged context.
    pub context_overrides: Option<Value>,
    /// Merged over the session's metadata defaults.
    pub metadata_overrides: Option<Value>,
    /// Minimal schema the merged metadata must satisfy; on violation the
    /// overrides are dropped and the session defaults used alone.
    pub metadata_schema: Option<Value>,
    /// Option overrides forwarded to the memory tools.
    pub options: Option<Value>,
}

/// Everything one pipeline run needs.
pub struct PipelineInput<'a> {
    pub session_id: &'a str,
    pub turn: &'a TurnRecord,
    /// Transcript tail rendered as plain strings (most recent last).
    pub recent_messages: Vec<String>,
    /// Session-level metadata defaults.
    pub session_metadata: Option<&'a Value>,
    pub overrides: Option<&'a RunOverrides>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// KnowledgePipeline
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct KnowledgePipeline {
    tools: Arc<UnifiedToolManager>,
    embeddings: Arc<EmbeddingManager>,
    bus: Arc<EventBus>,
    config: MemoryConfig,
}

impl KnowledgePipeline {
    pub fn new(
        tools: Arc<UnifiedToolManager>,
        embeddings: Arc<EmbeddingManager>,
        bus: Arc<EventBus>,
        config: MemoryConfig,
    ) -> Self {
        Self {
            tools,
            embeddings,
            bus,
            config,
        }
    }

    /// Run the knowledge tools for one turn. Never returns an error.
    pub async fn run(&self, input: PipelineInput<'_>) {
        if !self.embeddings.is_enabled() {
            tracing::debug!(
                session_id = input.session_id,
                "embeddings disabled, skipping knowledge pipeline"
            );
            return;
        }

        let interaction = collect_interaction(input.turn);
        let context = self.merged_context(&input);
        let metadata = merge_metadata(
            input.session_metadata,
            input.overrides.and_then(|o| o.metadata_overrides.as_ref()),
            input.overrides.and_then(|o| o.metadata_schema.as_ref()),
        );

        let args = json!({
            "interaction": interaction,
            "context": context,
            "metadata": metadata,
            "options": input
                .overrides
                .and_then(|o| o.options.clone())
                .unwrap_or_else(|| serde_json::to_value(&self.config.options).unwrap_or_default()),
        });

        if self.config.use_workspace_memory {
            self.run_tool(WORKSPACE_TOOL, &args, input.session_id).await;
        }
        if !self.config.disable_default_memory {
            self.run_tool(KNOWLEDGE_TOOL, &args, input.session_id).await;
        }
    }

    async fn run_tool(&self, name: &str, args: &Value, session_id: &str) {
        match self
            .tools
            .execute_tool_without_loading(name, args.clone())
            .await
        {
            Ok(result) => {
                let actions = result
                    .get("actions")
                    .and_then(|v| v.as_array())
                    .map(|a| a.len())
                    .unwrap_or(0);
                tracing::debug!(session_id, tool = name, actions, "memory tool completed");
            }
            Err(e) => {
                tracing::warn!(session_id, tool = name, error = %e, "memory tool failed");
                self.bus.emit_session(
                    session_id,
                    topics::MEMORY_OPERATION_FAILED,
                    json!({ "stage": "tool", "tool": name, "error": e.to_string() }),
                );
            }
        }
    }

    /// `{sessionId, conversationTopic, recentMessages}` overlaid with the
    /// caller's context overrides.
    fn merged_context(&self, input: &PipelineInput<'_>) -> Value {
        let topic: String = input
            .turn
            .user_input
            .split_whitespace()
            .take(8)
            .collect::<Vec<_>>()
            .join(" ");

        let mut context = json!({
            "sessionId": input.session_id,
            "conversationTopic": topic,
            "recentMessages": input.recent_messages,
        });
        if let Some(overrides) = input.overrides.and_then(|o| o.context_overrides.as_ref()) {
            overlay(&mut context, overrides);
        }
        context
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Metadata merge + validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Merge session metadata defaults with per-run overrides, then check
/// the result against the optional schema. A schema violation drops the
/// overrides entirely and keeps the session defaults (logged, so the
/// drop is observable).
pub fn merge_metadata(
    defaults: Option<&Value>,
    overrides: Option<&Value>,
    schema: Option<&Value>,
) -> Value {
    let defaults = defaults.cloned().unwrap_or_else(|| json!({}));
    let Some(overrides) = overrides else {
        return defaults;
    };

    let mut merged = defaults.clone();
    overlay(&mut merged, overrides);

    if let Some(schema) = schema {
        if let Err(reason) = validate_metadata(&merged, schema) {
            tracing::warn!(
                reason,
                "merged metadata failed schema validation, dropping per-run overrides"
            );
            return defaults;
        }
    }
    merged
}

/// Shallow key overlay (objects only; anything else replaces wholesale).
fn overlay(base: &mut Value, overrides: &Value) {
    match (base.as_object_mut(), overrides.as_object()) {
        (Some(base_map), Some(override_map)) => {
            for (k, v) in override_map {
                base_map.insert(k.clone(), v.clone());
            }
        }
        _ => *base = overrides.clone(),
    }
}

/// Minimal validator: `required` keys must exist, `properties.*.type`
/// must match when present.
pub fn validate_metadata(value: &Value, schema: &Value) -> Result<(), String> {
    let object = value
        .as_object()
        .ok_or_else(|| "metadata is not an object".to_owned())?;

    if let Some(required) = schema.get("required").and_then(|v| v.as_array()) {
        for key in required.iter().filter_map(|k| k.as_str()) {
            if !object.contains_key(key) {
                return Err(format!("missing required key: {key}"));
            }
        }
    }

    if let Some(properties) = schema.get("properties").and_then(|v| v.as_object()) {
        for (key, prop) in properties {
            let Some(actual) = object.get(key) else {
                continue;
            };
            let Some(expected) = prop.get("type").and_then(|v| v.as_str()) else {
                continue;
            };
            if !type_matches(actual, expected) {
                return Err(format!("key {key} is not of type {expected}"));
            }
        }
    }
    Ok(())
}

fn type_matches(value: &Value, expected: &str) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        "null" => value.is_null(),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_win_on_merge() {
        let defaults = json!({"env": "prod", "team": "core"});
        let overrides = json!({"team": "memory"});
        let merged = merge_metadata(Some(&defaults), Some(&overrides), None);
        assert_eq!(merged["env"], "prod");
        assert_eq!(merged["team"], "memory");
    }

    #[test]
    fn schema_violation_drops_overrides() {
        let defaults = json!({"env": "prod"});
        let overrides = json!({"count": "not a number"});
        let schema = json!({
            "properties": { "count": { "type": "number" } }
        });
        let merged = merge_metadata(Some(&defaults), Some(&overrides), Some(&schema));
        assert_eq!(merged, defaults);
    }

    #[test]
    fn required_key_enforced() {
        let schema = json!({"required": ["sessionId"]});
        assert!(validate_metadata(&json!({}), &schema).is_err());
        assert!(validate_metadata(&json!({"sessionId": "s1"}), &schema).is_ok());
    }

    #[test]
    fn no_overrides_returns_defaults_untouched() {
        let defaults = json!({"env": "dev"});
        let merged = merge_metadata(Some(&defaults), None, None);
        assert_eq!(merged, defaults);
    }
}

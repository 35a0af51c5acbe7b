use serde::{Deserialize, Serialize};

/// Knowledge entries draw their ids from this range; reflection entries
/// occupy a disjoint range so the two collections can never collide.
pub const KNOWLEDGE_ID_MIN: u32 = 1;
pub const KNOWLEDGE_ID_MAX: u32 = 333_333;
pub const REFLECTION_ID_MIN: u32 = 400_000;
pub const REFLECTION_ID_MAX: u32 = 999_999;

/// The operation a memory decision resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MemoryEvent {
    Add,
    Update,
    Delete,
    None,
}

impl MemoryEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryEvent::Add => "ADD",
            MemoryEvent::Update => "UPDATE",
            MemoryEvent::Delete => "DELETE",
            MemoryEvent::None => "NONE",
        }
    }
}

/// Where a decision's confidence came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualitySource {
    Similarity,
    Llm,
    Heuristic,
}

/// One resolved memory action for an extracted fact.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryAction {
    pub id: u32,
    pub text: String,
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_pattern: Option<String>,
    pub confidence: f32,
    pub event: MemoryEvent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_memory: Option<String>,
    pub quality_source: QualitySource,
}

/// A vector-search hit against the knowledge collection.
#[derive(Debug, Clone)]
pub struct MemoryHit {
    pub id: u32,
    pub score: f32,
    pub text: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Reasoning traces
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    Premise,
    Inference,
    Conclusion,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningStep {
    pub kind: StepKind,
    pub content: String,
}

/// The evaluator's verdict on a trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceEvaluation {
    pub quality_score: f32,
    pub should_store: bool,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub suggestions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningTrace {
    pub id: u32,
    pub steps: Vec<ReasoningStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluation: Option<TraceEvaluation>,
}

impl ReasoningTrace {
    /// Render the trace as one searchable text block.
    pub fn rendered(&self) -> String {
        self.steps
            .iter()
            .map(|s| format!("[{:?}] {}", s.kind, s.content))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_event_serializes_uppercase() {
        assert_eq!(
            serde_json::to_string(&MemoryEvent::Update).unwrap(),
            "\"UPDATE\""
        );
        let parsed: MemoryEvent = serde_json::from_str("\"NONE\"").unwrap();
        assert_eq!(parsed, MemoryEvent::None);
    }

    #[test]
    fn id_ranges_are_disjoint() {
        assert!(KNOWLEDGE_ID_MAX < REFLECTION_ID_MIN);
    }

    #[test]
    fn action_json_uses_camel_case_payload_keys() {
        let action = MemoryAction {
            id: 12,
            text: "fact".into(),
            tags: vec!["tag".into()],
            code_pattern: None,
            confidence: 0.8,
            event: MemoryEvent::Add,
            old_memory: None,
            quality_source: QualitySource::Similarity,
        };
        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["qualitySource"], "similarity");
        assert!(json.get("oldMemory").is_none());
    }
}

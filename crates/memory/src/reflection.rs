//! The reflection memory pipeline: detect → extract → evaluate → store.
//!
//! Runs after the knowledge pipeline on the same turn. Every step is
//! independently wrapped; a failure is logged and emitted, never
//! propagated.

use std::sync::Arc;

use regex::Regex;
use serde_json::{json, Value};
use tokio::sync::RwLock;

use mx_domain::config::MemoryConfig;
use mx_domain::error::{Error, Result};
use mx_domain::trace::TraceEvent;
use mx_events::{topics, EventBus};
use mx_providers::TextCompletion;
use mx_tools::{InternalTool, ToolInvocation, UnifiedToolManager};

use crate::embedding::EmbeddingManager;
use crate::interaction::TurnRecord;
use crate::store::VectorStore;
use crate::types::{
    ReasoningStep, ReasoningTrace, StepKind, TraceEvaluation, REFLECTION_ID_MAX,
    REFLECTION_ID_MIN,
};

pub const EXTRACT_TOOL: &str = "extract_reasoning_steps";
pub const STORE_TRACE_TOOL: &str = "store_reasoning_memory";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Reasoning detector
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy)]
pub struct DetectionResult {
    pub contains_reasoning: bool,
    pub confidence: f32,
}

/// Lexical cue counter over connective words and numbered steps.
pub struct ReasoningDetector {
    cues: Regex,
    numbered: Regex,
}

impl ReasoningDetector {
    pub fn new() -> Self {
        Self {
            cues: Regex::new(
                r"(?i)\b(because|therefore|thus|hence|since|implies|follows|first|second|then|finally|if|so)\b",
            )
            .expect("static regex"),
            numbered: Regex::new(r"(?m)^\s*\d+[.)]").expect("static regex"),
        }
    }

    pub fn detect(&self, text: &str) -> DetectionResult {
        let cue_count = self.cues.find_iter(text).count();
        let numbered_count = self.numbered.find_iter(text).count();
        let matches = cue_count + numbered_count * 2;
        DetectionResult {
            contains_reasoning: matches >= 2,
            confidence: (matches as f32 * 0.2).min(1.0),
        }
    }
}

impl Default for ReasoningDetector {
    fn default() -> Self {
        Self::new()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// extract_reasoning_steps tool
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Splits a text into typed reasoning steps. Premises lead with causal
/// markers, conclusions with consequence markers, everything else is an
/// inference.
pub struct ExtractReasoningStepsTool;

fn classify_step(sentence: &str) -> StepKind {
    let lower = sentence.to_lowercase();
    let trimmed = lower.trim_start_matches(|c: char| c.is_numeric() || c == '.' || c == ')' || c == ' ');
    if trimmed.starts_with("because") || trimmed.starts_with("since") || trimmed.starts_with("given") {
        StepKind::Premise
    } else if trimmed.starts_with("therefore")
        || trimmed.starts_with("thus")
        || trimmed.starts_with("hence")
        || trimmed.starts_with("so ")
        || trimmed.starts_with("finally")
    {
        StepKind::Conclusion
    } else {
        StepKind::Inference
    }
}

pub fn extract_steps(text: &str) -> Vec<ReasoningStep> {
    text.split(['.', ';', '\n'])
        .map(str::trim)
        .filter(|s| s.split_whitespace().count() >= 3)
        .map(|s| ReasoningStep {
            kind: classify_step(s),
            content: s.to_owned(),
        })
        .collect()
}

#[async_trait::async_trait]
impl InternalTool for ExtractReasoningStepsTool {
    fn name(&self) -> &str {
        EXTRACT_TOOL
    }
    fn description(&self) -> &str {
        "Split a text into typed reasoning steps."
    }
    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "text": { "type": "string" } },
            "required": ["text"]
        })
    }
    fn agent_visible(&self) -> bool {
        false
    }
    async fn execute(&self, args: Value, _ctx: &ToolInvocation) -> Result<Value> {
        let text = args
            .get("text")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::ToolExecution {
                tool: EXTRACT_TOOL.into(),
                message: "missing required argument: text".into(),
            })?;
        let steps = extract_steps(text);
        Ok(json!({ "steps": steps }))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// store_reasoning_memory tool
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Persists an evaluated trace into the reflection collection. Ids come
/// from the reflection range, disjoint from knowledge ids.
pub struct StoreReasoningMemoryTool {
    embeddings: Arc<EmbeddingManager>,
    store: Arc<dyn VectorStore>,
    collection: String,
}

impl StoreReasoningMemoryTool {
    pub fn new(
        embeddings: Arc<EmbeddingManager>,
        store: Arc<dyn VectorStore>,
        collection: impl Into<String>,
    ) -> Self {
        Self {
            embeddings,
            store,
            collection: collection.into(),
        }
    }

    async fn allocate_id(&self) -> Result<u32> {
        use rand::Rng;
        for _ in 0..1000 {
            let candidate = {
                let mut rng = rand::thread_rng();
                rng.gen_range(REFLECTION_ID_MIN..=REFLECTION_ID_MAX)
            };
            if self.store.get(&self.collection, candidate).await?.is_none() {
                return Ok(candidate);
            }
        }
        Err(Error::VectorStore(
            "could not allocate a free reflection id".into(),
        ))
    }
}

#[async_trait::async_trait]
impl InternalTool for StoreReasoningMemoryTool {
    fn name(&self) -> &str {
        STORE_TRACE_TOOL
    }
    fn description(&self) -> &str {
        "Persist an evaluated reasoning trace into reflection memory."
    }
    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "steps": { "type": "array" },
                "evaluation": { "type": "object" }
            },
            "required": ["steps", "evaluation"]
        })
    }
    fn agent_visible(&self) -> bool {
        false
    }
    async fn execute(&self, args: Value, _ctx: &ToolInvocation) -> Result<Value> {
        let steps: Vec<ReasoningStep> =
            serde_json::from_value(args.get("steps").cloned().unwrap_or(json!([])))?;
        let evaluation: TraceEvaluation = serde_json::from_value(
            args.get("evaluation")
                .cloned()
                .ok_or_else(|| Error::ToolExecution {
                    tool: STORE_TRACE_TOOL.into(),
                    message: "missing required argument: evaluation".into(),
                })?,
        )?;

        let id = self.allocate_id().await?;
        let trace = ReasoningTrace {
            id,
            steps,
            evaluation: Some(evaluation),
        };
        let vector = self.embeddings.embed(&trace.rendered()).await?;
        let payload = serde_json::to_value(&trace)?;
        self.store
            .insert(&self.collection, id, vector, payload)
            .await?;
        Ok(json!({ "id": id }))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Pipeline
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const EVALUATION_SYSTEM: &str =
    "You grade reasoning traces for reuse value. Respond with only a JSON \
     object: {\"qualityScore\": 0.0-1.0, \"shouldStore\": true|false, \
     \"issues\": [\"...\"], \"suggestions\": [\"...\"]}";

/// Extract → evaluate → store, behind four gates: embeddings enabled,
/// both reflection tools registered, reflection not disabled, and the
/// detector firing on the user input.
pub struct ReflectionPipeline {
    tools: Arc<UnifiedToolManager>,
    embeddings: Arc<EmbeddingManager>,
    bus: Arc<EventBus>,
    detector: ReasoningDetector,
    config: MemoryConfig,
    evaluator: RwLock<Option<Arc<dyn TextCompletion>>>,
}

impl ReflectionPipeline {
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
            detector: ReasoningDetector::new(),
            config,
            evaluator: RwLock::new(None),
        }
    }

    /// Bind (or replace) the evaluator LLM — built from the evaluation
    /// config, typically a non-thinking model.
    pub async fn set_evaluator(&self, evaluator: Option<Arc<dyn TextCompletion>>) {
        *self.evaluator.write().await = evaluator;
    }

    /// Run the pipeline for one turn. Never returns an error; failures
    /// are logged and emitted on the bus.
    pub async fn run(&self, session_id: &str, turn: &TurnRecord) {
        if self.config.disable_reflection {
            return;
        }
        if !self.embeddings.is_enabled() {
            tracing::debug!("embeddings disabled, skipping reflection");
            return;
        }
        if !self.tools.has_tool(EXTRACT_TOOL) || !self.tools.has_tool(STORE_TRACE_TOOL) {
            tracing::debug!("reflection tools not registered, skipping");
            return;
        }

        // The gate keys on the user input; assistant text can only raise
        // the confidence, never satisfy the gate alone.
        let detection = self.detector.detect(&turn.user_input);
        let assist = self.detector.detect(&turn.assistant_response);
        let confidence = (detection.confidence + assist.confidence * 0.2).min(1.0);
        if !detection.contains_reasoning || confidence < self.config.reasoning_detector_threshold {
            return;
        }

        // Step 1: extract.
        let steps = match self.extract(turn).await {
            Ok(steps) => steps,
            Err(e) => {
                self.step_failed(session_id, "extract", &e);
                return;
            }
        };
        if steps.is_empty() {
            return;
        }

        // Step 2: evaluate.
        let evaluation = match self.evaluate(&steps).await {
            Ok(evaluation) => evaluation,
            Err(e) => {
                self.step_failed(session_id, "evaluate", &e);
                return;
            }
        };

        // Step 3: store.
        if !evaluation.should_store {
            tracing::debug!(
                session_id,
                quality = evaluation.quality_score,
                "trace below storage bar"
            );
            return;
        }
        let quality_score = evaluation.quality_score;
        match self.store(&steps, &evaluation).await {
            Ok(id) => {
                TraceEvent::ReflectionStored {
                    session_id: session_id.to_owned(),
                    steps: steps.len(),
                    quality_score,
                }
                .emit();
                self.bus.emit_session(
                    session_id,
                    topics::REFLECTION_STORED,
                    json!({ "id": id, "steps": steps.len(), "qualityScore": quality_score }),
                );
            }
            Err(e) => self.step_failed(session_id, "store", &e),
        }
    }

    async fn extract(&self, turn: &TurnRecord) -> Result<Vec<ReasoningStep>> {
        let result = self
            .tools
            .execute_tool_without_loading(EXTRACT_TOOL, json!({ "text": turn.user_input }))
            .await?;
        Ok(serde_json::from_value(
            result.get("steps").cloned().unwrap_or(json!([])),
        )?)
    }

    async fn evaluate(&self, steps: &[ReasoningStep]) -> Result<TraceEvaluation> {
        let evaluator = self
            .evaluator
            .read()
            .await
            .clone()
            .ok_or_else(|| Error::Other("no reasoning evaluator configured".into()))?;

        let rendered: Vec<String> = steps
            .iter()
            .map(|s| format!("[{:?}] {}", s.kind, s.content))
            .collect();
        let raw = evaluator
            .complete(&rendered.join("\n"), Some(EVALUATION_SYSTEM))
            .await?;
        parse_evaluation(&raw)
    }

    async fn store(&self, steps: &[ReasoningStep], evaluation: &TraceEvaluation) -> Result<u32> {
        let result = self
            .tools
            .execute_tool_without_loading(
                STORE_TRACE_TOOL,
                json!({ "steps": steps, "evaluation": evaluation }),
            )
            .await?;
        Ok(result.get("id").and_then(|v| v.as_u64()).unwrap_or(0) as u32)
    }

    fn step_failed(&self, session_id: &str, stage: &str, error: &Error) {
        tracing::warn!(session_id, stage, error = %error, "reflection step failed");
        self.bus.emit_session(
            session_id,
            topics::REFLECTION_FAILED,
            json!({ "stage": stage, "error": error.to_string() }),
        );
    }
}

/// Tolerant evaluation parse: full JSON, then an embedded object.
fn parse_evaluation(raw: &str) -> Result<TraceEvaluation> {
    if let Ok(evaluation) = serde_json::from_str::<TraceEvaluation>(raw.trim()) {
        return Ok(evaluation);
    }
    let object_re = regex::Regex::new(r"\{[\s\S]*\}").expect("static regex");
    if let Some(found) = object_re.find(raw) {
        if let Ok(evaluation) = serde_json::from_str::<TraceEvaluation>(found.as_str()) {
            return Ok(evaluation);
        }
    }
    Err(Error::Other(format!(
        "unparseable evaluation response: {}",
        raw.chars().take(80).collect::<String>()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detector_fires_on_connectives() {
        let detector = ReasoningDetector::new();
        let result = detector.detect(
            "Because the cache is cold, the first request is slow; therefore we warm it at boot.",
        );
        assert!(result.contains_reasoning);
        assert!(result.confidence >= 0.4);
    }

    #[test]
    fn detector_ignores_plain_statements() {
        let detector = ReasoningDetector::new();
        let result = detector.detect("The file has 42 lines.");
        assert!(!result.contains_reasoning);
    }

    #[test]
    fn numbered_lists_count_as_reasoning() {
        let detector = ReasoningDetector::new();
        let result = detector.detect("1. open the file\n2. parse it\n3. write the report");
        assert!(result.contains_reasoning);
    }

    #[test]
    fn steps_are_classified() {
        let steps = extract_steps(
            "Because the index is stale, lookups miss. The cache must be rebuilt. Therefore we schedule a nightly job.",
        );
        assert_eq!(steps.len(), 3);
        assert_eq!(steps[0].kind, StepKind::Premise);
        assert_eq!(steps[1].kind, StepKind::Inference);
        assert_eq!(steps[2].kind, StepKind::Conclusion);
    }

    #[test]
    fn evaluation_parses_from_prose() {
        let raw = "Verdict: {\"qualityScore\": 0.8, \"shouldStore\": true, \"issues\": []}";
        let evaluation = parse_evaluation(raw).unwrap();
        assert_eq!(evaluation.quality_score, 0.8);
        assert!(evaluation.should_store);
    }

    #[test]
    fn bad_evaluation_is_an_error() {
        assert!(parse_evaluation("definitely a good trace").is_err());
    }
}

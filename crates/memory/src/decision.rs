//! The per-fact decision engine.
//!
//! Strategy chain: try the decision LLM when one is configured, fall
//! back to similarity-only rules, then finish with the confidence gate
//! (any decision below the threshold is demoted to NONE).

use serde_json::Value;

use mx_domain::config::MemoryOptions;
use mx_domain::error::{Error, Result};
use mx_providers::TextCompletion;

use crate::types::{MemoryEvent, MemoryHit, QualitySource};

/// A resolved decision for one fact.
#[derive(Debug, Clone)]
pub struct MemoryDecision {
    pub event: MemoryEvent,
    pub confidence: f32,
    pub target_id: Option<u32>,
    pub old_memory: Option<String>,
    pub quality_source: QualitySource,
}

/// Decide what to do with `fact` given the filtered similarity hits.
pub async fn decide(
    fact: &str,
    hits: &[MemoryHit],
    context: &Value,
    options: &MemoryOptions,
    llm: Option<&dyn TextCompletion>,
) -> MemoryDecision {
    let mut decision = match llm {
        Some(llm) if options.use_llm_decisions => {
            match llm_decide(llm, fact, hits, context).await {
                Ok(decision) => decision,
                Err(e) => {
                    tracing::debug!(error = %e, "LLM decision failed, using similarity fallback");
                    similarity_decide(hits, options)
                }
            }
        }
        _ => similarity_decide(hits, options),
    };

    if decision.event == MemoryEvent::Delete && !options.enable_delete_operations {
        tracing::debug!("delete operations disabled, demoting to NONE");
        decision.event = MemoryEvent::None;
    }

    // The confidence gate always runs last.
    if decision.confidence < options.confidence_threshold {
        decision.event = MemoryEvent::None;
    }
    decision
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Similarity-only rules
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// No hits → ADD @ 0.8. Top hit above 0.9 → NONE @ 0.9 (duplicate).
/// Top hit in `(threshold, 0.9]` → UPDATE @ 0.75 carrying the old text.
/// Anything else → ADD @ 0.7.
pub fn similarity_decide(hits: &[MemoryHit], options: &MemoryOptions) -> MemoryDecision {
    let top = match hits.first() {
        None => {
            return MemoryDecision {
                event: MemoryEvent::Add,
                confidence: 0.8,
                target_id: None,
                old_memory: None,
                quality_source: QualitySource::Similarity,
            }
        }
        Some(top) => top,
    };

    if top.score > 0.9 {
        MemoryDecision {
            event: MemoryEvent::None,
            confidence: 0.9,
            target_id: Some(top.id),
            old_memory: None,
            quality_source: QualitySource::Similarity,
        }
    } else if top.score > options.similarity_threshold {
        MemoryDecision {
            event: MemoryEvent::Update,
            confidence: 0.75,
            target_id: Some(top.id),
            old_memory: Some(top.text.clone()),
            quality_source: QualitySource::Similarity,
        }
    } else {
        MemoryDecision {
            event: MemoryEvent::Add,
            confidence: 0.7,
            target_id: None,
            old_memory: None,
            quality_source: QualitySource::Similarity,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LLM-assisted path
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const DECISION_SYSTEM: &str =
    "You manage a long-term memory store. Given a new fact and the most similar \
     existing memories, choose one operation. Respond with only a JSON object: \
     {\"operation\": \"ADD\"|\"UPDATE\"|\"DELETE\"|\"NONE\", \"confidence\": 0.0-1.0, \
     \"targetMemoryId\": <id or null>}";

async fn llm_decide(
    llm: &dyn TextCompletion,
    fact: &str,
    hits: &[MemoryHit],
    context: &Value,
) -> Result<MemoryDecision> {
    let similar: Vec<String> = hits
        .iter()
        .take(3)
        .map(|h| format!("- id {} (score {:.2}): {}", h.id, h.score, h.text))
        .collect();
    let prompt = format!(
        "New fact:\n{fact}\n\nSimilar memories:\n{}\n\nConversation context:\n{context}",
        if similar.is_empty() {
            "(none)".to_owned()
        } else {
            similar.join("\n")
        },
    );

    let raw = llm.complete(&prompt, Some(DECISION_SYSTEM)).await?;
    let mut decision = parse_decision_response(&raw)?;

    // Fill old_memory from the hit the decision targets.
    if decision.event == MemoryEvent::Update {
        let target = decision
            .target_id
            .and_then(|id| hits.iter().find(|h| h.id == id))
            .or_else(|| hits.first());
        if let Some(hit) = target {
            decision.target_id = Some(hit.id);
            decision.old_memory = Some(hit.text.clone());
        }
    }
    Ok(decision)
}

/// Tolerant parse: full JSON, then a regex-extracted JSON object, then a
/// keyword scan. Anything else is an error (the caller falls back).
pub fn parse_decision_response(raw: &str) -> Result<MemoryDecision> {
    if let Some(decision) = parse_decision_json(raw) {
        return Ok(decision);
    }

    let object_re = regex::Regex::new(r"\{[^{}]*\}").expect("static regex");
    if let Some(found) = object_re.find(raw) {
        if let Some(decision) = parse_decision_json(found.as_str()) {
            return Ok(decision);
        }
    }

    // Keyword fallback: the first operation word wins.
    let upper = raw.to_uppercase();
    for (keyword, event) in [
        ("UPDATE", MemoryEvent::Update),
        ("DELETE", MemoryEvent::Delete),
        ("NONE", MemoryEvent::None),
        ("ADD", MemoryEvent::Add),
    ] {
        if upper.contains(keyword) {
            return Ok(MemoryDecision {
                event,
                confidence: 0.6,
                target_id: None,
                old_memory: None,
                quality_source: QualitySource::Llm,
            });
        }
    }

    Err(Error::Other(format!(
        "unparseable decision response: {}",
        raw.chars().take(80).collect::<String>()
    )))
}

fn parse_decision_json(raw: &str) -> Option<MemoryDecision> {
    let json: Value = serde_json::from_str(raw.trim()).ok()?;
    let operation = json.get("operation")?.as_str()?;
    let event = match operation.to_uppercase().as_str() {
        "ADD" => MemoryEvent::Add,
        "UPDATE" => MemoryEvent::Update,
        "DELETE" => MemoryEvent::Delete,
        "NONE" => MemoryEvent::None,
        _ => return None,
    };
    let confidence = json
        .get("confidence")
        .and_then(|v| v.as_f64())
        .map(|v| v.clamp(0.0, 1.0) as f32)
        .unwrap_or(0.6);
    let target_id = json
        .get("targetMemoryId")
        .and_then(|v| v.as_u64())
        .map(|v| v as u32);
    Some(MemoryDecision {
        event,
        confidence,
        target_id,
        old_memory: None,
        quality_source: QualitySource::Llm,
    })
}

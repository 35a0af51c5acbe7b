//! The knowledge memory tools.
//!
//! Both tools run through the unified tool manager with an interaction
//! list, a merged context, a metadata blob, and per-run options. They
//! extract facts, decide per fact against the vector store, and persist
//! the survivors. They are internal-only: never listed to the agent.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::RwLock;

use mx_domain::config::MemoryOptions;
use mx_domain::error::{Error, Result};
use mx_domain::trace::TraceEvent;
use mx_events::{topics, EventBus};
use mx_providers::TextCompletion;
use mx_tools::{InternalTool, ToolInvocation};

use crate::decision::decide;
use crate::embedding::EmbeddingManager;
use crate::store::VectorStore;
use crate::types::{
    MemoryAction, MemoryEvent, MemoryHit, QualitySource, KNOWLEDGE_ID_MAX, KNOWLEDGE_ID_MIN,
};

pub const KNOWLEDGE_TOOL: &str = "knowledge_memory";
pub const WORKSPACE_TOOL: &str = "workspace_memory";

/// Id-allocation attempts before giving up on a saturated collection.
const MAX_ID_ATTEMPTS: usize = 1000;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Fact extraction
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct Fact {
    pub text: String,
    pub tags: Vec<String>,
    pub code_pattern: Option<String>,
}

const EXTRACTION_SYSTEM: &str =
    "Extract short, durable factual statements worth remembering from the \
     interaction. Respond with only a JSON array: \
     [{\"text\": \"...\", \"tags\": [\"...\"]}]. Return [] when nothing is worth keeping.";

/// Extract facts from the interaction lines. The LLM path is tried
/// first when available; the sentence heuristic is the fallback.
pub async fn extract_facts(
    interaction: &[String],
    llm: Option<&dyn TextCompletion>,
) -> Vec<Fact> {
    if let Some(llm) = llm {
        let prompt = interaction.join("\n");
        match llm.complete(&prompt, Some(EXTRACTION_SYSTEM)).await {
            Ok(raw) => {
                if let Some(facts) = parse_extracted_facts(&raw) {
                    return facts;
                }
                tracing::debug!("unparseable fact extraction, using heuristic");
            }
            Err(e) => {
                tracing::debug!(error = %e, "LLM fact extraction failed, using heuristic");
            }
        }
    }
    heuristic_facts(interaction)
}

fn parse_extracted_facts(raw: &str) -> Option<Vec<Fact>> {
    let array_re = regex::Regex::new(r"\[[\s\S]*\]").expect("static regex");
    let candidate = if raw.trim_start().starts_with('[') {
        raw.trim().to_owned()
    } else {
        array_re.find(raw)?.as_str().to_owned()
    };

    let items: Vec<Value> = serde_json::from_str(&candidate).ok()?;
    let facts: Vec<Fact> = items
        .iter()
        .filter_map(|item| {
            let text = item.get("text")?.as_str()?.trim().to_owned();
            if text.is_empty() {
                return None;
            }
            let tags = item
                .get("tags")
                .and_then(|v| v.as_array())
                .map(|tags| {
                    tags.iter()
                        .filter_map(|t| t.as_str())
                        .map(|t| t.to_lowercase())
                        .collect()
                })
                .unwrap_or_else(|| derive_tags(&text));
            Some(Fact {
                code_pattern: extract_code_pattern(&text),
                text,
                tags,
            })
        })
        .collect();
    Some(facts)
}

/// Assertion verbs that mark a sentence as a candidate fact.
const ASSERTION_MARKERS: &[&str] = &[
    " is ", " are ", " was ", " means ", " defines ", " uses ", " returns ",
    " has ", " have ", " works ", " prefers ", " prefer ", " requires ",
];

/// Leading words that mark a sentence as a question, not an assertion.
const QUESTION_OPENERS: &[&str] = &[
    "what", "who", "when", "where", "why", "how", "is", "are", "can", "could",
    "do", "does", "did", "should", "would", "will",
];

/// Sentence-level heuristic over the user lines of the interaction.
fn heuristic_facts(interaction: &[String]) -> Vec<Fact> {
    let mut facts = Vec::new();
    for line in interaction {
        let Some(text) = line.strip_prefix("User: ") else {
            continue;
        };
        for sentence in text.split(['.', '!', '?']) {
            let sentence = sentence.trim();
            if sentence.split_whitespace().count() < 4 {
                continue;
            }
            let lower = format!(" {} ", sentence.to_lowercase());
            let first_word = lower.split_whitespace().next().unwrap_or_default();
            if QUESTION_OPENERS.contains(&first_word) {
                continue;
            }
            if !ASSERTION_MARKERS.iter().any(|m| lower.contains(m)) {
                continue;
            }
            facts.push(Fact {
                text: sentence.to_owned(),
                tags: derive_tags(sentence),
                code_pattern: extract_code_pattern(sentence),
            });
        }
    }
    facts
}

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "that", "this", "with", "from", "have", "has", "are",
    "was", "were", "will", "would", "should", "could", "may", "might", "can",
    "not", "but", "its", "into", "when", "then", "than", "them", "they", "you",
    "your", "our", "all", "any", "also", "does",
];

/// Lowercased significant words, up to five.
pub fn derive_tags(text: &str) -> Vec<String> {
    let mut tags = Vec::new();
    for word in text.split_whitespace() {
        let word: String = word
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_')
            .collect::<String>()
            .to_lowercase();
        if word.len() < 3 || STOPWORDS.contains(&word.as_str()) || tags.contains(&word) {
            continue;
        }
        tags.push(word);
        if tags.len() == 5 {
            break;
        }
    }
    tags
}

/// Inline code between backticks, if any.
fn extract_code_pattern(text: &str) -> Option<String> {
    let start = text.find('`')?;
    let rest = &text[start + 1..];
    let end = rest.find('`')?;
    let snippet = &rest[..end];
    if snippet.is_empty() {
        None
    } else {
        Some(snippet.to_owned())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Shared tool core
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Everything both knowledge tools share: embedding manager, vector
/// store, collection name, bus, and the optional decision LLM (bound by
/// the session once its LLM service exists).
pub struct KnowledgeCore {
    embeddings: Arc<EmbeddingManager>,
    store: Arc<dyn VectorStore>,
    bus: Arc<EventBus>,
    collection: String,
    decision_llm: RwLock<Option<Arc<dyn TextCompletion>>>,
}

impl KnowledgeCore {
    pub fn new(
        embeddings: Arc<EmbeddingManager>,
        store: Arc<dyn VectorStore>,
        bus: Arc<EventBus>,
        collection: impl Into<String>,
    ) -> Self {
        Self {
            embeddings,
            store,
            bus,
            collection: collection.into(),
            decision_llm: RwLock::new(None),
        }
    }

    /// Bind (or replace) the decision LLM.
    pub async fn set_decision_llm(&self, llm: Option<Arc<dyn TextCompletion>>) {
        *self.decision_llm.write().await = llm;
    }

    async fn run(
        &self,
        args: Value,
        ctx: &ToolInvocation,
        fact_filter: fn(&Fact) -> bool,
    ) -> Result<Value> {
        if !self.embeddings.is_enabled() {
            return Ok(json!({ "skipped": "embeddings disabled", "actions": [] }));
        }

        let interaction: Vec<String> = args
            .get("interaction")
            .and_then(|v| v.as_array())
            .map(|lines| {
                lines
                    .iter()
                    .filter_map(|l| l.as_str())
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();
        if interaction.is_empty() {
            return Ok(json!({ "actions": [] }));
        }

        let context = args.get("context").cloned().unwrap_or(Value::Null);
        let options: MemoryOptions = args
            .get("options")
            .cloned()
            .map(|v| serde_json::from_value(v).unwrap_or_default())
            .unwrap_or_default();

        let llm = self.decision_llm.read().await.clone();
        let mut facts = extract_facts(&interaction, llm.as_deref()).await;
        facts.retain(fact_filter);

        // Facts are processed in extraction order; a later fact sees the
        // store state earlier ones produced.
        let mut actions = Vec::new();
        for fact in facts {
            let action = self
                .process_fact(fact, &context, &options, llm.as_deref(), ctx)
                .await;
            actions.push(action);
        }
        Ok(json!({ "actions": actions }))
    }

    async fn process_fact(
        &self,
        fact: Fact,
        context: &Value,
        options: &MemoryOptions,
        llm: Option<&dyn TextCompletion>,
        ctx: &ToolInvocation,
    ) -> MemoryAction {
        let session_id = ctx.session_id.clone().unwrap_or_default();

        // 1. Embed. Failure disables embeddings globally and falls back
        //    to an unpersisted ADD at 0.6.
        let vector = match self.embeddings.embed(&fact.text).await {
            Ok(v) => v,
            Err(e) => {
                self.bus.emit_service(
                    topics::MEMORY_OPERATION_FAILED,
                    json!({ "stage": "embed", "error": e.to_string() }),
                );
                return MemoryAction {
                    id: 0,
                    text: fact.text,
                    tags: fact.tags,
                    code_pattern: fact.code_pattern,
                    confidence: 0.6,
                    event: MemoryEvent::Add,
                    old_memory: None,
                    quality_source: QualitySource::Heuristic,
                };
            }
        };

        // 2. Search and filter by the similarity threshold.
        let search_start = std::time::Instant::now();
        let hits = match self
            .store
            .search(&self.collection, &vector, options.max_similar_results)
            .await
        {
            Ok(points) => points,
            Err(e) => {
                tracing::warn!(error = %e, "memory search failed, treating as empty");
                Vec::new()
            }
        };
        self.bus.emit_service(
            topics::MEMORY_SEARCH_COMPLETED,
            json!({ "duration_ms": search_start.elapsed().as_millis() as u64 }),
        );
        let hits: Vec<MemoryHit> = hits
            .into_iter()
            .filter(|p| p.score >= options.similarity_threshold)
            .map(|p| MemoryHit {
                id: p.id,
                score: p.score,
                text: p
                    .payload
                    .get("text")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_owned(),
            })
            .collect();

        // 3. Decide (LLM with similarity fallback, then confidence gate).
        let decision = decide(&fact.text, &hits, context, options, llm).await;

        TraceEvent::MemoryDecision {
            session_id: session_id.clone(),
            operation: decision.event.as_str().to_owned(),
            confidence: decision.confidence,
            quality_source: format!("{:?}", decision.quality_source).to_lowercase(),
        }
        .emit();

        // 4. Persist ADD/UPDATE; DELETE removes its target; NONE is a no-op.
        let id = match self.persist(&fact, &decision, vector).await {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(error = %e, "memory persistence failed");
                self.bus.emit_service(
                    topics::MEMORY_OPERATION_FAILED,
                    json!({ "stage": "persist", "error": e.to_string() }),
                );
                0
            }
        };

        self.bus.emit_session(
            &session_id,
            topics::MEMORY_OPERATION_COMPLETED,
            json!({ "operation": decision.event.as_str(), "id": id }),
        );

        MemoryAction {
            id,
            text: fact.text,
            tags: fact.tags,
            code_pattern: fact.code_pattern,
            confidence: decision.confidence,
            event: decision.event,
            old_memory: decision.old_memory,
            quality_source: decision.quality_source,
        }
    }

    async fn persist(
        &self,
        fact: &Fact,
        decision: &crate::decision::MemoryDecision,
        vector: Vec<f32>,
    ) -> Result<u32> {
        match decision.event {
            MemoryEvent::Add => {
                let id = self.allocate_id().await?;
                let payload = action_payload(fact, decision);
                self.store
                    .insert(&self.collection, id, vector, payload)
                    .await?;
                Ok(id)
            }
            MemoryEvent::Update => {
                let id = match decision.target_id {
                    Some(id) => id,
                    None => self.allocate_id().await?,
                };
                let payload = action_payload(fact, decision);
                self.store
                    .update(&self.collection, id, vector, payload)
                    .await?;
                Ok(id)
            }
            MemoryEvent::Delete => {
                if let Some(id) = decision.target_id {
                    self.store.delete(&self.collection, id).await?;
                    return Ok(id);
                }
                Ok(0)
            }
            MemoryEvent::None => Ok(decision.target_id.unwrap_or(0)),
        }
    }

    /// Draw an unused id from the knowledge range.
    async fn allocate_id(&self) -> Result<u32> {
        use rand::Rng;
        for _ in 0..MAX_ID_ATTEMPTS {
            let candidate = {
                let mut rng = rand::thread_rng();
                rng.gen_range(KNOWLEDGE_ID_MIN..=KNOWLEDGE_ID_MAX)
            };
            if self.store.get(&self.collection, candidate).await?.is_none() {
                return Ok(candidate);
            }
        }
        Err(Error::VectorStore(
            "could not allocate a free knowledge id".into(),
        ))
    }
}

fn action_payload(fact: &Fact, decision: &crate::decision::MemoryDecision) -> Value {
    let mut payload = json!({
        "text": fact.text,
        "tags": fact.tags,
        "confidence": decision.confidence,
        "event": decision.event.as_str(),
        "qualitySource": format!("{:?}", decision.quality_source).to_lowercase(),
    });
    if let Some(pattern) = &fact.code_pattern {
        payload["codePattern"] = Value::String(pattern.clone());
    }
    if let Some(old) = &decision.old_memory {
        payload["oldMemory"] = Value::String(old.clone());
    }
    payload
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// The two tools
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn memory_tool_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "interaction": {
                "type": "array",
                "items": { "type": "string" },
                "description": "Ordered interaction lines from the turn"
            },
            "context": { "type": "object", "description": "Merged session context" },
            "metadata": { "type": "object", "description": "Merged metadata blob" },
            "options": { "type": "object", "description": "Per-run option overrides" }
        },
        "required": ["interaction"]
    })
}

/// The default knowledge tool: runs on every turn unless disabled.
pub struct DefaultKnowledgeTool {
    core: Arc<KnowledgeCore>,
}

impl DefaultKnowledgeTool {
    pub fn new(core: Arc<KnowledgeCore>) -> Self {
        Self { core }
    }
}

#[async_trait::async_trait]
impl InternalTool for DefaultKnowledgeTool {
    fn name(&self) -> &str {
        KNOWLEDGE_TOOL
    }
    fn description(&self) -> &str {
        "Extract facts from an interaction and reconcile them with long-term memory."
    }
    fn parameters(&self) -> Value {
        memory_tool_schema()
    }
    fn agent_visible(&self) -> bool {
        false
    }
    async fn execute(&self, args: Value, ctx: &ToolInvocation) -> Result<Value> {
        self.core.run(args, ctx, |_| true).await
    }
}

/// The workspace memory tool: same pipeline scoped to a workspace
/// collection, keeping only facts that carry a code pattern.
pub struct WorkspaceMemoryTool {
    core: Arc<KnowledgeCore>,
}

impl WorkspaceMemoryTool {
    pub fn new(core: Arc<KnowledgeCore>) -> Self {
        Self { core }
    }
}

#[async_trait::async_trait]
impl InternalTool for WorkspaceMemoryTool {
    fn name(&self) -> &str {
        WORKSPACE_TOOL
    }
    fn description(&self) -> &str {
        "Capture workspace code patterns from an interaction into workspace memory."
    }
    fn parameters(&self) -> Value {
        memory_tool_schema()
    }
    fn agent_visible(&self) -> bool {
        false
    }
    async fn execute(&self, args: Value, ctx: &ToolInvocation) -> Result<Value> {
        self.core.run(args, ctx, |fact| fact.code_pattern.is_some()).await
    }
}

//! End-to-end memory pipeline tests with a programmable embedder and the
//! in-memory vector store — the full extract → decide → persist path
//! without any external services.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};

use mx_domain::config::{MemoryConfig, ToolsConfig};
use mx_domain::error::{Error, Result};
use mx_events::EventBus;
use mx_mcp_client::McpManager;
use mx_memory::{
    DefaultKnowledgeTool, Embedder, EmbeddingManager, ExtractReasoningStepsTool,
    InMemoryVectorStore, KnowledgeCore, KnowledgePipeline, PipelineInput, ReflectionPipeline,
    StoreReasoningMemoryTool, TurnRecord, VectorStore, KNOWLEDGE_ID_MAX, KNOWLEDGE_TOOL,
    REFLECTION_ID_MIN,
};
use mx_providers::TextCompletion;
use mx_tools::UnifiedToolManager;

const KNOWLEDGE: &str = "matrix_knowledge";
const REFLECTION: &str = "matrix_reflection";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Programmable embedder
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct MockEmbedder {
    programmed: Mutex<HashMap<String, Vec<f32>>>,
    fail: AtomicBool,
}

impl MockEmbedder {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            programmed: Mutex::new(HashMap::new()),
            fail: AtomicBool::new(false),
        })
    }

    fn program(&self, text: &str, vector: Vec<f32>) {
        self.programmed.lock().insert(text.to_owned(), vector);
    }
}

#[async_trait::async_trait]
impl Embedder for MockEmbedder {
    fn id(&self) -> &str {
        "mock"
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Other("embedder offline".into()));
        }
        if let Some(vector) = self.programmed.lock().get(text) {
            return Ok(vector.clone());
        }
        // Deterministic default: a unit vector derived from the text.
        let h = text
            .bytes()
            .fold(0u64, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u64));
        let a = ((h % 1000) as f32 / 1000.0).max(0.05);
        let b = (((h / 1000) % 1000) as f32 / 1000.0).max(0.05);
        let norm = (a * a + b * b).sqrt();
        Ok(vec![a / norm, b / norm, 0.0, 0.0])
    }
}

/// A vector whose cosine against `[1, 0, 0, 0]` equals `score`.
fn vector_at(score: f32) -> Vec<f32> {
    vec![score, (1.0 - score * score).sqrt(), 0.0, 0.0]
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Fixture
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct Fixture {
    embedder: Arc<MockEmbedder>,
    embeddings: Arc<EmbeddingManager>,
    store: Arc<InMemoryVectorStore>,
    tools: Arc<UnifiedToolManager>,
    pipeline: KnowledgePipeline,
}

fn fixture() -> Fixture {
    let config = MemoryConfig::default();
    let embedder = MockEmbedder::new();
    let embeddings = Arc::new(EmbeddingManager::new(Some(embedder.clone()), &config));
    let store = Arc::new(InMemoryVectorStore::new());
    let bus = Arc::new(EventBus::new());
    let tools = Arc::new(UnifiedToolManager::new(
        Arc::new(McpManager::empty()),
        ToolsConfig::default(),
        bus.clone(),
    ));

    let core = Arc::new(KnowledgeCore::new(
        embeddings.clone(),
        store.clone(),
        bus.clone(),
        KNOWLEDGE,
    ));
    tools.register(Arc::new(DefaultKnowledgeTool::new(core)));

    let pipeline = KnowledgePipeline::new(tools.clone(), embeddings.clone(), bus, config);
    Fixture {
        embedder,
        embeddings,
        store,
        tools,
        pipeline,
    }
}

fn turn(user_input: &str) -> TurnRecord {
    TurnRecord {
        user_input: user_input.to_owned(),
        assistant_response: "noted".into(),
        ..TurnRecord::default()
    }
}

async fn run_pipeline(f: &Fixture, record: &TurnRecord) {
    f.pipeline
        .run(PipelineInput {
            session_id: "s1",
            turn: record,
            recent_messages: vec![format!("User: {}", record.user_input)],
            session_metadata: None,
            overrides: None,
        })
        .await;
}

/// Call the knowledge tool directly to inspect the returned actions.
async fn run_tool(f: &Fixture, user_input: &str) -> Vec<Value> {
    let args = json!({
        "interaction": [format!("User: {user_input}"), "Assistant: noted"],
        "context": { "sessionId": "s1" },
    });
    let result = f
        .tools
        .execute_tool_without_loading(KNOWLEDGE_TOOL, args)
        .await
        .unwrap();
    result["actions"].as_array().cloned().unwrap_or_default()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario: fresh ADD
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn fresh_fact_becomes_one_add() {
    let f = fixture();
    run_pipeline(&f, &turn("In Python, def defines a function.")).await;

    let entries = f.store.entries(KNOWLEDGE);
    assert_eq!(entries.len(), 1);
    let (id, payload) = &entries[0];
    assert!((1..=KNOWLEDGE_ID_MAX).contains(id));
    assert_eq!(payload["event"], "ADD");
    assert!(payload["confidence"].as_f64().unwrap() >= 0.7);
    let tags: Vec<String> = serde_json::from_value(payload["tags"].clone()).unwrap();
    assert!(tags.contains(&"python".to_owned()));
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario: duplicate skip
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn near_duplicate_is_skipped() {
    let f = fixture();
    let fact = "In Python, def defines a function";
    f.embedder.program(fact, vector_at(1.0));
    f.store
        .insert(KNOWLEDGE, 5, vector_at(0.95), json!({"text": fact}))
        .await
        .unwrap();

    let actions = run_tool(&f, "In Python, def defines a function.").await;
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0]["event"], "NONE");
    assert!(actions[0]["confidence"].as_f64().unwrap() >= 0.89);

    // No new entry was written.
    assert_eq!(f.store.len(KNOWLEDGE), 1);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario: UPDATE with old memory
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn mid_similarity_updates_in_place() {
    let f = fixture();
    let old_text = "def defines functions in Python";
    let new_fact = "In Python, def defines a function and may specify default args";
    f.embedder.program(new_fact, vector_at(1.0));
    f.store
        .insert(KNOWLEDGE, 7, vector_at(0.82), json!({"text": old_text}))
        .await
        .unwrap();

    let actions = run_tool(
        &f,
        "In Python, def defines a function and may specify default args.",
    )
    .await;
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0]["event"], "UPDATE");
    assert_eq!(actions[0]["oldMemory"], old_text);
    assert_eq!(actions[0]["id"], 7);

    let payload = f.store.get(KNOWLEDGE, 7).await.unwrap().unwrap();
    assert_eq!(payload["text"], new_fact);
    assert_eq!(payload["event"], "UPDATE");
    assert_eq!(payload["oldMemory"], old_text);
    assert_eq!(f.store.len(KNOWLEDGE), 1);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario: embedding failure cascade
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn embedding_failure_disables_all_memory_work() {
    let f = fixture();
    f.embedder.fail.store(true, Ordering::SeqCst);

    // The failing run still reports an action (ADD @ 0.6), unpersisted.
    let actions = run_tool(&f, "In Python, def defines a function.").await;
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0]["event"], "ADD");
    assert!((actions[0]["confidence"].as_f64().unwrap() - 0.6).abs() < 1e-6);
    assert_eq!(actions[0]["qualitySource"], "heuristic");
    assert!(f.store.is_empty(KNOWLEDGE));
    assert!(!f.embeddings.is_enabled());

    // Later turns no-op even with a healthy embedder.
    f.embedder.fail.store(false, Ordering::SeqCst);
    run_pipeline(&f, &turn("In Rust, ownership moves values.")).await;
    assert!(f.store.is_empty(KNOWLEDGE));
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LLM-assisted decisions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Answers fact extraction with a fixed list and decisions with a fixed
/// operation, keyed off the system prompt.
struct ScriptedLlm {
    decision: String,
}

#[async_trait::async_trait]
impl TextCompletion for ScriptedLlm {
    async fn complete(&self, _prompt: &str, system: Option<&str>) -> Result<String> {
        if system.unwrap_or_default().contains("Extract") {
            Ok(r#"[{"text": "The user prefers tabs over spaces", "tags": ["style"]}]"#.into())
        } else {
            Ok(self.decision.clone())
        }
    }
}

#[tokio::test]
async fn llm_decision_controls_the_operation() {
    let f = fixture();
    // Rebuild the tool with a decision LLM bound.
    let core = Arc::new(KnowledgeCore::new(
        f.embeddings.clone(),
        f.store.clone(),
        Arc::new(EventBus::new()),
        KNOWLEDGE,
    ));
    core.set_decision_llm(Some(Arc::new(ScriptedLlm {
        decision: r#"{"operation": "NONE", "confidence": 0.99}"#.into(),
    })))
    .await;
    f.tools
        .register(Arc::new(DefaultKnowledgeTool::new(core.clone())));

    let actions = run_tool(&f, "The user prefers tabs over spaces.").await;
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0]["event"], "NONE");
    assert_eq!(actions[0]["qualitySource"], "llm");
    assert!(f.store.is_empty(KNOWLEDGE));
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Reflection pipeline
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct ApprovingEvaluator;

#[async_trait::async_trait]
impl TextCompletion for ApprovingEvaluator {
    async fn complete(&self, _prompt: &str, _system: Option<&str>) -> Result<String> {
        Ok(r#"{"qualityScore": 0.85, "shouldStore": true, "issues": [], "suggestions": []}"#.into())
    }
}

fn reflection_fixture(f: &Fixture) -> ReflectionPipeline {
    f.tools.register(Arc::new(ExtractReasoningStepsTool));
    f.tools.register(Arc::new(StoreReasoningMemoryTool::new(
        f.embeddings.clone(),
        f.store.clone(),
        REFLECTION,
    )));
    ReflectionPipeline::new(
        f.tools.clone(),
        f.embeddings.clone(),
        Arc::new(EventBus::new()),
        MemoryConfig::default(),
    )
}

#[tokio::test]
async fn reasoning_input_is_stored_as_a_trace() {
    let f = fixture();
    let reflection = reflection_fixture(&f);
    reflection
        .set_evaluator(Some(Arc::new(ApprovingEvaluator)))
        .await;

    let record = turn(
        "Because the cache is cold, the first request is slow. \
         Therefore we should warm the cache at boot, since latency matters.",
    );
    reflection.run("s1", &record).await;

    let entries = f.store.entries(REFLECTION);
    assert_eq!(entries.len(), 1);
    let (id, payload) = &entries[0];
    assert!(*id >= REFLECTION_ID_MIN);
    let quality = payload["evaluation"]["qualityScore"].as_f64().unwrap();
    assert!((quality - 0.85).abs() < 1e-6);
    assert!(!payload["steps"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn plain_input_never_reaches_the_evaluator() {
    let f = fixture();
    let reflection = reflection_fixture(&f);
    reflection
        .set_evaluator(Some(Arc::new(ApprovingEvaluator)))
        .await;

    reflection.run("s1", &turn("The file has 42 lines.")).await;
    assert!(f.store.is_empty(REFLECTION));
}

#[tokio::test]
async fn reflection_respects_disable_flag() {
    let f = fixture();
    f.tools.register(Arc::new(ExtractReasoningStepsTool));
    f.tools.register(Arc::new(StoreReasoningMemoryTool::new(
        f.embeddings.clone(),
        f.store.clone(),
        REFLECTION,
    )));
    let config = MemoryConfig {
        disable_reflection: true,
        ..MemoryConfig::default()
    };
    let reflection = ReflectionPipeline::new(
        f.tools.clone(),
        f.embeddings.clone(),
        Arc::new(EventBus::new()),
        config,
    );
    reflection
        .set_evaluator(Some(Arc::new(ApprovingEvaluator)))
        .await;

    reflection
        .run("s1", &turn("Because A, therefore B, since C."))
        .await;
    assert!(f.store.is_empty(REFLECTION));
}

//! `mx-memory` — the knowledge and reflection memory pipelines.
//!
//! After every foreground turn a background job runs through here:
//! interaction data is collected, facts are extracted and measured
//! against existing memory (LLM-assisted with a similarity-only
//! fallback), and surviving actions are persisted to the vector store.
//! When the user input carries reasoning, a second pipeline extracts the
//! trace, has a separate evaluator score it, and stores it in the
//! reflection collection.
//!
//! Failures anywhere in this crate are recovered locally: they reach
//! logs and the event bus, never the foreground response.

pub mod decision;
pub mod embedding;
pub mod interaction;
pub mod knowledge;
pub mod pipeline;
pub mod reflection;
pub mod store;
pub mod types;

pub use embedding::{Embedder, EmbeddingManager};
pub use interaction::{collect_interaction, TurnRecord};
pub use knowledge::{
    extract_facts, DefaultKnowledgeTool, Fact, KnowledgeCore, WorkspaceMemoryTool, KNOWLEDGE_TOOL,
    WORKSPACE_TOOL,
};
pub use pipeline::{KnowledgePipeline, PipelineInput, RunOverrides};
pub use reflection::{
    ExtractReasoningStepsTool, ReasoningDetector, ReflectionPipeline, StoreReasoningMemoryTool,
    EXTRACT_TOOL, STORE_TRACE_TOOL,
};
pub use store::{InMemoryVectorStore, ScoredPoint, VectorStore};
pub use types::{
    MemoryAction, MemoryEvent, MemoryHit, QualitySource, ReasoningStep, ReasoningTrace, StepKind,
    TraceEvaluation, KNOWLEDGE_ID_MAX, KNOWLEDGE_ID_MIN, REFLECTION_ID_MAX, REFLECTION_ID_MIN,
};

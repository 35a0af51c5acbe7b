use serde::{Deserialize, Serialize};

use super::env_flag;
use crate::config::EvaluationConfig;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Memory pipelines
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Settings for the knowledge and reflection memory pipelines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Globally disable all embedding-backed memory work.
    #[serde(default)]
    pub embeddings_disabled: bool,
    /// Run the workspace-memory tool after each turn.
    #[serde(default)]
    pub use_workspace_memory: bool,
    /// Skip the default knowledge tool.
    #[serde(default)]
    pub disable_default_memory: bool,
    /// Skip the reflection pipeline.
    #[serde(default)]
    pub disable_reflection: bool,

    #[serde(default)]
    pub options: MemoryOptions,

    /// Vector-store collection for knowledge entries.
    #[serde(default = "d_knowledge_collection")]
    pub knowledge_collection: String,
    /// Vector-store collection for reasoning traces.
    #[serde(default = "d_reflection_collection")]
    pub reflection_collection: String,

    /// Minimum detector confidence before the reflection pipeline runs.
    #[serde(default = "d_detector_threshold")]
    pub reasoning_detector_threshold: f32,
    /// Evaluator model for reasoning traces.
    #[serde(default)]
    pub evaluation: EvaluationConfig,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            embeddings_disabled: false,
            use_workspace_memory: false,
            disable_default_memory: false,
            disable_reflection: false,
            options: MemoryOptions::default(),
            knowledge_collection: d_knowledge_collection(),
            reflection_collection: d_reflection_collection(),
            reasoning_detector_threshold: d_detector_threshold(),
            evaluation: EvaluationConfig::default(),
        }
    }
}

impl MemoryConfig {
    pub fn apply_env(&mut self) {
        self.embeddings_disabled |=
            env_flag("DISABLE_EMBEDDINGS") || env_flag("EMBEDDING_DISABLED");
        self.use_workspace_memory |= env_flag("USE_WORKSPACE_MEMORY");
        self.disable_default_memory |= env_flag("DISABLE_DEFAULT_MEMORY");
        self.disable_reflection |= env_flag("DISABLE_REFLECTION_MEMORY");
    }
}

/// Per-run knowledge-tool options. Callers may override these per turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryOptions {
    /// Vector-search hits below this score are ignored.
    #[serde(default = "d_similarity_threshold")]
    pub similarity_threshold: f32,
    #[serde(default = "d_max_similar")]
    pub max_similar_results: usize,
    /// Consult the decision LLM before falling back to similarity rules.
    #[serde(default = "d_true")]
    pub use_llm_decisions: bool,
    /// Decisions below this confidence are demoted to NONE.
    #[serde(default = "d_confidence_threshold")]
    pub confidence_threshold: f32,
    #[serde(default = "d_true")]
    pub enable_delete_operations: bool,
}

impl Default for MemoryOptions {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.7,
            max_similar_results: 5,
            use_llm_decisions: true,
            confidence_threshold: 0.4,
            enable_delete_operations: true,
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_knowledge_collection() -> String {
    "matrix_knowledge".into()
}
fn d_reflection_collection() -> String {
    "matrix_reflection".into()
}
fn d_detector_threshold() -> f32 {
    0.5
}
fn d_similarity_threshold() -> f32 {
    0.7
}
fn d_max_similar() -> usize {
    5
}
fn d_confidence_threshold() -> f32 {
    0.4
}
fn d_true() -> bool {
    true
}

use serde::Serialize;

/// Structured trace events emitted across all Matrix crates.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum TraceEvent {
    SessionInitialized {
        session_id: String,
        provider: String,
        history_backend: String,
    },
    SessionRestored {
        session_id: String,
        messages: usize,
        strategy: String,
    },
    TurnCompleted {
        session_id: String,
        iterations: usize,
        tool_calls: usize,
    },
    HistorySaved {
        session_id: String,
        backend: String,
        seq: i64,
    },
    WalFlushed {
        entries: usize,
        backend: String,
    },
    MemoryDecision {
        session_id: String,
        operation: String,
        confidence: f32,
        quality_source: String,
    },
    ReflectionStored {
        session_id: String,
        steps: usize,
        quality_score: f32,
    },
    EmbeddingsDisabled {
        reason: String,
    },
    ToolDispatched {
        tool_name: String,
        source: String,
        duration_ms: u64,
        is_error: bool,
    },
}

impl TraceEvent {
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();
        tracing::info!(trace_event = %json, "mx_event");
    }
}

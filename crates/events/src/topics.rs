//! Event type names used across the runtime.

pub const LLM_THINKING: &str = "llm:thinking";
pub const LLM_RESPONSE_STARTED: &str = "llm:responseStarted";
pub const LLM_RESPONSE_COMPLETED: &str = "llm:responseCompleted";
pub const LLM_RESPONSE_ERROR: &str = "llm:responseError";

pub const TOOL_EXECUTED: &str = "tool:executed";
pub const TOOL_FAILED: &str = "tool:failed";

pub const MEMORY_OPERATION_COMPLETED: &str = "memory:operationCompleted";
pub const MEMORY_OPERATION_FAILED: &str = "memory:operationFailed";
pub const MEMORY_SEARCH_COMPLETED: &str = "memory:searchCompleted";

pub const REFLECTION_STORED: &str = "reflection:stored";
pub const REFLECTION_FAILED: &str = "reflection:failed";

pub const SESSION_CREATED: &str = "session:created";
pub const SESSION_DISCONNECTED: &str = "session:disconnected";

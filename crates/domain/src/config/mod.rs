//! Configuration types for the Matrix runtime.
//!
//! One module per concern. Everything is serde-deserializable (TOML or JSON)
//! with defaults on every field, and each concern exposes an `apply_env`
//! helper so the environment variables the core relies on are read in one
//! place rather than ad hoc at use sites.

mod llm;
mod mcp;
mod memory;
mod storage;
mod tools;

pub use llm::*;
pub use mcp::*;
pub use memory::*;
pub use storage::*;
pub use tools::*;

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub mcp: McpConfig,
    /// Optional system prompt prepended to every conversation.
    #[serde(default)]
    pub system_prompt: Option<String>,
}

impl Config {
    /// Overlay the environment variables the core honors onto a loaded
    /// config. File values lose to explicit env vars.
    pub fn apply_env(&mut self) {
        self.storage.apply_env();
        self.memory.apply_env();
        self.tools.apply_env();
    }
}

/// Deployment environment tag written into session metadata.
pub fn environment_tag() -> Option<String> {
    std::env::var("MATRIX_ENV")
        .or_else(|_| std::env::var("NODE_ENV"))
        .ok()
        .filter(|v| !v.is_empty())
}

/// True when the named env var is set to a truthy value.
pub(crate) fn env_flag(name: &str) -> bool {
    match std::env::var(name) {
        Ok(v) => !matches!(v.as_str(), "" | "0" | "false" | "no"),
        Err(_) => false,
    }
}

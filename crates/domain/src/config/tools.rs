use serde::{Deserialize, Serialize};

use super::env_flag;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Unified tool manager
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Hard deadline for a single tool execution.
    #[serde(default = "d_60000")]
    pub execution_timeout_ms: u64,
    /// How internal/remote name collisions are resolved.
    #[serde(default)]
    pub conflict_resolution: ConflictResolution,
    /// Tool surface exposed when running as an aggregating tool server.
    #[serde(default)]
    pub server_mode: ServerMode,
    /// Expose the umbrella `ask_matrix` tool.
    #[serde(default)]
    pub use_ask_matrix: bool,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            execution_timeout_ms: 60_000,
            conflict_resolution: ConflictResolution::default(),
            server_mode: ServerMode::default(),
            use_ask_matrix: false,
        }
    }
}

impl ToolsConfig {
    pub fn apply_env(&mut self) {
        if let Ok(strategy) = std::env::var("AGGREGATOR_CONFLICT_RESOLUTION") {
            if let Some(parsed) = ConflictResolution::parse(&strategy) {
                self.conflict_resolution = parsed;
            }
        }
        if let Ok(timeout) = std::env::var("AGGREGATOR_TIMEOUT") {
            if let Ok(ms) = timeout.parse() {
                self.execution_timeout_ms = ms;
            }
        }
        if let Ok(mode) = std::env::var("MCP_SERVER_MODE") {
            if mode.eq_ignore_ascii_case("aggregator") {
                self.server_mode = ServerMode::Aggregator;
            }
        }
        self.use_ask_matrix |= env_flag("USE_ASK_MATRIX");
    }
}

/// Resolution strategy when an internal and a remote tool share a name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictResolution {
    /// Internal tool keeps the bare name; the remote one gets a server prefix.
    #[default]
    PrefixInternal,
    /// The remote tool wins the bare name.
    PreferRemote,
    /// Whichever source registered first keeps the name.
    FirstWins,
    /// Collisions are a registration error.
    Error,
}

impl ConflictResolution {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "prefix-internal" | "prefix_internal" => Some(Self::PrefixInternal),
            "prefer-mcp" | "prefer-remote" | "prefer_mcp" => Some(Self::PreferRemote),
            "first-wins" | "first_wins" => Some(Self::FirstWins),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ServerMode {
    #[default]
    Default,
    Aggregator,
}

// ── serde default helpers ───────────────────────────────────────────

fn d_60000() -> u64 {
    60_000
}

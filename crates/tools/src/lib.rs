//! `mx-tools` — the unified tool manager.
//!
//! Two tool sources sit behind one execution interface: internal tools
//! (memory, reasoning, workspace, ...) registered in-process, and remote
//! tools discovered from tool servers via `mx-mcp-client`. The manager
//! routes by name, resolves collisions by the configured strategy, and
//! enforces a per-execution timeout.

pub mod internal;
pub mod manager;

pub use internal::{InternalTool, ToolInvocation};
pub use manager::{ToolRoute, UnifiedToolManager};

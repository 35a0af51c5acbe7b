//! `mx-mcp-client` — remote tool-server client for Matrix.
//!
//! Tool servers speak JSON-RPC 2.0 over a transport (stdio today, SSE
//! stubbed). The [`McpManager`] holds one connection per configured
//! server, discovers tools at handshake time, and dispatches calls. The
//! unified tool manager consumes the discovered tools and routes remote
//! executions through here.

pub mod manager;
pub mod protocol;
pub mod transport;

pub use manager::{McpError, McpManager, McpServer};
pub use protocol::{RemoteToolDef, ToolCallOutcome};
pub use transport::{StdioTransport, ToolTransport, TransportError};

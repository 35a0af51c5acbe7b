//! `mx-domain` — shared types for the Matrix runtime.
//!
//! Everything the other crates agree on lives here: the provider-agnostic
//! message model, the error taxonomy, persisted history records, the event
//! envelope carried on the bus, structured trace events, and the config
//! structs for every subsystem.

pub mod config;
pub mod error;
pub mod event;
pub mod message;
pub mod record;
pub mod trace;

pub use error::{Error, Result};
pub use event::{EventEnvelope, EventMetadata};
pub use message::{ContentPart, Message, MessageContent, Role, ToolCall, ToolDefinition};
pub use record::{HistoryRecord, RecordMetadata, RECORD_VERSION};

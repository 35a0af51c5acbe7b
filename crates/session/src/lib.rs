//! `mx-session` — the session runtime.
//!
//! A [`Session`] is one durable conversation: it lazily wires its LLM
//! service and history storage on first use, drives the foreground turn
//! through the LLM service, and hands back a first-class handle on the
//! background memory job. Process-wide collaborators (tool manager,
//! event bus, embedding manager, memory pipelines, session registry)
//! live in [`SharedServices`] and are shared by reference.

pub mod ask;
pub mod registry;
pub mod services;
pub mod session;

pub use ask::register_ask_matrix;
pub use registry::{SessionEntry, SessionRegistry};
pub use services::SharedServices;
pub use session::{RunOptions, Session, SessionOptions, StorageOwnership, TurnOutput};

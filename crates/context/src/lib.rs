//! `mx-context` — the per-session transcript and its provider shaping.
//!
//! A [`ContextManager`] holds the ordered transcript for one session,
//! merges the system prompt at send time, persists every append to the
//! bound history provider before returning, and delegates per-provider
//! message shaping to a [`MessageFormatter`].

pub mod format;
pub mod manager;

pub use format::{
    formatter_for, FormattedConversation, MessageFormatter, ProviderFamily,
};
pub use manager::ContextManager;

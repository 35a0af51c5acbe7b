//! `mx-providers` — LLM backends and the per-session LLM service.
//!
//! A [`ChatBackend`] is a thin wire adapter for one provider family
//! (OpenAI-compatible including Azure, or Anthropic). The [`LlmService`]
//! drives the tool-calling loop on top of a backend: it owns retries,
//! tool-call parsing, transcript appends through the context manager, and
//! event emission. `direct_generate` bypasses all of that for internal
//! subsystems (memory decisions, reasoning evaluation).

pub mod anthropic;
pub mod backend;
pub mod openai_compat;
pub mod service;

pub use backend::{
    backend_for, ChatBackend, ProviderRequest, ProviderResponse, TextCompletion, ToolChoice,
};
pub use service::LlmService;

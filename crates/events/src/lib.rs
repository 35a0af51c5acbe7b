//! `mx-events` — in-process event bus and metrics for the Matrix runtime.
//!
//! The bus keeps two subscriber maps: service-level (process-scoped) and
//! session-level (scoped by session id). Fan-out never blocks the
//! publisher; a subscriber that falls behind loses events with a warning.
//! The metrics collector consumes bus events into counters and histograms
//! and renders them as Prometheus text or JSON. Nothing here is durable.

pub mod bus;
pub mod metrics;
pub mod topics;

pub use bus::EventBus;
pub use metrics::{MetricsCollector, MetricsSnapshot};

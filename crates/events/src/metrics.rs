//! In-process metrics fed by bus events.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use mx_domain::event::EventEnvelope;

use crate::bus::EventBus;
use crate::topics;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Histogram
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Running summary of observed durations (milliseconds).
#[derive(Debug, Clone, Default, Serialize)]
pub struct Histogram {
    pub count: u64,
    pub sum_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
}

impl Histogram {
    fn observe(&mut self, value_ms: f64) {
        if self.count == 0 || value_ms < self.min_ms {
            self.min_ms = value_ms;
        }
        if value_ms > self.max_ms {
            self.max_ms = value_ms;
        }
        self.count += 1;
        self.sum_ms += value_ms;
    }

    pub fn mean_ms(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum_ms / self.count as f64
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// MetricsCollector
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Counters and histograms maintained from bus events. In-process only;
/// exporters render point-in-time snapshots.
#[derive(Default)]
pub struct MetricsCollector {
    counters: RwLock<HashMap<String, u64>>,
    histograms: RwLock<HashMap<String, Histogram>>,
}

/// A point-in-time copy of all metrics.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub counters: HashMap<String, u64>,
    pub histograms: HashMap<String, Histogram>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self, name: &str) {
        *self.counters.write().entry(name.to_owned()).or_default() += 1;
    }

    pub fn observe(&self, name: &str, value_ms: f64) {
        self.histograms
            .write()
            .entry(name.to_owned())
            .or_default()
            .observe(value_ms);
    }

    /// Update metrics from a single bus event.
    pub fn record(&self, event: &EventEnvelope) {
        self.increment("events_total");
        let duration_ms = event
            .data
            .get("duration_ms")
            .and_then(|v| v.as_f64());

        match event.event_type.as_str() {
            topics::TOOL_EXECUTED => {
                self.increment("tool_execution_count");
                if let Some(ms) = duration_ms {
                    self.observe("tool_execution_duration", ms);
                }
            }
            topics::TOOL_FAILED => self.increment("tool_execution_error_count"),
            topics::LLM_RESPONSE_COMPLETED => self.increment("llm_response_count"),
            topics::LLM_RESPONSE_ERROR => self.increment("llm_response_error_count"),
            topics::MEMORY_SEARCH_COMPLETED => {
                if let Some(ms) = duration_ms {
                    self.observe("memory_search_duration", ms);
                }
            }
            topics::MEMORY_OPERATION_COMPLETED => self.increment("memory_operation_count"),
            topics::MEMORY_OPERATION_FAILED => self.increment("memory_operation_error_count"),
            topics::REFLECTION_STORED => self.increment("reflection_stored_count"),
            _ => {}
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            counters: self.counters.read().clone(),
            histograms: self.histograms.read().clone(),
        }
    }

    /// Render the snapshot in the Prometheus exposition format.
    pub fn export_prometheus(&self) -> String {
        let snap = self.snapshot();
        let mut out = String::new();

        let mut counters: Vec<_> = snap.counters.into_iter().collect();
        counters.sort_by(|a, b| a.0.cmp(&b.0));
        for (name, value) in counters {
            out.push_str(&format!("# TYPE matrix_{name} counter\n"));
            out.push_str(&format!("matrix_{name} {value}\n"));
        }

        let mut histograms: Vec<_> = snap.histograms.into_iter().collect();
        histograms.sort_by(|a, b| a.0.cmp(&b.0));
        for (name, h) in histograms {
            out.push_str(&format!("# TYPE matrix_{name}_ms summary\n"));
            out.push_str(&format!("matrix_{name}_ms_count {}\n", h.count));
            out.push_str(&format!("matrix_{name}_ms_sum {}\n", h.sum_ms));
        }
        out
    }

    /// Render the snapshot as JSON.
    pub fn export_json(&self) -> serde_json::Value {
        serde_json::to_value(self.snapshot()).unwrap_or_default()
    }
}

/// Spawn a task that feeds every bus event into the collector.
pub fn spawn_collector(bus: &EventBus, metrics: Arc<MetricsCollector>) -> tokio::task::JoinHandle<()> {
    let mut rx = bus.subscribe_service();
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            metrics.record(&event);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(event_type: &str, data: serde_json::Value) -> EventEnvelope {
        EventEnvelope::new(event_type, data)
    }

    #[test]
    fn tool_events_update_counter_and_histogram() {
        let metrics = MetricsCollector::new();
        metrics.record(&event(
            topics::TOOL_EXECUTED,
            serde_json::json!({"duration_ms": 12.0}),
        ));
        metrics.record(&event(
            topics::TOOL_EXECUTED,
            serde_json::json!({"duration_ms": 30.0}),
        ));

        let snap = metrics.snapshot();
        assert_eq!(snap.counters["tool_execution_count"], 2);
        let h = &snap.histograms["tool_execution_duration"];
        assert_eq!(h.count, 2);
        assert_eq!(h.min_ms, 12.0);
        assert_eq!(h.max_ms, 30.0);
        assert_eq!(h.mean_ms(), 21.0);
    }

    #[test]
    fn error_events_counted_separately() {
        let metrics = MetricsCollector::new();
        metrics.record(&event(topics::LLM_RESPONSE_ERROR, serde_json::json!({})));
        let snap = metrics.snapshot();
        assert_eq!(snap.counters["llm_response_error_count"], 1);
        assert!(!snap.counters.contains_key("llm_response_count"));
    }

    #[test]
    fn prometheus_export_contains_counters() {
        let metrics = MetricsCollector::new();
        metrics.record(&event(topics::TOOL_EXECUTED, serde_json::json!({})));
        let text = metrics.export_prometheus();
        assert!(text.contains("matrix_tool_execution_count 1"));
        assert!(text.contains("# TYPE matrix_tool_execution_count counter"));
    }

    #[tokio::test]
    async fn collector_task_consumes_bus_events() {
        let bus = EventBus::new();
        let metrics = Arc::new(MetricsCollector::new());
        let handle = spawn_collector(&bus, metrics.clone());

        bus.emit_service(topics::TOOL_EXECUTED, serde_json::json!({"duration_ms": 5.0}));
        // Give the collector task a tick to drain.
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        assert_eq!(metrics.snapshot().counters.get("tool_execution_count"), Some(&1));
        handle.abort();
    }
}

//! Write-ahead-log history provider.
//!
//! Appends are synchronous and in-memory; a background task flushes the
//! buffer to a [`WalSink`] every `flush_interval_ms`. A failed flush keeps
//! the batch queued for the next tick, so no record is ever dropped — at
//! the cost of buffer growth while the sink is down. Overflowing
//! `max_entries` fails the write loudly.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use mx_domain::config::WalConfig;
use mx_domain::error::{Error, Result};
use mx_domain::message::Message;
use mx_domain::trace::TraceEvent;

use crate::provider::HistoryProvider;

/// One buffered write.
#[derive(Debug, Clone)]
pub struct WalEntry {
    pub session_id: String,
    pub message: Message,
    pub enqueued_at: DateTime<Utc>,
}

/// Destination the WAL drains into on each flush tick.
#[async_trait::async_trait]
pub trait WalSink: Send + Sync {
    fn sink_name(&self) -> &str;
    async fn persist(&self, batch: &[WalEntry]) -> Result<()>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// WalProvider
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct WalProvider {
    entries: Mutex<Vec<WalEntry>>,
    sink: Arc<dyn WalSink>,
    max_entries: usize,
    flush_task: Mutex<Option<JoinHandle<()>>>,
}

impl WalProvider {
    /// Create the provider and start its flush timer.
    pub fn spawn(sink: Arc<dyn WalSink>, config: &WalConfig) -> Arc<Self> {
        let provider = Arc::new(Self {
            entries: Mutex::new(Vec::new()),
            sink,
            max_entries: config.max_entries,
            flush_task: Mutex::new(None),
        });

        let weak = Arc::downgrade(&provider);
        let interval = Duration::from_millis(config.flush_interval_ms.max(1));
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(provider) = weak.upgrade() else {
                    break;
                };
                if let Err(e) = provider.flush_now().await {
                    tracing::warn!(error = %e, "WAL flush failed, batch retained");
                }
            }
        });
        *provider.flush_task.lock() = Some(task);
        provider
    }

    /// Number of currently buffered entries.
    pub fn pending(&self) -> usize {
        self.entries.lock().len()
    }

    /// Unflushed entries for one session, in append order.
    pub fn tail(&self, session_id: &str) -> Vec<Message> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.session_id == session_id)
            .map(|e| e.message.clone())
            .collect()
    }

    /// Drain the buffer into the sink. On sink failure the batch stays
    /// queued; entries appended during the flush are untouched.
    pub async fn flush_now(&self) -> Result<()> {
        let batch: Vec<WalEntry> = {
            let entries = self.entries.lock();
            if entries.is_empty() {
                return Ok(());
            }
            entries.clone()
        };

        self.sink.persist(&batch).await?;

        let mut entries = self.entries.lock();
        let drain_len = batch.len().min(entries.len());
        entries.drain(..drain_len);
        TraceEvent::WalFlushed {
            entries: batch.len(),
            backend: self.sink.sink_name().to_owned(),
        }
        .emit();
        Ok(())
    }
}

#[async_trait::async_trait]
impl HistoryProvider for WalProvider {
    fn backend_name(&self) -> &str {
        "wal"
    }

    async fn save_message(&self, session_id: &str, message: &Message) -> Result<()> {
        let mut entries = self.entries.lock();
        if entries.len() >= self.max_entries {
            return Err(Error::HistoryProvider(format!(
                "WAL overflow: {} entries buffered and the sink is not draining",
                entries.len()
            )));
        }
        entries.push(WalEntry {
            session_id: session_id.to_owned(),
            message: message.clone(),
            enqueued_at: Utc::now(),
        });
        Ok(())
    }

    async fn load_messages(&self, session_id: &str) -> Result<Vec<Message>> {
        Ok(self.tail(session_id))
    }

    async fn clear_messages(&self, session_id: &str) -> Result<()> {
        self.entries.lock().retain(|e| e.session_id != session_id);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if let Some(task) = self.flush_task.lock().take() {
            task.abort();
        }
        self.flush_now().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RecordingSink {
        batches: Mutex<Vec<usize>>,
        fail: std::sync::atomic::AtomicBool,
    }

    impl RecordingSink {
        fn new() -> Self {
            Self {
                batches: Mutex::new(Vec::new()),
                fail: std::sync::atomic::AtomicBool::new(false),
            }
        }
    }

    #[async_trait::async_trait]
    impl WalSink for RecordingSink {
        fn sink_name(&self) -> &str {
            "recording"
        }

        async fn persist(&self, batch: &[WalEntry]) -> Result<()> {
            if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(Error::HistoryProvider("sink down".into()));
            }
            self.batches.lock().push(batch.len());
            Ok(())
        }
    }

    fn wal_config(max_entries: usize) -> WalConfig {
        WalConfig {
            // Long interval so tests drive flushes explicitly.
            flush_interval_ms: 3_600_000,
            max_entries,
        }
    }

    #[tokio::test]
    async fn flush_drains_buffer_into_sink() {
        let sink = Arc::new(RecordingSink::new());
        let wal = WalProvider::spawn(sink.clone(), &wal_config(100));

        wal.save_message("s1", &Message::user("one")).await.unwrap();
        wal.save_message("s1", &Message::user("two")).await.unwrap();
        assert_eq!(wal.pending(), 2);

        wal.flush_now().await.unwrap();
        assert_eq!(wal.pending(), 0);
        assert_eq!(*sink.batches.lock(), vec![2]);
    }

    #[tokio::test]
    async fn failed_flush_retains_batch() {
        let sink = Arc::new(RecordingSink::new());
        sink.fail.store(true, std::sync::atomic::Ordering::SeqCst);
        let wal = WalProvider::spawn(sink.clone(), &wal_config(100));

        wal.save_message("s1", &Message::user("one")).await.unwrap();
        assert!(wal.flush_now().await.is_err());
        assert_eq!(wal.pending(), 1);

        sink.fail.store(false, std::sync::atomic::Ordering::SeqCst);
        wal.flush_now().await.unwrap();
        assert_eq!(wal.pending(), 0);
    }

    #[tokio::test]
    async fn overflow_fails_loudly() {
        let sink = Arc::new(RecordingSink::new());
        let wal = WalProvider::spawn(sink, &wal_config(2));

        wal.save_message("s1", &Message::user("one")).await.unwrap();
        wal.save_message("s1", &Message::user("two")).await.unwrap();
        let err = wal
            .save_message("s1", &Message::user("three"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("overflow"));
    }

    #[tokio::test]
    async fn tail_is_scoped_by_session() {
        let sink = Arc::new(RecordingSink::new());
        let wal = WalProvider::spawn(sink, &wal_config(100));

        wal.save_message("s1", &Message::user("mine")).await.unwrap();
        wal.save_message("s2", &Message::user("other")).await.unwrap();

        let tail = wal.load_messages("s1").await.unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].content.extract_all_text(), "mine");
    }

    #[tokio::test]
    async fn timer_flushes_without_explicit_call() {
        let sink = Arc::new(RecordingSink::new());
        let config = WalConfig {
            flush_interval_ms: 10,
            max_entries: 100,
        };
        let wal = WalProvider::spawn(sink.clone(), &config);
        wal.save_message("s1", &Message::user("one")).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(wal.pending(), 0);
        assert!(!sink.batches.lock().is_empty());
    }
}

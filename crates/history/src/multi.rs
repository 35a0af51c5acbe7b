//! Multi-backend history provider.
//!
//! Owns a primary, a backup, and a WAL. Every write lands in the WAL
//! synchronously and is fanned out to primary and backup on the flush
//! tick. Reads prefer the primary within a 250 ms budget, fall back to
//! the backup, and surface the WAL tail when both fail. Reads always
//! include the unflushed tail so a restore immediately after a write
//! sees the full transcript.

use std::sync::Arc;
use std::time::Duration;

use mx_domain::config::WalConfig;
use mx_domain::error::{Error, Result};
use mx_domain::message::Message;

use crate::provider::HistoryProvider;
use crate::wal::{WalEntry, WalProvider, WalSink};

/// How long a primary read may take before the backup is consulted.
const PRIMARY_READ_BUDGET: Duration = Duration::from_millis(250);

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Fan-out sink
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct FanOutSink {
    primary: Arc<dyn HistoryProvider>,
    backup: Arc<dyn HistoryProvider>,
}

impl FanOutSink {
    async fn drain_into(provider: &dyn HistoryProvider, batch: &[WalEntry]) -> Result<()> {
        for entry in batch {
            provider
                .save_message(&entry.session_id, &entry.message)
                .await?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl WalSink for FanOutSink {
    fn sink_name(&self) -> &str {
        "fan-out"
    }

    /// The batch is considered flushed once at least one backend holds it;
    /// the other backend's failure is logged. Only a double failure keeps
    /// the batch queued.
    async fn persist(&self, batch: &[WalEntry]) -> Result<()> {
        let primary_result = Self::drain_into(self.primary.as_ref(), batch).await;
        let backup_result = Self::drain_into(self.backup.as_ref(), batch).await;

        match (&primary_result, &backup_result) {
            (Ok(()), Ok(())) => Ok(()),
            (Ok(()), Err(e)) => {
                tracing::warn!(error = %e, "backup history write failed");
                Ok(())
            }
            (Err(e), Ok(())) => {
                tracing::warn!(error = %e, "primary history write failed");
                Ok(())
            }
            (Err(p), Err(b)) => Err(Error::HistoryProvider(format!(
                "both backends rejected the WAL batch (primary: {p}; backup: {b})"
            ))),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// MultiBackendProvider
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct MultiBackendProvider {
    primary: Arc<dyn HistoryProvider>,
    backup: Arc<dyn HistoryProvider>,
    wal: Arc<WalProvider>,
}

impl MultiBackendProvider {
    pub fn new(
        primary: Arc<dyn HistoryProvider>,
        backup: Arc<dyn HistoryProvider>,
        wal_config: &WalConfig,
    ) -> Self {
        let sink = Arc::new(FanOutSink {
            primary: primary.clone(),
            backup: backup.clone(),
        });
        let wal = WalProvider::spawn(sink, wal_config);
        Self {
            primary,
            backup,
            wal,
        }
    }

    /// Force a WAL flush (tests and shutdown paths).
    pub async fn flush(&self) -> Result<()> {
        self.wal.flush_now().await
    }

    async fn read_with_fallback(&self, session_id: &str) -> Vec<Message> {
        match tokio::time::timeout(PRIMARY_READ_BUDGET, self.primary.load_messages(session_id))
            .await
        {
            Ok(Ok(messages)) => return messages,
            Ok(Err(e)) => {
                tracing::warn!(session_id, error = %e, "primary history read failed");
            }
            Err(_) => {
                tracing::warn!(session_id, "primary history read exceeded 250ms budget");
            }
        }

        match self.backup.load_messages(session_id).await {
            Ok(messages) => messages,
            Err(e) => {
                tracing::warn!(session_id, error = %e, "backup history read failed, surfacing WAL tail");
                Vec::new()
            }
        }
    }
}

#[async_trait::async_trait]
impl HistoryProvider for MultiBackendProvider {
    fn backend_name(&self) -> &str {
        "multi"
    }

    async fn save_message(&self, session_id: &str, message: &Message) -> Result<()> {
        self.wal.save_message(session_id, message).await
    }

    async fn load_messages(&self, session_id: &str) -> Result<Vec<Message>> {
        let mut messages = self.read_with_fallback(session_id).await;
        messages.extend(self.wal.tail(session_id));
        Ok(messages)
    }

    async fn clear_messages(&self, session_id: &str) -> Result<()> {
        self.wal.clear_messages(session_id).await?;
        if let Err(e) = self.primary.clear_messages(session_id).await {
            tracing::warn!(session_id, error = %e, "primary history clear failed");
        }
        if let Err(e) = self.backup.clear_messages(session_id).await {
            tracing::warn!(session_id, error = %e, "backup history clear failed");
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.wal.close().await?;
        self.primary.close().await?;
        self.backup.close().await
    }
}

//! Database-backed history provider (the primary).

use std::sync::Arc;

use chrono::Utc;

use mx_domain::error::Result;
use mx_domain::message::Message;
use mx_domain::trace::TraceEvent;

use crate::provider::HistoryProvider;
use crate::storage::StorageManager;

/// Persists messages to the `conversation_messages` table keyed
/// `(session_id, seq)`. The sequence is allocated at save time, so append
/// order is the load order.
pub struct DatabaseProvider {
    manager: Arc<StorageManager>,
}

impl DatabaseProvider {
    pub fn new(manager: Arc<StorageManager>) -> Self {
        Self { manager }
    }
}

#[async_trait::async_trait]
impl HistoryProvider for DatabaseProvider {
    fn backend_name(&self) -> &str {
        self.manager.backend().as_str()
    }

    async fn save_message(&self, session_id: &str, message: &Message) -> Result<()> {
        let payload = serde_json::to_string(message)?;
        let seq = self.manager.max_seq(session_id).await? + 1;
        self.manager
            .insert_message(session_id, seq, &payload, &Utc::now().to_rfc3339())
            .await?;
        TraceEvent::HistorySaved {
            session_id: session_id.to_owned(),
            backend: self.backend_name().to_owned(),
            seq,
        }
        .emit();
        Ok(())
    }

    async fn load_messages(&self, session_id: &str) -> Result<Vec<Message>> {
        let payloads = self.manager.load_payloads(session_id).await?;
        let mut messages = Vec::with_capacity(payloads.len());
        for payload in payloads {
            match serde_json::from_str::<Message>(&payload) {
                Ok(msg) => messages.push(msg),
                Err(e) => {
                    tracing::warn!(
                        session_id = session_id,
                        error = %e,
                        "skipping malformed history row"
                    );
                }
            }
        }
        Ok(messages)
    }

    async fn clear_messages(&self, session_id: &str) -> Result<()> {
        self.manager.delete_session(session_id).await
    }

    async fn close(&self) -> Result<()> {
        self.manager.close().await;
        Ok(())
    }
}

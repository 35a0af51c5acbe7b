//! In-memory history provider.
//!
//! Used as a cheap backup backend and by tests. Not durable across
//! process restarts.

use std::collections::HashMap;

use parking_lot::RwLock;

use mx_domain::error::Result;
use mx_domain::message::Message;

use crate::provider::HistoryProvider;

#[derive(Default)]
pub struct InMemoryProvider {
    sessions: RwLock<HashMap<String, Vec<Message>>>,
}

impl InMemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl HistoryProvider for InMemoryProvider {
    fn backend_name(&self) -> &str {
        "memory"
    }

    async fn save_message(&self, session_id: &str, message: &Message) -> Result<()> {
        self.sessions
            .write()
            .entry(session_id.to_owned())
            .or_default()
            .push(message.clone());
        Ok(())
    }

    async fn load_messages(&self, session_id: &str) -> Result<Vec<Message>> {
        Ok(self
            .sessions
            .read()
            .get(session_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn clear_messages(&self, session_id: &str) -> Result<()> {
        self.sessions.write().remove(session_id);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

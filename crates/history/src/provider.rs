use mx_domain::error::Result;
use mx_domain::message::Message;

/// Durable backing store for session transcripts.
///
/// Implementations must be internally thread-safe: a provider may be shared
/// by every session using the same storage backend. Messages are persisted
/// in append order per session and load back in the same order.
#[async_trait::async_trait]
pub trait HistoryProvider: Send + Sync {
    /// Short backend identifier ("postgres", "sqlite", "wal", "multi", ...).
    fn backend_name(&self) -> &str;

    /// Append one message to the session's transcript.
    async fn save_message(&self, session_id: &str, message: &Message) -> Result<()>;

    /// Load the session's full transcript in append order.
    async fn load_messages(&self, session_id: &str) -> Result<Vec<Message>>;

    /// Delete the session's transcript.
    async fn clear_messages(&self, session_id: &str) -> Result<()>;

    /// Release the provider's resources. Safe to call more than once.
    async fn close(&self) -> Result<()>;
}

//! The per-session context manager.

use std::sync::Arc;

use parking_lot::RwLock;

use mx_domain::error::Result;
use mx_domain::message::{Message, ToolCall};
use mx_history::HistoryProvider;

use crate::format::{FormattedConversation, MessageFormatter};

/// Transcript entries kept when formatting for the provider. Older
/// messages beyond this window are truncated from the request (never
/// from the durable store).
const DEFAULT_HISTORY_WINDOW: usize = 100;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ContextManager
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Holds the ordered transcript for a session and mediates between the
/// history store and the provider formatter.
///
/// Invariant: after any `add_*` call returns, the message has been
/// handed to the bound history provider. Insertion order is preserved;
/// messages are never re-ordered after append.
pub struct ContextManager {
    session_id: String,
    formatter: Box<dyn MessageFormatter>,
    system_prompt: RwLock<Option<String>>,
    messages: RwLock<Vec<Message>>,
    provider: RwLock<Option<Arc<dyn HistoryProvider>>>,
    history_window: usize,
}

impl ContextManager {
    pub fn new(
        session_id: impl Into<String>,
        formatter: Box<dyn MessageFormatter>,
        system_prompt: Option<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            formatter,
            system_prompt: RwLock::new(system_prompt),
            messages: RwLock::new(Vec::new()),
            provider: RwLock::new(None),
            history_window: DEFAULT_HISTORY_WINDOW,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn formatter(&self) -> &dyn MessageFormatter {
        self.formatter.as_ref()
    }

    pub fn set_system_prompt(&self, prompt: Option<String>) {
        *self.system_prompt.write() = prompt;
    }

    // ── History provider binding ───────────────────────────────────

    pub fn bind_provider(&self, provider: Option<Arc<dyn HistoryProvider>>) {
        *self.provider.write() = provider;
    }

    pub fn provider(&self) -> Option<Arc<dyn HistoryProvider>> {
        self.provider.read().clone()
    }

    // ── Appends (save-before-return) ───────────────────────────────

    pub async fn add_user_message(
        &self,
        text: &str,
        image: Option<(&str, &str)>,
    ) -> Result<Message> {
        let message = match image {
            Some((data, mime)) => Message::user_with_image(text, data, mime),
            None => Message::user(text),
        };
        self.append_and_save(message).await
    }

    pub async fn add_assistant_message(
        &self,
        text: &str,
        tool_calls: Vec<ToolCall>,
    ) -> Result<Message> {
        let message = if tool_calls.is_empty() {
            Message::assistant(text)
        } else {
            Message::assistant_with_tools(text, tool_calls)
        };
        self.append_and_save(message).await
    }

    pub async fn add_tool_result(
        &self,
        call_id: &str,
        name: &str,
        payload: &str,
    ) -> Result<Message> {
        self.append_and_save(Message::tool_result(call_id, name, payload))
            .await
    }

    async fn append_and_save(&self, message: Message) -> Result<Message> {
        self.messages.write().push(message.clone());
        if let Some(provider) = self.provider() {
            // Write failures must not lose the turn; the in-memory
            // transcript stays authoritative for this session.
            if let Err(e) = provider.save_message(&self.session_id, &message).await {
                tracing::warn!(
                    session_id = %self.session_id,
                    error = %e,
                    "history save failed, continuing with in-memory transcript"
                );
            }
        }
        Ok(message)
    }

    // ── Reads ──────────────────────────────────────────────────────

    /// The full provider-ready conversation: system prompt merged,
    /// history truncated to the window, shaped by the formatter.
    pub fn formatted_messages(&self) -> FormattedConversation {
        let messages = self.messages.read();
        let window = windowed(&messages, self.history_window);
        let system = self.system_prompt.read().clone();
        self.formatter.format(system.as_deref(), window)
    }

    pub fn raw_messages(&self) -> Vec<Message> {
        self.messages.read().clone()
    }

    pub fn len(&self) -> usize {
        self.messages.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.read().is_empty()
    }

    /// Last `n` messages, oldest first (memory-pipeline context).
    pub fn recent_messages(&self, n: usize) -> Vec<Message> {
        let messages = self.messages.read();
        let start = messages.len().saturating_sub(n);
        messages[start..].to_vec()
    }

    // ── Restoration capabilities ───────────────────────────────────
    //
    // Three strategies, tried in order by the session: provider-driven
    // restore, bulk set, per-message append. The latter two never touch
    // the history provider — their input came from it.

    /// Strategy (a): load the transcript from the bound provider.
    pub async fn restore_via_provider(&self) -> Result<usize> {
        let provider = self.provider().ok_or_else(|| {
            mx_domain::error::Error::HistoryProvider("no history provider bound".into())
        })?;
        let restored = provider.load_messages(&self.session_id).await?;
        let count = restored.len();
        *self.messages.write() = restored;
        Ok(count)
    }

    /// Strategy (b): replace the transcript wholesale.
    pub fn set_messages(&self, messages: Vec<Message>) {
        *self.messages.write() = messages;
    }

    /// Strategy (c): append one already-persisted message.
    pub fn append_message(&self, message: Message) {
        self.messages.write().push(message);
    }

    pub fn clear_messages(&self) {
        self.messages.write().clear();
    }
}

/// Truncate to the last `window` messages without orphaning tool results:
/// the cut never lands between an assistant's tool calls and their results.
fn windowed(messages: &[Message], window: usize) -> &[Message] {
    if messages.len() <= window {
        return messages;
    }
    let mut start = messages.len() - window;
    while start < messages.len() && messages[start].role == mx_domain::message::Role::Tool {
        start += 1;
    }
    &messages[start..]
}

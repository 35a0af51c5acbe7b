//! Persisted session records.
//!
//! A [`HistoryRecord`] is the version-stamped JSON blob a session serializes
//! to and restores from. Functions (merge hooks, metadata schemas) are never
//! part of a record — they must be re-supplied at deserialization time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::message::Message;

/// Record format version written by this build. Mismatched versions restore
/// best-effort with a warning.
pub const RECORD_VERSION: &str = "2.0";

/// A serialized session: transcript plus the metadata needed to rebuild it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRecord {
    pub session_id: String,
    pub messages: Vec<Message>,
    pub metadata: RecordMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<serde_json::Value>,
    pub version: String,
    pub serialized_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordMetadata {
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    #[serde(default)]
    pub history_enabled: bool,
    /// Backend name the transcript was captured from ("postgres", "sqlite",
    /// "multi", or "none" for an ephemeral session).
    #[serde(default)]
    pub history_backend: String,
    /// Deployment environment tag the record was written under.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_memory_metadata: Option<serde_json::Value>,
}

impl HistoryRecord {
    /// Whether this record was written by the current format version.
    pub fn version_matches(&self) -> bool {
        self.version == RECORD_VERSION
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;

    #[test]
    fn record_roundtrips_and_preserves_order() {
        let record = HistoryRecord {
            session_id: "s1".into(),
            messages: vec![
                Message::user("hi"),
                Message::assistant("hello"),
                Message::user("bye"),
            ],
            metadata: RecordMetadata {
                created_at: Utc::now(),
                last_activity: Utc::now(),
                history_enabled: true,
                history_backend: "sqlite".into(),
                environment: Some("test".into()),
                session_memory_metadata: None,
            },
            options: None,
            version: RECORD_VERSION.into(),
            serialized_at: Utc::now(),
        };
        let json = serde_json::to_string(&record).unwrap();
        let parsed: HistoryRecord = serde_json::from_str(&json).unwrap();
        assert!(parsed.version_matches());
        assert_eq!(parsed.messages, record.messages);
    }

    #[test]
    fn stale_version_detected() {
        let mut record: HistoryRecord = serde_json::from_value(serde_json::json!({
            "sessionId": "s1",
            "messages": [],
            "metadata": {
                "createdAt": "2026-01-01T00:00:00Z",
                "lastActivity": "2026-01-01T00:00:00Z"
            },
            "version": "1.0",
            "serializedAt": "2026-01-01T00:00:00Z"
        }))
        .unwrap();
        assert!(!record.version_matches());
        record.version = RECORD_VERSION.into();
        assert!(record.version_matches());
    }
}

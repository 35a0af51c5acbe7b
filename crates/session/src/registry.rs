//! Process-level session registry.
//!
//! Tracks every session seen this process with its timestamps and turn
//! counter, flushed to `sessions.json` so callers can enumerate and
//! reattach after a restart.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use mx_domain::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEntry {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    #[serde(default)]
    pub turns: u64,
    #[serde(default)]
    pub history_backend: String,
}

pub struct SessionRegistry {
    path: PathBuf,
    entries: RwLock<HashMap<String, SessionEntry>>,
}

impl SessionRegistry {
    /// Load or create the registry at `state_dir/sessions.json`.
    pub fn new(state_dir: impl AsRef<Path>) -> Result<Self> {
        let dir = state_dir.as_ref();
        std::fs::create_dir_all(dir).map_err(Error::Io)?;
        let path = dir.join("sessions.json");

        let entries = if path.exists() {
            let raw = std::fs::read_to_string(&path).map_err(Error::Io)?;
            serde_json::from_str(&raw).unwrap_or_default()
        } else {
            HashMap::new()
        };

        Ok(Self {
            path,
            entries: RwLock::new(entries),
        })
    }

    /// Record a session, creating its entry on first sight.
    pub fn register(&self, session_id: &str, history_backend: &str) {
        let mut entries = self.entries.write();
        let now = Utc::now();
        entries
            .entry(session_id.to_owned())
            .and_modify(|e| {
                e.last_activity = now;
                e.history_backend = history_backend.to_owned();
            })
            .or_insert_with(|| SessionEntry {
                session_id: session_id.to_owned(),
                created_at: now,
                last_activity: now,
                turns: 0,
                history_backend: history_backend.to_owned(),
            });
    }

    /// Bump the turn counter and activity timestamp.
    pub fn record_turn(&self, session_id: &str) {
        let mut entries = self.entries.write();
        if let Some(entry) = entries.get_mut(session_id) {
            entry.turns += 1;
            entry.last_activity = Utc::now();
        }
    }

    pub fn get(&self, session_id: &str) -> Option<SessionEntry> {
        self.entries.read().get(session_id).cloned()
    }

    pub fn list(&self) -> Vec<SessionEntry> {
        self.entries.read().values().cloned().collect()
    }

    pub fn remove(&self, session_id: &str) {
        self.entries.write().remove(session_id);
    }

    /// Persist the registry to disk.
    pub fn flush(&self) -> Result<()> {
        let entries = self.entries.read();
        let json = serde_json::to_string_pretty(&*entries)?;
        std::fs::write(&self.path, json).map_err(Error::Io)
    }
}

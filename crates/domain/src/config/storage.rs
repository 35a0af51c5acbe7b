use serde::{Deserialize, Serialize};

use super::env_flag;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// History storage
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Durable-transcript configuration.
///
/// Backend choice is made once from this struct and cached: Postgres when a
/// URL or host+database pair is configured, SQLite otherwise.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Full Postgres connection URL (`PG_URL`). Takes precedence over the
    /// individual host/name fields.
    #[serde(default)]
    pub postgres_url: Option<String>,
    #[serde(default)]
    pub postgres_host: Option<String>,
    #[serde(default)]
    pub postgres_database: Option<String>,
    #[serde(default = "d_5432")]
    pub postgres_port: u16,
    #[serde(default)]
    pub postgres_user: Option<String>,
    #[serde(default)]
    pub postgres_password: Option<String>,
    #[serde(default)]
    pub postgres_ssl: bool,

    /// Directory for the SQLite fallback database.
    #[serde(default = "d_sqlite_path")]
    pub sqlite_path: String,
    #[serde(default = "d_sqlite_name")]
    pub sqlite_name: String,

    /// Use the multi-backend provider (primary + backup + WAL).
    #[serde(default)]
    pub multi_backend: bool,
    #[serde(default)]
    pub wal: WalConfig,

    /// Disable durable history entirely (ephemeral sessions).
    #[serde(default)]
    pub history_disabled: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            postgres_url: None,
            postgres_host: None,
            postgres_database: None,
            postgres_port: 5432,
            postgres_user: None,
            postgres_password: None,
            postgres_ssl: false,
            sqlite_path: d_sqlite_path(),
            sqlite_name: d_sqlite_name(),
            multi_backend: false,
            wal: WalConfig::default(),
            history_disabled: false,
        }
    }
}

impl StorageConfig {
    pub fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("PG_URL") {
            if !url.is_empty() {
                self.postgres_url = Some(url);
            }
        }
        if let Ok(host) = std::env::var("STORAGE_DATABASE_HOST") {
            if !host.is_empty() {
                self.postgres_host = Some(host);
            }
        }
        if let Ok(name) = std::env::var("STORAGE_DATABASE_NAME") {
            if !name.is_empty() {
                // Shared between backends: database name for Postgres,
                // file name for the SQLite fallback.
                self.postgres_database = Some(name.clone());
                self.sqlite_name = name;
            }
        }
        if let Ok(port) = std::env::var("STORAGE_DATABASE_PORT") {
            if let Ok(port) = port.parse() {
                self.postgres_port = port;
            }
        }
        if let Ok(user) = std::env::var("STORAGE_DATABASE_USER") {
            if !user.is_empty() {
                self.postgres_user = Some(user);
            }
        }
        if let Ok(password) = std::env::var("STORAGE_DATABASE_PASSWORD") {
            if !password.is_empty() {
                self.postgres_password = Some(password);
            }
        }
        self.postgres_ssl |= env_flag("STORAGE_DATABASE_SSL");
        if let Ok(path) = std::env::var("STORAGE_DATABASE_PATH") {
            if !path.is_empty() {
                self.sqlite_path = path;
            }
        }
        self.multi_backend |= env_flag("MULTI_BACKEND");
        self.wal.apply_env();
    }

    /// Whether Postgres is configured (URL, or host + database).
    pub fn postgres_configured(&self) -> bool {
        self.postgres_url.is_some()
            || (self.postgres_host.is_some() && self.postgres_database.is_some())
    }

    /// Build the effective Postgres connection URL.
    pub fn postgres_effective_url(&self) -> Option<String> {
        if let Some(url) = &self.postgres_url {
            return Some(url.clone());
        }
        let host = self.postgres_host.as_deref()?;
        let db = self.postgres_database.as_deref()?;
        let user = self.postgres_user.as_deref().unwrap_or("postgres");
        let auth = match self.postgres_password.as_deref() {
            Some(pw) => format!("{user}:{pw}"),
            None => user.to_string(),
        };
        let ssl = if self.postgres_ssl {
            "?sslmode=require"
        } else {
            ""
        };
        Some(format!(
            "postgres://{auth}@{host}:{}/{db}{ssl}",
            self.postgres_port
        ))
    }
}

/// Write-ahead-log settings for the multi-backend provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalConfig {
    /// Flush period in milliseconds (`WAL_FLUSH_INTERVAL`).
    #[serde(default = "d_5000")]
    pub flush_interval_ms: u64,
    /// Maximum buffered entries before writes fail loudly.
    #[serde(default = "d_100000")]
    pub max_entries: usize,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: 5000,
            max_entries: 100_000,
        }
    }
}

impl WalConfig {
    pub fn apply_env(&mut self) {
        if let Ok(ms) = std::env::var("WAL_FLUSH_INTERVAL") {
            if let Ok(ms) = ms.parse() {
                self.flush_interval_ms = ms;
            }
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_5432() -> u16 {
    5432
}
fn d_sqlite_path() -> String {
    ".matrix".into()
}
fn d_sqlite_name() -> String {
    "matrix-history.db".into()
}
fn d_5000() -> u64 {
    5000
}
fn d_100000() -> usize {
    100_000
}

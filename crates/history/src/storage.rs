//! Storage manager — owns the database pool behind the primary provider.
//!
//! The backend is resolved once from config (Postgres when a URL or
//! host+database pair is present, SQLite otherwise) and cached for the
//! process lifetime; sessions sharing a manager share the pool.

use std::path::Path;

use sqlx::postgres::PgPoolOptions;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::Row;

use mx_domain::config::StorageConfig;
use mx_domain::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Postgres,
    Sqlite,
}

impl StorageBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageBackend::Postgres => "postgres",
            StorageBackend::Sqlite => "sqlite",
        }
    }
}

enum Pool {
    Postgres(sqlx::PgPool),
    Sqlite(sqlx::SqlitePool),
}

/// A connected database with the message table ensured.
pub struct StorageManager {
    backend: StorageBackend,
    pool: Pool,
}

impl StorageManager {
    /// Connect according to config and create the schema if missing.
    pub async fn connect(config: &StorageConfig) -> Result<Self> {
        let manager = if config.postgres_configured() {
            let url = config
                .postgres_effective_url()
                .ok_or_else(|| Error::Config("incomplete postgres configuration".into()))?;
            let pool = PgPoolOptions::new()
                .max_connections(5)
                .connect(&url)
                .await
                .map_err(storage_err)?;
            tracing::info!(backend = "postgres", "history storage connected");
            Self {
                backend: StorageBackend::Postgres,
                pool: Pool::Postgres(pool),
            }
        } else {
            let dir = Path::new(&config.sqlite_path);
            std::fs::create_dir_all(dir).map_err(Error::Io)?;
            let file = dir.join(&config.sqlite_name);
            let opts = SqliteConnectOptions::new()
                .filename(&file)
                .create_if_missing(true);
            let pool = SqlitePoolOptions::new()
                .max_connections(5)
                .connect_with(opts)
                .await
                .map_err(storage_err)?;
            tracing::info!(backend = "sqlite", path = %file.display(), "history storage connected");
            Self {
                backend: StorageBackend::Sqlite,
                pool: Pool::Sqlite(pool),
            }
        };

        manager.ensure_schema().await?;
        Ok(manager)
    }

    pub fn backend(&self) -> StorageBackend {
        self.backend
    }

    async fn ensure_schema(&self) -> Result<()> {
        let ddl = "CREATE TABLE IF NOT EXISTS conversation_messages (
            session_id TEXT NOT NULL,
            seq BIGINT NOT NULL,
            payload TEXT NOT NULL,
            created_at TEXT NOT NULL,
            PRIMARY KEY (session_id, seq)
        )";
        match &self.pool {
            Pool::Postgres(pool) => {
                sqlx::query(ddl).execute(pool).await.map_err(storage_err)?;
            }
            Pool::Sqlite(pool) => {
                sqlx::query(ddl).execute(pool).await.map_err(storage_err)?;
            }
        }
        Ok(())
    }

    /// Highest sequence number stored for the session (0 when empty).
    pub async fn max_seq(&self, session_id: &str) -> Result<i64> {
        match &self.pool {
            Pool::Postgres(pool) => {
                let row = sqlx::query(
                    "SELECT COALESCE(MAX(seq), 0) AS max_seq \
                     FROM conversation_messages WHERE session_id = $1",
                )
                .bind(session_id)
                .fetch_one(pool)
                .await
                .map_err(storage_err)?;
                row.try_get::<i64, _>("max_seq").map_err(storage_err)
            }
            Pool::Sqlite(pool) => {
                let row = sqlx::query(
                    "SELECT COALESCE(MAX(seq), 0) AS max_seq \
                     FROM conversation_messages WHERE session_id = ?1",
                )
                .bind(session_id)
                .fetch_one(pool)
                .await
                .map_err(storage_err)?;
                row.try_get::<i64, _>("max_seq").map_err(storage_err)
            }
        }
    }

    pub async fn insert_message(
        &self,
        session_id: &str,
        seq: i64,
        payload: &str,
        created_at: &str,
    ) -> Result<()> {
        match &self.pool {
            Pool::Postgres(pool) => {
                sqlx::query(
                    "INSERT INTO conversation_messages (session_id, seq, payload, created_at) \
                     VALUES ($1, $2, $3, $4)",
                )
                .bind(session_id)
                .bind(seq)
                .bind(payload)
                .bind(created_at)
                .execute(pool)
                .await
                .map_err(storage_err)?;
            }
            Pool::Sqlite(pool) => {
                sqlx::query(
                    "INSERT INTO conversation_messages (session_id, seq, payload, created_at) \
                     VALUES (?1, ?2, ?3, ?4)",
                )
                .bind(session_id)
                .bind(seq)
                .bind(payload)
                .bind(created_at)
                .execute(pool)
                .await
                .map_err(storage_err)?;
            }
        }
        Ok(())
    }

    /// Message payloads for the session, ordered by sequence.
    pub async fn load_payloads(&self, session_id: &str) -> Result<Vec<String>> {
        match &self.pool {
            Pool::Postgres(pool) => {
                let rows = sqlx::query(
                    "SELECT payload FROM conversation_messages \
                     WHERE session_id = $1 ORDER BY seq ASC",
                )
                .bind(session_id)
                .fetch_all(pool)
                .await
                .map_err(storage_err)?;
                rows.into_iter()
                    .map(|row| row.try_get::<String, _>("payload").map_err(storage_err))
                    .collect()
            }
            Pool::Sqlite(pool) => {
                let rows = sqlx::query(
                    "SELECT payload FROM conversation_messages \
                     WHERE session_id = ?1 ORDER BY seq ASC",
                )
                .bind(session_id)
                .fetch_all(pool)
                .await
                .map_err(storage_err)?;
                rows.into_iter()
                    .map(|row| row.try_get::<String, _>("payload").map_err(storage_err))
                    .collect()
            }
        }
    }

    pub async fn delete_session(&self, session_id: &str) -> Result<()> {
        match &self.pool {
            Pool::Postgres(pool) => {
                sqlx::query("DELETE FROM conversation_messages WHERE session_id = $1")
                    .bind(session_id)
                    .execute(pool)
                    .await
                    .map_err(storage_err)?;
            }
            Pool::Sqlite(pool) => {
                sqlx::query("DELETE FROM conversation_messages WHERE session_id = ?1")
                    .bind(session_id)
                    .execute(pool)
                    .await
                    .map_err(storage_err)?;
            }
        }
        Ok(())
    }

    pub async fn close(&self) {
        match &self.pool {
            Pool::Postgres(pool) => pool.close().await,
            Pool::Sqlite(pool) => pool.close().await,
        }
    }
}

fn storage_err(e: sqlx::Error) -> Error {
    Error::HistoryProvider(e.to_string())
}

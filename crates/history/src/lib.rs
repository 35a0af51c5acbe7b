//! `mx-history` — durable transcript storage for Matrix sessions.
//!
//! Three concrete providers back the [`HistoryProvider`] trait:
//!
//! - [`DatabaseProvider`] — the primary, persisting messages to a table
//!   keyed `(session_id, seq)` over a [`StorageManager`] (Postgres when
//!   configured, SQLite otherwise; the choice is made once and cached).
//! - [`WalProvider`] — an in-memory append log flushed to a sink on a
//!   timer. Writes fail loudly when the buffer overflows; nothing is
//!   silently dropped.
//! - [`MultiBackendProvider`] — owns a primary, a backup, and a WAL.
//!   Writes land in the WAL synchronously and fan out on the flush tick;
//!   reads prefer the primary within a 250 ms budget, then the backup,
//!   then the WAL tail.

pub mod database;
pub mod memory;
pub mod multi;
pub mod provider;
pub mod storage;
pub mod wal;

pub use database::DatabaseProvider;
pub use memory::InMemoryProvider;
pub use multi::MultiBackendProvider;
pub use provider::HistoryProvider;
pub use storage::{StorageBackend, StorageManager};
pub use wal::{WalEntry, WalProvider, WalSink};

//! chainledger-storage — durable storage backends for ChainLedger.
//!
//! Backends:
//! - memory — re-exported from `chainledger-core` (dev/testing, no persistence)
//! - [`sqlite`] — SQLite via `sqlx` (embedded, single-file persistence)
//! - [`postgres`] — PostgreSQL via `sqlx` (pooled, production deployments)
//!
//! Every backend implements the same two traits, [`StateStore`] and
//! [`EventStore`], so the engine is backend-agnostic.
//!
//! [`StateStore`]: chainledger_core::store::StateStore
//! [`EventStore`]: chainledger_core::store::EventStore

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use chainledger_core::store::MemoryStore;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStorage;

#[cfg(feature = "postgres")]
pub use postgres::PostgresStorage;

//! PostgreSQL storage backend for ChainLedger.
//!
//! Persists indexing state, event rows, and block identifiers to PostgreSQL.
//! Uses `sqlx` with connection pooling for production deployments. The
//! idempotent insert relies on `ON CONFLICT DO NOTHING` with no conflict
//! target, so either uniqueness key short-circuits to a duplicate.
//!
//! # Feature Flag
//! Requires the `postgres` feature:
//! ```toml
//! chainledger-storage = { version = "0.2", features = ["postgres"] }
//! ```
//!
//! # Schema
//! Tables are created automatically on first connect:
//! - `chainledger_state` — one row per source (cursors, status, counters)
//! - `chainledger_events` — event rows under both uniqueness keys
//! - `chainledger_block_identifiers` — canonical identifiers for reorg checks

use async_trait::async_trait;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::{debug, info};

use chainledger_core::error::IngestError;
use chainledger_core::event::{IndexedEvent, PersistOutcome};
use chainledger_core::source::SourceId;
use chainledger_core::state::{IndexingState, SourceStatus};
use chainledger_core::store::{EventStore, StateStore};

// ─── Connection options ──────────────────────────────────────────────────────

/// Connection options for the Postgres storage backend.
#[derive(Debug, Clone)]
pub struct PostgresOptions {
    /// Maximum number of connections in the pool (default: 10)
    pub max_connections: u32,
    /// Minimum number of idle connections to keep open (default: 1)
    pub min_connections: u32,
    /// Connection timeout in seconds (default: 30)
    pub connect_timeout_secs: u64,
}

impl Default for PostgresOptions {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 1,
            connect_timeout_secs: 30,
        }
    }
}

// ─── PostgresStorage ─────────────────────────────────────────────────────────

/// PostgreSQL-backed store implementing both storage traits.
///
/// Thread-safe and cheaply cloneable — wraps a connection pool internally.
#[derive(Clone)]
pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    /// Connect to a PostgreSQL database and initialize the schema.
    ///
    /// The URL format follows libpq convention:
    /// `postgresql://[user[:password]@][host][:port][/dbname]`
    pub async fn connect(database_url: &str) -> Result<Self, IngestError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| IngestError::Storage(format!("postgres connect: {e}")))?;

        let storage = Self { pool };
        storage.init_schema().await?;
        info!("PostgresStorage connected and schema initialized");
        Ok(storage)
    }

    /// Connect with custom pool options.
    pub async fn connect_with_options(
        database_url: &str,
        opts: PostgresOptions,
    ) -> Result<Self, IngestError> {
        let pool = PgPoolOptions::new()
            .max_connections(opts.max_connections)
            .min_connections(opts.min_connections)
            .acquire_timeout(std::time::Duration::from_secs(opts.connect_timeout_secs))
            .connect(database_url)
            .await
            .map_err(|e| IngestError::Storage(format!("postgres connect: {e}")))?;

        let storage = Self { pool };
        storage.init_schema().await?;
        Ok(storage)
    }

    /// Create tables and indexes if they don't already exist.
    async fn init_schema(&self) -> Result<(), IngestError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS chainledger_state (
                chain_id               TEXT    NOT NULL,
                contract_address       TEXT    NOT NULL,
                event_type             TEXT    NOT NULL,
                last_scanned_block     BIGINT  NOT NULL,
                last_processed_block   BIGINT  NOT NULL,
                last_finalized_block   BIGINT  NOT NULL,
                status                 TEXT    NOT NULL,
                error_message          TEXT,
                total_event_count      BIGINT  NOT NULL DEFAULT 0,
                processed_event_count  BIGINT  NOT NULL DEFAULT 0,
                failed_event_count     BIGINT  NOT NULL DEFAULT 0,
                block_range_per_batch  BIGINT  NOT NULL,
                confirmations_required BIGINT  NOT NULL,
                max_retry_attempts     INTEGER NOT NULL,
                updated_at             BIGINT  NOT NULL,
                PRIMARY KEY (chain_id, contract_address, event_type)
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| IngestError::Storage(e.to_string()))?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS chainledger_events (
                chain_id         TEXT    NOT NULL,
                contract_address TEXT    NOT NULL,
                event_type       TEXT    NOT NULL,
                block_number     BIGINT  NOT NULL,
                log_index        BIGINT  NOT NULL,
                transaction_hash TEXT    NOT NULL,
                block_identifier TEXT    NOT NULL,
                event_data       JSONB   NOT NULL,
                parsed_data      JSONB   NOT NULL,
                confirmations    BIGINT  NOT NULL DEFAULT 0,
                is_finalized     BOOLEAN NOT NULL DEFAULT FALSE,
                is_processed     BOOLEAN NOT NULL DEFAULT FALSE,
                processing_error TEXT,
                retry_attempts   INTEGER NOT NULL DEFAULT 0,
                observed_at      BIGINT  NOT NULL,
                processed_at     BIGINT,
                PRIMARY KEY (chain_id, contract_address, event_type, block_number, log_index),
                UNIQUE (chain_id, contract_address, event_type, transaction_hash, log_index)
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| IngestError::Storage(e.to_string()))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_chainledger_events_pending
             ON chainledger_events (chain_id, contract_address, event_type,
                                    is_finalized, is_processed, block_number)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| IngestError::Storage(e.to_string()))?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS chainledger_block_identifiers (
                chain_id         TEXT   NOT NULL,
                contract_address TEXT   NOT NULL,
                event_type       TEXT   NOT NULL,
                block_number     BIGINT NOT NULL,
                identifier       TEXT   NOT NULL,
                PRIMARY KEY (chain_id, contract_address, event_type, block_number)
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| IngestError::Storage(e.to_string()))?;

        debug!("PostgresStorage schema initialized");
        Ok(())
    }

    fn state_from_row(row: &PgRow) -> Result<IndexingState, IngestError> {
        let status: String = row.get("status");
        Ok(IndexingState {
            source: SourceId::new(
                row.get::<String, _>("chain_id"),
                row.get::<String, _>("contract_address"),
                row.get::<String, _>("event_type"),
            ),
            last_scanned_block: row.get::<i64, _>("last_scanned_block") as u64,
            last_processed_block: row.get::<i64, _>("last_processed_block") as u64,
            last_finalized_block: row.get::<i64, _>("last_finalized_block") as u64,
            status: status.parse::<SourceStatus>().map_err(IngestError::Storage)?,
            error_message: row.get("error_message"),
            total_event_count: row.get::<i64, _>("total_event_count") as u64,
            processed_event_count: row.get::<i64, _>("processed_event_count") as u64,
            failed_event_count: row.get::<i64, _>("failed_event_count") as u64,
            block_range_per_batch: row.get::<i64, _>("block_range_per_batch") as u64,
            confirmations_required: row.get::<i64, _>("confirmations_required") as u64,
            max_retry_attempts: row.get::<i32, _>("max_retry_attempts") as u32,
            updated_at: row.get("updated_at"),
        })
    }

    fn event_from_row(row: &PgRow) -> IndexedEvent {
        IndexedEvent {
            source: SourceId::new(
                row.get::<String, _>("chain_id"),
                row.get::<String, _>("contract_address"),
                row.get::<String, _>("event_type"),
            ),
            block_number: row.get::<i64, _>("block_number") as u64,
            log_index: row.get::<i64, _>("log_index") as u64,
            transaction_hash: row.get("transaction_hash"),
            block_identifier: row.get("block_identifier"),
            event_data: row.get("event_data"),
            parsed_data: row.get("parsed_data"),
            confirmations: row.get::<i64, _>("confirmations") as u64,
            is_finalized: row.get("is_finalized"),
            is_processed: row.get("is_processed"),
            processing_error: row.get("processing_error"),
            retry_attempts: row.get::<i32, _>("retry_attempts") as u32,
            observed_at: row.get("observed_at"),
            processed_at: row.get("processed_at"),
        }
    }

    const EVENT_COLUMNS: &'static str =
        "chain_id, contract_address, event_type, block_number, log_index, transaction_hash, \
         block_identifier, event_data, parsed_data, confirmations, is_finalized, is_processed, \
         processing_error, retry_attempts, observed_at, processed_at";
}

// ─── StateStore impl ─────────────────────────────────────────────────────────

#[async_trait]
impl StateStore for PostgresStorage {
    async fn load(&self, source: &SourceId) -> Result<Option<IndexingState>, IngestError> {
        let row = sqlx::query(
            "SELECT * FROM chainledger_state
             WHERE chain_id = $1 AND contract_address = $2 AND event_type = $3",
        )
        .bind(&source.chain_id)
        .bind(&source.contract_address)
        .bind(&source.event_type)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| IngestError::Storage(e.to_string()))?;

        row.map(|r| Self::state_from_row(&r)).transpose()
    }

    async fn save(&self, state: &IndexingState) -> Result<(), IngestError> {
        sqlx::query(
            "INSERT INTO chainledger_state
             (chain_id, contract_address, event_type, last_scanned_block, last_processed_block,
              last_finalized_block, status, error_message, total_event_count,
              processed_event_count, failed_event_count, block_range_per_batch,
              confirmations_required, max_retry_attempts, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
             ON CONFLICT (chain_id, contract_address, event_type) DO UPDATE SET
                last_scanned_block = EXCLUDED.last_scanned_block,
                last_processed_block = EXCLUDED.last_processed_block,
                last_finalized_block = EXCLUDED.last_finalized_block,
                status = EXCLUDED.status,
                error_message = EXCLUDED.error_message,
                total_event_count = EXCLUDED.total_event_count,
                processed_event_count = EXCLUDED.processed_event_count,
                failed_event_count = EXCLUDED.failed_event_count,
                block_range_per_batch = EXCLUDED.block_range_per_batch,
                confirmations_required = EXCLUDED.confirmations_required,
                max_retry_attempts = EXCLUDED.max_retry_attempts,
                updated_at = EXCLUDED.updated_at",
        )
        .bind(&state.source.chain_id)
        .bind(&state.source.contract_address)
        .bind(&state.source.event_type)
        .bind(state.last_scanned_block as i64)
        .bind(state.last_processed_block as i64)
        .bind(state.last_finalized_block as i64)
        .bind(state.status.as_str())
        .bind(&state.error_message)
        .bind(state.total_event_count as i64)
        .bind(state.processed_event_count as i64)
        .bind(state.failed_event_count as i64)
        .bind(state.block_range_per_batch as i64)
        .bind(state.confirmations_required as i64)
        .bind(state.max_retry_attempts as i32)
        .bind(state.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| IngestError::Storage(e.to_string()))?;

        debug!(source = %state.source, status = %state.status, "state saved");
        Ok(())
    }

    async fn transition(
        &self,
        source: &SourceId,
        from: SourceStatus,
        to: SourceStatus,
    ) -> Result<bool, IngestError> {
        let result = sqlx::query(
            "UPDATE chainledger_state SET status = $1, updated_at = $2
             WHERE chain_id = $3 AND contract_address = $4 AND event_type = $5 AND status = $6",
        )
        .bind(to.as_str())
        .bind(chrono::Utc::now().timestamp())
        .bind(&source.chain_id)
        .bind(&source.contract_address)
        .bind(&source.event_type)
        .bind(from.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| IngestError::Storage(e.to_string()))?;

        Ok(result.rows_affected() == 1)
    }

    async fn delete(&self, source: &SourceId) -> Result<(), IngestError> {
        sqlx::query(
            "DELETE FROM chainledger_state
             WHERE chain_id = $1 AND contract_address = $2 AND event_type = $3",
        )
        .bind(&source.chain_id)
        .bind(&source.contract_address)
        .bind(&source.event_type)
        .execute(&self.pool)
        .await
        .map_err(|e| IngestError::Storage(e.to_string()))?;
        Ok(())
    }
}

// ─── EventStore impl ─────────────────────────────────────────────────────────

#[async_trait]
impl EventStore for PostgresStorage {
    async fn persist(&self, event: &IndexedEvent) -> Result<PersistOutcome, IngestError> {
        // No conflict target: any uniqueness violation becomes a no-op.
        let result = sqlx::query(
            "INSERT INTO chainledger_events
             (chain_id, contract_address, event_type, block_number, log_index,
              transaction_hash, block_identifier, event_data, parsed_data, confirmations,
              is_finalized, is_processed, processing_error, retry_attempts, observed_at,
              processed_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
             ON CONFLICT DO NOTHING",
        )
        .bind(&event.source.chain_id)
        .bind(&event.source.contract_address)
        .bind(&event.source.event_type)
        .bind(event.block_number as i64)
        .bind(event.log_index as i64)
        .bind(&event.transaction_hash)
        .bind(&event.block_identifier)
        .bind(&event.event_data)
        .bind(&event.parsed_data)
        .bind(event.confirmations as i64)
        .bind(event.is_finalized)
        .bind(event.is_processed)
        .bind(&event.processing_error)
        .bind(event.retry_attempts as i32)
        .bind(event.observed_at)
        .bind(event.processed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| IngestError::Storage(e.to_string()))?;

        if result.rows_affected() == 0 {
            debug!(
                source = %event.source,
                block_number = event.block_number,
                log_index = event.log_index,
                "duplicate event ignored"
            );
            Ok(PersistOutcome::Duplicate)
        } else {
            Ok(PersistOutcome::Inserted)
        }
    }

    async fn mark_finalized(
        &self,
        source: &SourceId,
        block_number: u64,
        log_index: u64,
        confirmations: u64,
    ) -> Result<(), IngestError> {
        let result = sqlx::query(
            "UPDATE chainledger_events SET confirmations = $1, is_finalized = TRUE
             WHERE chain_id = $2 AND contract_address = $3 AND event_type = $4
               AND block_number = $5 AND log_index = $6",
        )
        .bind(confirmations as i64)
        .bind(&source.chain_id)
        .bind(&source.contract_address)
        .bind(&source.event_type)
        .bind(block_number as i64)
        .bind(log_index as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| IngestError::Storage(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(IngestError::Storage(format!(
                "no event at {block_number}/{log_index} for {source}"
            )));
        }
        Ok(())
    }

    async fn mark_processed(
        &self,
        source: &SourceId,
        block_number: u64,
        log_index: u64,
        processed_at: i64,
    ) -> Result<(), IngestError> {
        let result = sqlx::query(
            "UPDATE chainledger_events
             SET is_processed = TRUE, processed_at = $1, processing_error = NULL
             WHERE chain_id = $2 AND contract_address = $3 AND event_type = $4
               AND block_number = $5 AND log_index = $6",
        )
        .bind(processed_at)
        .bind(&source.chain_id)
        .bind(&source.contract_address)
        .bind(&source.event_type)
        .bind(block_number as i64)
        .bind(log_index as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| IngestError::Storage(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(IngestError::Storage(format!(
                "no event at {block_number}/{log_index} for {source}"
            )));
        }
        Ok(())
    }

    async fn record_failure(
        &self,
        source: &SourceId,
        block_number: u64,
        log_index: u64,
        message: &str,
    ) -> Result<u32, IngestError> {
        let row = sqlx::query(
            "UPDATE chainledger_events
             SET retry_attempts = retry_attempts + 1, processing_error = $1
             WHERE chain_id = $2 AND contract_address = $3 AND event_type = $4
               AND block_number = $5 AND log_index = $6
             RETURNING retry_attempts",
        )
        .bind(message)
        .bind(&source.chain_id)
        .bind(&source.contract_address)
        .bind(&source.event_type)
        .bind(block_number as i64)
        .bind(log_index as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| IngestError::Storage(e.to_string()))?;

        match row {
            Some(r) => Ok(r.get::<i32, _>("retry_attempts") as u32),
            None => Err(IngestError::Storage(format!(
                "no event at {block_number}/{log_index} for {source}"
            ))),
        }
    }

    async fn unfinalized_at_or_below(
        &self,
        source: &SourceId,
        max_block: u64,
    ) -> Result<Vec<IndexedEvent>, IngestError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM chainledger_events
             WHERE chain_id = $1 AND contract_address = $2 AND event_type = $3
               AND is_finalized = FALSE AND block_number <= $4
             ORDER BY block_number, log_index",
            Self::EVENT_COLUMNS
        ))
        .bind(&source.chain_id)
        .bind(&source.contract_address)
        .bind(&source.event_type)
        .bind(max_block as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| IngestError::Storage(e.to_string()))?;

        Ok(rows.iter().map(Self::event_from_row).collect())
    }

    async fn pending(
        &self,
        source: &SourceId,
        max_retry_attempts: u32,
    ) -> Result<Vec<IndexedEvent>, IngestError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM chainledger_events
             WHERE chain_id = $1 AND contract_address = $2 AND event_type = $3
               AND is_finalized = TRUE AND is_processed = FALSE AND retry_attempts < $4
             ORDER BY block_number, log_index",
            Self::EVENT_COLUMNS
        ))
        .bind(&source.chain_id)
        .bind(&source.contract_address)
        .bind(&source.event_type)
        .bind(max_retry_attempts as i32)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| IngestError::Storage(e.to_string()))?;

        Ok(rows.iter().map(Self::event_from_row).collect())
    }

    async fn first_unprocessed_block(
        &self,
        source: &SourceId,
    ) -> Result<Option<u64>, IngestError> {
        let row = sqlx::query(
            "SELECT MIN(block_number) AS gap FROM chainledger_events
             WHERE chain_id = $1 AND contract_address = $2 AND event_type = $3
               AND is_processed = FALSE",
        )
        .bind(&source.chain_id)
        .bind(&source.contract_address)
        .bind(&source.event_type)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| IngestError::Storage(e.to_string()))?;

        Ok(row.get::<Option<i64>, _>("gap").map(|b| b as u64))
    }

    async fn delete_unfinalized_from(
        &self,
        source: &SourceId,
        from_block: u64,
    ) -> Result<u64, IngestError> {
        let result = sqlx::query(
            "DELETE FROM chainledger_events
             WHERE chain_id = $1 AND contract_address = $2 AND event_type = $3
               AND is_finalized = FALSE AND block_number >= $4",
        )
        .bind(&source.chain_id)
        .bind(&source.contract_address)
        .bind(&source.event_type)
        .bind(from_block as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| IngestError::Storage(e.to_string()))?;

        debug!(source = %source, from_block, deleted = result.rows_affected(), "rolled back events");
        Ok(result.rows_affected())
    }

    async fn record_block_identifier(
        &self,
        source: &SourceId,
        block_number: u64,
        identifier: &str,
    ) -> Result<(), IngestError> {
        sqlx::query(
            "INSERT INTO chainledger_block_identifiers
             (chain_id, contract_address, event_type, block_number, identifier)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (chain_id, contract_address, event_type, block_number)
             DO UPDATE SET identifier = EXCLUDED.identifier",
        )
        .bind(&source.chain_id)
        .bind(&source.contract_address)
        .bind(&source.event_type)
        .bind(block_number as i64)
        .bind(identifier)
        .execute(&self.pool)
        .await
        .map_err(|e| IngestError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn block_identifiers_in(
        &self,
        source: &SourceId,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<(u64, String)>, IngestError> {
        let rows = sqlx::query(
            "SELECT block_number, identifier FROM chainledger_block_identifiers
             WHERE chain_id = $1 AND contract_address = $2 AND event_type = $3
               AND block_number BETWEEN $4 AND $5
             ORDER BY block_number",
        )
        .bind(&source.chain_id)
        .bind(&source.contract_address)
        .bind(&source.event_type)
        .bind(from_block as i64)
        // u64::MAX would wrap negative as i64 and empty the range.
        .bind(to_block.min(i64::MAX as u64) as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| IngestError::Storage(e.to_string()))?;

        Ok(rows
            .iter()
            .map(|r| (r.get::<i64, _>("block_number") as u64, r.get("identifier")))
            .collect())
    }

    async fn delete_block_identifiers_from(
        &self,
        source: &SourceId,
        from_block: u64,
    ) -> Result<(), IngestError> {
        sqlx::query(
            "DELETE FROM chainledger_block_identifiers
             WHERE chain_id = $1 AND contract_address = $2 AND event_type = $3
               AND block_number >= $4",
        )
        .bind(&source.chain_id)
        .bind(&source.contract_address)
        .bind(&source.event_type)
        .bind(from_block as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| IngestError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn event_count(&self, source: &SourceId) -> Result<u64, IngestError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS cnt FROM chainledger_events
             WHERE chain_id = $1 AND contract_address = $2 AND event_type = $3",
        )
        .bind(&source.chain_id)
        .bind(&source.contract_address)
        .bind(&source.event_type)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| IngestError::Storage(e.to_string()))?;

        Ok(row.get::<i64, _>("cnt") as u64)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    // Integration tests require a running PostgreSQL instance.
    // Set DATABASE_URL to enable, e.g.:
    // DATABASE_URL=postgresql://localhost/chainledger_test cargo test -- --ignored

    use super::*;
    use chainledger_core::event::RawLog;
    use chainledger_core::state::SourceConfig;
    use serde_json::json;

    fn source() -> SourceId {
        SourceId::new("ethereum", "0xpgtest", "Transfer")
    }

    async fn connect() -> PostgresStorage {
        let url = std::env::var("DATABASE_URL")
            .expect("DATABASE_URL must be set for integration tests");
        PostgresStorage::connect(&url).await.unwrap()
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL (set DATABASE_URL to enable)"]
    async fn state_roundtrip_and_cas() {
        let store = connect().await;
        StateStore::delete(&store, &source()).await.unwrap();

        let state = IndexingState::new(source(), &SourceConfig::default());
        store.save(&state).await.unwrap();

        assert!(store
            .transition(&source(), SourceStatus::Idle, SourceStatus::Scanning)
            .await
            .unwrap());
        assert!(!store
            .transition(&source(), SourceStatus::Idle, SourceStatus::Scanning)
            .await
            .unwrap());

        let loaded = store.load(&source()).await.unwrap().unwrap();
        assert_eq!(loaded.status, SourceStatus::Scanning);

        StateStore::delete(&store, &source()).await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL (set DATABASE_URL to enable)"]
    async fn idempotent_persist_and_rollback() {
        let store = connect().await;
        store.delete_unfinalized_from(&source(), 0).await.unwrap();
        store.delete_block_identifiers_from(&source(), 0).await.unwrap();

        let raw = RawLog {
            block_number: 100,
            log_index: 2,
            transaction_hash: "0xabc".into(),
            block_identifier: "0xblk100".into(),
            topics: vec!["0xddf252ad".into()],
            data: "0x01".into(),
        };
        let event = IndexedEvent::from_raw(&source(), &raw, json!({ "value": "100" }));

        assert_eq!(store.persist(&event).await.unwrap(), PersistOutcome::Inserted);
        assert_eq!(store.persist(&event).await.unwrap(), PersistOutcome::Duplicate);
        assert_eq!(store.event_count(&source()).await.unwrap(), 1);

        let deleted = store.delete_unfinalized_from(&source(), 100).await.unwrap();
        assert_eq!(deleted, 1);
    }
}

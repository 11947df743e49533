//! SQLite storage backend for ChainLedger.
//!
//! Persists indexing state, event rows, and block identifiers to a single
//! SQLite file. Uses `sqlx` with WAL mode for concurrent read performance.
//! `INSERT OR IGNORE` against the two uniqueness keys is the idempotency
//! primitive; the status compare-and-set rides on a conditional `UPDATE`.
//!
//! # Usage
//! ```rust,no_run
//! use chainledger_storage::sqlite::SqliteStorage;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let store = SqliteStorage::open("./ledger.db").await?;
//!
//! // In-memory (tests / ephemeral)
//! let store = SqliteStorage::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::debug;

use chainledger_core::error::IngestError;
use chainledger_core::event::{IndexedEvent, PersistOutcome};
use chainledger_core::source::SourceId;
use chainledger_core::state::{IndexingState, SourceStatus};
use chainledger_core::store::{EventStore, StateStore};

/// SQLite-backed store implementing both storage traits.
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./ledger.db"`) or a full
    /// SQLite URL (`"sqlite:./ledger.db?mode=rwc"`).
    pub async fn open(path: &str) -> Result<Self, IngestError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };

        let pool = SqlitePool::connect(&url)
            .await
            .map_err(|e| IngestError::Storage(e.to_string()))?;

        let storage = Self { pool };
        storage.init_schema().await?;
        Ok(storage)
    }

    /// Open an in-memory SQLite database. All data is lost when the pool is
    /// dropped. Ideal for tests.
    pub async fn in_memory() -> Result<Self, IngestError> {
        // One connection only: every new `:memory:` connection would get its
        // own empty database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| IngestError::Storage(e.to_string()))?;

        let storage = Self { pool };
        storage.init_schema().await?;
        Ok(storage)
    }

    /// Create tables and enable WAL mode.
    async fn init_schema(&self) -> Result<(), IngestError> {
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await
            .map_err(|e| IngestError::Storage(e.to_string()))?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS indexing_state (
                chain_id               TEXT    NOT NULL,
                contract_address       TEXT    NOT NULL,
                event_type             TEXT    NOT NULL,
                last_scanned_block     INTEGER NOT NULL,
                last_processed_block   INTEGER NOT NULL,
                last_finalized_block   INTEGER NOT NULL,
                status                 TEXT    NOT NULL,
                error_message          TEXT,
                total_event_count      INTEGER NOT NULL DEFAULT 0,
                processed_event_count  INTEGER NOT NULL DEFAULT 0,
                failed_event_count     INTEGER NOT NULL DEFAULT 0,
                block_range_per_batch  INTEGER NOT NULL,
                confirmations_required INTEGER NOT NULL,
                max_retry_attempts     INTEGER NOT NULL,
                updated_at             INTEGER NOT NULL,
                PRIMARY KEY (chain_id, contract_address, event_type)
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| IngestError::Storage(e.to_string()))?;

        // Both uniqueness keys of the event identity, scoped per stream.
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS indexed_events (
                chain_id         TEXT    NOT NULL,
                contract_address TEXT    NOT NULL,
                event_type       TEXT    NOT NULL,
                block_number     INTEGER NOT NULL,
                log_index        INTEGER NOT NULL,
                transaction_hash TEXT    NOT NULL,
                block_identifier TEXT    NOT NULL,
                event_data       TEXT    NOT NULL,
                parsed_data      TEXT    NOT NULL,
                confirmations    INTEGER NOT NULL DEFAULT 0,
                is_finalized     INTEGER NOT NULL DEFAULT 0,
                is_processed     INTEGER NOT NULL DEFAULT 0,
                processing_error TEXT,
                retry_attempts   INTEGER NOT NULL DEFAULT 0,
                observed_at      INTEGER NOT NULL,
                processed_at     INTEGER,
                PRIMARY KEY (chain_id, contract_address, event_type, block_number, log_index),
                UNIQUE (chain_id, contract_address, event_type, transaction_hash, log_index)
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| IngestError::Storage(e.to_string()))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_events_pending
             ON indexed_events (chain_id, contract_address, event_type, is_finalized, is_processed);",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| IngestError::Storage(e.to_string()))?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS block_identifiers (
                chain_id         TEXT    NOT NULL,
                contract_address TEXT    NOT NULL,
                event_type       TEXT    NOT NULL,
                block_number     INTEGER NOT NULL,
                identifier       TEXT    NOT NULL,
                PRIMARY KEY (chain_id, contract_address, event_type, block_number)
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| IngestError::Storage(e.to_string()))?;

        Ok(())
    }

    fn state_from_row(row: &SqliteRow) -> Result<IndexingState, IngestError> {
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
            max_retry_attempts: row.get::<i64, _>("max_retry_attempts") as u32,
            updated_at: row.get("updated_at"),
        })
    }

    fn event_from_row(row: &SqliteRow) -> IndexedEvent {
        let event_data: String = row.get("event_data");
        let parsed_data: String = row.get("parsed_data");
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
            event_data: serde_json::from_str(&event_data).unwrap_or(serde_json::Value::Null),
            parsed_data: serde_json::from_str(&parsed_data).unwrap_or(serde_json::Value::Null),
            confirmations: row.get::<i64, _>("confirmations") as u64,
            is_finalized: row.get::<i64, _>("is_finalized") != 0,
            is_processed: row.get::<i64, _>("is_processed") != 0,
            processing_error: row.get("processing_error"),
            retry_attempts: row.get::<i64, _>("retry_attempts") as u32,
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
impl StateStore for SqliteStorage {
    async fn load(&self, source: &SourceId) -> Result<Option<IndexingState>, IngestError> {
        let row = sqlx::query(
            "SELECT * FROM indexing_state
             WHERE chain_id = ? AND contract_address = ? AND event_type = ?",
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
            "INSERT OR REPLACE INTO indexing_state
             (chain_id, contract_address, event_type, last_scanned_block, last_processed_block,
              last_finalized_block, status, error_message, total_event_count,
              processed_event_count, failed_event_count, block_range_per_batch,
              confirmations_required, max_retry_attempts, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
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
        .bind(state.max_retry_attempts as i64)
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
            "UPDATE indexing_state SET status = ?, updated_at = ?
             WHERE chain_id = ? AND contract_address = ? AND event_type = ? AND status = ?",
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
            "DELETE FROM indexing_state
             WHERE chain_id = ? AND contract_address = ? AND event_type = ?",
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
impl EventStore for SqliteStorage {
    async fn persist(&self, event: &IndexedEvent) -> Result<PersistOutcome, IngestError> {
        let event_data = serde_json::to_string(&event.event_data)
            .map_err(|e| IngestError::Storage(e.to_string()))?;
        let parsed_data = serde_json::to_string(&event.parsed_data)
            .map_err(|e| IngestError::Storage(e.to_string()))?;

        // OR IGNORE short-circuits on either uniqueness key.
        let result = sqlx::query(
            "INSERT OR IGNORE INTO indexed_events
             (chain_id, contract_address, event_type, block_number, log_index,
              transaction_hash, block_identifier, event_data, parsed_data, confirmations,
              is_finalized, is_processed, processing_error, retry_attempts, observed_at,
              processed_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&event.source.chain_id)
        .bind(&event.source.contract_address)
        .bind(&event.source.event_type)
        .bind(event.block_number as i64)
        .bind(event.log_index as i64)
        .bind(&event.transaction_hash)
        .bind(&event.block_identifier)
        .bind(&event_data)
        .bind(&parsed_data)
        .bind(event.confirmations as i64)
        .bind(event.is_finalized as i64)
        .bind(event.is_processed as i64)
        .bind(&event.processing_error)
        .bind(event.retry_attempts as i64)
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
            debug!(
                source = %event.source,
                block_number = event.block_number,
                log_index = event.log_index,
                "event stored"
            );
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
            "UPDATE indexed_events SET confirmations = ?, is_finalized = 1
             WHERE chain_id = ? AND contract_address = ? AND event_type = ?
               AND block_number = ? AND log_index = ?",
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
            "UPDATE indexed_events
             SET is_processed = 1, processed_at = ?, processing_error = NULL
             WHERE chain_id = ? AND contract_address = ? AND event_type = ?
               AND block_number = ? AND log_index = ?",
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
        let result = sqlx::query(
            "UPDATE indexed_events
             SET retry_attempts = retry_attempts + 1, processing_error = ?
             WHERE chain_id = ? AND contract_address = ? AND event_type = ?
               AND block_number = ? AND log_index = ?",
        )
        .bind(message)
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

        let row = sqlx::query(
            "SELECT retry_attempts FROM indexed_events
             WHERE chain_id = ? AND contract_address = ? AND event_type = ?
               AND block_number = ? AND log_index = ?",
        )
        .bind(&source.chain_id)
        .bind(&source.contract_address)
        .bind(&source.event_type)
        .bind(block_number as i64)
        .bind(log_index as i64)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| IngestError::Storage(e.to_string()))?;

        Ok(row.get::<i64, _>("retry_attempts") as u32)
    }

    async fn unfinalized_at_or_below(
        &self,
        source: &SourceId,
        max_block: u64,
    ) -> Result<Vec<IndexedEvent>, IngestError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM indexed_events
             WHERE chain_id = ? AND contract_address = ? AND event_type = ?
               AND is_finalized = 0 AND block_number <= ?
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
            "SELECT {} FROM indexed_events
             WHERE chain_id = ? AND contract_address = ? AND event_type = ?
               AND is_finalized = 1 AND is_processed = 0 AND retry_attempts < ?
             ORDER BY block_number, log_index",
            Self::EVENT_COLUMNS
        ))
        .bind(&source.chain_id)
        .bind(&source.contract_address)
        .bind(&source.event_type)
        .bind(max_retry_attempts as i64)
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
            "SELECT MIN(block_number) AS gap FROM indexed_events
             WHERE chain_id = ? AND contract_address = ? AND event_type = ?
               AND is_processed = 0",
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
            "DELETE FROM indexed_events
             WHERE chain_id = ? AND contract_address = ? AND event_type = ?
               AND is_finalized = 0 AND block_number >= ?",
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
            "INSERT OR REPLACE INTO block_identifiers
             (chain_id, contract_address, event_type, block_number, identifier)
             VALUES (?, ?, ?, ?, ?)",
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
            "SELECT block_number, identifier FROM block_identifiers
             WHERE chain_id = ? AND contract_address = ? AND event_type = ?
               AND block_number BETWEEN ? AND ?
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
            "DELETE FROM block_identifiers
             WHERE chain_id = ? AND contract_address = ? AND event_type = ?
               AND block_number >= ?",
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
            "SELECT COUNT(*) AS cnt FROM indexed_events
             WHERE chain_id = ? AND contract_address = ? AND event_type = ?",
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

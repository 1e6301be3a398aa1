use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use bitcoin::hashes::Hash;
use bitcoin::Txid;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};

use crate::config::PgConfig;
use crate::health::{ErrorCounter, ErrorSnapshot};
use crate::ledger::error::{LedgerError, Result};
use crate::ledger::store::schema::SCHEMA;
use crate::ledger::store::{observe, AdmitOutcome, LedgerStore, ReconcileReport, StoreWindows};
use crate::ledger::types::{BlockBatch, EntryKey, LedgerEntry, TransactionRecord};

// =========================================================================
// Statements
// =========================================================================

/// The insert's only height source is `admitted`. When the tip does not
/// match, `admitted` is empty, the scalar sub-select yields NULL and the
/// NOT NULL constraint on `block` aborts the statement.
const ADMIT_CHECKED: &str = r#"
WITH tip AS (
    SELECT block, block_hash FROM ledger_staging
    ORDER BY block DESC
    LIMIT 1
), admitted AS (
    SELECT $1::INTEGER AS height FROM tip
    WHERE (tip.block = $1::INTEGER - 1 AND tip.block_hash = $2)
       OR (tip.block = $1::INTEGER AND tip.block_hash = $3)
)
INSERT INTO ledger_staging (block, from_addr, to_addr, block_time, block_hash, tx_hash, value)
SELECT (SELECT height FROM admitted), r.from_addr, r.to_addr, $4, $3, r.tx_hash, r.value
FROM UNNEST($5::TEXT[], $6::TEXT[], $7::BYTEA[], $8::BIGINT[]) AS r(from_addr, to_addr, tx_hash, value)
ON CONFLICT (block, tx_hash, (COALESCE(to_addr, ''))) DO NOTHING
"#;

const ADMIT_UNCHECKED: &str = r#"
INSERT INTO ledger_staging (block, from_addr, to_addr, block_time, block_hash, tx_hash, value)
SELECT $1::INTEGER, r.from_addr, r.to_addr, $2, $3, r.tx_hash, r.value
FROM UNNEST($4::TEXT[], $5::TEXT[], $6::BYTEA[], $7::BIGINT[]) AS r(from_addr, to_addr, tx_hash, value)
ON CONFLICT (block, tx_hash, (COALESCE(to_addr, ''))) DO NOTHING
"#;

const PROMOTE: &str = r#"
INSERT INTO ledger_confirmed (block, from_addr, to_addr, tx_time, tx_hash, value)
SELECT s.block, s.from_addr, s.to_addr, s.block_time, s.tx_hash, s.value
FROM ledger_staging s
WHERE s.block >= $1
  AND EXISTS (
      SELECT 1 FROM ledger_tracked_address t
      WHERE t.address = s.from_addr OR t.address = s.to_addr
  )
ON CONFLICT (block, tx_hash, (COALESCE(to_addr, ''))) DO NOTHING
"#;

const PURGE: &str = "DELETE FROM ledger_staging WHERE block <= $1";

const TOUCHED_BLOCKS: &str =
    "SELECT DISTINCT block FROM ledger_staging WHERE block >= $1 ORDER BY block";

const TOUCHED_ADDRESSES: &str = r#"
SELECT addr FROM (
    SELECT from_addr AS addr FROM ledger_staging WHERE block >= $1
    UNION
    SELECT to_addr AS addr FROM ledger_staging WHERE block >= $1
) touched
WHERE addr IS NOT NULL
ORDER BY addr
"#;

const DELETE_INCOMPLETE: &str = r#"
DELETE FROM ledger_confirmed
WHERE (from_addr = $1 AND to_addr IS NULL)
   OR (to_addr = $1 AND from_addr IS NULL)
"#;

const COUNT_INCOMPLETE: &str = r#"
SELECT COUNT(*) FROM ledger_confirmed
WHERE (from_addr = $1 AND to_addr IS NULL)
   OR (to_addr = $1 AND from_addr IS NULL)
"#;

/// Bootstrap writes win over whatever was recorded before.
const UPSERT_HISTORY: &str = r#"
INSERT INTO ledger_confirmed (block, from_addr, to_addr, tx_time, tx_hash, value)
SELECT * FROM UNNEST($1::INTEGER[], $2::TEXT[], $3::TEXT[], $4::TIMESTAMPTZ[], $5::BYTEA[], $6::BIGINT[])
ON CONFLICT (block, tx_hash, (COALESCE(to_addr, ''))) DO UPDATE
SET from_addr = EXCLUDED.from_addr,
    tx_time = EXCLUDED.tx_time,
    value = EXCLUDED.value
"#;

const COPY_STAGED_FOR_ADDRESS: &str = r#"
INSERT INTO ledger_confirmed (block, from_addr, to_addr, tx_time, tx_hash, value)
SELECT block, from_addr, to_addr, block_time, tx_hash, value
FROM ledger_staging
WHERE from_addr = $1 OR to_addr = $1
ON CONFLICT (block, tx_hash, (COALESCE(to_addr, ''))) DO NOTHING
"#;

const SELECT_BETWEEN: &str = r#"
SELECT block, from_addr, to_addr, tx_time, tx_hash, value
FROM ledger_confirmed
WHERE from_addr = $1 AND to_addr = $2
ORDER BY block DESC, tx_hash
"#;

/// SQLSTATE `not_null_violation`.
const NOT_NULL_VIOLATION: &str = "23502";

// =========================================================================
// Store
// =========================================================================

/// Postgres-backed [`LedgerStore`]. Every multi-statement operation runs in
/// one transaction and all SQL is parameterised.
pub struct PgLedgerStore {
    pool: PgPool,
    windows: StoreWindows,
    errors: ErrorCounter,
}

impl PgLedgerStore {
    pub async fn connect(config: &PgConfig, windows: StoreWindows) -> Result<Self> {
        log::info!(
            "[STORE] connecting to postgres {}:{}/{} as {}",
            config.host,
            config.port,
            config.database,
            config.user
        );
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect_with(config.connect_options())
            .await?;

        Ok(Self::from_pool(pool, windows))
    }

    pub async fn connect_url(url: &str, windows: StoreWindows) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(5))
            .connect(url)
            .await?;

        Ok(Self::from_pool(pool, windows))
    }

    pub fn from_pool(pool: PgPool, windows: StoreWindows) -> Self {
        Self {
            pool,
            windows,
            errors: ErrorCounter::new(),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Creates tables and indexes if they do not exist yet.
    pub async fn migrate(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for statement in SCHEMA {
            sqlx::query(statement).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        log::info!("[STORE] schema up to date ({} statements)", SCHEMA.len());
        Ok(())
    }

    async fn admit(&self, batch: &BlockBatch, checked: bool) -> Result<AdmitOutcome> {
        let block = batch.block();
        let height = to_db_height(block)?;
        let columns = StagingColumns::from_batch(batch)?;
        let block_hash = batch.block_hash().to_byte_array().to_vec();

        let mut tx = self.pool.begin().await?;

        let inserted = if checked {
            let parent = batch.parent_block_hash().ok_or_else(|| {
                LedgerError::InvalidInput(format!("block {} has no parent hash", block))
            })?;
            sqlx::query(ADMIT_CHECKED)
                .bind(height)
                .bind(parent.to_byte_array().to_vec())
                .bind(block_hash)
                .bind(batch.time())
                .bind(columns.from)
                .bind(columns.to)
                .bind(columns.tx_hash)
                .bind(columns.value)
                .execute(&mut *tx)
                .await
        } else {
            sqlx::query(ADMIT_UNCHECKED)
                .bind(height)
                .bind(batch.time())
                .bind(block_hash)
                .bind(columns.from)
                .bind(columns.to)
                .bind(columns.tx_hash)
                .bind(columns.value)
                .execute(&mut *tx)
                .await
        };

        let staged = match inserted {
            Ok(done) => done.rows_affected(),
            Err(e) if is_not_null_violation(&e) => {
                log::warn!("[STORE] block {} does not extend the staged tip", block);
                return Err(LedgerError::Continuity { block });
            }
            Err(e) => return Err(e.into()),
        };

        let promoted = sqlx::query(PROMOTE)
            .bind(to_db_height(self.windows.promotion_floor(block))?)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        let purged = match self.windows.purge_ceiling(block) {
            Some(ceiling) => sqlx::query(PURGE)
                .bind(to_db_height(ceiling)?)
                .execute(&mut *tx)
                .await?
                .rows_affected(),
            None => 0,
        };

        tx.commit().await?;

        log::debug!(
            "[STORE] admitted block {} (staged={}, promoted={}, purged={})",
            block,
            staged,
            promoted,
            purged
        );

        Ok(AdmitOutcome {
            block,
            staged,
            promoted,
            purged,
        })
    }

    async fn reconcile_tx(&self, from_block: u32) -> Result<ReconcileReport> {
        let from = to_db_height(from_block)?;
        let mut tx = self.pool.begin().await?;

        let removed: Vec<i32> = sqlx::query_scalar(TOUCHED_BLOCKS)
            .bind(from)
            .fetch_all(&mut *tx)
            .await?;
        let addresses: Vec<String> = sqlx::query_scalar(TOUCHED_ADDRESSES)
            .bind(from)
            .fetch_all(&mut *tx)
            .await?;

        let staging_deleted = sqlx::query("DELETE FROM ledger_staging WHERE block >= $1")
            .bind(from)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        let confirmed_deleted = sqlx::query(
            "DELETE FROM ledger_confirmed WHERE from_addr = ANY($1) OR to_addr = ANY($1)",
        )
        .bind(&addresses)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let tracked_deleted =
            sqlx::query("DELETE FROM ledger_tracked_address WHERE address = ANY($1)")
                .bind(&addresses)
                .execute(&mut *tx)
                .await?
                .rows_affected();

        tx.commit().await?;

        let removed_blocks = removed
            .into_iter()
            .map(from_db_height)
            .collect::<Result<Vec<_>>>()?;

        Ok(ReconcileReport {
            from_block,
            removed_blocks,
            addresses,
            staging_deleted,
            confirmed_deleted,
            tracked_deleted,
        })
    }

    async fn insert_history_tx(&self, address: &str, records: &[TransactionRecord]) -> Result<u64> {
        let columns = HistoryColumns::from_records(records)?;
        let mut tx = self.pool.begin().await?;

        let dropped = sqlx::query(DELETE_INCOMPLETE)
            .bind(address)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if dropped > 0 {
            log::debug!("[STORE] dropped {} incomplete entries for {}", dropped, address);
        }

        let written = if columns.is_empty() {
            0
        } else {
            upsert_history(&mut tx, columns).await?
        };

        let copied = sqlx::query(COPY_STAGED_FOR_ADDRESS)
            .bind(address)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        sqlx::query(
            "INSERT INTO ledger_tracked_address (address, checked) VALUES ($1, $2) \
             ON CONFLICT (address) DO NOTHING",
        )
        .bind(address)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        log::debug!(
            "[STORE] stored history for {} (written={}, copied from staging={})",
            address,
            written,
            copied
        );
        Ok(written)
    }

    async fn max_block_query(&self) -> Result<Option<u32>> {
        let max: Option<i32> = sqlx::query_scalar("SELECT MAX(block) FROM ledger_staging")
            .fetch_one(&self.pool)
            .await?;
        max.map(from_db_height).transpose()
    }

    async fn min_block_query(&self) -> Result<Option<u32>> {
        let min: Option<i32> = sqlx::query_scalar("SELECT MIN(block) FROM ledger_staging")
            .fetch_one(&self.pool)
            .await?;
        min.map(from_db_height).transpose()
    }

    async fn touch_query(&self, address: &str) -> Result<bool> {
        let touched = sqlx::query("UPDATE ledger_tracked_address SET checked = $2 WHERE address = $1")
            .bind(address)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(touched > 0)
    }

    async fn incomplete_query(&self, address: &str) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(COUNT_INCOMPLETE)
            .bind(address)
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn between_query(&self, from: &str, to: &str) -> Result<Vec<LedgerEntry>> {
        let rows = sqlx::query(SELECT_BETWEEN)
            .bind(from)
            .bind(to)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(entry_from_row).collect()
    }

    async fn ping_query(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn admit_block(&self, batch: &BlockBatch) -> Result<AdmitOutcome> {
        observe(&self.errors, self.admit(batch, true).await)
    }

    async fn admit_block_unchecked(&self, batch: &BlockBatch) -> Result<AdmitOutcome> {
        observe(&self.errors, self.admit(batch, false).await)
    }

    async fn reconcile(&self, from_block: u32) -> Result<ReconcileReport> {
        observe(&self.errors, self.reconcile_tx(from_block).await)
    }

    async fn max_block(&self) -> Result<Option<u32>> {
        observe(&self.errors, self.max_block_query().await)
    }

    async fn min_block(&self) -> Result<Option<u32>> {
        observe(&self.errors, self.min_block_query().await)
    }

    async fn touch_tracked_address(&self, address: &str) -> Result<bool> {
        observe(&self.errors, self.touch_query(address).await)
    }

    async fn incomplete_entry_count(&self, address: &str) -> Result<u64> {
        observe(&self.errors, self.incomplete_query(address).await)
    }

    async fn insert_address_history(&self, address: &str, records: &[TransactionRecord]) -> Result<u64> {
        observe(&self.errors, self.insert_history_tx(address, records).await)
    }

    async fn confirmed_between(&self, from: &str, to: &str) -> Result<Vec<LedgerEntry>> {
        observe(&self.errors, self.between_query(from, to).await)
    }

    async fn ping(&self) -> Result<()> {
        observe(&self.errors, self.ping_query().await)
    }

    fn metrics(&self) -> ErrorSnapshot {
        self.errors.snapshot()
    }
}

// =========================================================================
// Helpers
// =========================================================================

struct StagingColumns {
    from: Vec<Option<String>>,
    to: Vec<Option<String>>,
    tx_hash: Vec<Vec<u8>>,
    value: Vec<i64>,
}

impl StagingColumns {
    fn from_batch(batch: &BlockBatch) -> Result<Self> {
        let mut cols = Self {
            from: Vec::with_capacity(batch.len()),
            to: Vec::with_capacity(batch.len()),
            tx_hash: Vec::with_capacity(batch.len()),
            value: Vec::with_capacity(batch.len()),
        };
        for r in batch.records() {
            cols.from.push(r.from.clone());
            cols.to.push(r.to.clone());
            cols.tx_hash.push(r.tx_hash.to_byte_array().to_vec());
            cols.value.push(to_db_value(r.value)?);
        }
        Ok(cols)
    }
}

/// Column arrays for the bootstrap upsert, deduplicated by entry key so one
/// statement never updates the same row twice.
struct HistoryColumns {
    block: Vec<i32>,
    from: Vec<Option<String>>,
    to: Vec<Option<String>>,
    time: Vec<DateTime<Utc>>,
    tx_hash: Vec<Vec<u8>>,
    value: Vec<i64>,
}

impl HistoryColumns {
    fn from_records(records: &[TransactionRecord]) -> Result<Self> {
        let unique: BTreeMap<EntryKey, &TransactionRecord> =
            records.iter().map(|r| (r.key(), r)).collect();

        let mut cols = Self {
            block: Vec::with_capacity(unique.len()),
            from: Vec::with_capacity(unique.len()),
            to: Vec::with_capacity(unique.len()),
            time: Vec::with_capacity(unique.len()),
            tx_hash: Vec::with_capacity(unique.len()),
            value: Vec::with_capacity(unique.len()),
        };
        for r in unique.into_values() {
            cols.block.push(to_db_height(r.block)?);
            cols.from.push(r.from.clone());
            cols.to.push(r.to.clone());
            cols.time.push(r.time);
            cols.tx_hash.push(r.tx_hash.to_byte_array().to_vec());
            cols.value.push(to_db_value(r.value)?);
        }
        Ok(cols)
    }

    fn is_empty(&self) -> bool {
        self.block.is_empty()
    }
}

async fn upsert_history(tx: &mut Transaction<'_, Postgres>, cols: HistoryColumns) -> Result<u64> {
    let done = sqlx::query(UPSERT_HISTORY)
        .bind(cols.block)
        .bind(cols.from)
        .bind(cols.to)
        .bind(cols.time)
        .bind(cols.tx_hash)
        .bind(cols.value)
        .execute(&mut **tx)
        .await?;
    Ok(done.rows_affected())
}

fn entry_from_row(row: &PgRow) -> Result<LedgerEntry> {
    let block: i32 = row.try_get("block")?;
    let tx_hash: Vec<u8> = row.try_get("tx_hash")?;
    let value: i64 = row.try_get("value")?;

    Ok(LedgerEntry {
        block: from_db_height(block)?,
        from: row.try_get("from_addr")?,
        to: row.try_get("to_addr")?,
        time: row.try_get("tx_time")?,
        tx_hash: Txid::from_slice(&tx_hash)
            .map_err(|e| LedgerError::StoreState(format!("malformed tx hash in store: {}", e)))?,
        value: u64::try_from(value)
            .map_err(|_| LedgerError::StoreState(format!("negative value {} in store", value)))?,
    })
}

fn is_not_null_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.code().as_deref() == Some(NOT_NULL_VIOLATION),
        _ => false,
    }
}

fn to_db_height(block: u32) -> Result<i32> {
    i32::try_from(block)
        .map_err(|_| LedgerError::InvalidInput(format!("block height {} out of range", block)))
}

fn from_db_height(block: i32) -> Result<u32> {
    u32::try_from(block)
        .map_err(|_| LedgerError::StoreState(format!("negative block height {} in store", block)))
}

fn to_db_value(value: u64) -> Result<i64> {
    i64::try_from(value)
        .map_err(|_| LedgerError::InvalidInput(format!("value {} out of range", value)))
}

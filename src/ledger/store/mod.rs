//! Two-tier ledger storage.
//!
//! Staging holds a rolling window of recently admitted blocks and doubles as
//! the continuity trail: its highest block is the chain tip every new batch
//! must extend. Confirmed holds the durable history of tracked addresses.
//!
//! # Atomicity
//! Every mutating operation is one unit: either all of its effects are
//! visible or none are. Both implementations keep that promise, Postgres via
//! a transaction and the in-memory store via a single lock acquisition.

mod memory;
mod postgres;
pub mod schema;


pub use memory::MemoryLedgerStore;
pub use postgres::PgLedgerStore;

use async_trait::async_trait;

use crate::health::{ErrorCounter, ErrorSnapshot};
use crate::ledger::error::Result;
use crate::ledger::types::{BlockBatch, LedgerEntry, TransactionRecord};

/// Staging window sizes, in blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreWindows {
    /// Blocks kept in staging, counting the newest one.
    pub retention_blocks: u32,
    /// Blocks before the admitted one that are re-scanned for promotion.
    pub promotion_blocks: u32,
}

impl Default for StoreWindows {
    fn default() -> Self {
        Self {
            retention_blocks: 10,
            promotion_blocks: 3,
        }
    }
}

impl StoreWindows {
    /// Lowest block re-scanned for promotion when `block` is admitted.
    pub fn promotion_floor(&self, block: u32) -> u32 {
        block.saturating_sub(self.promotion_blocks)
    }

    /// Blocks at or below this height are purged when `block` is admitted.
    pub fn purge_ceiling(&self, block: u32) -> Option<u32> {
        block.checked_sub(self.retention_blocks)
    }
}

/// Rows actually written by one admission.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdmitOutcome {
    pub block: u32,
    /// 0 when the batch was already staged.
    pub staged: u64,
    pub promoted: u64,
    pub purged: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub from_block: u32,
    pub removed_blocks: Vec<u32>,
    pub addresses: Vec<String>,
    pub staging_deleted: u64,
    pub confirmed_deleted: u64,
    pub tracked_deleted: u64,
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Stages a block that must extend the current tip.
    ///
    /// Fails with `LedgerError::Continuity` when the tip is not `block - 1`
    /// or its hash differs from the batch's parent hash. Re-delivering the
    /// tip block itself succeeds with `staged == 0`.
    async fn admit_block(&self, batch: &BlockBatch) -> Result<AdmitOutcome>;

    /// Same as [`LedgerStore::admit_block`] without the continuity predicate.
    /// Only used to seed an empty staging set.
    async fn admit_block_unchecked(&self, batch: &BlockBatch) -> Result<AdmitOutcome>;

    /// Reorg recovery: drops staging at or above `from_block` and forgets
    /// every address those blocks touched.
    async fn reconcile(&self, from_block: u32) -> Result<ReconcileReport>;

    /// Current chain tip height, `None` while staging is empty.
    async fn max_block(&self) -> Result<Option<u32>>;

    async fn min_block(&self) -> Result<Option<u32>>;

    /// Bumps `last_checked`; returns whether the address is tracked.
    async fn touch_tracked_address(&self, address: &str) -> Result<bool>;

    /// Confirmed entries with one side equal to `address` and the other missing.
    async fn incomplete_entry_count(&self, address: &str) -> Result<u64>;

    /// Store half of bootstrap. Upserts `records` into confirmed, copies
    /// staging rows touching `address`, then marks it tracked. Returns the
    /// number of records written.
    async fn insert_address_history(&self, address: &str, records: &[TransactionRecord]) -> Result<u64>;

    async fn confirmed_between(&self, from: &str, to: &str) -> Result<Vec<LedgerEntry>>;

    async fn ping(&self) -> Result<()>;

    /// Error counter snapshot; advances the health checkpoint.
    fn metrics(&self) -> ErrorSnapshot;
}

/// Counts continuity and store failures before handing the result back.
pub(crate) fn observe<T>(errors: &ErrorCounter, result: Result<T>) -> Result<T> {
    if let Err(e) = &result {
        if e.is_store_failure() {
            errors.record();
        }
    }
    result
}

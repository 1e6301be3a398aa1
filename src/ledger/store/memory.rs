use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bitcoin::BlockHash;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::health::{ErrorCounter, ErrorSnapshot};
use crate::ledger::error::{LedgerError, Result};
use crate::ledger::store::{observe, AdmitOutcome, LedgerStore, ReconcileReport, StoreWindows};
use crate::ledger::types::{BlockBatch, EntryKey, LedgerEntry, TransactionRecord};

#[derive(Debug, Default)]
struct State {
    staging: BTreeMap<EntryKey, TransactionRecord>,
    confirmed: BTreeMap<EntryKey, LedgerEntry>,
    tracked: HashMap<String, DateTime<Utc>>,
}

impl State {
    /// Keys sort by block first, so the last staging key is the tip.
    fn tip(&self) -> Option<(u32, BlockHash)> {
        self.staging
            .values()
            .next_back()
            .map(|r| (r.block, r.block_hash))
    }

    fn is_tracked_row(&self, row: &TransactionRecord) -> bool {
        let hit = |a: &Option<String>| a.as_ref().map_or(false, |a| self.tracked.contains_key(a));
        hit(&row.from) || hit(&row.to)
    }

    fn promote_from(&mut self, floor: u32) -> u64 {
        let candidates: Vec<LedgerEntry> = self
            .staging
            .values()
            .filter(|r| r.block >= floor && self.is_tracked_row(r))
            .map(LedgerEntry::from)
            .collect();

        let mut promoted = 0;
        for entry in candidates {
            if let Entry::Vacant(slot) = self.confirmed.entry(entry.key()) {
                slot.insert(entry);
                promoted += 1;
            }
        }
        promoted
    }

    fn purge_through(&mut self, ceiling: Option<u32>) -> u64 {
        let Some(ceiling) = ceiling else { return 0 };
        let before = self.staging.len();
        self.staging.retain(|k, _| k.block > ceiling);
        (before - self.staging.len()) as u64
    }
}

/// In-process [`LedgerStore`] with the same semantics as the Postgres store.
///
/// Every operation runs under one lock acquisition, which gives it the same
/// all-or-nothing visibility as a database transaction.
#[derive(Debug, Default)]
pub struct MemoryLedgerStore {
    state: Mutex<State>,
    windows: StoreWindows,
    errors: ErrorCounter,
    offline: AtomicBool,
}

impl MemoryLedgerStore {
    pub fn new(windows: StoreWindows) -> Self {
        Self {
            windows,
            ..Self::default()
        }
    }

    /// Simulates a lost connection: every call fails until switched back.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn confirmed_len(&self) -> usize {
        self.state.lock().confirmed.len()
    }

    pub fn staged_blocks(&self) -> Vec<u32> {
        let state = self.state.lock();
        let blocks: BTreeSet<u32> = state.staging.keys().map(|k| k.block).collect();
        blocks.into_iter().collect()
    }

    pub fn confirmed_entries(&self) -> Vec<LedgerEntry> {
        self.state.lock().confirmed.values().cloned().collect()
    }

    /// Tracked addresses with their last check time, sorted by address.
    pub fn tracked_addresses(&self) -> Vec<(String, DateTime<Utc>)> {
        let state = self.state.lock();
        let mut out: Vec<(String, DateTime<Utc>)> =
            state.tracked.iter().map(|(a, t)| (a.clone(), *t)).collect();
        out.sort();
        out
    }

    /// Writes a confirmed entry directly, bypassing staging.
    pub fn insert_confirmed(&self, entry: LedgerEntry) {
        self.state.lock().confirmed.insert(entry.key(), entry);
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(LedgerError::StoreState("memory store is offline".into()));
        }
        Ok(())
    }

    fn admit(&self, batch: &BlockBatch, checked: bool) -> Result<AdmitOutcome> {
        self.check_online()?;
        let mut state = self.state.lock();
        let block = batch.block();

        if checked {
            let parent = batch.parent_block_hash().ok_or_else(|| {
                LedgerError::InvalidInput(format!("block {} has no parent hash", block))
            })?;
            let extends = match state.tip() {
                Some((tip, hash)) => {
                    (tip.checked_add(1) == Some(block) && hash == parent)
                        || (tip == block && hash == batch.block_hash())
                }
                None => false,
            };
            if !extends {
                return Err(LedgerError::Continuity { block });
            }
        }

        let mut staged = 0;
        for record in batch.records() {
            let row = TransactionRecord {
                time: batch.time(),
                block_hash: batch.block_hash(),
                parent_block_hash: None,
                ..record.clone()
            };
            if let Entry::Vacant(slot) = state.staging.entry(row.key()) {
                slot.insert(row);
                staged += 1;
            }
        }

        let promoted = state.promote_from(self.windows.promotion_floor(block));
        let purged = state.purge_through(self.windows.purge_ceiling(block));

        Ok(AdmitOutcome {
            block,
            staged,
            promoted,
            purged,
        })
    }

    fn reconcile_locked(&self, from_block: u32) -> Result<ReconcileReport> {
        self.check_online()?;
        let mut state = self.state.lock();

        let mut removed = BTreeSet::new();
        let mut addresses = BTreeSet::new();
        for row in state.staging.values().filter(|r| r.block >= from_block) {
            removed.insert(row.block);
            addresses.extend(row.from.iter().cloned());
            addresses.extend(row.to.iter().cloned());
        }

        let before = state.staging.len();
        state.staging.retain(|k, _| k.block < from_block);
        let staging_deleted = (before - state.staging.len()) as u64;

        let before = state.confirmed.len();
        state
            .confirmed
            .retain(|_, e| !addresses.iter().any(|a| e.touches(a)));
        let confirmed_deleted = (before - state.confirmed.len()) as u64;

        let before = state.tracked.len();
        state.tracked.retain(|a, _| !addresses.contains(a));
        let tracked_deleted = (before - state.tracked.len()) as u64;

        Ok(ReconcileReport {
            from_block,
            removed_blocks: removed.into_iter().collect(),
            addresses: addresses.into_iter().collect(),
            staging_deleted,
            confirmed_deleted,
            tracked_deleted,
        })
    }

    fn insert_history_locked(&self, address: &str, records: &[TransactionRecord]) -> Result<u64> {
        self.check_online()?;
        let mut state = self.state.lock();

        state.confirmed.retain(|_, e| !e.is_incomplete_for(address));

        let mut fresh: BTreeMap<EntryKey, LedgerEntry> = BTreeMap::new();
        for record in records {
            fresh.insert(record.key(), LedgerEntry::from(record));
        }
        let written = fresh.len() as u64;
        state.confirmed.extend(fresh);

        let staged: Vec<LedgerEntry> = state
            .staging
            .values()
            .filter(|r| r.touches(address))
            .map(LedgerEntry::from)
            .collect();
        for entry in staged {
            state.confirmed.entry(entry.key()).or_insert(entry);
        }

        state
            .tracked
            .entry(address.to_string())
            .or_insert_with(Utc::now);

        Ok(written)
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn admit_block(&self, batch: &BlockBatch) -> Result<AdmitOutcome> {
        observe(&self.errors, self.admit(batch, true))
    }

    async fn admit_block_unchecked(&self, batch: &BlockBatch) -> Result<AdmitOutcome> {
        observe(&self.errors, self.admit(batch, false))
    }

    async fn reconcile(&self, from_block: u32) -> Result<ReconcileReport> {
        observe(&self.errors, self.reconcile_locked(from_block))
    }

    async fn max_block(&self) -> Result<Option<u32>> {
        observe(&self.errors, self.check_online())?;
        Ok(self.state.lock().tip().map(|(block, _)| block))
    }

    async fn min_block(&self) -> Result<Option<u32>> {
        observe(&self.errors, self.check_online())?;
        Ok(self.state.lock().staging.keys().next().map(|k| k.block))
    }

    async fn touch_tracked_address(&self, address: &str) -> Result<bool> {
        observe(&self.errors, self.check_online())?;
        let mut state = self.state.lock();
        match state.tracked.get_mut(address) {
            Some(checked) => {
                *checked = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn incomplete_entry_count(&self, address: &str) -> Result<u64> {
        observe(&self.errors, self.check_online())?;
        let state = self.state.lock();
        Ok(state
            .confirmed
            .values()
            .filter(|e| e.is_incomplete_for(address))
            .count() as u64)
    }

    async fn insert_address_history(&self, address: &str, records: &[TransactionRecord]) -> Result<u64> {
        observe(&self.errors, self.insert_history_locked(address, records))
    }

    async fn confirmed_between(&self, from: &str, to: &str) -> Result<Vec<LedgerEntry>> {
        observe(&self.errors, self.check_online())?;
        let state = self.state.lock();
        Ok(state
            .confirmed
            .values()
            .filter(|e| e.from.as_deref() == Some(from) && e.to.as_deref() == Some(to))
            .cloned()
            .collect())
    }

    async fn ping(&self) -> Result<()> {
        observe(&self.errors, self.check_online())
    }

    fn metrics(&self) -> ErrorSnapshot {
        self.errors.snapshot()
    }
}

use std::sync::Arc;

use crate::chain::ChainClient;
use crate::ledger::error::{LedgerError, Result};
use crate::ledger::store::LedgerStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootstrapReport {
    /// Records returned by the provider.
    pub fetched: usize,
    /// Records at or below the maturity ceiling.
    pub eligible: usize,
    pub written: u64,
    pub ceiling: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackOutcome {
    AlreadyTracked,
    Bootstrapped(BootstrapReport),
}

/// Keeps the set of observed addresses and back-fills history the first
/// time an address is seen.
///
/// Two concurrent bootstraps of the same address are harmless: the history
/// upsert and the tracked-address insert are both idempotent in the store.
pub struct AddressTracker<S: ?Sized, C: ?Sized> {
    store: Arc<S>,
    chain: Arc<C>,
    require_complete_history: bool,
}

impl<S: ?Sized, C: ?Sized> Clone for AddressTracker<S, C> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            chain: Arc::clone(&self.chain),
            require_complete_history: self.require_complete_history,
        }
    }
}

impl<S, C> AddressTracker<S, C>
where
    S: LedgerStore + ?Sized,
    C: ChainClient + ?Sized,
{
    pub fn new(store: Arc<S>, chain: Arc<C>, require_complete_history: bool) -> Self {
        Self {
            store,
            chain,
            require_complete_history,
        }
    }

    /// Touches the tracked record. `true` when the address needs no bootstrap.
    pub async fn ensure_tracked(&self, address: &str) -> Result<bool> {
        if !self.store.touch_tracked_address(address).await? {
            return Ok(false);
        }
        if self.require_complete_history {
            let incomplete = self.store.incomplete_entry_count(address).await?;
            if incomplete > 0 {
                log::debug!(
                    "[TRACKER] {} tracked but has {} incomplete entries",
                    address,
                    incomplete
                );
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Fetches the full history of `address` and stores what is at or below
    /// the current staged tip.
    pub async fn bootstrap(&self, address: &str) -> Result<BootstrapReport> {
        let history = self.chain.fetch_address_history(address).await?;
        let fetched = history.len();

        let Some(ceiling) = self.store.max_block().await? else {
            log::warn!("[TRACKER] cannot bootstrap {}: no chain tip staged yet", address);
            return Err(LedgerError::NoEligibleHistory {
                address: address.to_string(),
                fetched,
            });
        };

        let eligible: Vec<_> = history.into_iter().filter(|r| r.block <= ceiling).collect();
        if eligible.is_empty() {
            log::debug!(
                "[TRACKER] {} has no history at or below block {} ({} fetched)",
                address,
                ceiling,
                fetched
            );
            return Err(LedgerError::NoEligibleHistory {
                address: address.to_string(),
                fetched,
            });
        }

        let written = self.store.insert_address_history(address, &eligible).await?;
        log::info!(
            "[TRACKER] bootstrapped {} ({} fetched, {} eligible, ceiling {})",
            address,
            fetched,
            eligible.len(),
            ceiling
        );

        Ok(BootstrapReport {
            fetched,
            eligible: eligible.len(),
            written,
            ceiling,
        })
    }

    /// [`AddressTracker::ensure_tracked`], bootstrapping when needed.
    pub async fn track(&self, address: &str) -> Result<TrackOutcome> {
        if self.ensure_tracked(address).await? {
            return Ok(TrackOutcome::AlreadyTracked);
        }
        self.bootstrap(address).await.map(TrackOutcome::Bootstrapped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;
    use bitcoin::BlockHash;
    use chrono::{TimeZone, Utc};

    use crate::chain::mock::mock_txid;
    use crate::chain::MockChainClient;
    use crate::ledger::store::{MemoryLedgerStore, StoreWindows};
    use crate::ledger::types::{BlockBatch, LedgerEntry, TransactionRecord};

    const A: &str = "tb1q2ye03p4jdcja4vn9ap4tfq0qcc6esw3zwthcau";
    const B: &str = "tb1qr9d7z0es86sps5f2kefx5grpj4a5yvp4evj80z";

    fn record(block: u32, from: &str, to: &str, value: u64) -> TransactionRecord {
        TransactionRecord {
            block,
            from: Some(from.into()),
            to: Some(to.into()),
            value,
            time: Utc.with_ymd_and_hms(2019, 5, 7, 14, 0, 0).unwrap() + chrono::Duration::minutes(block as i64),
            block_hash: BlockHash::from_byte_array([block as u8; 32]),
            tx_hash: mock_txid(block, 1),
            parent_block_hash: None,
        }
    }

    async fn seeded_store(tip: u32) -> Arc<MemoryLedgerStore> {
        let store = Arc::new(MemoryLedgerStore::new(StoreWindows::default()));
        let sentinel = TransactionRecord::sentinel(
            tip,
            Utc::now(),
            BlockHash::from_byte_array([0xAA; 32]),
            mock_txid(tip, 0),
            Some(BlockHash::all_zeros()),
        );
        store
            .admit_block_unchecked(&BlockBatch::new(vec![sentinel]).unwrap())
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn bootstrap_filters_by_staged_tip() {
        // 1. Setup: tip at 150, history spans both sides of it
        let store = seeded_store(150).await;
        let chain = Arc::new(MockChainClient::new());
        chain.set_history(B, vec![record(100, A, B, 10), record(140, A, B, 20), record(160, A, B, 30)]);
        let tracker = AddressTracker::new(store.clone(), chain.clone(), true);

        // 2. Bootstrap
        let report = tracker.bootstrap(B).await.unwrap();

        // 3. Verify only matured records landed and the address is tracked
        assert_eq!(report.fetched, 3);
        assert_eq!(report.eligible, 2);
        assert_eq!(report.ceiling, 150);
        assert_eq!(store.confirmed_len(), 2);
        assert_eq!(store.tracked_addresses().len(), 1);
        assert!(tracker.ensure_tracked(B).await.unwrap());
    }

    #[tokio::test]
    async fn bootstrap_without_matured_history_fails() {
        let store = seeded_store(150).await;
        let chain = Arc::new(MockChainClient::new());
        chain.set_history(B, vec![record(160, A, B, 30)]);
        let tracker = AddressTracker::new(store.clone(), chain, true);

        let err = tracker.bootstrap(B).await.unwrap_err();

        assert!(matches!(err, LedgerError::NoEligibleHistory { fetched: 1, .. }));
        assert!(store.tracked_addresses().is_empty());
    }

    #[tokio::test]
    async fn bootstrap_distinguishes_unknown_address() {
        let store = seeded_store(150).await;
        let tracker = AddressTracker::new(store, Arc::new(MockChainClient::new()), true);

        let err = tracker.bootstrap(A).await.unwrap_err();
        assert!(matches!(err, LedgerError::NoEligibleHistory { fetched: 0, .. }));
    }

    #[tokio::test]
    async fn track_bootstraps_once() {
        let store = seeded_store(150).await;
        let chain = Arc::new(MockChainClient::new());
        chain.set_history(B, vec![record(100, A, B, 10)]);
        let tracker = AddressTracker::new(store, chain.clone(), true);

        assert!(matches!(tracker.track(B).await.unwrap(), TrackOutcome::Bootstrapped(_)));
        assert_eq!(tracker.track(B).await.unwrap(), TrackOutcome::AlreadyTracked);
        assert_eq!(chain.history_calls(B), 1);
    }

    #[tokio::test]
    async fn incomplete_entries_force_rebootstrap_and_are_cleared() {
        // 1. Setup: B tracked, but carrying a one-sided entry
        let store = seeded_store(150).await;
        let chain = Arc::new(MockChainClient::new());
        chain.set_history(B, vec![record(100, A, B, 10)]);
        let tracker = AddressTracker::new(store.clone(), chain.clone(), true);
        tracker.track(B).await.unwrap();

        store.insert_confirmed(LedgerEntry {
            block: 90,
            from: None,
            to: Some(B.into()),
            time: Utc::now(),
            tx_hash: mock_txid(90, 1),
            value: 0,
        });

        // 2. Guard reports not tracked, track() re-bootstraps
        assert!(!tracker.ensure_tracked(B).await.unwrap());
        assert!(matches!(tracker.track(B).await.unwrap(), TrackOutcome::Bootstrapped(_)));

        // 3. The incomplete entry is gone, so the guard converges
        assert_eq!(store.incomplete_entry_count(B).await.unwrap(), 0);
        assert!(tracker.ensure_tracked(B).await.unwrap());
        assert_eq!(chain.history_calls(B), 2);
    }

    #[tokio::test]
    async fn incomplete_guard_can_be_disabled() {
        let store = seeded_store(150).await;
        let chain = Arc::new(MockChainClient::new());
        chain.set_history(B, vec![record(100, A, B, 10)]);
        let tracker = AddressTracker::new(store.clone(), chain, false);
        tracker.track(B).await.unwrap();

        store.insert_confirmed(LedgerEntry {
            block: 90,
            from: Some(B.into()),
            to: None,
            time: Utc::now(),
            tx_hash: mock_txid(90, 1),
            value: 0,
        });

        assert!(tracker.ensure_tracked(B).await.unwrap());
    }

    #[tokio::test]
    async fn bootstrap_copies_staged_rows_for_address() {
        // 1. Setup: staged block 150 pays B but B was not tracked at admission
        let store = Arc::new(MemoryLedgerStore::new(StoreWindows::default()));
        let mut staged = record(150, A, B, 77);
        staged.parent_block_hash = Some(BlockHash::all_zeros());
        store
            .admit_block_unchecked(&BlockBatch::new(vec![staged]).unwrap())
            .await
            .unwrap();
        assert_eq!(store.confirmed_len(), 0);

        let chain = Arc::new(MockChainClient::new());
        chain.set_history(B, vec![record(100, A, B, 10)]);
        let tracker = AddressTracker::new(store.clone(), chain, true);

        // 2. Bootstrap
        tracker.bootstrap(B).await.unwrap();

        // 3. History plus the staged row
        assert_eq!(store.confirmed_len(), 2);
    }
}

use std::collections::{BTreeMap, HashMap, VecDeque};

use async_trait::async_trait;
use bitcoin::hashes::Hash;
use bitcoin::{BlockHash, Txid};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::chain::api::{ChainBlock, ChainClient, ChainError};
use crate::health::{ErrorCounter, ErrorSnapshot};
use crate::ledger::types::{canonical_address, TransactionRecord};

#[derive(Debug, Default)]
struct MockState {
    tip: Option<u32>,
    blocks: BTreeMap<u32, ChainBlock>,
    histories: HashMap<String, Vec<TransactionRecord>>,
    failures: VecDeque<String>,
    history_calls: HashMap<String, usize>,
    block_calls: usize,
}

/// Pure in-memory chain for tests.
#[derive(Debug, Default)]
pub struct MockChainClient {
    state: Mutex<MockState>,
    errors: ErrorCounter,
}

impl MockChainClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_history(&self, address: &str, records: Vec<TransactionRecord>) {
        self.state
            .lock()
            .histories
            .insert(canonical_address(address), records);
    }

    /// Adds (or replaces) a block; the tip follows the highest block unless
    /// pinned with [`MockChainClient::set_tip`].
    pub fn put_block(&self, block: ChainBlock) {
        let mut state = self.state.lock();
        state.blocks.insert(block.height, block);
    }

    pub fn set_tip(&self, height: u32) {
        self.state.lock().tip = Some(height);
    }

    /// The next call, of any kind, fails with `reason`.
    pub fn fail_next(&self, reason: &str) {
        self.state.lock().failures.push_back(reason.to_string());
    }

    pub fn history_calls(&self, address: &str) -> usize {
        self.state
            .lock()
            .history_calls
            .get(&canonical_address(address))
            .copied()
            .unwrap_or(0)
    }

    pub fn block_calls(&self) -> usize {
        self.state.lock().block_calls
    }

    fn scripted_failure(&self) -> Result<(), ChainError> {
        match self.state.lock().failures.pop_front() {
            Some(reason) => Err(ChainError::Provider(reason)),
            None => Ok(()),
        }
    }

    /// Builds a block whose records are the given transfers, or a sentinel
    /// when there are none. Each transfer gets its own txid.
    pub fn build_block(
        height: u32,
        hash: BlockHash,
        parent_hash: BlockHash,
        time: DateTime<Utc>,
        transfers: &[(&str, &str, u64)],
    ) -> ChainBlock {
        let mut records: Vec<TransactionRecord> = transfers
            .iter()
            .enumerate()
            .map(|(i, (from, to, value))| TransactionRecord {
                block: height,
                from: Some(canonical_address(from)),
                to: Some(canonical_address(to)),
                value: *value,
                time,
                block_hash: hash,
                tx_hash: mock_txid(height, i as u32 + 1),
                parent_block_hash: Some(parent_hash),
            })
            .collect();

        if records.is_empty() {
            records.push(TransactionRecord::sentinel(
                height,
                time,
                hash,
                mock_txid(height, 0),
                Some(parent_hash),
            ));
        }

        ChainBlock {
            height,
            hash,
            parent_hash,
            time,
            records,
        }
    }
}

/// Deterministic txid for the `index`-th transaction of a mock block.
pub fn mock_txid(height: u32, index: u32) -> Txid {
    let mut bytes = [0u8; 32];
    bytes[..4].copy_from_slice(&height.to_le_bytes());
    bytes[4..8].copy_from_slice(&index.to_le_bytes());
    Txid::from_byte_array(bytes)
}

#[async_trait]
impl ChainClient for MockChainClient {
    async fn fetch_address_history(&self, address: &str) -> Result<Vec<TransactionRecord>, ChainError> {
        self.errors.observe(self.scripted_failure())?;
        let mut state = self.state.lock();
        let key = canonical_address(address);
        *state.history_calls.entry(key.clone()).or_insert(0) += 1;
        Ok(state.histories.get(&key).cloned().unwrap_or_default())
    }

    async fn fetch_latest_block_height(&self) -> Result<u32, ChainError> {
        self.errors.observe(self.scripted_failure())?;
        let state = self.state.lock();
        let tip = state
            .tip
            .or_else(|| state.blocks.keys().next_back().copied())
            .ok_or_else(|| ChainError::Provider("mock chain has no blocks".into()));
        self.errors.observe(tip)
    }

    async fn fetch_block(&self, height: u32) -> Result<ChainBlock, ChainError> {
        self.errors.observe(self.scripted_failure())?;
        let mut state = self.state.lock();
        state.block_calls += 1;
        let block = state
            .blocks
            .get(&height)
            .cloned()
            .ok_or(ChainError::BlockNotFound(height));
        self.errors.observe(block)
    }

    fn metrics(&self) -> ErrorSnapshot {
        self.errors.snapshot()
    }
}

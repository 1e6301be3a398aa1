use bitcoin::{BlockHash, Txid};
use chrono::{DateTime, Utc};

use crate::ledger::error::{LedgerError, Result};

/// A normalised value transfer as delivered by a chain provider or read back
/// from staging.
///
/// `from`/`to` are `None` only for the sentinel record standing in for a
/// block that carried no value-bearing transfers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionRecord {
    pub block: u32,
    pub from: Option<String>,
    pub to: Option<String>,
    /// Smallest ledger unit (satoshis).
    pub value: u64,
    pub time: DateTime<Utc>,
    pub block_hash: BlockHash,
    pub tx_hash: Txid,
    /// Known for block records, absent for address-history records.
    pub parent_block_hash: Option<BlockHash>,
}

impl TransactionRecord {
    /// Zero-value record marking a block with nothing to stage.
    pub fn sentinel(
        block: u32,
        time: DateTime<Utc>,
        block_hash: BlockHash,
        tx_hash: Txid,
        parent_block_hash: Option<BlockHash>,
    ) -> Self {
        Self {
            block,
            from: None,
            to: None,
            value: 0,
            time,
            block_hash,
            tx_hash,
            parent_block_hash,
        }
    }

    pub fn is_sentinel(&self) -> bool {
        self.from.is_none() && self.to.is_none()
    }

    pub fn touches(&self, address: &str) -> bool {
        self.from.as_deref() == Some(address) || self.to.as_deref() == Some(address)
    }

    pub fn key(&self) -> EntryKey {
        EntryKey {
            block: self.block,
            tx_hash: self.tx_hash,
            to: self.to.clone(),
        }
    }
}

/// Unique key shared by staging and confirmed entries.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryKey {
    pub block: u32,
    pub tx_hash: Txid,
    pub to: Option<String>,
}

/// A row of the confirmed record set, as read by the tally engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub block: u32,
    pub from: Option<String>,
    pub to: Option<String>,
    pub time: DateTime<Utc>,
    pub tx_hash: Txid,
    pub value: u64,
}

impl LedgerEntry {
    pub fn key(&self) -> EntryKey {
        EntryKey {
            block: self.block,
            tx_hash: self.tx_hash,
            to: self.to.clone(),
        }
    }

    /// One side names an address, the other is missing.
    pub fn is_incomplete_for(&self, address: &str) -> bool {
        match (self.from.as_deref(), self.to.as_deref()) {
            (Some(f), None) => f == address,
            (None, Some(t)) => t == address,
            _ => false,
        }
    }

    pub fn touches(&self, address: &str) -> bool {
        self.from.as_deref() == Some(address) || self.to.as_deref() == Some(address)
    }
}

impl From<&TransactionRecord> for LedgerEntry {
    fn from(r: &TransactionRecord) -> Self {
        Self {
            block: r.block,
            from: r.from.clone(),
            to: r.to.clone(),
            time: r.time,
            tx_hash: r.tx_hash,
            value: r.value,
        }
    }
}

/// The records of exactly one block, validated for admission.
#[derive(Debug, Clone)]
pub struct BlockBatch {
    block: u32,
    block_hash: BlockHash,
    parent_block_hash: Option<BlockHash>,
    time: DateTime<Utc>,
    records: Vec<TransactionRecord>,
}

impl BlockBatch {
    pub fn new(records: Vec<TransactionRecord>) -> Result<Self> {
        let first = records
            .first()
            .ok_or_else(|| LedgerError::InvalidInput("no transactions in batch".into()))?;

        if records.iter().any(|r| r.block != first.block) {
            return Err(LedgerError::InvalidInput(
                "multiple blocks in transactions list, not allowed".into(),
            ));
        }
        if records.iter().any(|r| r.block_hash != first.block_hash) {
            return Err(LedgerError::InvalidInput(format!(
                "conflicting block hashes in batch for block {}",
                first.block
            )));
        }

        Ok(Self {
            block: first.block,
            block_hash: first.block_hash,
            parent_block_hash: first.parent_block_hash,
            time: first.time,
            records,
        })
    }

    pub fn block(&self) -> u32 {
        self.block
    }

    pub fn block_hash(&self) -> BlockHash {
        self.block_hash
    }

    pub fn parent_block_hash(&self) -> Option<BlockHash> {
        self.parent_block_hash
    }

    /// Block time; every staged row of the batch is written with it.
    pub fn time(&self) -> DateTime<Utc> {
        self.time
    }

    pub fn records(&self) -> &[TransactionRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

const BECH32_PREFIXES: [&str; 3] = ["bc1", "tb1", "bcrt1"];

/// Store key for an address. Bech32 addresses are case-insensitive and are
/// lower-cased; base58 addresses are case-sensitive and kept verbatim.
pub fn canonical_address(address: &str) -> String {
    let lower = address.trim().to_ascii_lowercase();
    if BECH32_PREFIXES.iter().any(|p| lower.starts_with(p)) {
        lower
    } else {
        address.trim().to_string()
    }
}

/// Validates caller input and returns its canonical form.
pub fn normalize_address(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(LedgerError::InvalidInput("address must not be empty".into()));
    }
    if !trimmed.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(LedgerError::InvalidInput(format!(
            "address '{}' contains invalid characters",
            trimmed
        )));
    }
    Ok(canonical_address(trimmed))
}

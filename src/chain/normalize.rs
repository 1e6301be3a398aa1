//! Provider-neutral transaction shape and the rules that turn it into
//! [`TransactionRecord`]s.

use std::str::FromStr;

use bitcoin::{BlockHash, Txid};
use chrono::{DateTime, TimeZone, Utc};

use crate::chain::api::ChainError;
use crate::ledger::types::{canonical_address, TransactionRecord};

#[derive(Debug, Clone)]
pub struct RawTx {
    pub txid: Txid,
    /// Addresses behind each input; empty for coinbase or non-standard scripts.
    pub inputs: Vec<Vec<String>>,
    pub outputs: Vec<RawOutput>,
    pub confirmation: Option<RawConfirmation>,
}

#[derive(Debug, Clone)]
pub struct RawOutput {
    pub addresses: Vec<String>,
    pub value: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct RawConfirmation {
    pub height: u32,
    pub block_hash: BlockHash,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
pub struct BlockMeta {
    pub height: u32,
    pub hash: BlockHash,
    pub parent_hash: BlockHash,
    pub time: DateTime<Utc>,
}

impl RawOutput {
    fn single_address(&self) -> Option<String> {
        match self.addresses.as_slice() {
            [only] => Some(canonical_address(only)),
            _ => None,
        }
    }
}

impl RawTx {
    /// The one address paying for every input, if there is exactly one.
    pub fn payer(&self) -> Option<String> {
        let mut payer: Option<String> = None;
        for input in &self.inputs {
            let [address] = input.as_slice() else {
                return None;
            };
            let address = canonical_address(address);
            match &payer {
                Some(p) if *p != address => return None,
                Some(_) => {}
                None => payer = Some(address),
            }
        }
        payer
    }
}

/// Records for `address`: one per output paying exactly that address.
pub fn history_records(address: &str, txs: &[RawTx]) -> Vec<TransactionRecord> {
    let address = canonical_address(address);
    let mut records = Vec::new();

    for tx in txs {
        let Some(conf) = tx.confirmation else {
            log::trace!("[CHAIN] skipping unconfirmed {}", tx.txid);
            continue;
        };
        let Some(payer) = tx.payer() else {
            log::trace!("[CHAIN] skipping {} (no single payer)", tx.txid);
            continue;
        };
        for output in &tx.outputs {
            if output.single_address().as_deref() != Some(address.as_str()) {
                continue;
            }
            records.push(TransactionRecord {
                block: conf.height,
                from: Some(payer.clone()),
                to: Some(address.clone()),
                value: output.value,
                time: conf.time,
                block_hash: conf.block_hash,
                tx_hash: tx.txid,
                parent_block_hash: None,
            });
        }
    }
    records
}

/// Records for a whole block: one per non-zero output paying a single
/// address other than the payer, or a sentinel when there are none.
pub fn block_records(meta: &BlockMeta, txs: &[RawTx]) -> Result<Vec<TransactionRecord>, ChainError> {
    let first = txs
        .first()
        .ok_or_else(|| ChainError::Decode(format!("block {} has no transactions", meta.height)))?;

    let mut records = Vec::new();
    for tx in txs {
        let Some(payer) = tx.payer() else { continue };
        for output in &tx.outputs {
            let Some(to) = output.single_address() else { continue };
            if to == payer || output.value == 0 {
                continue;
            }
            records.push(TransactionRecord {
                block: meta.height,
                from: Some(payer.clone()),
                to: Some(to),
                value: output.value,
                time: meta.time,
                block_hash: meta.hash,
                tx_hash: tx.txid,
                parent_block_hash: Some(meta.parent_hash),
            });
        }
    }

    if records.is_empty() {
        records.push(TransactionRecord::sentinel(
            meta.height,
            meta.time,
            meta.hash,
            first.txid,
            Some(meta.parent_hash),
        ));
    }
    Ok(records)
}

pub fn parse_txid(hex: &str) -> Result<Txid, ChainError> {
    Txid::from_str(hex).map_err(|e| ChainError::Decode(format!("txid {}: {}", hex, e)))
}

pub fn parse_block_hash(hex: &str) -> Result<BlockHash, ChainError> {
    BlockHash::from_str(hex).map_err(|e| ChainError::Decode(format!("block hash {}: {}", hex, e)))
}

pub fn parse_time(secs: i64) -> Result<DateTime<Utc>, ChainError> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| ChainError::Decode(format!("timestamp {} out of range", secs)))
}

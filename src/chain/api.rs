use async_trait::async_trait;
use bitcoin::BlockHash;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::health::ErrorSnapshot;
use crate::ledger::error::Result as LedgerResult;
use crate::ledger::types::{BlockBatch, TransactionRecord};

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("http transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("GET {url} code: {status} error: {body}")]
    Status { url: String, status: u16, body: String },

    #[error("cannot decode provider response: {0}")]
    Decode(String),

    #[error("block {0} not found")]
    BlockNotFound(u32),

    #[error("network {0} is not served by this provider")]
    UnsupportedNetwork(String),

    #[error("provider failure: {0}")]
    Provider(String),
}

/// One block as delivered by a provider, already normalised.
#[derive(Debug, Clone)]
pub struct ChainBlock {
    pub height: u32,
    pub hash: BlockHash,
    pub parent_hash: BlockHash,
    pub time: DateTime<Utc>,
    /// Never empty: a block without value transfers carries one sentinel.
    pub records: Vec<TransactionRecord>,
}

impl ChainBlock {
    pub fn into_batch(self) -> LedgerResult<BlockBatch> {
        BlockBatch::new(self.records)
    }
}

/// Remote ledger-data provider.
///
/// Implementations own pagination and decoding; callers only ever see
/// [`TransactionRecord`]s.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Complete confirmed history of `address`, every page collected.
    async fn fetch_address_history(&self, address: &str) -> Result<Vec<TransactionRecord>, ChainError>;

    async fn fetch_latest_block_height(&self) -> Result<u32, ChainError>;

    async fn fetch_block(&self, height: u32) -> Result<ChainBlock, ChainError>;

    /// Error counter snapshot; advances the health checkpoint.
    fn metrics(&self) -> ErrorSnapshot;
}

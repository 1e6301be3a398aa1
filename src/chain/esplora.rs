use std::time::Duration;

use async_trait::async_trait;
use bitcoin::hashes::Hash;
use bitcoin::{BlockHash, Network};
use serde::Deserialize;

use crate::chain::api::{ChainBlock, ChainClient, ChainError};
use crate::chain::http::{build_client, get_json, get_text, parse_number};
use crate::chain::normalize::{
    self, parse_block_hash, parse_time, parse_txid, BlockMeta, RawConfirmation, RawOutput, RawTx,
};
use crate::health::{ErrorCounter, ErrorSnapshot};
use crate::ledger::types::TransactionRecord;

/// Esplora serves transaction lists in fixed pages of this size.
const PAGE_SIZE: usize = 25;

#[derive(Debug, Deserialize)]
struct EsploraTx {
    txid: String,
    vin: Vec<EsploraVin>,
    vout: Vec<EsploraVout>,
    status: EsploraStatus,
}

#[derive(Debug, Deserialize)]
struct EsploraVin {
    #[serde(default)]
    is_coinbase: bool,
    prevout: Option<EsploraVout>,
}

#[derive(Debug, Deserialize)]
struct EsploraVout {
    scriptpubkey_address: Option<String>,
    value: u64,
}

#[derive(Debug, Deserialize)]
struct EsploraStatus {
    confirmed: bool,
    block_height: Option<u32>,
    block_hash: Option<String>,
    block_time: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct EsploraBlock {
    id: String,
    height: u32,
    previousblockhash: Option<String>,
    timestamp: i64,
    tx_count: usize,
}

impl EsploraTx {
    fn into_raw(self) -> Result<RawTx, ChainError> {
        let confirmation = match (self.status.confirmed, self.status.block_height, &self.status.block_hash, self.status.block_time) {
            (true, Some(height), Some(hash), Some(time)) => Some(RawConfirmation {
                height,
                block_hash: parse_block_hash(hash)?,
                time: parse_time(time)?,
            }),
            _ => None,
        };

        let inputs = self
            .vin
            .into_iter()
            .map(|vin| match (vin.is_coinbase, vin.prevout) {
                (false, Some(prev)) => prev.scriptpubkey_address.into_iter().collect(),
                _ => Vec::new(),
            })
            .collect();

        let outputs = self
            .vout
            .into_iter()
            .map(|out| RawOutput {
                addresses: out.scriptpubkey_address.into_iter().collect(),
                value: out.value,
            })
            .collect();

        Ok(RawTx {
            txid: parse_txid(&self.txid)?,
            inputs,
            outputs,
            confirmation,
        })
    }
}

/// Blockstream / mempool.space style REST provider.
pub struct EsploraClient {
    http: reqwest::Client,
    base_url: String,
    errors: ErrorCounter,
}

impl EsploraClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ChainError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        log::info!("[CHAIN] esplora provider at {}", base_url);
        Ok(Self {
            http: build_client(timeout)?,
            base_url,
            errors: ErrorCounter::new(),
        })
    }

    pub fn default_url(network: Network) -> Result<&'static str, ChainError> {
        match network {
            Network::Bitcoin => Ok("https://blockstream.info/api"),
            Network::Testnet => Ok("https://blockstream.info/testnet/api"),
            Network::Signet => Ok("https://mempool.space/signet/api"),
            other => Err(ChainError::UnsupportedNetwork(other.to_string())),
        }
    }

    async fn address_history(&self, address: &str) -> Result<Vec<TransactionRecord>, ChainError> {
        let mut raws = Vec::new();
        let mut url = format!("{}/address/{}/txs/chain", self.base_url, address);

        loop {
            let page: Vec<EsploraTx> = get_json(&self.http, &url).await?;
            let full_page = page.len() >= PAGE_SIZE;
            let last_seen = page.last().map(|t| t.txid.clone());

            for tx in page {
                raws.push(tx.into_raw()?);
            }

            match last_seen {
                Some(last) if full_page => {
                    log::debug!("[CHAIN] more history for {}, continuing after {}", address, last);
                    url = format!("{}/address/{}/txs/chain/{}", self.base_url, address, last);
                }
                _ => break,
            }
        }

        let records = normalize::history_records(address, &raws);
        log::debug!(
            "[CHAIN] {} transactions fetched for {}, {} records",
            raws.len(),
            address,
            records.len()
        );
        Ok(records)
    }

    async fn tip_height(&self) -> Result<u32, ChainError> {
        let url = format!("{}/blocks/tip/height", self.base_url);
        let body = get_text(&self.http, &url).await?;
        parse_number(&body, "tip height")
    }

    async fn block(&self, height: u32) -> Result<ChainBlock, ChainError> {
        let url = format!("{}/block-height/{}", self.base_url, height);
        let hash = match get_text(&self.http, &url).await {
            Ok(body) => body.trim().to_string(),
            Err(ChainError::Status { status: 404, .. }) => return Err(ChainError::BlockNotFound(height)),
            Err(e) => return Err(e),
        };

        let header: EsploraBlock = get_json(&self.http, &format!("{}/block/{}", self.base_url, hash)).await?;
        let meta = BlockMeta {
            height: header.height,
            hash: parse_block_hash(&header.id)?,
            parent_hash: match &header.previousblockhash {
                Some(parent) => parse_block_hash(parent)?,
                None => BlockHash::all_zeros(),
            },
            time: parse_time(header.timestamp)?,
        };

        let mut raws = Vec::with_capacity(header.tx_count);
        for start in (0..header.tx_count).step_by(PAGE_SIZE) {
            let url = format!("{}/block/{}/txs/{}", self.base_url, hash, start);
            let page: Vec<EsploraTx> = get_json(&self.http, &url).await?;
            for tx in page {
                raws.push(tx.into_raw()?);
            }
        }

        let records = normalize::block_records(&meta, &raws)?;
        Ok(ChainBlock {
            height: meta.height,
            hash: meta.hash,
            parent_hash: meta.parent_hash,
            time: meta.time,
            records,
        })
    }
}

#[async_trait]
impl ChainClient for EsploraClient {
    async fn fetch_address_history(&self, address: &str) -> Result<Vec<TransactionRecord>, ChainError> {
        self.errors.observe(self.address_history(address).await)
    }

    async fn fetch_latest_block_height(&self) -> Result<u32, ChainError> {
        self.errors.observe(self.tip_height().await)
    }

    async fn fetch_block(&self, height: u32) -> Result<ChainBlock, ChainError> {
        self.errors.observe(self.block(height).await)
    }

    fn metrics(&self) -> ErrorSnapshot {
        self.errors.snapshot()
    }
}

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use bitcoin::Network;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::chain::api::{ChainBlock, ChainClient, ChainError};
use crate::chain::http::{build_client, get_json};
use crate::chain::normalize::{
    self, parse_block_hash, parse_txid, BlockMeta, RawConfirmation, RawOutput, RawTx,
};
use crate::health::{ErrorCounter, ErrorSnapshot};
use crate::ledger::types::TransactionRecord;

const HISTORY_PAGE: usize = 50;
const BLOCK_TXIDS_PAGE: usize = 500;
/// Inputs/outputs returned per transaction.
const TX_IO_LIMIT: usize = 100;

#[derive(Debug, Deserialize)]
struct BcChain {
    height: u32,
}

#[derive(Debug, Deserialize)]
struct BcAddressFull {
    #[serde(default)]
    txs: Vec<BcTx>,
    #[serde(default, rename = "hasMore")]
    has_more: bool,
}

#[derive(Debug, Deserialize)]
struct BcTx {
    hash: String,
    /// -1 while unconfirmed.
    block_height: Option<i64>,
    block_hash: Option<String>,
    vin_sz: Option<usize>,
    vout_sz: Option<usize>,
    #[serde(default)]
    inputs: Vec<BcIo>,
    #[serde(default)]
    outputs: Vec<BcIo>,
}

#[derive(Debug, Deserialize)]
struct BcIo {
    addresses: Option<Vec<String>>,
    #[serde(default, alias = "output_value")]
    value: u64,
}

#[derive(Debug, Deserialize)]
struct BcBlock {
    hash: String,
    height: u32,
    prev_block: String,
    time: DateTime<Utc>,
    n_tx: usize,
    #[serde(default)]
    txids: Vec<String>,
}

impl BcTx {
    /// Confirmed block hash, if any.
    fn confirmed_block(&self) -> Option<&str> {
        match self.block_height {
            Some(height) if height >= 0 => self.block_hash.as_deref(),
            _ => None,
        }
    }

    /// Fails when the provider cut the input or output list short.
    fn ensure_complete(&self) -> Result<(), ChainError> {
        let inputs = self.vin_sz.unwrap_or(self.inputs.len());
        let outputs = self.vout_sz.unwrap_or(self.outputs.len());
        if inputs > self.inputs.len() || outputs > self.outputs.len() {
            return Err(ChainError::Decode(format!(
                "tx {} truncated: {}/{} inputs, {}/{} outputs",
                self.hash,
                self.inputs.len(),
                inputs,
                self.outputs.len(),
                outputs
            )));
        }
        Ok(())
    }

    /// `block_times` maps block hash to header time; every confirmed tx
    /// must find its block there.
    fn into_raw(self, block_times: &HashMap<String, DateTime<Utc>>) -> Result<RawTx, ChainError> {
        self.ensure_complete()?;

        let confirmation = match (self.block_height, self.confirmed_block()) {
            (Some(height), Some(hash)) => {
                let time = block_times
                    .get(hash)
                    .copied()
                    .ok_or_else(|| ChainError::Decode(format!("no header time for block {}", hash)))?;
                Some(RawConfirmation {
                    height: u32::try_from(height)
                        .map_err(|_| ChainError::Decode(format!("block height {} out of range", height)))?,
                    block_hash: parse_block_hash(hash)?,
                    time,
                })
            }
            _ => None,
        };

        Ok(RawTx {
            txid: parse_txid(&self.hash)?,
            inputs: self
                .inputs
                .into_iter()
                .map(|i| i.addresses.unwrap_or_default())
                .collect(),
            outputs: self
                .outputs
                .into_iter()
                .map(|o| RawOutput {
                    addresses: o.addresses.unwrap_or_default(),
                    value: o.value,
                })
                .collect(),
            confirmation,
        })
    }
}

/// api.blockcypher.com provider.
pub struct BlockCypherClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
    errors: ErrorCounter,
}

impl BlockCypherClient {
    pub fn new(base_url: impl Into<String>, token: Option<String>, timeout: Duration) -> Result<Self, ChainError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        log::info!(
            "[CHAIN] blockcypher provider at {} (token {})",
            base_url,
            if token.is_some() { "set" } else { "not set" }
        );
        Ok(Self {
            http: build_client(timeout)?,
            base_url,
            token,
            errors: ErrorCounter::new(),
        })
    }

    pub fn default_url(network: Network) -> Result<String, ChainError> {
        let chain = match network {
            Network::Bitcoin => "main",
            Network::Testnet => "test3",
            other => return Err(ChainError::UnsupportedNetwork(other.to_string())),
        };
        Ok(format!("https://api.blockcypher.com/v1/btc/{}", chain))
    }

    fn url(&self, path: &str, query: &[(&str, String)]) -> String {
        let mut params: Vec<String> = query.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        if let Some(token) = &self.token {
            params.push(format!("token={}", token));
        }
        if params.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, params.join("&"))
        }
    }

    async fn address_history(&self, address: &str) -> Result<Vec<TransactionRecord>, ChainError> {
        let path = format!("/addrs/{}/full", address);
        let mut txs: Vec<BcTx> = Vec::new();
        let mut seen = HashSet::new();
        let mut before: Option<u32> = None;

        loop {
            let mut query = vec![
                ("limit", HISTORY_PAGE.to_string()),
                ("txlimit", TX_IO_LIMIT.to_string()),
            ];
            if let Some(b) = before {
                query.push(("before", b.to_string()));
            }
            let page: BcAddressFull = get_json(&self.http, &self.url(&path, &query)).await?;

            for tx in page.txs {
                if seen.insert(tx.hash.clone()) {
                    txs.push(tx);
                }
            }

            if !page.has_more {
                break;
            }

            // `before` is exclusive; restart at the lowest block so its
            // remaining transactions are not skipped.
            let next = txs
                .iter()
                .filter_map(|t| t.block_height)
                .filter_map(|h| u32::try_from(h).ok())
                .min()
                .map(|low| low.saturating_add(1));
            match next {
                Some(next) if before.map_or(true, |b| next < b) => {
                    log::debug!("[CHAIN] more results for {}, fetching before {}", address, next);
                    before = Some(next);
                }
                _ => {
                    return Err(ChainError::Provider(format!(
                        "history pagination for {} stopped making progress after {} txs",
                        address,
                        txs.len()
                    )));
                }
            }
        }

        let mut block_times = HashMap::new();
        for hash in txs.iter().filter_map(BcTx::confirmed_block) {
            if !block_times.contains_key(hash) {
                let time = self.block_time(hash).await?;
                block_times.insert(hash.to_string(), time);
            }
        }

        let raws = txs
            .into_iter()
            .map(|tx| tx.into_raw(&block_times))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(normalize::history_records(address, &raws))
    }

    async fn block_time(&self, hash: &str) -> Result<DateTime<Utc>, ChainError> {
        let url = self.url(&format!("/blocks/{}", hash), &[("limit", "1".to_string())]);
        let header: BcBlock = get_json(&self.http, &url).await?;
        Ok(header.time)
    }

    async fn tip_height(&self) -> Result<u32, ChainError> {
        let chain: BcChain = get_json(&self.http, &self.url("", &[])).await?;
        Ok(chain.height)
    }

    async fn block(&self, height: u32) -> Result<ChainBlock, ChainError> {
        let path = format!("/blocks/{}", height);
        let mut txids = Vec::new();
        let mut header: Option<BcBlock> = None;

        loop {
            let query = [
                ("txstart", txids.len().to_string()),
                ("limit", BLOCK_TXIDS_PAGE.to_string()),
            ];
            let page: BcBlock = match get_json(&self.http, &self.url(&path, &query)).await {
                Ok(page) => page,
                Err(ChainError::Status { status: 404, .. }) => return Err(ChainError::BlockNotFound(height)),
                Err(e) => return Err(e),
            };
            let got = page.txids.len();
            txids.extend(page.txids.iter().cloned());
            let done = got == 0 || txids.len() >= page.n_tx;
            header = Some(page);
            if done {
                break;
            }
        }

        let header = header.ok_or(ChainError::BlockNotFound(height))?;
        let meta = BlockMeta {
            height: header.height,
            hash: parse_block_hash(&header.hash)?,
            parent_hash: parse_block_hash(&header.prev_block)?,
            time: header.time,
        };

        let block_times = HashMap::from([(header.hash.clone(), header.time)]);
        let mut raws = Vec::with_capacity(txids.len());
        for txid in &txids {
            let url = self.url(&format!("/txs/{}", txid), &[("limit", TX_IO_LIMIT.to_string())]);
            let tx: BcTx = get_json(&self.http, &url).await?;
            raws.push(tx.into_raw(&block_times)?);
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
impl ChainClient for BlockCypherClient {
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

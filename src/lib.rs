pub mod chain;
pub mod config;
pub mod health;
pub mod ledger;
pub mod runtime;
pub mod service;
pub mod signature;

#[cfg(test)]
pub(crate) mod test_support;

use anyhow::Result;

use crate::config::{EngineConfig, PgConfig};
use crate::ledger::{LedgerStore, PgLedgerStore};

/// Connects to Postgres and makes sure the schema exists.
pub async fn setup_store(pg: &PgConfig, config: &EngineConfig) -> Result<PgLedgerStore> {
    let store = PgLedgerStore::connect(pg, config.store_windows()).await?;
    store.migrate().await?;

    match store.max_block().await? {
        Some(tip) => log::info!("[STORE] opened ledger, staged tip at block {}", tip),
        None => log::info!("[STORE] opened empty ledger"),
    }

    Ok(store)
}

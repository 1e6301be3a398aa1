use std::fmt;
use std::time::Duration;

use bitcoin::Network;
use sqlx::postgres::{PgConnectOptions, PgSslMode};

use crate::ledger::error::{LedgerError, Result};
use crate::ledger::store::StoreWindows;

/// Process-wide engine settings, passed explicitly into constructors.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub network: Network,
    /// Default confirmation depth; queries may ask for more.
    pub confirmations: u32,
    pub staging_retention_blocks: u32,
    pub promotion_window_blocks: u32,
    /// Treat an address with one-sided confirmed entries as not yet tracked.
    pub require_complete_history: bool,
    pub request_timeout: Duration,
    pub poll_interval: Duration,
    pub max_blocks_per_tick: u32,
    pub max_reorg_depth: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            network: Network::Testnet,
            confirmations: 6,
            staging_retention_blocks: 10,
            promotion_window_blocks: 3,
            require_complete_history: true,
            request_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(30),
            max_blocks_per_tick: 20,
            max_reorg_depth: 10,
        }
    }
}

impl EngineConfig {
    /// Fails fast on settings the store or driver cannot honour.
    pub fn validate(self) -> Result<Self> {
        if self.staging_retention_blocks == 0 {
            return Err(LedgerError::Config(
                "staging retention window must be at least one block".into(),
            ));
        }
        if self.promotion_window_blocks > self.staging_retention_blocks {
            return Err(LedgerError::Config(format!(
                "promotion window ({}) exceeds staging retention ({})",
                self.promotion_window_blocks, self.staging_retention_blocks
            )));
        }
        if self.request_timeout.is_zero() {
            return Err(LedgerError::Config("request timeout must be non-zero".into()));
        }
        if self.max_blocks_per_tick == 0 {
            return Err(LedgerError::Config("max blocks per tick must be non-zero".into()));
        }
        Ok(self)
    }

    pub fn store_windows(&self) -> StoreWindows {
        StoreWindows {
            retention_blocks: self.staging_retention_blocks,
            promotion_blocks: self.promotion_window_blocks,
        }
    }
}

#[derive(Clone)]
pub struct PgConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    pub ssl: bool,
    pub max_connections: u32,
}

impl PgConfig {
    /// Builds the connection settings, naming the first missing variable.
    pub fn from_parts(
        host: Option<String>,
        port: Option<u16>,
        database: Option<String>,
        user: Option<String>,
        password: Option<String>,
        ssl: bool,
    ) -> Result<Self> {
        Ok(Self {
            host: required(host, "POSTGRES_HOST")?,
            port: port.ok_or_else(|| missing("POSTGRES_PORT"))?,
            database: required(database, "POSTGRES_DB")?,
            user: required(user, "POSTGRES_USER")?,
            password: required(password, "POSTGRES_PASSWORD")?,
            ssl,
            max_connections: 10,
        })
    }

    pub fn connect_options(&self) -> PgConnectOptions {
        let ssl_mode = if self.ssl {
            PgSslMode::Require
        } else {
            PgSslMode::Prefer
        };
        PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .database(&self.database)
            .username(&self.user)
            .password(&self.password)
            .ssl_mode(ssl_mode)
    }
}

impl fmt::Debug for PgConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &mask_secret(&self.password))
            .field("ssl", &self.ssl)
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

/// Accepts the provider-style names (`main`, `test3`) next to the ones
/// [`Network`] parses itself.
pub fn parse_network(value: &str) -> Result<Network> {
    match value.trim().to_ascii_lowercase().as_str() {
        "main" | "mainnet" => Ok(Network::Bitcoin),
        "test" | "test3" => Ok(Network::Testnet),
        other => other
            .parse::<Network>()
            .map_err(|_| LedgerError::Config(format!("unknown network {:?}", value))),
    }
}

/// Replaces every character but the last two with `*`.
pub fn mask_secret(secret: &str) -> String {
    let count = secret.chars().count();
    secret
        .chars()
        .enumerate()
        .map(|(i, c)| if i + 2 < count { '*' } else { c })
        .collect()
}

fn required(value: Option<String>, name: &str) -> Result<String> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(missing(name)),
    }
}

fn missing(name: &str) -> LedgerError {
    LedgerError::Config(format!("{} must be specified.", name))
}

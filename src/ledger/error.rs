use thiserror::Error;

use crate::chain::ChainError;

pub type Result<T> = std::result::Result<T, LedgerError>;

#[derive(Debug, Error)]
pub enum LedgerError {
    /// The batch does not extend the recorded chain tip.
    #[error("continuity check failed for block {block}: batch does not extend the chain tip")]
    Continuity { block: u32 },

    /// `fetched` is the number of records the provider returned before the
    /// maturity filter; 0 means the address has no history at all.
    #[error("no eligible history for {address} ({fetched} records fetched, none matured)")]
    NoEligibleHistory { address: String, fetched: usize },

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("store error: {0}")]
    StoreState(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("signature invalid: {0}")]
    SignatureInvalid(String),

    #[error("chain client error: {0}")]
    Chain(#[from] ChainError),

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("configuration error: {0}")]
    Config(String),
}

impl LedgerError {
    /// Failures that count against the store's health counter.
    pub fn is_store_failure(&self) -> bool {
        matches!(
            self,
            LedgerError::Continuity { .. } | LedgerError::Store(_) | LedgerError::StoreState(_)
        )
    }

    /// Caller mistakes, never retried.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            LedgerError::InvalidInput(_)
                | LedgerError::SignatureInvalid(_)
                | LedgerError::NoEligibleHistory { .. }
        )
    }
}

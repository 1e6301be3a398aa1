//! Ledger reconciliation core.
//!
//! Two-tier record store (staging + confirmed), the address tracker that
//! bootstraps first-seen addresses, and the tally engine that aggregates
//! confirmed entries between two addresses.

pub mod error;
pub mod store;
pub mod tally;
pub mod tracker;
pub mod types;

pub use error::{LedgerError, Result};
pub use store::{
    AdmitOutcome, LedgerStore, MemoryLedgerStore, PgLedgerStore, ReconcileReport, StoreWindows,
};
pub use tally::{TallyEngine, TallyOptions, TallyResult, TallyTransaction};
pub use tracker::AddressTracker;
pub use types::{
    canonical_address, normalize_address, BlockBatch, EntryKey, LedgerEntry, TransactionRecord,
};

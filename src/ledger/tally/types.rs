use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TallyOptions {
    /// Keep at most this many entries, most recent first.
    pub max_most_recent: Option<usize>,
    /// Exclusive lower time bound.
    pub since: Option<DateTime<Utc>>,
    /// Omit the transaction list from the result.
    pub tally_only: bool,
    /// Net the reverse direction against the forward one.
    pub include_refunds: bool,
    /// Requested confirmation depth; 0 means the process default.
    pub confirmations: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TallyTransaction {
    /// Negative for refunds.
    #[serde(rename = "transaction-value")]
    pub value: i64,
    #[serde(rename = "transaction-date")]
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TallyResult {
    pub tally: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transactions: Option<Vec<TallyTransaction>>,
}

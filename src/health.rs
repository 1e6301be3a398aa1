use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Monotonic failure counter with a "since last check" checkpoint.
#[derive(Debug, Default)]
pub struct ErrorCounter {
    errors: AtomicU64,
    last_checked: AtomicU64,
}

impl ErrorCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts the failure, if any, and passes the result through.
    pub fn observe<T, E>(&self, result: Result<T, E>) -> Result<T, E> {
        if result.is_err() {
            self.record();
        }
        result
    }

    /// Reads the counter and moves the checkpoint to the current value.
    pub fn snapshot(&self) -> ErrorSnapshot {
        let errors = self.errors.load(Ordering::Relaxed);
        let previous = self.last_checked.swap(errors, Ordering::Relaxed);
        ErrorSnapshot {
            errors,
            errors_delta: errors.saturating_sub(previous),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ErrorSnapshot {
    pub errors: u64,
    #[serde(rename = "errorsDelta")]
    pub errors_delta: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub store: ErrorSnapshot,
    pub chain: ErrorSnapshot,
    #[serde(rename = "storeError", skip_serializing_if = "Option::is_none")]
    pub store_error: Option<String>,
    /// Failed ingestion ticks; only the ingest driver reports these.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ingest: Option<ErrorSnapshot>,
}

impl HealthReport {
    pub fn evaluate(store: ErrorSnapshot, chain: ErrorSnapshot, store_error: Option<String>) -> Self {
        let healthy = store_error.is_none() && store.errors_delta == 0 && chain.errors_delta == 0;
        Self {
            healthy,
            store,
            chain,
            store_error,
            ingest: None,
        }
    }

    pub fn with_ingest(mut self, failed_ticks: ErrorSnapshot) -> Self {
        self.healthy &= failed_ticks.errors_delta == 0;
        self.ingest = Some(failed_ticks);
        self
    }
}

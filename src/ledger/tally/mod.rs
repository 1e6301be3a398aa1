//! Directional tally between two addresses.
//!
//! The pure part (`logic`) takes the entries read from the confirmed store
//! and produces the netted window; [`TallyEngine`] does the reads.
//!
//! # Guarantees
//! * **Integer only**: values stay in satoshis end to end.
//! * **Bounded reads**: "latest" is the staged tip, never a fresh chain call.
//! * **Walk order**: the count cap and the `since` bound are applied while
//!   walking most-recent-first, whichever is hit first.

mod logic;
pub mod types;


pub use logic::{effective_ceiling, is_reverse, window};
pub use types::{TallyOptions, TallyResult, TallyTransaction};

use std::sync::Arc;

use crate::chain::ChainClient;
use crate::ledger::error::Result;
use crate::ledger::store::LedgerStore;
use crate::ledger::tracker::AddressTracker;
use crate::ledger::types::normalize_address;

pub struct TallyEngine<S: ?Sized, C: ?Sized> {
    store: Arc<S>,
    tracker: AddressTracker<S, C>,
    default_confirmations: u32,
}

impl<S, C> TallyEngine<S, C>
where
    S: LedgerStore + ?Sized,
    C: ChainClient + ?Sized,
{
    pub fn new(store: Arc<S>, tracker: AddressTracker<S, C>, default_confirmations: u32) -> Self {
        Self {
            store,
            tracker,
            default_confirmations,
        }
    }

    pub fn tracker(&self) -> &AddressTracker<S, C> {
        &self.tracker
    }

    /// Tallies value moved `from` -> `to`, bootstrapping either address on
    /// first sight.
    pub async fn query(&self, from: &str, to: &str, opts: &TallyOptions) -> Result<TallyResult> {
        let from = normalize_address(from)?;
        let to = normalize_address(to)?;

        self.tracker.track(&from).await?;
        if to != from {
            self.tracker.track(&to).await?;
        }

        let mut entries = self.store.confirmed_between(&from, &to).await?;
        if opts.include_refunds && from != to {
            entries.extend(self.store.confirmed_between(&to, &from).await?);
        }

        let tip = self.store.max_block().await?;
        let ceiling = effective_ceiling(tip, opts.confirmations, self.default_confirmations);
        log::debug!(
            "[TALLY] {} -> {}: {} entries read, tip {:?}, ceiling {:?}",
            from,
            to,
            entries.len(),
            tip,
            ceiling
        );

        Ok(window(&from, &to, entries, ceiling, opts))
    }
}

use crate::ledger::tally::types::{TallyOptions, TallyResult, TallyTransaction};
use crate::ledger::types::LedgerEntry;

/// Highest block a query may read.
///
/// Requesting more confirmations than the process default lowers the
/// ceiling by the difference. `None` when nothing is eligible.
pub fn effective_ceiling(tip: Option<u32>, requested: u32, default: u32) -> Option<u32> {
    tip?.checked_sub(requested.saturating_sub(default))
}

/// Entry paid from `to` back to `from`.
pub fn is_reverse(entry: &LedgerEntry, from: &str, to: &str) -> bool {
    from != to && entry.from.as_deref() == Some(to) && entry.to.as_deref() == Some(from)
}

/// Applies ceiling, ordering and the two walk bounds, then nets the result.
pub fn window(
    from: &str,
    to: &str,
    entries: Vec<LedgerEntry>,
    ceiling: Option<u32>,
    opts: &TallyOptions,
) -> TallyResult {
    let mut eligible: Vec<LedgerEntry> = match ceiling {
        Some(ceiling) => entries.into_iter().filter(|e| e.block <= ceiling).collect(),
        None => Vec::new(),
    };

    // stable: equal times keep store order
    eligible.sort_by(|a, b| b.time.cmp(&a.time));

    let mut tally: i64 = 0;
    let mut transactions = Vec::new();

    for entry in eligible {
        if opts.max_most_recent.map_or(false, |max| transactions.len() >= max) {
            break;
        }
        if opts.since.map_or(false, |since| entry.time <= since) {
            break;
        }

        let magnitude = i64::try_from(entry.value).unwrap_or(i64::MAX);
        let value = if is_reverse(&entry, from, to) {
            -magnitude
        } else {
            magnitude
        };

        tally = tally.saturating_add(value);
        transactions.push(TallyTransaction {
            value,
            time: entry.time,
        });
    }

    log::trace!("[TALLY] {} -> {}: {} entries, tally {}", from, to, transactions.len(), tally);

    TallyResult {
        tally,
        transactions: if opts.tally_only { None } else { Some(transactions) },
    }
}

use std::sync::Arc;
use std::time::Duration;

use crate::chain::MockChainClient;
use crate::config::EngineConfig;
use crate::ledger::{LedgerError, LedgerStore, MemoryLedgerStore};
use crate::runtime::IngestDriver;
use crate::test_support::{chain_block, ACCT1, OTHER1};

// --- Setup ---

fn config() -> EngineConfig {
    EngineConfig {
        confirmations: 2,
        poll_interval: Duration::from_millis(10),
        ..EngineConfig::default()
    }
}

fn setup(config: EngineConfig) -> (Arc<MemoryLedgerStore>, Arc<MockChainClient>, IngestDriver<MemoryLedgerStore, MockChainClient>) {
    let store = Arc::new(MemoryLedgerStore::new(config.store_windows()));
    let chain = Arc::new(MockChainClient::new());
    let driver = IngestDriver::new(store.clone(), chain.clone(), config);
    (store, chain, driver)
}

fn extend_canonical(chain: &MockChainClient, from: u32, to: u32) {
    for h in from..=to {
        chain.put_block(chain_block(h, 0, 0, &[]));
    }
}

/// Replaces `from..=to` with fork 1, branching off canonical `from - 1`.
fn fork_from(chain: &MockChainClient, from: u32, to: u32) {
    chain.put_block(chain_block(from, 1, 0, &[]));
    for h in from + 1..=to {
        chain.put_block(chain_block(h, 1, 1, &[]));
    }
}

// --- Tests ---

#[tokio::test]
async fn seeds_empty_staging_then_idles() {
    let (store, chain, driver) = setup(config());
    extend_canonical(&chain, 100, 110);

    let first = driver.tick().await.unwrap();
    assert_eq!(first.seeded, Some(108));
    assert_eq!(first.admitted, 0);
    assert_eq!(store.max_block().await.unwrap(), Some(108));

    let second = driver.tick().await.unwrap();
    assert_eq!(second.seeded, None);
    assert_eq!(second.admitted, 0);
    assert_eq!(second.tip, Some(108));
}

#[tokio::test]
async fn follows_the_chain_head() {
    let (store, chain, driver) = setup(config());
    extend_canonical(&chain, 100, 110);
    driver.tick().await.unwrap();

    extend_canonical(&chain, 111, 115);
    let report = driver.tick().await.unwrap();

    assert_eq!(report.admitted, 5);
    assert_eq!(report.reorgs, 0);
    assert_eq!(report.tip, Some(113));
    assert_eq!(store.staged_blocks(), (108..=113).collect::<Vec<u32>>());
}

#[tokio::test]
async fn admits_at_most_the_per_tick_budget() {
    let (store, chain, driver) = setup(EngineConfig {
        max_blocks_per_tick: 2,
        ..config()
    });
    extend_canonical(&chain, 100, 110);
    driver.tick().await.unwrap();
    extend_canonical(&chain, 111, 120);

    let report = driver.tick().await.unwrap();

    assert_eq!(report.admitted, 2);
    assert_eq!(store.max_block().await.unwrap(), Some(110));
}

#[tokio::test]
async fn recovers_from_a_reorg_and_forgets_touched_addresses() {
    // 1. Setup: staged 105..=108 with a tracked payment at 107
    let (store, chain, driver) = setup(config());
    extend_canonical(&chain, 100, 107);
    driver.tick().await.unwrap();
    store.insert_address_history(ACCT1, &[]).await.unwrap();

    chain.put_block(chain_block(106, 0, 0, &[]));
    chain.put_block(chain_block(107, 0, 0, &[(ACCT1, OTHER1, 500)]));
    extend_canonical(&chain, 108, 110);
    driver.tick().await.unwrap();
    assert_eq!(store.max_block().await.unwrap(), Some(108));
    assert_eq!(store.confirmed_between(ACCT1, OTHER1).await.unwrap().len(), 1);

    // 2. Chain reorganises from 107
    fork_from(&chain, 107, 112);
    let report = driver.tick().await.unwrap();

    // 3. Verify
    assert_eq!(report.reorgs, 2);
    assert_eq!(report.admitted, 4);
    assert_eq!(report.tip, Some(110));
    assert!(store.confirmed_between(ACCT1, OTHER1).await.unwrap().is_empty());
    assert!(!store.touch_tracked_address(ACCT1).await.unwrap());
    assert_eq!(store.staged_blocks(), (105..=110).collect::<Vec<u32>>());
}

#[tokio::test]
async fn gives_up_past_the_reorg_depth() {
    let (store, chain, driver) = setup(EngineConfig {
        max_reorg_depth: 1,
        ..config()
    });
    extend_canonical(&chain, 100, 107);
    driver.tick().await.unwrap();
    extend_canonical(&chain, 108, 110);
    driver.tick().await.unwrap();
    assert_eq!(store.max_block().await.unwrap(), Some(108));

    fork_from(&chain, 106, 112);
    let err = driver.tick().await.unwrap_err();

    assert!(matches!(err, LedgerError::Continuity { block: 108 }));
    assert_eq!(store.max_block().await.unwrap(), Some(107));

    // each tick unwinds one more block until the fork point is reached
    let mut attempts = 0;
    let report = loop {
        attempts += 1;
        match driver.tick().await {
            Ok(report) => break report,
            Err(LedgerError::Continuity { .. }) if attempts < 5 => continue,
            Err(e) => panic!("unexpected tick error: {}", e),
        }
    };
    assert_eq!(attempts, 3);
    assert_eq!(report.tip, Some(110));
    assert_eq!(store.staged_blocks(), (105..=110).collect::<Vec<u32>>());
}

#[tokio::test]
async fn reseeds_when_the_whole_staging_set_is_reorganised() {
    let (store, chain, driver) = setup(config());
    extend_canonical(&chain, 100, 107);
    driver.tick().await.unwrap();
    assert_eq!(store.staged_blocks(), vec![105]);

    fork_from(&chain, 105, 108);
    let report = driver.tick().await.unwrap();

    assert_eq!(report.reorgs, 1);
    assert_eq!(report.seeded, Some(106));
    assert_eq!(store.staged_blocks(), vec![106]);
}

#[tokio::test]
async fn provider_failure_fails_the_tick_without_side_effects() {
    let (store, chain, driver) = setup(config());
    extend_canonical(&chain, 100, 110);
    chain.fail_next("rate limited");

    let err = driver.tick().await.unwrap_err();

    assert!(matches!(err, LedgerError::Chain(_)));
    assert_eq!(store.max_block().await.unwrap(), None);
}

#[tokio::test]
async fn run_forever_survives_failed_ticks_and_stops_on_shutdown() {
    let (store, chain, driver) = setup(config());
    extend_canonical(&chain, 100, 110);
    chain.fail_next("connection reset");

    driver.run_forever(tokio::time::sleep(Duration::from_millis(100))).await;

    let health = driver.health().await;
    assert_eq!(health.ingest.map(|t| t.errors), Some(1));
    assert_eq!(health.ingest.map(|t| t.errors_delta), Some(0));
    assert_eq!(store.max_block().await.unwrap(), Some(108));
}

#[tokio::test]
async fn continuity_break_shows_up_in_the_next_health_report() {
    let (_store, chain, driver) = setup(config());
    extend_canonical(&chain, 100, 107);
    driver.tick().await.unwrap();
    extend_canonical(&chain, 108, 110);
    driver.tick().await.unwrap();
    assert!(driver.health().await.healthy);

    fork_from(&chain, 107, 112);
    let report = driver.tick().await.unwrap();
    assert!(report.reorgs > 0);

    let health = driver.health().await;
    assert!(!health.healthy);
    assert!(health.store.errors_delta >= 1);

    // nothing new since the last report
    assert!(driver.health().await.healthy);
}


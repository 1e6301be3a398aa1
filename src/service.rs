//! Request-layer facade.
//!
//! [`LedgerService`] is what an outer surface (the CLI here) talks to. It
//! owns the caller-level timeout and the base64 transport decoding, and
//! maps the engine's results onto the error taxonomy callers see.
//!
//! # Architecture guarantees
//! * **No partial writes on timeout**: every store mutation is atomic, so
//!   abandoning an operation at the deadline leaves no half-written state.
//! * **No chain calls on the tally path** beyond first-sight bootstraps.

use std::future::Future;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use crate::chain::ChainClient;
use crate::config::EngineConfig;
use crate::health::HealthReport;
use crate::ledger::tracker::AddressTracker;
use crate::ledger::{
    normalize_address, LedgerError, LedgerStore, Result, TallyEngine, TallyOptions, TallyResult,
};
use crate::signature::SignatureVerifier;

pub struct LedgerService<S: ?Sized, C: ?Sized> {
    store: Arc<S>,
    chain: Arc<C>,
    engine: TallyEngine<S, C>,
    verifier: Arc<dyn SignatureVerifier>,
    config: EngineConfig,
}

impl<S, C> LedgerService<S, C>
where
    S: LedgerStore + ?Sized,
    C: ChainClient + ?Sized,
{
    pub fn new(
        store: Arc<S>,
        chain: Arc<C>,
        verifier: Arc<dyn SignatureVerifier>,
        config: EngineConfig,
    ) -> Self {
        let tracker = AddressTracker::new(
            Arc::clone(&store),
            Arc::clone(&chain),
            config.require_complete_history,
        );
        let engine = TallyEngine::new(Arc::clone(&store), tracker, config.confirmations);
        Self {
            store,
            chain,
            engine,
            verifier,
            config,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn chain(&self) -> &Arc<C> {
        &self.chain
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Tally of `from` -> `to` under the caller-level timeout.
    pub async fn get_transactions(&self, from: &str, to: &str, opts: &TallyOptions) -> Result<TallyResult> {
        log::debug!("[SERVICE] get_transactions {} -> {} {:?}", from, to, opts);
        let result = self.with_timeout(self.engine.query(from, to, opts)).await;
        if let Err(e) = &result {
            log_failure("get_transactions", e);
        }
        result
    }

    /// Checks that `address` signed the base64 `message_b64`.
    ///
    /// Unless `skip_ledger_check` is set the address must have on-chain
    /// history; it is tracked (and bootstrapped) as a side effect.
    pub async fn is_signature_valid(
        &self,
        signature_b64: &str,
        message_b64: &str,
        address: &str,
        skip_ledger_check: bool,
    ) -> Result<()> {
        let result = self
            .with_timeout(self.check_signature(signature_b64, message_b64, address, skip_ledger_check))
            .await;
        if let Err(e) = &result {
            log_failure("is_signature_valid", e);
        }
        result
    }

    /// Healthy iff the store answers and neither error counter moved since
    /// the previous call.
    pub async fn get_health(&self) -> HealthReport {
        let store_error = self.store.ping().await.err().map(|e| e.to_string());
        let report = HealthReport::evaluate(self.store.metrics(), self.chain.metrics(), store_error);
        if !report.healthy {
            log::warn!(
                "[SERVICE] unhealthy: store errorsDelta={} chain errorsDelta={} storeError={:?}",
                report.store.errors_delta,
                report.chain.errors_delta,
                report.store_error
            );
        }
        report
    }

    async fn check_signature(
        &self,
        signature_b64: &str,
        message_b64: &str,
        address: &str,
        skip_ledger_check: bool,
    ) -> Result<()> {
        let address = normalize_address(address)?;
        let message = decode_message(message_b64)?;

        if !skip_ledger_check {
            match self.engine.tracker().track(&address).await {
                Ok(_) => {}
                Err(LedgerError::NoEligibleHistory { fetched: 0, .. }) => {
                    return Err(LedgerError::SignatureInvalid(format!(
                        "no transactions for address {} on chain",
                        address
                    )));
                }
                // history exists, it just has not matured yet
                Err(LedgerError::NoEligibleHistory { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        if self.verifier.verify(&address, signature_b64, &message)? {
            log::debug!("[SERVICE] signature valid for {}", address);
            Ok(())
        } else {
            Err(LedgerError::SignatureInvalid(format!(
                "signature does not match address {}",
                address
            )))
        }
    }

    async fn with_timeout<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.config.request_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(LedgerError::Timeout(self.config.request_timeout)),
        }
    }
}

fn decode_message(message_b64: &str) -> Result<String> {
    let bytes = STANDARD
        .decode(message_b64.trim())
        .map_err(|e| LedgerError::InvalidInput(format!("message is not base64: {}", e)))?;
    String::from_utf8(bytes).map_err(|_| LedgerError::InvalidInput("message is not UTF-8".into()))
}

fn log_failure(operation: &str, e: &LedgerError) {
    if e.is_client_error() {
        log::debug!("[SERVICE] {} rejected: {}", operation, e);
    } else {
        log::error!("[SERVICE] {} failed: {}", operation, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::chain::{ChainBlock, ChainError, MockChainClient};
    use crate::health::{ErrorCounter, ErrorSnapshot};
    use crate::ledger::{MemoryLedgerStore, StoreWindows, TransactionRecord};
    use crate::signature::BitcoinMessageVerifier;
    use crate::test_support::{history, sign_message, stage_range, ACCT1, ACCT2};

    const MESSAGE: &str = "sign-in challenge 42";

    type Service = LedgerService<MemoryLedgerStore, MockChainClient>;

    async fn setup() -> (Arc<MemoryLedgerStore>, Arc<MockChainClient>, Service) {
        let config = EngineConfig {
            confirmations: 2,
            request_timeout: Duration::from_secs(5),
            ..EngineConfig::default()
        };
        let store = Arc::new(MemoryLedgerStore::new(StoreWindows::default()));
        stage_range(store.as_ref(), 400, 403).await;
        let chain = Arc::new(MockChainClient::new());
        let verifier = Arc::new(BitcoinMessageVerifier::new(config.network));
        let service = LedgerService::new(store.clone(), chain.clone(), verifier, config);
        (store, chain, service)
    }

    fn b64(s: &str) -> String {
        STANDARD.encode(s)
    }

    // =====================================================================
    // Signatures
    // =====================================================================

    #[tokio::test]
    async fn valid_signature_bootstraps_the_signer() {
        let (store, chain, service) = setup().await;
        let (address, signature) = sign_message(0x21, MESSAGE);
        chain.set_history(
            &address,
            vec![history(300, ACCT1, &address, 5_000, "2019-05-07T14:00:00Z", 1)],
        );

        service
            .is_signature_valid(&signature, &b64(MESSAGE), &address, false)
            .await
            .unwrap();

        assert_eq!(chain.history_calls(&address), 1);
        assert!(store.tracked_addresses().iter().any(|(a, _)| *a == address));

        // second check is served from the tracked set
        service
            .is_signature_valid(&signature, &b64(MESSAGE), &address, false)
            .await
            .unwrap();
        assert_eq!(chain.history_calls(&address), 1);
    }

    #[tokio::test]
    async fn signer_without_history_is_rejected() {
        let (_, _, service) = setup().await;
        let (address, signature) = sign_message(0x22, MESSAGE);

        let err = service
            .is_signature_valid(&signature, &b64(MESSAGE), &address, false)
            .await
            .unwrap_err();

        assert!(matches!(err, LedgerError::SignatureInvalid(_)));
    }

    #[tokio::test]
    async fn immature_history_still_allows_verification() {
        let (_, chain, service) = setup().await;
        let (address, signature) = sign_message(0x23, MESSAGE);
        chain.set_history(
            &address,
            vec![history(500, ACCT1, &address, 5_000, "2019-05-07T14:00:00Z", 1)],
        );

        service
            .is_signature_valid(&signature, &b64(MESSAGE), &address, false)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn skipping_the_ledger_never_calls_the_chain() {
        let (_, chain, service) = setup().await;
        let (address, signature) = sign_message(0x24, MESSAGE);

        service
            .is_signature_valid(&signature, &b64(MESSAGE), &address, true)
            .await
            .unwrap();

        assert_eq!(chain.history_calls(&address), 0);
    }

    #[tokio::test]
    async fn wrong_message_is_signature_invalid() {
        let (_, _, service) = setup().await;
        let (address, signature) = sign_message(0x25, MESSAGE);

        let err = service
            .is_signature_valid(&signature, &b64("another challenge"), &address, true)
            .await
            .unwrap_err();

        assert!(matches!(err, LedgerError::SignatureInvalid(_)));
    }

    #[tokio::test]
    async fn undecodable_message_is_invalid_input() {
        let (_, _, service) = setup().await;
        let (address, signature) = sign_message(0x26, MESSAGE);

        let err = service
            .is_signature_valid(&signature, "***", &address, true)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidInput(_)));

        let err = service
            .is_signature_valid(&signature, &STANDARD.encode([0xff, 0xfe]), &address, true)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidInput(_)));
    }

    // =====================================================================
    // Tally and timeout
    // =====================================================================

    #[tokio::test]
    async fn transactions_between_tracked_addresses() {
        let (store, _, service) = setup().await;
        store
            .insert_address_history(
                ACCT1,
                &[history(200, ACCT1, ACCT2, 1_000_000, "2019-05-07T14:27:36Z", 1)],
            )
            .await
            .unwrap();
        store.insert_address_history(ACCT2, &[]).await.unwrap();

        let result = service
            .get_transactions(ACCT1, ACCT2, &TallyOptions::default())
            .await
            .unwrap();

        assert_eq!(result.tally, 1_000_000);
    }

    /// Chain that never answers in time.
    struct StalledChain {
        errors: ErrorCounter,
    }

    #[async_trait]
    impl ChainClient for StalledChain {
        async fn fetch_address_history(&self, _address: &str) -> std::result::Result<Vec<TransactionRecord>, ChainError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(vec![])
        }

        async fn fetch_latest_block_height(&self) -> std::result::Result<u32, ChainError> {
            Ok(0)
        }

        async fn fetch_block(&self, height: u32) -> std::result::Result<ChainBlock, ChainError> {
            Err(ChainError::BlockNotFound(height))
        }

        fn metrics(&self) -> ErrorSnapshot {
            self.errors.snapshot()
        }
    }

    #[tokio::test]
    async fn slow_bootstrap_times_out() {
        let store = Arc::new(MemoryLedgerStore::new(StoreWindows::default()));
        stage_range(store.as_ref(), 400, 401).await;
        let chain = Arc::new(StalledChain {
            errors: ErrorCounter::new(),
        });
        let config = EngineConfig {
            request_timeout: Duration::from_millis(50),
            ..EngineConfig::default()
        };
        let verifier = Arc::new(BitcoinMessageVerifier::new(config.network));
        let service = LedgerService::new(store.clone(), chain, verifier, config);

        let err = service
            .get_transactions(ACCT1, ACCT2, &TallyOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, LedgerError::Timeout(_)));
        assert!(store.tracked_addresses().is_empty());
    }

    // =====================================================================
    // Health
    // =====================================================================

    #[tokio::test]
    async fn health_tracks_error_deltas() {
        let (store, chain, service) = setup().await;

        // 1. Clean start
        let report = service.get_health().await;
        assert!(report.healthy);

        // 2. Store down
        store.set_offline(true);
        let report = service.get_health().await;
        assert!(!report.healthy);
        assert!(report.store_error.is_some());
        assert_eq!(report.store.errors_delta, 1);

        // 3. Store back, delta consumed
        store.set_offline(false);
        assert!(service.get_health().await.healthy);

        // 4. Provider failure
        chain.fail_next("503");
        let err = service
            .get_transactions(ACCT1, ACCT2, &TallyOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Chain(_)));
        let report = service.get_health().await;
        assert!(!report.healthy);
        assert_eq!(report.chain.errors_delta, 1);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["chain"]["errorsDelta"], 1);
        assert!(json.get("storeError").is_none());

        assert!(service.get_health().await.healthy);
    }
}

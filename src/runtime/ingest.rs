use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use tokio::time::MissedTickBehavior;

use crate::chain::ChainClient;
use crate::config::EngineConfig;
use crate::health::{ErrorCounter, HealthReport};
use crate::ledger::{LedgerError, LedgerStore, Result};

/// What one [`IngestDriver::tick`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Height admitted without a continuity check because staging was empty.
    pub seeded: Option<u32>,
    /// Blocks admitted through the continuity check.
    pub admitted: u32,
    pub reorgs: u32,
    /// Staged tip when the tick finished.
    pub tip: Option<u32>,
}

/// **IngestDriver**
///
/// The imperative shell around the ledger store. It has one job: keep the
/// staged tip `confirmations` blocks behind the provider's chain head.
///
/// 1. **Seed** an empty staging set with the target block.
/// 2. **Extend** the tip one block at a time through the continuity check.
/// 3. **Recover** from a broken continuity check by reconciling the stale
///    tip and walking forward again from the surviving one.
///
/// There must be exactly one driver per store.
pub struct IngestDriver<S: ?Sized, C: ?Sized> {
    store: Arc<S>,
    chain: Arc<C>,
    config: EngineConfig,
    failed_ticks: ErrorCounter,
    t0: Instant,
}

impl<S, C> IngestDriver<S, C>
where
    S: LedgerStore + ?Sized,
    C: ChainClient + ?Sized,
{
    pub fn new(store: Arc<S>, chain: Arc<C>, config: EngineConfig) -> Self {
        Self {
            store,
            chain,
            config,
            failed_ticks: ErrorCounter::new(),
            t0: Instant::now(),
        }
    }

    /// Store, chain and failed-tick counters since the previous call.
    pub async fn health(&self) -> HealthReport {
        let store_error = self.store.ping().await.err().map(|e| e.to_string());
        HealthReport::evaluate(self.store.metrics(), self.chain.metrics(), store_error)
            .with_ingest(self.failed_ticks.snapshot())
    }

    /// One ingestion pass.
    pub async fn tick(&self) -> Result<TickReport> {
        let latest = self.chain.fetch_latest_block_height().await?;
        let target = latest.saturating_sub(self.config.confirmations);
        let mut report = TickReport::default();

        let Some(mut tip) = self.store.max_block().await? else {
            self.seed(target, &mut report).await?;
            return Ok(report);
        };
        report.tip = Some(tip);

        if tip >= target {
            self.trace(&format!("idle: tip {} target {} (chain head {})", tip, target, latest));
            return Ok(report);
        }

        let mut budget = self.config.max_blocks_per_tick;
        let mut consecutive_reorgs = 0;

        while tip < target && budget > 0 {
            let height = tip + 1;
            let batch = self.chain.fetch_block(height).await?.into_batch()?;

            match self.store.admit_block(&batch).await {
                Ok(outcome) => {
                    consecutive_reorgs = 0;
                    budget -= 1;
                    report.admitted += 1;
                    tip = height;
                    report.tip = Some(tip);
                    self.debug(&format!(
                        "admitted block {} (staged={}, promoted={}, purged={})",
                        height, outcome.staged, outcome.promoted, outcome.purged
                    ));
                }
                Err(LedgerError::Continuity { block }) => {
                    report.reorgs += 1;
                    consecutive_reorgs += 1;
                    if consecutive_reorgs > self.config.max_reorg_depth {
                        log::error!(
                            "[INGEST] giving up after {} consecutive reorgs at block {}",
                            consecutive_reorgs - 1,
                            block
                        );
                        return Err(LedgerError::Continuity { block });
                    }

                    log::warn!("[INGEST] block {} does not extend tip {}, reconciling", block, tip);
                    let reconciled = self.store.reconcile(tip).await?;
                    self.info(&format!(
                        "reconciled from block {}: {} staging rows, {} confirmed rows, {} addresses forgotten",
                        tip,
                        reconciled.staging_deleted,
                        reconciled.confirmed_deleted,
                        reconciled.tracked_deleted
                    ));

                    match self.store.max_block().await? {
                        Some(surviving) => {
                            tip = surviving;
                            report.tip = Some(tip);
                        }
                        None => {
                            self.seed(target, &mut report).await?;
                            return Ok(report);
                        }
                    }
                }
                Err(e) => return Err(e),
            }
        }

        if report.admitted > 0 {
            self.info(&format!(
                "tick done: {} admitted, {} reorgs, tip {} target {}",
                report.admitted, report.reorgs, tip, target
            ));
        }
        Ok(report)
    }

    /// Ticks every `poll_interval` until `shutdown` resolves. A failed tick
    /// is logged and counted, never fatal. Health is re-evaluated after
    /// every tick and logged when it flips.
    pub async fn run_forever<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        self.info(&format!(
            "starting driver (poll every {:?}, {} confirmations)",
            self.config.poll_interval, self.config.confirmations
        ));

        tokio::pin!(shutdown);
        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut healthy = true;

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    self.info("shutdown requested, stopping driver");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        self.failed_ticks.record();
                        log::error!("[INGEST] tick failed: {}", e);
                    }
                    healthy = self.report_health(healthy).await;
                }
            }
        }
    }

    async fn report_health(&self, was_healthy: bool) -> bool {
        let report = self.health().await;
        match (was_healthy, report.healthy) {
            (true, false) => log::warn!(
                "[INGEST] unhealthy: store errorsDelta={} chain errorsDelta={} failed ticks={} storeError={:?}",
                report.store.errors_delta,
                report.chain.errors_delta,
                report.ingest.map_or(0, |t| t.errors_delta),
                report.store_error
            ),
            (false, true) => self.info("healthy again"),
            _ => {}
        }
        report.healthy
    }

    async fn seed(&self, target: u32, report: &mut TickReport) -> Result<()> {
        let batch = self.chain.fetch_block(target).await?.into_batch()?;
        let outcome = self.store.admit_block_unchecked(&batch).await?;
        report.seeded = Some(target);
        report.tip = Some(target);
        self.info(&format!("seeded empty staging with block {} ({} rows)", target, outcome.staged));
        Ok(())
    }

    fn t(&self) -> u128 {
        self.t0.elapsed().as_millis()
    }

    fn info(&self, msg: &str) {
        log::info!("[INGEST] {:>8}ms: {}", self.t(), msg);
    }

    fn debug(&self, msg: &str) {
        log::debug!("[INGEST] {:>8}ms: {}", self.t(), msg);
    }

    fn trace(&self, msg: &str) {
        log::trace!("[INGEST] {:>8}ms: {}", self.t(), msg);
    }
}

//! The leader's timed cycle loop.
//!
//! Every replica runs a scheduler; only the lease holder acts. Each tick
//! renews (or attempts to take) the lease, runs health checks, closes stuck
//! cycles, skips overlapping runs, and otherwise invokes the executor once.
//! A failing health check or an errored tick never stops the loop — the
//! next tick starts after the normal interval or a shorter recovery sleep.

use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::engine::activity::{log_activity, ActivityEntry, Severity, SharedActivityLog};
use crate::engine::executor::{CycleExecutor, CycleOutcome};
use crate::engine::lease::LeaseManager;
use crate::engine::storage::EngineStorage;
use crate::engine::stream::{StreamHealth, MONITORED_MINT_KEY};
use crate::types::CycleStatus;

/// Execution statistics kept in memory and surfaced through `status()`.
#[derive(Debug, Clone, Default)]
pub struct SchedulerStats {
    pub execution_count: u64,
    pub last_execution: Option<i64>,
    pub last_error: Option<String>,
}

/// Snapshot returned to the (excluded) web layer.
#[derive(Debug, Clone)]
pub struct StatusReport {
    pub is_running: bool,
    pub execution_count: u64,
    pub last_execution: Option<i64>,
    pub activity: Vec<ActivityEntry>,
}

/// What one tick did; used for logging and tests.
#[derive(Debug)]
enum TickOutcome {
    NotLeader,
    Unhealthy(String),
    Busy,
    Ran(CycleOutcome),
}

pub struct CycleScheduler {
    storage: Arc<dyn EngineStorage>,
    lease: LeaseManager,
    executor: Arc<CycleExecutor>,
    stream_health: Arc<StreamHealth>,
    activity: SharedActivityLog,
    config: Arc<EngineConfig>,
    stats: Arc<Mutex<SchedulerStats>>,
    running: Arc<AtomicBool>,
}

impl CycleScheduler {
    pub fn new(
        storage: Arc<dyn EngineStorage>,
        lease: LeaseManager,
        executor: Arc<CycleExecutor>,
        stream_health: Arc<StreamHealth>,
        activity: SharedActivityLog,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            storage,
            lease,
            executor,
            stream_health,
            activity,
            config,
            stats: Arc::new(Mutex::new(SchedulerStats::default())),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Main loop. New ticks stop on shutdown; an in-flight execution always
    /// runs to completion first.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: mpsc::Receiver<()>) {
        self.running.store(true, Ordering::SeqCst);
        info!(
            "CycleScheduler is running as {} (tick every {:?})",
            self.lease.instance_id(),
            self.config.cycle_interval
        );

        loop {
            let delay = match self.tick().await {
                Ok(outcome) => {
                    debug!("scheduler tick: {:?}", outcome);
                    self.config.cycle_interval
                }
                Err(e) => {
                    error!("scheduler tick failed: {:#}", e);
                    log_activity(
                        &self.activity,
                        Severity::Error,
                        format!("scheduler tick failed: {e:#}"),
                    );
                    self.config.recovery_sleep
                }
            };

            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.running.store(false, Ordering::SeqCst);
        if let Err(e) = self.lease.release().await {
            warn!("failed to release lease on shutdown: {:#}", e);
        }
        info!("CycleScheduler stopped");
    }

    async fn tick(&self) -> Result<TickOutcome> {
        if !self.ensure_leadership().await? {
            debug!("not the cycle driver this tick");
            return Ok(TickOutcome::NotLeader);
        }

        if let Some(reason) = self.failing_health_check().await? {
            warn!("health check failed, skipping tick: {}", reason);
            log_activity(
                &self.activity,
                Severity::Warning,
                format!("health check failed: {reason}"),
            );
            return Ok(TickOutcome::Unhealthy(reason));
        }

        let now = now_ms();
        let cutoff = now - self.config.stuck_age.as_millis() as i64;
        let closed = self
            .storage
            .fail_stuck_cycles(
                cutoff,
                "closed by leader cleanup: pending past the stuck-age threshold",
                now,
            )
            .await?;
        if closed > 0 {
            warn!("closed {} stuck cycle(s)", closed);
            log_activity(
                &self.activity,
                Severity::Warning,
                format!("closed {closed} stuck cycle(s)"),
            );
        }

        let fresh = self.storage.pending_cycles().await?;
        if !fresh.is_empty() {
            info!(
                "{} fresh pending cycle(s) present; skipping this tick",
                fresh.len()
            );
            return Ok(TickOutcome::Busy);
        }

        let mint = self.monitored_mint().await?;
        let outcome = self.executor.execute_cycle(&mint).await?;
        self.note_execution(&outcome);
        Ok(TickOutcome::Ran(outcome))
    }

    /// Renew when holding, otherwise attempt acquisition. A failed renewal
    /// demotes immediately; re-acquisition waits for the next tick.
    async fn ensure_leadership(&self) -> Result<bool> {
        if self.lease.is_holder().await? {
            if self.lease.renew().await? {
                return Ok(true);
            }
            return Ok(false);
        }
        self.lease.try_acquire().await
    }

    /// First failing health check, if any. Failures abort the tick, never
    /// the loop.
    async fn failing_health_check(&self) -> Result<Option<String>> {
        if !self.stream_health.is_fresh(self.config.heartbeat_stale_after) {
            return Ok(Some("trade feed heartbeat is stale".to_string()));
        }

        let mint = self.storage.get_setting(MONITORED_MINT_KEY).await?;
        if mint.map(|m| m.is_empty()).unwrap_or(true) {
            return Ok(Some("monitored mint not configured".to_string()));
        }

        if self.config.treasury_address.is_empty() {
            return Ok(Some("treasury address not configured".to_string()));
        }

        if self.config.engine_api_key.is_none() {
            return Ok(Some("signing engine credentials missing".to_string()));
        }

        if self.config.liquidity_amount_sol > 0.0 && self.config.pool_key.is_none() {
            return Ok(Some(
                "liquidity deposits enabled without a configured pool".to_string(),
            ));
        }

        Ok(None)
    }

    async fn monitored_mint(&self) -> Result<String> {
        self.storage
            .get_setting(MONITORED_MINT_KEY)
            .await?
            .filter(|m| !m.is_empty())
            .context("monitored mint vanished between health check and execution")
    }

    fn note_execution(&self, outcome: &CycleOutcome) {
        if let CycleOutcome::Executed { status, error, .. } = outcome {
            let mut stats = self.stats.lock().unwrap_or_else(|p| p.into_inner());
            stats.execution_count += 1;
            stats.last_execution = Some(now_ms());
            if *status == CycleStatus::Failed {
                stats.last_error = error.clone();
            }
        }
    }

    /// Status surface for the excluded web layer.
    pub fn status(&self) -> StatusReport {
        let stats = self
            .stats
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        let activity = self
            .activity
            .lock()
            .map(|log| log.snapshot())
            .unwrap_or_default();

        StatusReport {
            is_running: self.running.load(Ordering::SeqCst),
            execution_count: stats.execution_count,
            last_execution: stats.last_execution,
            activity,
        }
    }

    /// Manual trigger: synchronously run one cycle and return its outcome.
    pub async fn trigger(&self) -> Result<CycleOutcome> {
        let mint = self.monitored_mint().await?;
        info!("manual cycle trigger for {}", mint);
        let outcome = self.executor.execute_cycle(&mint).await?;
        self.note_execution(&outcome);
        Ok(outcome)
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::activity::ActivityLog;
    use crate::engine::counter::test_support::FixedThreshold;
    use crate::engine::counter::TradeCounter;
    use crate::engine::executor::test_support::ScriptedChain;
    use crate::engine::storage::SqliteStore;
    use std::time::Duration;

    const SOL: u64 = 1_000_000_000;

    fn test_config() -> EngineConfig {
        EngineConfig {
            treasury_address: "Treasury111".to_string(),
            engine_api_key: Some("test-key".to_string()),
            ..Default::default()
        }
    }

    async fn scheduler_with(
        config: EngineConfig,
        chain: ScriptedChain,
        instance_id: &str,
    ) -> (Arc<dyn EngineStorage>, CycleScheduler) {
        let store = SqliteStore::in_memory().await.unwrap();
        let storage: Arc<dyn EngineStorage> = store;
        let config = Arc::new(config);

        let counter = Arc::new(TradeCounter::new(
            storage.clone(),
            Arc::new(FixedThreshold::new(vec![50])),
            config.min_qualifying_sol,
            config.threshold_min,
            config.threshold_max,
        ));
        counter.init().await.unwrap();

        let activity = ActivityLog::shared();
        let executor = Arc::new(CycleExecutor::new(
            storage.clone(),
            Arc::new(chain),
            counter,
            activity.clone(),
            config.clone(),
        ));

        let lease = LeaseManager::new(storage.clone(), instance_id.to_string(), config.lease_ttl);
        let scheduler = CycleScheduler::new(
            storage.clone(),
            lease,
            executor,
            StreamHealth::new(),
            activity,
            config,
        );

        (storage, scheduler)
    }

    #[tokio::test]
    async fn non_leader_tick_does_nothing() {
        let chain = ScriptedChain::with_balances(vec![10 * SOL]);
        let (storage, scheduler) = scheduler_with(test_config(), chain, "instance-a").await;

        // Another instance already drives cycles.
        let now = chrono::Utc::now().timestamp_millis();
        storage
            .acquire_lease("cycle-driver", "instance-b", now, 300_000)
            .await
            .unwrap();

        storage
            .set_setting(MONITORED_MINT_KEY, "MintAAA")
            .await
            .unwrap();

        let outcome = scheduler.tick().await.unwrap();
        assert!(matches!(outcome, TickOutcome::NotLeader));
        assert!(storage.recent_cycles(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_mint_aborts_the_tick() {
        let chain = ScriptedChain::with_balances(vec![10 * SOL]);
        let (storage, scheduler) = scheduler_with(test_config(), chain, "instance-a").await;

        let outcome = scheduler.tick().await.unwrap();
        match outcome {
            TickOutcome::Unhealthy(reason) => assert!(reason.contains("monitored mint")),
            other => panic!("expected unhealthy tick, got {other:?}"),
        }
        assert!(storage.recent_cycles(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stale_feed_heartbeat_aborts_the_tick() {
        let chain = ScriptedChain::with_balances(vec![10 * SOL]);
        let mut config = test_config();
        config.heartbeat_stale_after = Duration::ZERO;
        let (storage, scheduler) = scheduler_with(config, chain, "instance-a").await;

        storage
            .set_setting(MONITORED_MINT_KEY, "MintAAA")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let outcome = scheduler.tick().await.unwrap();
        match outcome {
            TickOutcome::Unhealthy(reason) => assert!(reason.contains("heartbeat")),
            other => panic!("expected unhealthy tick, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_credentials_abort_the_tick() {
        let chain = ScriptedChain::with_balances(vec![10 * SOL]);
        let mut config = test_config();
        config.engine_api_key = None;
        let (storage, scheduler) = scheduler_with(config, chain, "instance-a").await;

        storage
            .set_setting(MONITORED_MINT_KEY, "MintAAA")
            .await
            .unwrap();

        let outcome = scheduler.tick().await.unwrap();
        match outcome {
            TickOutcome::Unhealthy(reason) => assert!(reason.contains("credentials")),
            other => panic!("expected unhealthy tick, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn liquidity_without_pool_aborts_the_tick() {
        let chain = ScriptedChain::with_balances(vec![10 * SOL]);
        let mut config = test_config();
        config.liquidity_amount_sol = 0.5;
        let (storage, scheduler) = scheduler_with(config, chain, "instance-a").await;

        storage
            .set_setting(MONITORED_MINT_KEY, "MintAAA")
            .await
            .unwrap();

        let outcome = scheduler.tick().await.unwrap();
        match outcome {
            TickOutcome::Unhealthy(reason) => assert!(reason.contains("pool")),
            other => panic!("expected unhealthy tick, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn fresh_pending_cycle_skips_execution() {
        let chain = ScriptedChain::with_balances(vec![10 * SOL]);
        let (storage, scheduler) = scheduler_with(test_config(), chain, "instance-a").await;

        storage
            .set_setting(MONITORED_MINT_KEY, "MintAAA")
            .await
            .unwrap();
        let now = chrono::Utc::now().timestamp_millis();
        storage.insert_cycle("MintAAA", 6, now - 1_000).await.unwrap();

        let outcome = scheduler.tick().await.unwrap();
        assert!(matches!(outcome, TickOutcome::Busy));
        assert_eq!(storage.recent_cycles(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stuck_cycle_is_closed_and_execution_proceeds() {
        let chain = ScriptedChain::with_balances(vec![10 * SOL, 12 * SOL]);
        let (storage, scheduler) = scheduler_with(test_config(), chain, "instance-a").await;

        storage
            .set_setting(MONITORED_MINT_KEY, "MintAAA")
            .await
            .unwrap();
        let now = chrono::Utc::now().timestamp_millis();
        let stuck = storage
            .insert_cycle("MintAAA", 6, now - 700_000)
            .await
            .unwrap();

        let outcome = scheduler.tick().await.unwrap();
        assert!(matches!(outcome, TickOutcome::Ran(_)));

        let cycles = storage.recent_cycles(10).await.unwrap();
        assert_eq!(cycles.len(), 2);
        let stuck_record = cycles.iter().find(|c| c.id == stuck).unwrap();
        assert_eq!(stuck_record.status, CycleStatus::Failed);
        assert!(stuck_record
            .error_message
            .as_deref()
            .unwrap()
            .contains("leader cleanup"));
    }

    #[tokio::test]
    async fn executed_tick_updates_stats_and_status() {
        let chain = ScriptedChain::with_balances(vec![10 * SOL, 12 * SOL]);
        let (storage, scheduler) = scheduler_with(test_config(), chain, "instance-a").await;

        storage
            .set_setting(MONITORED_MINT_KEY, "MintAAA")
            .await
            .unwrap();

        let outcome = scheduler.tick().await.unwrap();
        assert!(matches!(outcome, TickOutcome::Ran(CycleOutcome::Executed { .. })));

        let status = scheduler.status();
        assert_eq!(status.execution_count, 1);
        assert!(status.last_execution.is_some());
        assert!(!status.activity.is_empty());
    }

    #[tokio::test]
    async fn manual_trigger_runs_a_cycle() {
        let chain = ScriptedChain::with_balances(vec![10 * SOL, 12 * SOL]);
        let (storage, scheduler) = scheduler_with(test_config(), chain, "instance-a").await;

        storage
            .set_setting(MONITORED_MINT_KEY, "MintAAA")
            .await
            .unwrap();

        let outcome = scheduler.trigger().await.unwrap();
        assert!(outcome.is_completed());
        assert_eq!(scheduler.status().execution_count, 1);
    }
}

//! The buyback cycle pipeline.
//!
//! One cycle is an ordered sequence: claim creator fees, forward the
//! platform cut, buy the token back, optionally deposit+burn liquidity, and
//! evaluate the trader reward. Steps run strictly in order; a hard failure
//! marks the cycle `failed` with every signature obtained so far retained.
//! A rate-limit denial of the whole cycle is a normal no-op, not an error.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::config::{EngineConfig, RewardMode};
use crate::engine::activity::{log_activity, Severity, SharedActivityLog};
use crate::engine::chain::{lamports_to_sol, ChainOps};
use crate::engine::counter::TradeCounter;
use crate::engine::rate_limit::{CooldownLimiter, Gate, BUY_KEY, DEPOSIT_KEY, RUN_CYCLE_KEY};
use crate::engine::storage::EngineStorage;
use crate::types::{CycleArtifacts, CycleStatus};

/// Steps in one cycle: gate, fee claim, split, buy, liquidity, reward.
const TOTAL_STEPS: i64 = 6;

/// Result of one `execute_cycle` invocation.
#[derive(Debug, Clone)]
pub enum CycleOutcome {
    /// The `run-cycle` window has not elapsed; nothing was attempted.
    RateLimited { retry_after: Duration },
    /// A cycle record was created and driven to a terminal status.
    Executed {
        cycle_id: i64,
        status: CycleStatus,
        artifacts: CycleArtifacts,
        error: Option<String>,
    },
}

impl CycleOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(
            self,
            CycleOutcome::Executed {
                status: CycleStatus::Completed,
                ..
            }
        )
    }
}

pub struct CycleExecutor {
    storage: Arc<dyn EngineStorage>,
    chain: Arc<dyn ChainOps>,
    limiter: CooldownLimiter,
    counter: Arc<TradeCounter>,
    activity: SharedActivityLog,
    config: Arc<EngineConfig>,
}

impl CycleExecutor {
    pub fn new(
        storage: Arc<dyn EngineStorage>,
        chain: Arc<dyn ChainOps>,
        counter: Arc<TradeCounter>,
        activity: SharedActivityLog,
        config: Arc<EngineConfig>,
    ) -> Self {
        let limiter = CooldownLimiter::new(storage.clone());
        Self {
            storage,
            chain,
            limiter,
            counter,
            activity,
            config,
        }
    }

    /// Run one full cycle against `mint`.
    #[instrument(skip(self))]
    pub async fn execute_cycle(&self, mint: &str) -> Result<CycleOutcome> {
        // Step 1: rate-gate the whole cycle before touching anything.
        match self
            .limiter
            .try_consume(RUN_CYCLE_KEY, self.config.cycle_window_secs)
            .await?
        {
            Gate::Allowed => {}
            Gate::Denied { retry_after } => {
                debug!("cycle for {} rate-limited; retry in {:?}", mint, retry_after);
                return Ok(CycleOutcome::RateLimited { retry_after });
            }
        }

        let cycle_id = self
            .storage
            .insert_cycle(mint, TOTAL_STEPS, now_ms())
            .await?;
        info!("cycle {} started for mint {}", cycle_id, mint);

        let mut artifacts = CycleArtifacts::default();
        let result = self.run_steps(cycle_id, mint, &mut artifacts).await;

        let outcome = match result {
            Ok(()) => {
                self.storage
                    .finish_cycle(cycle_id, CycleStatus::Completed, None, now_ms())
                    .await?;
                info!("cycle {} completed", cycle_id);
                log_activity(
                    &self.activity,
                    Severity::Info,
                    format!("cycle {cycle_id} completed"),
                );
                CycleOutcome::Executed {
                    cycle_id,
                    status: CycleStatus::Completed,
                    artifacts,
                    error: None,
                }
            }
            Err(e) => {
                let message = format!("{e:#}");
                self.storage
                    .finish_cycle(cycle_id, CycleStatus::Failed, Some(&message), now_ms())
                    .await?;
                warn!("cycle {} failed: {}", cycle_id, message);
                log_activity(
                    &self.activity,
                    Severity::Error,
                    format!("cycle {cycle_id} failed: {message}"),
                );
                CycleOutcome::Executed {
                    cycle_id,
                    status: CycleStatus::Failed,
                    artifacts,
                    error: Some(message),
                }
            }
        };

        Ok(outcome)
    }

    /// Steps 2-6. Any error here is terminal for this cycle; whatever was
    /// already written into `artifacts` survives in the record.
    async fn run_steps(
        &self,
        cycle_id: i64,
        mint: &str,
        artifacts: &mut CycleArtifacts,
    ) -> Result<()> {
        let config = &self.config;

        // Step 2: claim fees. The observed balance delta is authoritative —
        // a pre-declared claim amount is never trusted.
        let balance_before = self
            .chain
            .get_balance(&config.treasury_address)
            .await
            .context("balance read before fee claim")?;

        let fee_signature = self
            .chain
            .collect_fee(mint)
            .await
            .context("fee claim failed")?;
        artifacts.fee_signature = Some(fee_signature);

        let balance_after = self
            .chain
            .get_balance(&config.treasury_address)
            .await
            .context("balance read after fee claim")?;

        let collected_sol = lamports_to_sol(balance_after.saturating_sub(balance_before));
        artifacts.fee_amount_sol = Some(collected_sol);
        self.storage
            .update_cycle_progress(cycle_id, 2, artifacts)
            .await?;
        info!("cycle {}: claimed {:.6} SOL in fees", cycle_id, collected_sol);

        // Step 3: platform split.
        let mut remaining_sol = collected_sol;
        if let Some(platform) = &config.platform_address {
            if collected_sol > 0.0 && config.platform_split_bps > 0 {
                let cut = collected_sol * f64::from(config.platform_split_bps) / 10_000.0;
                let signature = self
                    .chain
                    .transfer(platform, cut)
                    .await
                    .context("platform split transfer failed")?;
                remaining_sol -= cut;
                info!(
                    "cycle {}: platform cut {:.6} SOL sent ({})",
                    cycle_id, cut, signature
                );
            }
        }
        self.storage
            .update_cycle_progress(cycle_id, 3, artifacts)
            .await?;

        // Step 4: buy-back, independently rate-gated. A denial skips the
        // step; it does not fail the cycle.
        if remaining_sol > 0.0 {
            match self
                .limiter
                .try_consume(BUY_KEY, config.buy_window_secs)
                .await?
            {
                Gate::Allowed => {
                    let signature = self
                        .chain
                        .buy_token(
                            mint,
                            remaining_sol,
                            config.slippage_bps,
                            config.priority_fee_sol,
                        )
                        .await
                        .context("buy-back swap failed")?;
                    artifacts.buy_signature = Some(signature);
                    artifacts.buy_amount_sol = Some(remaining_sol);
                    info!("cycle {}: bought back {:.6} SOL", cycle_id, remaining_sol);
                }
                Gate::Denied { retry_after } => {
                    debug!(
                        "cycle {}: buy-back window not elapsed (retry in {:?})",
                        cycle_id, retry_after
                    );
                }
            }
        }
        self.storage
            .update_cycle_progress(cycle_id, 4, artifacts)
            .await?;

        // Step 5: liquidity deposit + LP burn. Dormant unless a pool and a
        // nonzero amount are configured.
        if let Some(pool) = &config.pool_key {
            if config.liquidity_amount_sol > 0.0 {
                match self
                    .limiter
                    .try_consume(DEPOSIT_KEY, config.deposit_window_secs)
                    .await?
                {
                    Gate::Allowed => {
                        let signatures = self
                            .chain
                            .deposit_and_burn_liquidity(
                                pool,
                                config.liquidity_amount_sol,
                                config.slippage_bps,
                            )
                            .await
                            .context("liquidity deposit failed")?;
                        artifacts.liquidity_signature = Some(signatures.deposit);
                        artifacts.burn_signature = Some(signatures.burn);
                        artifacts.liquidity_amount_sol = Some(config.liquidity_amount_sol);
                        info!(
                            "cycle {}: deposited and burned {:.6} SOL of liquidity",
                            cycle_id, config.liquidity_amount_sol
                        );
                    }
                    Gate::Denied { retry_after } => {
                        debug!(
                            "cycle {}: deposit window not elapsed (retry in {:?})",
                            cycle_id, retry_after
                        );
                    }
                }
            }
        }
        self.storage
            .update_cycle_progress(cycle_id, 5, artifacts)
            .await?;

        // Step 6: reward evaluation.
        self.evaluate_reward(cycle_id, artifacts).await?;
        self.storage
            .update_cycle_progress(cycle_id, 6, artifacts)
            .await?;

        Ok(())
    }

    /// Pay the trader reward when the counter has reached its threshold.
    /// The threshold state resets whether or not the payout lands — an
    /// unpayable backlog must not re-trigger on every cycle. A failed payout
    /// still fails the cycle so the miss is visible in the record.
    async fn evaluate_reward(&self, cycle_id: i64, artifacts: &mut CycleArtifacts) -> Result<()> {
        let state = self.counter.state().await?;
        if state.current_count < state.current_threshold {
            debug!(
                "cycle {}: reward not due ({}/{} qualifying trades)",
                cycle_id, state.current_count, state.current_threshold
            );
            return Ok(());
        }

        let Some(reward_sol) = self.config.reward_amount_sol else {
            debug!("cycle {}: reward due but no amount configured", cycle_id);
            return Ok(());
        };

        let recipient = match &self.config.reward_mode {
            RewardMode::FixedAddress(address) => Some(address.clone()),
            RewardMode::LastQualifyingTrader => {
                self.storage
                    .last_qualifying_trader(self.counter.min_qualifying_sol())
                    .await?
            }
        };

        let transfer_result = match &recipient {
            Some(to) => self.chain.transfer(to, reward_sol).await.map(Some),
            None => {
                warn!("cycle {}: reward due but no recipient resolvable", cycle_id);
                Ok(None)
            }
        };

        let new_threshold = self.counter.reset().await?;
        debug!(
            "cycle {}: trade counter reset, next threshold {}",
            cycle_id, new_threshold
        );

        match transfer_result {
            Ok(Some(signature)) => {
                artifacts.reward_signature = Some(signature);
                artifacts.reward_amount_sol = Some(reward_sol);
                info!(
                    "cycle {}: paid {:.6} SOL reward to {}",
                    cycle_id,
                    reward_sol,
                    recipient.as_deref().unwrap_or("?")
                );
                log_activity(
                    &self.activity,
                    Severity::Info,
                    format!("reward of {reward_sol} SOL paid"),
                );
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => {
                warn!(
                    "cycle {}: reward transfer failed after counter reset: {:#}",
                    cycle_id, e
                );
                Err(e.context("reward transfer failed"))
            }
        }
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}


#[cfg(test)]
mod tests {
    use super::test_support::ScriptedChain;
    use super::*;
    use crate::engine::activity::ActivityLog;
    use crate::engine::counter::test_support::FixedThreshold;
    use crate::engine::storage::SqliteStore;
    use crate::types::Trade;

    const SOL: u64 = 1_000_000_000;

    fn config() -> EngineConfig {
        EngineConfig {
            treasury_address: "Treasury111".to_string(),
            platform_address: Some("Platform111".to_string()),
            platform_split_bps: 1000,
            reward_amount_sol: Some(0.25),
            ..Default::default()
        }
    }

    struct Harness {
        storage: Arc<dyn EngineStorage>,
        counter: Arc<TradeCounter>,
        executor: CycleExecutor,
        chain: Arc<ScriptedChain>,
    }

    async fn harness(config: EngineConfig, chain: ScriptedChain, threshold: u32) -> Harness {
        let store = SqliteStore::in_memory().await.unwrap();
        let storage: Arc<dyn EngineStorage> = store;
        let chain = Arc::new(chain);
        let counter = Arc::new(TradeCounter::new(
            storage.clone(),
            Arc::new(FixedThreshold::new(vec![threshold])),
            config.min_qualifying_sol,
            config.threshold_min,
            config.threshold_max,
        ));
        counter.init().await.unwrap();

        let executor = CycleExecutor::new(
            storage.clone(),
            chain.clone(),
            counter.clone(),
            ActivityLog::shared(),
            Arc::new(config),
        );

        Harness {
            storage,
            counter,
            executor,
            chain,
        }
    }

    fn qualifying_trade(trader: &str, sol: f64) -> Trade {
        Trade {
            signature: Some(format!("sig-{trader}-{sol}")),
            venue: Some("pump".to_string()),
            amount_sol: Some(sol),
            amount_tokens: Some(1000.0),
            price_per_token: None,
            trader: Some(trader.to_string()),
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    #[tokio::test]
    async fn successful_cycle_claims_splits_and_buys() {
        // 2 SOL of fees appear between the two balance reads.
        let chain = ScriptedChain::with_balances(vec![10 * SOL, 12 * SOL]);
        let h = harness(config(), chain, 50).await;

        let outcome = h.executor.execute_cycle("MintAAA").await.unwrap();
        assert!(outcome.is_completed());

        let record = &h.storage.recent_cycles(1).await.unwrap()[0];
        assert_eq!(record.status, CycleStatus::Completed);
        assert_eq!(record.step_number, 6);
        assert_eq!(record.artifacts.fee_signature.as_deref(), Some("fee-sig"));
        assert_eq!(record.artifacts.fee_amount_sol, Some(2.0));
        assert_eq!(record.artifacts.buy_signature.as_deref(), Some("buy-sig"));
        // 10% platform cut: 1.8 SOL carried into the buy-back.
        let bought = record.artifacts.buy_amount_sol.unwrap();
        assert!((bought - 1.8).abs() < 1e-9, "got {bought}");

        let calls = h.chain.calls();
        assert_eq!(calls[0], "balance:Treasury111");
        assert_eq!(calls[1], "collect_fee:MintAAA");
        assert_eq!(calls[2], "balance:Treasury111");
        assert_eq!(calls[3], "transfer:Platform111:0.2000");
        assert_eq!(calls[4], "buy:MintAAA:1.8000");
    }

    #[tokio::test]
    async fn immediate_rerun_is_rate_limited() {
        let chain = ScriptedChain::with_balances(vec![10 * SOL, 12 * SOL, 12 * SOL]);
        let h = harness(config(), chain, 50).await;

        let first = h.executor.execute_cycle("MintAAA").await.unwrap();
        assert!(first.is_completed());

        let second = h.executor.execute_cycle("MintAAA").await.unwrap();
        assert!(matches!(second, CycleOutcome::RateLimited { .. }));

        // The denial was a no-op: exactly one cycle record exists.
        assert_eq!(h.storage.recent_cycles(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn zero_fee_delta_skips_split_and_buy() {
        let chain = ScriptedChain::with_balances(vec![10 * SOL, 10 * SOL]);
        let h = harness(config(), chain, 50).await;

        let outcome = h.executor.execute_cycle("MintAAA").await.unwrap();
        assert!(outcome.is_completed());

        let record = &h.storage.recent_cycles(1).await.unwrap()[0];
        assert_eq!(record.artifacts.fee_amount_sol, Some(0.0));
        assert!(record.artifacts.buy_signature.is_none());

        let calls = h.chain.calls();
        assert!(!calls.iter().any(|c| c.starts_with("transfer:Platform111")));
        assert!(!calls.iter().any(|c| c.starts_with("buy:")));
    }

    #[tokio::test]
    async fn failed_buy_keeps_fee_signature_in_failed_record() {
        let mut chain = ScriptedChain::with_balances(vec![10 * SOL, 12 * SOL]);
        chain.fail_buy = true;
        let h = harness(config(), chain, 50).await;

        let outcome = h.executor.execute_cycle("MintAAA").await.unwrap();
        assert!(!outcome.is_completed());

        let record = &h.storage.recent_cycles(1).await.unwrap()[0];
        assert_eq!(record.status, CycleStatus::Failed);
        assert_eq!(record.artifacts.fee_signature.as_deref(), Some("fee-sig"));
        assert!(record.artifacts.buy_signature.is_none());
        let message = record.error_message.as_deref().unwrap();
        assert!(message.contains("buy-back swap failed"), "got: {message}");
    }

    #[tokio::test]
    async fn reward_pays_last_qualifying_trader_and_resets_counter() {
        let chain = ScriptedChain::with_balances(vec![10 * SOL, 12 * SOL]);
        let h = harness(config(), chain, 2).await;

        h.counter.record(&qualifying_trade("alice", 1.0)).await.unwrap();
        h.counter.record(&qualifying_trade("bob", 2.0)).await.unwrap();
        assert!(h.counter.is_due().await.unwrap());

        let outcome = h.executor.execute_cycle("MintAAA").await.unwrap();
        assert!(outcome.is_completed());

        let record = &h.storage.recent_cycles(1).await.unwrap()[0];
        assert_eq!(
            record.artifacts.reward_signature.as_deref(),
            Some("transfer-sig")
        );
        assert_eq!(record.artifacts.reward_amount_sol, Some(0.25));

        let calls = h.chain.calls();
        assert!(calls.iter().any(|c| c == "transfer:bob:0.2500"));

        // Redrawn from the scripted source; count back to zero.
        let state = h.counter.state().await.unwrap();
        assert_eq!(state.current_count, 0);
        assert_eq!(state.current_threshold, 2);
    }

    #[tokio::test]
    async fn reward_transfer_failure_still_resets_counter() {
        let mut chain = ScriptedChain::with_balances(vec![10 * SOL, 10 * SOL]);
        chain.fail_transfer = true;
        let h = harness(config(), chain, 2).await;

        h.counter.record(&qualifying_trade("alice", 1.0)).await.unwrap();
        h.counter.record(&qualifying_trade("bob", 2.0)).await.unwrap();

        let outcome = h.executor.execute_cycle("MintAAA").await.unwrap();
        assert!(!outcome.is_completed());

        // The miss is visible in the failed record, and the backlog cannot
        // re-trigger: the counter was reset anyway.
        let record = &h.storage.recent_cycles(1).await.unwrap()[0];
        assert_eq!(record.status, CycleStatus::Failed);
        assert!(record.artifacts.reward_signature.is_none());

        let state = h.counter.state().await.unwrap();
        assert_eq!(state.current_count, 0);
    }

    #[tokio::test]
    async fn fixed_reward_mode_ignores_trade_history() {
        let chain = ScriptedChain::with_balances(vec![10 * SOL, 10 * SOL]);
        let mut config = config();
        config.reward_mode = RewardMode::FixedAddress("Fixed111".to_string());
        let h = harness(config, chain, 1).await;

        h.counter.record(&qualifying_trade("alice", 1.0)).await.unwrap();

        let outcome = h.executor.execute_cycle("MintAAA").await.unwrap();
        assert!(outcome.is_completed());

        let calls = h.chain.calls();
        assert!(calls.iter().any(|c| c == "transfer:Fixed111:0.2500"));
    }

    #[tokio::test]
    async fn liquidity_step_runs_when_pool_configured() {
        let chain = ScriptedChain::with_balances(vec![10 * SOL, 10 * SOL]);
        let mut config = config();
        config.pool_key = Some("Pool111".to_string());
        config.liquidity_amount_sol = 0.5;
        let h = harness(config, chain, 50).await;

        let outcome = h.executor.execute_cycle("MintAAA").await.unwrap();
        assert!(outcome.is_completed());

        let record = &h.storage.recent_cycles(1).await.unwrap()[0];
        assert_eq!(
            record.artifacts.liquidity_signature.as_deref(),
            Some("deposit-sig")
        );
        assert_eq!(record.artifacts.burn_signature.as_deref(), Some("burn-sig"));
        assert_eq!(record.artifacts.liquidity_amount_sol, Some(0.5));
    }

    #[tokio::test]
    async fn partially_elapsed_window_denies_then_a_full_window_permits() {
        // Seeded state: the run-cycle window was consumed 10s ago with a 30s
        // window. A cycle now must be denied without touching the chain.
        let chain = ScriptedChain::with_balances(vec![10 * SOL, 12 * SOL]);
        let mut config = config();
        config.cycle_window_secs = 30;
        let h = harness(config, chain, 50).await;

        let now = chrono::Utc::now().timestamp_millis();
        assert!(h
            .storage
            .try_consume(RUN_CYCLE_KEY, 30, now - 10_000)
            .await
            .unwrap()
            .is_none());

        let denied = h.executor.execute_cycle("MintAAA").await.unwrap();
        assert!(matches!(denied, CycleOutcome::RateLimited { .. }));
        assert!(h.chain.calls().is_empty());

        // With the last execution a full window in the past, the cycle
        // proceeds all the way to the fee claim.
        let chain = ScriptedChain::with_balances(vec![10 * SOL, 12 * SOL]);
        let h = harness(
            EngineConfig {
                cycle_window_secs: 30,
                ..super::tests::config()
            },
            chain,
            50,
        )
        .await;

        let now = chrono::Utc::now().timestamp_millis();
        assert!(h
            .storage
            .try_consume(RUN_CYCLE_KEY, 30, now - 31_000)
            .await
            .unwrap()
            .is_none());

        let outcome = h.executor.execute_cycle("MintAAA").await.unwrap();
        assert!(outcome.is_completed());
        assert!(h
            .chain
            .calls()
            .iter()
            .any(|c| c == "collect_fee:MintAAA"));
    }

    #[tokio::test]
    async fn fee_claim_failure_fails_the_cycle_before_any_spend() {
        let mut chain = ScriptedChain::with_balances(vec![10 * SOL]);
        chain.fail_collect = true;
        let h = harness(config(), chain, 50).await;

        let outcome = h.executor.execute_cycle("MintAAA").await.unwrap();
        assert!(!outcome.is_completed());

        let record = &h.storage.recent_cycles(1).await.unwrap()[0];
        assert_eq!(record.status, CycleStatus::Failed);
        assert!(record.artifacts.fee_signature.is_none());

        let calls = h.chain.calls();
        assert!(!calls.iter().any(|c| c.starts_with("transfer:")));
        assert!(!calls.iter().any(|c| c.starts_with("buy:")));
    }
}

//! Durable qualifying-trade counter gating the reward payout.
//!
//! Every normalized trade is persisted; only trades meeting the minimum SOL
//! amount (boundary inclusive) advance the counter. When the counter reaches
//! the current threshold, the executor pays a reward and resets the state
//! with a freshly drawn threshold. Randomness is injected so tests can drive
//! deterministic sequences.

use anyhow::Result;
use rand::Rng;
use std::sync::Arc;
use tracing::debug;

use crate::engine::storage::EngineStorage;
use crate::types::{ThresholdState, Trade};

/// Source of redrawn reward thresholds.
pub trait ThresholdRng: Send + Sync {
    /// Draw a threshold uniformly from `[min, max]`.
    fn draw(&self, min: u32, max: u32) -> u32;
}

/// Production source backed by the thread-local RNG.
pub struct ThreadRngThreshold;

impl ThresholdRng for ThreadRngThreshold {
    fn draw(&self, min: u32, max: u32) -> u32 {
        rand::thread_rng().gen_range(min..=max)
    }
}

pub struct TradeCounter {
    storage: Arc<dyn EngineStorage>,
    rng: Arc<dyn ThresholdRng>,
    min_qualifying_sol: f64,
    threshold_min: u32,
    threshold_max: u32,
}

impl TradeCounter {
    pub fn new(
        storage: Arc<dyn EngineStorage>,
        rng: Arc<dyn ThresholdRng>,
        min_qualifying_sol: f64,
        threshold_min: u32,
        threshold_max: u32,
    ) -> Self {
        Self {
            storage,
            rng,
            min_qualifying_sol,
            threshold_min,
            threshold_max,
        }
    }

    /// Seed the singleton threshold row if this is a fresh database.
    pub async fn init(&self) -> Result<()> {
        let initial = self.rng.draw(self.threshold_min, self.threshold_max);
        self.storage.ensure_threshold(initial, now_ms()).await
    }

    pub fn min_qualifying_sol(&self) -> f64 {
        self.min_qualifying_sol
    }

    /// Persist a normalized trade and, when it qualifies, advance the
    /// counter. Returns whether the trade counted.
    pub async fn record(&self, trade: &Trade) -> Result<bool> {
        self.storage.insert_trade(trade).await?;

        let qualifies = trade
            .amount_sol
            .map(|sol| sol >= self.min_qualifying_sol)
            .unwrap_or(false);

        if qualifies {
            let count = self.storage.increment_trade_count(now_ms()).await?;
            debug!(
                "qualifying trade recorded (sol={:?}); count now {}",
                trade.amount_sol, count
            );
        }

        Ok(qualifies)
    }

    pub async fn state(&self) -> Result<ThresholdState> {
        self.storage.threshold_state().await
    }

    /// Whether the counter has reached the current threshold.
    pub async fn is_due(&self) -> Result<bool> {
        let state = self.state().await?;
        Ok(state.current_count >= state.current_threshold)
    }

    /// Zero the counter and install a new random threshold. Returns the new
    /// threshold.
    pub async fn reset(&self) -> Result<u32> {
        let new_threshold = self.rng.draw(self.threshold_min, self.threshold_max);
        self.storage.reset_threshold(new_threshold, now_ms()).await?;
        debug!("trade counter reset; next reward at {} trades", new_threshold);
        Ok(new_threshold)
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

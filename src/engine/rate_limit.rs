//! Per-operation cooldown windows backed by shared persistent state.
//!
//! Each side-effecting operation (`run-cycle`, `buy`, `deposit`) has an
//! independently configured minimum elapsed time between invocations, shared
//! across all replicas. The reservation is pessimistic: `last_executed_at`
//! is stamped in the same statement that grants permission, before the side
//! effect runs, and is never rolled back when the side effect later fails.
//! The next successful attempt waits out the full window — a conservative
//! bias against double spending.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

use crate::engine::storage::EngineStorage;

/// Cooldown key for the whole buyback cycle.
pub const RUN_CYCLE_KEY: &str = "run-cycle";
/// Cooldown key for buy-back swaps.
pub const BUY_KEY: &str = "buy";
/// Cooldown key for liquidity deposits.
pub const DEPOSIT_KEY: &str = "deposit";

/// Outcome of a cooldown check. A denial is a normal no-op, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Gate {
    Allowed,
    Denied { retry_after: Duration },
}

impl Gate {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Gate::Allowed)
    }
}

#[derive(Clone)]
pub struct CooldownLimiter {
    storage: Arc<dyn EngineStorage>,
}

impl CooldownLimiter {
    pub fn new(storage: Arc<dyn EngineStorage>) -> Self {
        Self { storage }
    }

    /// Consume the window for `key` at the current wall-clock time.
    #[instrument(skip(self))]
    pub async fn try_consume(&self, key: &str, window_secs: i64) -> Result<Gate> {
        self.try_consume_at(key, window_secs, chrono::Utc::now().timestamp_millis())
            .await
    }

    /// Time-explicit variant used by tests and replays.
    pub async fn try_consume_at(&self, key: &str, window_secs: i64, now_ms: i64) -> Result<Gate> {
        match self.storage.try_consume(key, window_secs, now_ms).await? {
            None => Ok(Gate::Allowed),
            Some(retry_after_ms) => Ok(Gate::Denied {
                retry_after: Duration::from_millis(retry_after_ms.max(0) as u64),
            }),
        }
    }
}

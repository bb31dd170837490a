//! Engine module - coordinated buyback-cycle subsystem.
//!
//! This module contains the leader election (lease), per-operation cooldown
//! windows, the durable qualifying-trade counter, the trade-feed consumer,
//! the leader's scheduler loop, and the cycle executor, all over a shared
//! storage contract. Services are explicitly constructed with injected
//! dependencies and run/stop lifecycles; nothing initializes lazily behind a
//! global.

pub mod activity;
pub mod chain;
pub mod counter;
pub mod executor;
pub mod lease;
pub mod rate_limit;
pub mod scheduler;
pub mod storage;
pub mod stream;

// Re-export main public types
pub use activity::{ActivityEntry, ActivityLog, Severity, SharedActivityLog};
pub use chain::{ChainOps, LiquiditySignatures, TxEngineClient};
pub use counter::{ThreadRngThreshold, ThresholdRng, TradeCounter};
pub use executor::{CycleExecutor, CycleOutcome};
pub use lease::{LeaseManager, CYCLE_DRIVER_RESOURCE};
pub use rate_limit::{CooldownLimiter, Gate, BUY_KEY, DEPOSIT_KEY, RUN_CYCLE_KEY};
pub use scheduler::{CycleScheduler, SchedulerStats, StatusReport};
pub use storage::{EngineStorage, SqliteStore};
pub use stream::{StreamConfig, StreamConsumer, StreamHealth, MONITORED_MINT_KEY};

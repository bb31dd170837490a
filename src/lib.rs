//! Flywheel - creator-fee buyback engine.
//!
//! A recurring cycle against a monitored token: claim accrued creator fees,
//! forward a platform cut, buy the token back, optionally deposit+burn
//! liquidity, and pay a trader reward once enough qualifying trades have
//! accumulated. Replicas coordinate through lease-based leadership and
//! persistent per-operation cooldown windows.

pub mod config;
pub mod engine;
pub mod types;

// Re-export main types for convenience
pub use config::{EngineConfig, RewardMode};
pub use types::{CycleRecord, CycleStatus, ThresholdState, Trade};

//! Core types and data structures for the flywheel engine.

use serde::{Deserialize, Serialize};

/// A simple public key representation (using string to keep domain types free
/// of Solana dependencies; parsing happens at the RPC boundary)
pub type Pubkey = String;

/// A trade observed on the monitored token's market, normalized from the feed.
///
/// Trades are append-only. A partially populated trade (e.g. signature and
/// venue only) is still recorded; dropping a real trade is worse than storing
/// incomplete data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    /// Transaction signature, when the feed supplied one
    pub signature: Option<String>,
    /// Venue/program the trade executed on
    pub venue: Option<String>,
    /// SOL side of the trade
    pub amount_sol: Option<f64>,
    /// Token side of the trade
    pub amount_tokens: Option<f64>,
    /// Explicit price, or derived SOL/token when both amounts are present
    pub price_per_token: Option<f64>,
    /// Trader wallet address
    pub trader: Option<Pubkey>,
    /// Unix timestamp (ms) when the trade was recorded
    pub created_at: i64,
}

/// Lifecycle status of a buyback cycle. A cycle is created `Pending` and
/// transitions exactly once to `Completed` or `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CycleStatus {
    Pending,
    Completed,
    Failed,
}

impl CycleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleStatus::Pending => "pending",
            CycleStatus::Completed => "completed",
            CycleStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(CycleStatus::Pending),
            "completed" => Some(CycleStatus::Completed),
            "failed" => Some(CycleStatus::Failed),
            _ => None,
        }
    }
}

/// Signatures and amounts produced by the steps of one cycle run.
///
/// Filled in incrementally as steps complete; a failed cycle keeps whatever
/// was obtained before the failing step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CycleArtifacts {
    pub fee_signature: Option<String>,
    pub buy_signature: Option<String>,
    pub liquidity_signature: Option<String>,
    pub burn_signature: Option<String>,
    pub reward_signature: Option<String>,
    pub fee_amount_sol: Option<f64>,
    pub buy_amount_sol: Option<f64>,
    pub liquidity_amount_sol: Option<f64>,
    pub reward_amount_sol: Option<f64>,
}

/// Complete persisted record of one buyback cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleRecord {
    /// Database record ID (set by DB)
    pub id: i64,
    /// The mint this cycle ran against
    pub mint: Pubkey,
    pub status: CycleStatus,
    /// Last step reached (1-based)
    pub step_number: i64,
    pub total_steps: i64,
    #[serde(flatten)]
    pub artifacts: CycleArtifacts,
    /// Populated when the cycle failed
    pub error_message: Option<String>,
    /// Unix timestamp (ms) when the cycle was created
    pub created_at: i64,
    /// Unix timestamp (ms) when the cycle reached a terminal status
    pub executed_at: Option<i64>,
}

/// Durable qualifying-trade counter plus the randomized reward threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdState {
    pub current_threshold: i64,
    pub current_count: i64,
    pub updated_at: i64,
}

/// The singleton leadership lease for a coordinated resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub resource: String,
    pub owner_id: String,
    /// Unix timestamp (ms) past which the lease may be taken over
    pub expires_at: i64,
    /// Unix timestamp (ms) of the holder's last successful renewal
    pub heartbeat_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_status_round_trips_through_text() {
        for status in [
            CycleStatus::Pending,
            CycleStatus::Completed,
            CycleStatus::Failed,
        ] {
            assert_eq!(CycleStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(CycleStatus::parse("resurrected"), None);
    }
}

//! Runtime configuration for the flywheel engine.
//!
//! `EngineConfig` carries every operational knob: persistence, leadership,
//! rate-limit windows, feed qualification, reward drawing, and the opaque
//! transaction-engine endpoints. Defaults are safe for a dormant instance;
//! `from_env` applies operator overrides.

use anyhow::{Context, Result};
use nonempty::NonEmpty;
use std::time::Duration;

use crate::types::Pubkey;

/// How the reward recipient is resolved when the trade threshold is reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RewardMode {
    /// Always pay a fixed configured address
    FixedAddress(Pubkey),
    /// Pay the trader behind the most recent qualifying trade
    LastQualifyingTrader,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// SQLite connection URL shared by all replicas
    pub database_url: String,
    /// Identity used for lease ownership; unique per process instance
    pub instance_id: String,
    /// Solana RPC endpoints for balance reads; the head is primary
    pub rpc_endpoints: NonEmpty<String>,
    /// Base URL of the opaque transaction-signing engine
    pub engine_url: String,
    /// Credential for the signing engine; absence fails the health check
    pub engine_api_key: Option<String>,
    /// Trade feed websocket endpoint
    pub ws_url: String,
    /// Treasury wallet whose balance delta measures claimed fees
    pub treasury_address: Pubkey,
    /// Platform cut destination; no split when unset
    pub platform_address: Option<Pubkey>,
    /// Platform cut in basis points of the claimed fee delta
    pub platform_split_bps: u16,
    /// Cooldown window for the whole cycle (`run-cycle` key)
    pub cycle_window_secs: i64,
    /// Cooldown window for buy-backs (`buy` key)
    pub buy_window_secs: i64,
    /// Cooldown window for liquidity deposits (`deposit` key)
    pub deposit_window_secs: i64,
    /// Scheduler tick interval
    pub cycle_interval: Duration,
    /// Shorter sleep after an errored tick
    pub recovery_sleep: Duration,
    /// Lease time-to-live; renewed every tick
    pub lease_ttl: Duration,
    /// Feed heartbeat staleness beyond which the system is unhealthy
    pub heartbeat_stale_after: Duration,
    /// Minimum SOL amount for a trade to count toward the reward (inclusive)
    pub min_qualifying_sol: f64,
    /// Lower bound of the redrawn reward threshold
    pub threshold_min: u32,
    /// Upper bound of the redrawn reward threshold
    pub threshold_max: u32,
    /// Reward payout size; rewards are disabled when unset
    pub reward_amount_sol: Option<f64>,
    pub reward_mode: RewardMode,
    /// Liquidity pool key; deposits are disabled when unset
    pub pool_key: Option<String>,
    /// SOL allocated to each liquidity deposit (0 = dormant)
    pub liquidity_amount_sol: f64,
    /// Swap slippage tolerance in basis points
    pub slippage_bps: u16,
    /// Priority fee attached to buy-back swaps, in SOL
    pub priority_fee_sol: f64,
    /// Age past which a pending cycle is presumed abandoned
    pub stuck_age: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite:flywheel.db?mode=rwc".to_string(),
            instance_id: format!("flywheel-{:08x}", rand::random::<u32>()),
            rpc_endpoints: NonEmpty::new("https://api.mainnet-beta.solana.com".to_string()),
            engine_url: "http://127.0.0.1:8899".to_string(),
            engine_api_key: None,
            ws_url: "wss://pumpportal.fun/api/data".to_string(),
            treasury_address: String::new(),
            platform_address: None,
            platform_split_bps: 1000,
            cycle_window_secs: 300,
            buy_window_secs: 60,
            deposit_window_secs: 300,
            cycle_interval: Duration::from_secs(120),
            recovery_sleep: Duration::from_secs(15),
            lease_ttl: Duration::from_secs(300),
            heartbeat_stale_after: Duration::from_secs(120),
            min_qualifying_sol: 0.5,
            threshold_min: 30,
            threshold_max: 300,
            reward_amount_sol: None,
            reward_mode: RewardMode::LastQualifyingTrader,
            pool_key: None,
            liquidity_amount_sol: 0.0,
            slippage_bps: 300,
            priority_fee_sol: 0.0001,
            stuck_age: Duration::from_secs(600),
        }
    }
}

impl EngineConfig {
    /// Build the configuration from defaults plus `FLYWHEEL_*` environment
    /// overrides.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(url) = env_string("FLYWHEEL_DATABASE_URL") {
            config.database_url = url;
        }
        if let Some(id) = env_string("FLYWHEEL_INSTANCE_ID") {
            config.instance_id = id;
        }
        if let Some(raw) = env_string("FLYWHEEL_RPC_ENDPOINTS") {
            let endpoints: Vec<String> = raw
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            config.rpc_endpoints = NonEmpty::from_vec(endpoints)
                .context("FLYWHEEL_RPC_ENDPOINTS must list at least one endpoint")?;
        }
        if let Some(url) = env_string("FLYWHEEL_ENGINE_URL") {
            config.engine_url = url;
        }
        config.engine_api_key = env_string("FLYWHEEL_ENGINE_API_KEY").or(config.engine_api_key);
        if let Some(url) = env_string("FLYWHEEL_WS_URL") {
            config.ws_url = url;
        }
        if let Some(addr) = env_string("FLYWHEEL_TREASURY") {
            config.treasury_address = addr;
        }
        config.platform_address = env_string("FLYWHEEL_PLATFORM_ADDRESS").or(config.platform_address);
        if let Some(bps) = env_parsed("FLYWHEEL_PLATFORM_SPLIT_BPS")? {
            config.platform_split_bps = bps;
        }
        if let Some(secs) = env_parsed("FLYWHEEL_CYCLE_WINDOW_SECS")? {
            config.cycle_window_secs = secs;
        }
        if let Some(secs) = env_parsed("FLYWHEEL_BUY_WINDOW_SECS")? {
            config.buy_window_secs = secs;
        }
        if let Some(secs) = env_parsed("FLYWHEEL_DEPOSIT_WINDOW_SECS")? {
            config.deposit_window_secs = secs;
        }
        if let Some(secs) = env_parsed::<u64>("FLYWHEEL_CYCLE_INTERVAL_SECS")? {
            config.cycle_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parsed::<u64>("FLYWHEEL_LEASE_TTL_SECS")? {
            config.lease_ttl = Duration::from_secs(secs);
        }
        if let Some(sol) = env_parsed("FLYWHEEL_MIN_QUALIFYING_SOL")? {
            config.min_qualifying_sol = sol;
        }
        if let Some(min) = env_parsed("FLYWHEEL_THRESHOLD_MIN")? {
            config.threshold_min = min;
        }
        if let Some(max) = env_parsed("FLYWHEEL_THRESHOLD_MAX")? {
            config.threshold_max = max;
        }
        config.reward_amount_sol = env_parsed("FLYWHEEL_REWARD_AMOUNT_SOL")?
            .or(config.reward_amount_sol);
        if let Some(addr) = env_string("FLYWHEEL_REWARD_ADDRESS") {
            config.reward_mode = RewardMode::FixedAddress(addr);
        }
        config.pool_key = env_string("FLYWHEEL_POOL_KEY").or(config.pool_key);
        if let Some(sol) = env_parsed("FLYWHEEL_LIQUIDITY_SOL")? {
            config.liquidity_amount_sol = sol;
        }
        if let Some(bps) = env_parsed("FLYWHEEL_SLIPPAGE_BPS")? {
            config.slippage_bps = bps;
        }
        if let Some(sol) = env_parsed("FLYWHEEL_PRIORITY_FEE_SOL")? {
            config.priority_fee_sol = sol;
        }

        if config.threshold_min == 0 || config.threshold_min > config.threshold_max {
            anyhow::bail!(
                "invalid reward threshold range [{}, {}]",
                config.threshold_min,
                config.threshold_max
            );
        }

        Ok(config)
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> Result<Option<T>>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env_string(key) {
        Some(raw) => {
            let value = raw
                .parse::<T>()
                .with_context(|| format!("failed to parse {key}={raw}"))?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_describe_a_dormant_instance() {
        let config = EngineConfig::default();

        assert_eq!(config.platform_split_bps, 1000);
        assert_eq!(config.liquidity_amount_sol, 0.0);
        assert!(config.reward_amount_sol.is_none());
        assert!(config.pool_key.is_none());
        assert_eq!(config.threshold_min, 30);
        assert_eq!(config.threshold_max, 300);
        assert_eq!(config.min_qualifying_sol, 0.5);
        assert_eq!(config.cycle_interval, Duration::from_secs(120));
        assert_eq!(config.stuck_age, Duration::from_secs(600));
    }

    #[test]
    fn instance_ids_are_unique_per_construction() {
        let a = EngineConfig::default();
        let b = EngineConfig::default();
        assert_ne!(a.instance_id, b.instance_id);
    }
}

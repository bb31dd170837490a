//! Storage abstraction layer for the flywheel engine.
//!
//! This module defines the formal contract for data persistence operations,
//! allowing for clean separation between business logic and storage
//! implementation. The lease, rate-limit, threshold, and cycle tables are the
//! only shared mutable state between replicas; every mutation to them is a
//! single conditional statement decided by `rows_affected()`, never a
//! read-modify-write across two round trips.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{sqlite::SqlitePoolOptions, FromRow, Pool, Sqlite};
use std::sync::Arc;
use tracing::{debug, info};

use crate::types::{CycleArtifacts, CycleRecord, CycleStatus, LeaseRecord, ThresholdState, Trade};

/// Formal contract for the engine's persistent state.
#[async_trait]
pub trait EngineStorage: Send + Sync {
    // --- Leadership lease ---

    /// Attempt to take (or keep) the lease on `resource` for `owner_id`.
    /// Succeeds when the lease is absent, already owned, or expired.
    async fn acquire_lease(
        &self,
        resource: &str,
        owner_id: &str,
        now_ms: i64,
        ttl_ms: i64,
    ) -> Result<bool>;

    /// Extend a currently held, unexpired lease. Returns false when the
    /// caller no longer holds it.
    async fn renew_lease(
        &self,
        resource: &str,
        owner_id: &str,
        now_ms: i64,
        ttl_ms: i64,
    ) -> Result<bool>;

    async fn get_lease(&self, resource: &str) -> Result<Option<LeaseRecord>>;

    /// Drop the lease if held by `owner_id`; a no-op otherwise.
    async fn release_lease(&self, resource: &str, owner_id: &str) -> Result<()>;

    // --- Per-operation cooldown windows ---

    /// Reserve the cooldown window for `key`. Returns `None` when the caller
    /// may proceed (the reservation is already persisted), or
    /// `Some(retry_after_ms)` when the window has not elapsed.
    async fn try_consume(&self, key: &str, window_secs: i64, now_ms: i64) -> Result<Option<i64>>;

    // --- Reward threshold state ---

    /// Create the singleton threshold row if missing. Concurrent replicas
    /// racing here keep the first-written threshold.
    async fn ensure_threshold(&self, initial_threshold: u32, now_ms: i64) -> Result<()>;

    async fn threshold_state(&self) -> Result<ThresholdState>;

    /// Increment the qualifying-trade counter, returning the new count.
    async fn increment_trade_count(&self, now_ms: i64) -> Result<i64>;

    /// Zero the counter and install a freshly drawn threshold.
    async fn reset_threshold(&self, new_threshold: u32, now_ms: i64) -> Result<()>;

    // --- Trade log ---

    async fn insert_trade(&self, trade: &Trade) -> Result<i64>;

    async fn recent_trades(&self, limit: i64) -> Result<Vec<Trade>>;

    /// Wallet behind the most recent trade at or above `min_sol`.
    async fn last_qualifying_trader(&self, min_sol: f64) -> Result<Option<String>>;

    // --- Cycle records ---

    async fn insert_cycle(&self, mint: &str, total_steps: i64, created_at: i64) -> Result<i64>;

    /// Record step progress and any artifacts obtained so far. Artifact
    /// columns already set are kept when the new value is absent.
    async fn update_cycle_progress(
        &self,
        id: i64,
        step_number: i64,
        artifacts: &CycleArtifacts,
    ) -> Result<()>;

    /// Transition a cycle out of `pending`. Returns false when the cycle was
    /// already terminal (the transition happens exactly once).
    async fn finish_cycle(
        &self,
        id: i64,
        status: CycleStatus,
        error_message: Option<&str>,
        executed_at: i64,
    ) -> Result<bool>;

    async fn pending_cycles(&self) -> Result<Vec<CycleRecord>>;

    /// Force-fail every pending cycle created before `cutoff_ms`. Idempotent;
    /// returns how many rows transitioned.
    async fn fail_stuck_cycles(&self, cutoff_ms: i64, message: &str, now_ms: i64) -> Result<u64>;

    async fn recent_cycles(&self, limit: i64) -> Result<Vec<CycleRecord>>;

    // --- Operator settings ---

    async fn get_setting(&self, key: &str) -> Result<Option<String>>;

    async fn set_setting(&self, key: &str, value: &str) -> Result<()>;

    /// Health check for the storage backend.
    async fn health_check(&self) -> Result<bool>;
}

/// Helper type for deserializing cycle rows from SQLite
#[derive(FromRow)]
struct CycleRow {
    id: i64,
    mint: String,
    status: String,
    step_number: i64,
    total_steps: i64,
    fee_signature: Option<String>,
    buy_signature: Option<String>,
    liquidity_signature: Option<String>,
    burn_signature: Option<String>,
    reward_signature: Option<String>,
    fee_amount_sol: Option<f64>,
    buy_amount_sol: Option<f64>,
    liquidity_amount_sol: Option<f64>,
    reward_amount_sol: Option<f64>,
    error_message: Option<String>,
    created_at: i64,
    executed_at: Option<i64>,
}

impl CycleRow {
    fn into_record(self) -> Result<CycleRecord> {
        let status = CycleStatus::parse(&self.status)
            .with_context(|| format!("unknown cycle status '{}' for cycle {}", self.status, self.id))?;
        Ok(CycleRecord {
            id: self.id,
            mint: self.mint,
            status,
            step_number: self.step_number,
            total_steps: self.total_steps,
            artifacts: CycleArtifacts {
                fee_signature: self.fee_signature,
                buy_signature: self.buy_signature,
                liquidity_signature: self.liquidity_signature,
                burn_signature: self.burn_signature,
                reward_signature: self.reward_signature,
                fee_amount_sol: self.fee_amount_sol,
                buy_amount_sol: self.buy_amount_sol,
                liquidity_amount_sol: self.liquidity_amount_sol,
                reward_amount_sol: self.reward_amount_sol,
            },
            error_message: self.error_message,
            created_at: self.created_at,
            executed_at: self.executed_at,
        })
    }
}

#[derive(FromRow)]
struct TradeRow {
    signature: Option<String>,
    venue: Option<String>,
    amount_sol: Option<f64>,
    amount_tokens: Option<f64>,
    price_per_token: Option<f64>,
    trader: Option<String>,
    created_at: i64,
}

/// SQLite implementation of the `EngineStorage` trait. The schema is created
/// at connect time so a fresh database is immediately usable.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    pub async fn connect(database_url: &str) -> Result<Arc<Self>> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("Failed to connect to SQLite database")?;

        Self::create_schema(&pool).await?;

        info!("SqliteStore initialized and connected to {}", database_url);

        Ok(Arc::new(Self { pool }))
    }

    /// In-memory store for tests. A single connection keeps every query on
    /// the same `:memory:` database.
    pub async fn in_memory() -> Result<Arc<Self>> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .context("Failed to open in-memory SQLite database")?;

        Self::create_schema(&pool).await?;

        Ok(Arc::new(Self { pool }))
    }

    async fn create_schema(pool: &Pool<Sqlite>) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS leases (
                resource TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                expires_at INTEGER NOT NULL,
                heartbeat_at INTEGER NOT NULL
            );
            "#,
        )
        .execute(pool)
        .await
        .context("Failed to create leases table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS rate_limits (
                key TEXT PRIMARY KEY,
                window_seconds INTEGER NOT NULL,
                last_executed_at INTEGER NOT NULL
            );
            "#,
        )
        .execute(pool)
        .await
        .context("Failed to create rate_limits table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trade_threshold (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                current_threshold INTEGER NOT NULL,
                current_count INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            "#,
        )
        .execute(pool)
        .await
        .context("Failed to create trade_threshold table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                signature TEXT,
                venue TEXT,
                amount_sol REAL,
                amount_tokens REAL,
                price_per_token REAL,
                trader TEXT,
                created_at INTEGER NOT NULL
            );
            "#,
        )
        .execute(pool)
        .await
        .context("Failed to create trades table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cycles (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                mint TEXT NOT NULL,
                status TEXT NOT NULL,
                step_number INTEGER NOT NULL,
                total_steps INTEGER NOT NULL,
                fee_signature TEXT,
                buy_signature TEXT,
                liquidity_signature TEXT,
                burn_signature TEXT,
                reward_signature TEXT,
                fee_amount_sol REAL,
                buy_amount_sol REAL,
                liquidity_amount_sol REAL,
                reward_amount_sol REAL,
                error_message TEXT,
                created_at INTEGER NOT NULL,
                executed_at INTEGER
            );
            "#,
        )
        .execute(pool)
        .await
        .context("Failed to create cycles table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            "#,
        )
        .execute(pool)
        .await
        .context("Failed to create settings table")?;

        Ok(())
    }
}

#[async_trait]
impl EngineStorage for SqliteStore {
    async fn acquire_lease(
        &self,
        resource: &str,
        owner_id: &str,
        now_ms: i64,
        ttl_ms: i64,
    ) -> Result<bool> {
        // Compare-and-set in one statement: the DO UPDATE only fires when the
        // existing row is ours or expired, so two racing replicas cannot both
        // believe they won.
        let result = sqlx::query(
            r#"
            INSERT INTO leases (resource, owner_id, expires_at, heartbeat_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(resource) DO UPDATE SET
                owner_id = excluded.owner_id,
                expires_at = excluded.expires_at,
                heartbeat_at = excluded.heartbeat_at
            WHERE leases.owner_id = excluded.owner_id OR leases.expires_at < ?;
            "#,
        )
        .bind(resource)
        .bind(owner_id)
        .bind(now_ms + ttl_ms)
        .bind(now_ms)
        .bind(now_ms)
        .execute(&self.pool)
        .await
        .context("Failed to acquire lease")?;

        Ok(result.rows_affected() == 1)
    }

    async fn renew_lease(
        &self,
        resource: &str,
        owner_id: &str,
        now_ms: i64,
        ttl_ms: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE leases
            SET expires_at = ?, heartbeat_at = ?
            WHERE resource = ? AND owner_id = ? AND expires_at > ?;
            "#,
        )
        .bind(now_ms + ttl_ms)
        .bind(now_ms)
        .bind(resource)
        .bind(owner_id)
        .bind(now_ms)
        .execute(&self.pool)
        .await
        .context("Failed to renew lease")?;

        Ok(result.rows_affected() == 1)
    }

    async fn get_lease(&self, resource: &str) -> Result<Option<LeaseRecord>> {
        let row: Option<(String, i64, i64)> = sqlx::query_as(
            "SELECT owner_id, expires_at, heartbeat_at FROM leases WHERE resource = ?",
        )
        .bind(resource)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch lease")?;

        Ok(row.map(|(owner_id, expires_at, heartbeat_at)| LeaseRecord {
            resource: resource.to_string(),
            owner_id,
            expires_at,
            heartbeat_at,
        }))
    }

    async fn release_lease(&self, resource: &str, owner_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM leases WHERE resource = ? AND owner_id = ?")
            .bind(resource)
            .bind(owner_id)
            .execute(&self.pool)
            .await
            .context("Failed to release lease")?;

        Ok(())
    }

    async fn try_consume(&self, key: &str, window_secs: i64, now_ms: i64) -> Result<Option<i64>> {
        // Pessimistic reservation: last_executed_at is stamped in the same
        // statement that decides acceptance, before any side effect runs.
        let result = sqlx::query(
            r#"
            INSERT INTO rate_limits (key, window_seconds, last_executed_at)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                last_executed_at = excluded.last_executed_at,
                window_seconds = excluded.window_seconds
            WHERE ? - rate_limits.last_executed_at >= ? * 1000;
            "#,
        )
        .bind(key)
        .bind(window_secs)
        .bind(now_ms)
        .bind(now_ms)
        .bind(window_secs)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to consume rate-limit window for key {key}"))?;

        if result.rows_affected() == 1 {
            debug!("rate-limit window consumed for key {}", key);
            return Ok(None);
        }

        let row: Option<(i64,)> =
            sqlx::query_as("SELECT last_executed_at FROM rate_limits WHERE key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await
                .context("Failed to read rate-limit entry after denial")?;

        let last = row.map(|(v,)| v).unwrap_or(now_ms);
        let retry_after_ms = (window_secs * 1000 - (now_ms - last)).max(0);
        Ok(Some(retry_after_ms))
    }

    async fn ensure_threshold(&self, initial_threshold: u32, now_ms: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO trade_threshold (id, current_threshold, current_count, updated_at)
            VALUES (1, ?, 0, ?);
            "#,
        )
        .bind(initial_threshold as i64)
        .bind(now_ms)
        .execute(&self.pool)
        .await
        .context("Failed to seed trade threshold state")?;

        Ok(())
    }

    async fn threshold_state(&self) -> Result<ThresholdState> {
        let (current_threshold, current_count, updated_at): (i64, i64, i64) = sqlx::query_as(
            "SELECT current_threshold, current_count, updated_at FROM trade_threshold WHERE id = 1",
        )
        .fetch_one(&self.pool)
        .await
        .context("Failed to fetch trade threshold state (was ensure_threshold called?)")?;

        Ok(ThresholdState {
            current_threshold,
            current_count,
            updated_at,
        })
    }

    async fn increment_trade_count(&self, now_ms: i64) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            UPDATE trade_threshold
            SET current_count = current_count + 1, updated_at = ?
            WHERE id = 1
            RETURNING current_count;
            "#,
        )
        .bind(now_ms)
        .fetch_one(&self.pool)
        .await
        .context("Failed to increment trade count")?;

        Ok(count)
    }

    async fn reset_threshold(&self, new_threshold: u32, now_ms: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE trade_threshold
            SET current_count = 0, current_threshold = ?, updated_at = ?
            WHERE id = 1;
            "#,
        )
        .bind(new_threshold as i64)
        .bind(now_ms)
        .execute(&self.pool)
        .await
        .context("Failed to reset trade threshold")?;

        Ok(())
    }

    async fn insert_trade(&self, trade: &Trade) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO trades (
                signature, venue, amount_sol, amount_tokens, price_per_token, trader, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?);
            "#,
        )
        .bind(&trade.signature)
        .bind(&trade.venue)
        .bind(trade.amount_sol)
        .bind(trade.amount_tokens)
        .bind(trade.price_per_token)
        .bind(&trade.trader)
        .bind(trade.created_at)
        .execute(&self.pool)
        .await
        .context("Failed to insert trade")?;

        Ok(result.last_insert_rowid())
    }

    async fn recent_trades(&self, limit: i64) -> Result<Vec<Trade>> {
        let rows: Vec<TradeRow> = sqlx::query_as(
            r#"
            SELECT signature, venue, amount_sol, amount_tokens, price_per_token, trader, created_at
            FROM trades
            ORDER BY created_at DESC, id DESC
            LIMIT ?;
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch recent trades")?;

        Ok(rows
            .into_iter()
            .map(|row| Trade {
                signature: row.signature,
                venue: row.venue,
                amount_sol: row.amount_sol,
                amount_tokens: row.amount_tokens,
                price_per_token: row.price_per_token,
                trader: row.trader,
                created_at: row.created_at,
            })
            .collect())
    }

    async fn last_qualifying_trader(&self, min_sol: f64) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as(
            r#"
            SELECT trader FROM trades
            WHERE trader IS NOT NULL AND amount_sol >= ?
            ORDER BY created_at DESC, id DESC
            LIMIT 1;
            "#,
        )
        .bind(min_sol)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch last qualifying trader")?;

        Ok(row.map(|(trader,)| trader))
    }

    async fn insert_cycle(&self, mint: &str, total_steps: i64, created_at: i64) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO cycles (mint, status, step_number, total_steps, created_at)
            VALUES (?, 'pending', 0, ?, ?);
            "#,
        )
        .bind(mint)
        .bind(total_steps)
        .bind(created_at)
        .execute(&self.pool)
        .await
        .context("Failed to insert cycle record")?;

        Ok(result.last_insert_rowid())
    }

    async fn update_cycle_progress(
        &self,
        id: i64,
        step_number: i64,
        artifacts: &CycleArtifacts,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE cycles
            SET
                step_number = ?,
                fee_signature = COALESCE(?, fee_signature),
                buy_signature = COALESCE(?, buy_signature),
                liquidity_signature = COALESCE(?, liquidity_signature),
                burn_signature = COALESCE(?, burn_signature),
                reward_signature = COALESCE(?, reward_signature),
                fee_amount_sol = COALESCE(?, fee_amount_sol),
                buy_amount_sol = COALESCE(?, buy_amount_sol),
                liquidity_amount_sol = COALESCE(?, liquidity_amount_sol),
                reward_amount_sol = COALESCE(?, reward_amount_sol)
            WHERE id = ?;
            "#,
        )
        .bind(step_number)
        .bind(&artifacts.fee_signature)
        .bind(&artifacts.buy_signature)
        .bind(&artifacts.liquidity_signature)
        .bind(&artifacts.burn_signature)
        .bind(&artifacts.reward_signature)
        .bind(artifacts.fee_amount_sol)
        .bind(artifacts.buy_amount_sol)
        .bind(artifacts.liquidity_amount_sol)
        .bind(artifacts.reward_amount_sol)
        .bind(id)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to update progress for cycle {id}"))?;

        Ok(())
    }

    async fn finish_cycle(
        &self,
        id: i64,
        status: CycleStatus,
        error_message: Option<&str>,
        executed_at: i64,
    ) -> Result<bool> {
        // Guarded transition: a cycle leaves `pending` exactly once.
        let result = sqlx::query(
            r#"
            UPDATE cycles
            SET status = ?, error_message = ?, executed_at = ?
            WHERE id = ? AND status = 'pending';
            "#,
        )
        .bind(status.as_str())
        .bind(error_message)
        .bind(executed_at)
        .bind(id)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to finish cycle {id}"))?;

        Ok(result.rows_affected() == 1)
    }

    async fn pending_cycles(&self) -> Result<Vec<CycleRecord>> {
        let rows: Vec<CycleRow> = sqlx::query_as(
            "SELECT * FROM cycles WHERE status = 'pending' ORDER BY created_at ASC",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch pending cycles")?;

        rows.into_iter().map(CycleRow::into_record).collect()
    }

    async fn fail_stuck_cycles(&self, cutoff_ms: i64, message: &str, now_ms: i64) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE cycles
            SET status = 'failed', error_message = ?, executed_at = ?
            WHERE status = 'pending' AND created_at < ?;
            "#,
        )
        .bind(message)
        .bind(now_ms)
        .bind(cutoff_ms)
        .execute(&self.pool)
        .await
        .context("Failed to close stuck cycles")?;

        Ok(result.rows_affected())
    }

    async fn recent_cycles(&self, limit: i64) -> Result<Vec<CycleRecord>> {
        let rows: Vec<CycleRow> =
            sqlx::query_as("SELECT * FROM cycles ORDER BY created_at DESC, id DESC LIMIT ?")
                .bind(limit)
                .fetch_all(&self.pool)
                .await
                .context("Failed to fetch recent cycles")?;

        rows.into_iter().map(CycleRow::into_record).collect()
    }

    async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("Failed to read setting {key}"))?;

        Ok(row.map(|(value,)| value))
    }

    async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO settings (key, value)
            VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value;
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to write setting {key}"))?;

        Ok(())
    }

    async fn health_check(&self) -> Result<bool> {
        match sqlx::query("SELECT 1").execute(&self.pool).await {
            Ok(_) => Ok(true),
            Err(_) => Ok(false),
        }
    }
}

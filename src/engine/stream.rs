//! WebSocket consumer for the external trade feed.
//!
//! A long-lived client that subscribes to trade events for the monitored
//! mint, normalizes heterogeneous frames into `Trade` records, and advances
//! the qualifying-trade counter. Every replica runs its own consumer —
//! market data has no ownership concept — against the same persistent store.
//!
//! Connection lifecycle: Disconnected → Connecting → Subscribed, back to
//! Disconnected on close/error, then reconnect after a linear backoff of
//! `min(30s, 1s × attempt)` with the attempt counter reset on a successful
//! open. Reconnection is retried indefinitely while running; shutdown
//! interrupts a pending backoff sleep promptly.

use futures_util::{SinkExt, StreamExt};
use moka::future::Cache;
use serde_json::Value;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::engine::activity::{log_activity, Severity, SharedActivityLog};
use crate::engine::counter::TradeCounter;
use crate::engine::storage::EngineStorage;
use crate::types::Trade;

/// Settings key holding the monitored mint. Re-resolved at every (re)connect
/// so the target can change without a redeploy.
pub const MONITORED_MINT_KEY: &str = "monitored-mint";

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub ws_url: String,
    /// Cadence of the liveness heartbeat, independent of message traffic
    pub heartbeat_interval: Duration,
    /// How long replayed signatures are remembered for dedup
    pub dedup_ttl: Duration,
    /// Ceiling of the reconnect backoff
    pub max_backoff: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            ws_url: "wss://pumpportal.fun/api/data".to_string(),
            heartbeat_interval: Duration::from_secs(5),
            dedup_ttl: Duration::from_secs(60),
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// Errors that can occur while consuming the trade feed.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("no monitored mint configured")]
    NotConfigured,

    #[error("storage error: {0}")]
    Storage(String),
}

/// Liveness timestamp shared with the scheduler's health checks.
pub struct StreamHealth {
    last_beat_ms: AtomicI64,
}

impl StreamHealth {
    pub fn new() -> Arc<Self> {
        let health = Self {
            last_beat_ms: AtomicI64::new(now_ms()),
        };
        Arc::new(health)
    }

    pub fn beat(&self) {
        self.last_beat_ms.store(now_ms(), Ordering::Relaxed);
    }

    pub fn last_beat_ms(&self) -> i64 {
        self.last_beat_ms.load(Ordering::Relaxed)
    }

    pub fn is_fresh(&self, stale_after: Duration) -> bool {
        now_ms() - self.last_beat_ms() <= stale_after.as_millis() as i64
    }
}

pub struct StreamConsumer {
    storage: Arc<dyn EngineStorage>,
    counter: Arc<TradeCounter>,
    config: StreamConfig,
    health: Arc<StreamHealth>,
    activity: SharedActivityLog,
    seen: Cache<String, ()>,
}

impl StreamConsumer {
    pub fn new(
        storage: Arc<dyn EngineStorage>,
        counter: Arc<TradeCounter>,
        config: StreamConfig,
        activity: SharedActivityLog,
    ) -> Self {
        let seen = Cache::builder()
            .max_capacity(10_000)
            .time_to_live(config.dedup_ttl)
            .build();

        Self {
            storage,
            counter,
            config,
            health: StreamHealth::new(),
            activity,
            seen,
        }
    }

    /// Handle for the scheduler's heartbeat-freshness check.
    pub fn health(&self) -> Arc<StreamHealth> {
        Arc::clone(&self.health)
    }

    /// Main loop. Runs until a shutdown signal arrives; every disconnect is
    /// followed by a backoff sleep and another attempt.
    pub async fn run(self, mut shutdown_rx: mpsc::Receiver<()>) {
        info!("StreamConsumer is running (feed {})", self.config.ws_url);
        let mut attempt: u32 = 0;

        loop {
            match self.connect_and_consume(&mut shutdown_rx, &mut attempt).await {
                Ok(()) => {
                    info!("trade feed consumer shut down");
                    break;
                }
                Err(e) => {
                    attempt += 1;
                    let delay = backoff_delay(attempt, self.config.max_backoff);
                    warn!(
                        "trade feed disconnected (attempt {}): {}; reconnecting in {:?}",
                        attempt, e, delay
                    );

                    tokio::select! {
                        _ = shutdown_rx.recv() => {
                            info!("trade feed consumer shut down during backoff");
                            break;
                        }
                        _ = sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// One connection attempt: resolve the mint, subscribe, and pump frames
    /// until shutdown (Ok) or disconnect (Err).
    async fn connect_and_consume(
        &self,
        shutdown_rx: &mut mpsc::Receiver<()>,
        attempt: &mut u32,
    ) -> Result<(), StreamError> {
        let mint = self
            .storage
            .get_setting(MONITORED_MINT_KEY)
            .await
            .map_err(|e| StreamError::Storage(format!("{e:#}")))?
            .filter(|m| !m.is_empty())
            .ok_or(StreamError::NotConfigured)?;

        let (ws_stream, _response) = connect_async(&self.config.ws_url)
            .await
            .map_err(|e| StreamError::ConnectionFailed(e.to_string()))?;

        *attempt = 0;
        info!("trade feed connected; subscribing to {}", mint);
        log_activity(&self.activity, Severity::Info, "trade feed connected");

        let (mut write, mut read) = ws_stream.split();

        let subscribe = serde_json::json!({
            "method": "subscribeTokenTrade",
            "keys": [mint],
        });
        write.send(Message::Text(subscribe.to_string())).await?;

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    let _ = write.close().await;
                    return Ok(());
                }

                _ = heartbeat.tick() => {
                    self.health.beat();
                    if let Err(e) = write.send(Message::Ping(vec![])).await {
                        return Err(StreamError::WebSocket(e));
                    }
                }

                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            self.process_frame(&text).await;
                        }
                        Some(Ok(Message::Ping(data))) => {
                            write.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Pong(_))) => {
                            debug!("feed pong");
                        }
                        Some(Ok(Message::Close(frame))) => {
                            return Err(StreamError::ConnectionFailed(
                                frame
                                    .map(|f| f.reason.to_string())
                                    .unwrap_or_else(|| "connection closed".to_string()),
                            ));
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            return Err(StreamError::WebSocket(e));
                        }
                        None => {
                            return Err(StreamError::ConnectionFailed("stream ended".to_string()));
                        }
                    }
                }
            }
        }
    }

    /// Classify and handle one text frame (single object or array).
    async fn process_frame(&self, text: &str) {
        let values: Vec<Value> = if text.trim_start().starts_with('[') {
            serde_json::from_str(text).unwrap_or_default()
        } else {
            serde_json::from_str::<Value>(text)
                .map(|v| vec![v])
                .unwrap_or_default()
        };

        if values.is_empty() {
            debug!("unparseable feed frame dropped");
            return;
        }

        for value in values {
            if is_control_frame(&value) {
                if value.get("errors").is_some() {
                    warn!("trade feed error frame: {}", value);
                    log_activity(&self.activity, Severity::Warning, "trade feed error frame");
                } else {
                    debug!("trade feed status frame: {}", value);
                }
                continue;
            }

            match normalize_trade(&value, now_ms()) {
                Some(trade) => self.handle_trade(trade).await,
                None => debug!("non-trade feed noise dropped"),
            }
        }
    }

    async fn handle_trade(&self, trade: Trade) {
        // Reconnects replay recent events on some feeds; remembered
        // signatures must not advance the counter twice.
        if let Some(signature) = &trade.signature {
            if self.seen.contains_key(signature) {
                debug!("duplicate trade {} dropped", signature);
                return;
            }
            self.seen.insert(signature.clone(), ()).await;
        }

        match self.counter.record(&trade).await {
            Ok(true) => debug!(
                "qualifying trade recorded: {:?} SOL by {:?}",
                trade.amount_sol, trade.trader
            ),
            Ok(false) => debug!("trade recorded (below qualification)"),
            Err(e) => warn!("failed to persist trade: {:#}", e),
        }
    }
}

/// Control/status/error frames carry a `message` or `errors` field.
fn is_control_frame(value: &Value) -> bool {
    value.get("message").is_some() || value.get("errors").is_some()
}

/// Extract a trade from a candidate frame, with fallback field names.
/// Returns None when none of the identifying fields are present — a message
/// with some-but-not-all fields is still a trade (partial data beats
/// dropping a real trade).
fn normalize_trade(value: &Value, now_ms: i64) -> Option<Trade> {
    if !value.is_object() {
        return None;
    }

    let signature = first_string(value, &["signature", "txSignature", "tx_signature"]);
    let venue = first_string(value, &["venue", "pool", "dex", "program"]);
    let amount_sol = first_f64(value, &["solAmount", "sol_amount", "amountSol"]);
    let amount_tokens = first_f64(value, &["tokenAmount", "token_amount", "amountTokens"]);
    let trader = first_string(value, &["traderPublicKey", "trader", "owner", "wallet"]);

    if signature.is_none() && venue.is_none() && amount_sol.is_none() && amount_tokens.is_none() {
        return None;
    }

    let price_per_token = first_f64(value, &["pricePerToken", "price_per_token", "price"])
        .or(match (amount_sol, amount_tokens) {
            (Some(sol), Some(tokens)) if tokens > 0.0 => Some(sol / tokens),
            _ => None,
        });

    Some(Trade {
        signature,
        venue,
        amount_sol,
        amount_tokens,
        price_per_token,
        trader,
        created_at: now_ms,
    })
}

fn first_string(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| {
        value
            .get(key)
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    })
}

fn first_f64(value: &Value, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|key| {
        let v = value.get(key)?;
        v.as_f64()
            .or_else(|| v.as_str().and_then(|s| s.parse::<f64>().ok()))
    })
}

/// Linear backoff capped at `max`: 1s, 2s, 3s, ... 30s, 30s, ...
fn backoff_delay(attempt: u32, max: Duration) -> Duration {
    Duration::from_millis(1000 * u64::from(attempt)).min(max)
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

//! Opaque blockchain collaborators.
//!
//! The engine never builds or signs transactions itself. Fee claims, swaps,
//! liquidity operations, and transfers go to an external signing engine over
//! HTTP, each call returning a signature or an error; balances are read from
//! Solana RPC. Any error from a call is terminal for the current cycle
//! attempt — retries across cycles are governed by the cooldown windows, not
//! here.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use serde::{Deserialize, Serialize};
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_sdk::pubkey::Pubkey;
use std::num::NonZeroU32;
use std::str::FromStr;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use tracing::{debug, info};

pub const LAMPORTS_PER_SOL: f64 = 1_000_000_000.0;

pub fn lamports_to_sol(lamports: u64) -> f64 {
    lamports as f64 / LAMPORTS_PER_SOL
}

/// Signatures returned by a combined liquidity deposit + LP burn.
#[derive(Debug, Clone, Deserialize)]
pub struct LiquiditySignatures {
    pub deposit: String,
    pub burn: String,
}

/// Contract for every on-chain side effect the cycle performs.
#[async_trait]
pub trait ChainOps: Send + Sync {
    /// Claim accrued creator fees for `mint`.
    async fn collect_fee(&self, mint: &str) -> Result<String>;

    /// Swap `amount_sol` into the monitored token.
    async fn buy_token(
        &self,
        mint: &str,
        amount_sol: f64,
        slippage_bps: u16,
        priority_fee_sol: f64,
    ) -> Result<String>;

    /// Deposit SOL into the pool and burn the received LP tokens.
    async fn deposit_and_burn_liquidity(
        &self,
        pool: &str,
        amount_sol: f64,
        slippage_bps: u16,
    ) -> Result<LiquiditySignatures>;

    /// Move SOL to an arbitrary address.
    async fn transfer(&self, to: &str, amount_sol: f64) -> Result<String>;

    /// Current balance of `address` in lamports.
    async fn get_balance(&self, address: &str) -> Result<u64>;
}

#[derive(Debug, Serialize)]
struct ClaimRequest<'a> {
    mint: &'a str,
}

#[derive(Debug, Serialize)]
struct BuyRequest<'a> {
    mint: &'a str,
    amount_sol: f64,
    slippage_bps: u16,
    priority_fee_sol: f64,
}

#[derive(Debug, Serialize)]
struct LiquidityRequest<'a> {
    pool: &'a str,
    amount_sol: f64,
    slippage_bps: u16,
}

#[derive(Debug, Serialize)]
struct TransferRequest<'a> {
    to: &'a str,
    amount_sol: f64,
}

#[derive(Debug, Deserialize)]
struct SignatureResponse {
    signature: String,
}

#[derive(Debug, Deserialize)]
struct LiquidityResponse {
    deposit_signature: String,
    burn_signature: String,
}

/// HTTP client for the external signing engine plus RPC balance reads.
pub struct TxEngineClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    rpc: RpcClient,
    throttle: DefaultDirectRateLimiter,
}

impl TxEngineClient {
    pub fn new(
        engine_url: impl Into<String>,
        api_key: Option<String>,
        rpc_endpoint: impl Into<String>,
        requests_per_second: u32,
    ) -> Self {
        let quota = Quota::per_second(
            NonZeroU32::new(requests_per_second).unwrap_or(NonZeroU32::new(10).unwrap()),
        );

        let base_url = engine_url.into().trim_end_matches('/').to_string();
        let rpc_endpoint = rpc_endpoint.into();
        info!(
            "TxEngineClient ready (engine {}, rpc {})",
            base_url, rpc_endpoint
        );

        Self {
            http: reqwest::Client::new(),
            base_url,
            api_key,
            rpc: RpcClient::new(rpc_endpoint),
            throttle: RateLimiter::direct(quota),
        }
    }

    async fn post<B: Serialize, R: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R> {
        self.throttle.until_ready().await;

        let url = format!("{}{}", self.base_url, path);
        let mut request = self.http.post(&url).json(body);
        if let Some(key) = &self.api_key {
            request = request.header("x-api-key", key);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("engine request to {path} failed"))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(anyhow!("engine returned {status} for {path}: {detail}"));
        }

        response
            .json::<R>()
            .await
            .with_context(|| format!("failed to decode engine response from {path}"))
    }
}

#[async_trait]
impl ChainOps for TxEngineClient {
    async fn collect_fee(&self, mint: &str) -> Result<String> {
        let response: SignatureResponse = self
            .post("/v1/fees/claim", &ClaimRequest { mint })
            .await
            .context("fee claim rejected by engine")?;
        debug!("fee claim submitted: {}", response.signature);
        Ok(response.signature)
    }

    async fn buy_token(
        &self,
        mint: &str,
        amount_sol: f64,
        slippage_bps: u16,
        priority_fee_sol: f64,
    ) -> Result<String> {
        let response: SignatureResponse = self
            .post(
                "/v1/swap/buy",
                &BuyRequest {
                    mint,
                    amount_sol,
                    slippage_bps,
                    priority_fee_sol,
                },
            )
            .await
            .context("buy-back swap rejected by engine")?;
        debug!("buy-back submitted: {}", response.signature);
        Ok(response.signature)
    }

    async fn deposit_and_burn_liquidity(
        &self,
        pool: &str,
        amount_sol: f64,
        slippage_bps: u16,
    ) -> Result<LiquiditySignatures> {
        let response: LiquidityResponse = self
            .post(
                "/v1/liquidity/deposit-burn",
                &LiquidityRequest {
                    pool,
                    amount_sol,
                    slippage_bps,
                },
            )
            .await
            .context("liquidity deposit rejected by engine")?;
        Ok(LiquiditySignatures {
            deposit: response.deposit_signature,
            burn: response.burn_signature,
        })
    }

    async fn transfer(&self, to: &str, amount_sol: f64) -> Result<String> {
        let response: SignatureResponse = self
            .post("/v1/transfer", &TransferRequest { to, amount_sol })
            .await
            .context("transfer rejected by engine")?;
        debug!("transfer submitted: {}", response.signature);
        Ok(response.signature)
    }

    async fn get_balance(&self, address: &str) -> Result<u64> {
        self.throttle.until_ready().await;

        let pubkey = Pubkey::from_str(address)
            .with_context(|| format!("invalid address for balance read: {address}"))?;

        // Balance reads are the one transient-tolerant call here: a flaky RPC
        // should not fail a whole cycle when a short retry resolves it.
        let strategy = ExponentialBackoff::from_millis(200).map(jitter).take(3);
        let lamports = Retry::spawn(strategy, || async {
            self.rpc.get_balance(&pubkey).await
        })
        .await
        .with_context(|| format!("balance read failed for {address}"))?;

        Ok(lamports)
    }
}

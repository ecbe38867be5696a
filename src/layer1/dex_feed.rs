// DEX Price Feed - Polls a DEX aggregator and builds 1-minute candles
// Liquidity-weighted price across pools; rolling 5m metrics normalized per minute

use reqwest::Client;
use serde::Deserialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::config::{AggregatorConfig, ExchangeConfig};
use crate::core::types::Candle;
use crate::layer2::aggregator::CandleAggregator;

#[derive(Debug, Error)]
pub enum DexFeedError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Unexpected status {0}")]
    Status(u16),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("No pool with usable liquidity")]
    NoLiquidity,
}

// ============================================================================
// Response schema
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DexResponse {
    #[serde(default)]
    pub pairs: Option<Vec<DexPair>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DexPair {
    #[serde(rename = "priceUsd")]
    pub price_usd: Option<String>,
    pub liquidity: Option<DexLiquidity>,
    pub volume: Option<DexVolume>,
    pub txns: Option<DexTxns>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DexLiquidity {
    pub usd: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DexVolume {
    pub m5: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DexTxns {
    pub m5: Option<DexTxnCount>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DexTxnCount {
    #[serde(default)]
    pub buys: i64,
    #[serde(default)]
    pub sells: i64,
}

/// Pools folded into one reading
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DexSnapshot {
    pub price_usd: f64,
    pub volume_m5: f64,
    pub buys_m5: i64,
    pub sells_m5: i64,
}

impl DexSnapshot {
    pub fn volume_per_minute(&self) -> f64 {
        self.volume_m5 / 5.0
    }

    pub fn trades_per_minute(&self) -> i64 {
        (self.buys_m5 + self.sells_m5) / 5
    }
}

/// Liquidity-weighted price. Pools with unusable price or liquidity are left out
/// of the weighting but still count toward volume and transactions.
pub fn aggregate_pairs(pairs: &[DexPair]) -> Result<DexSnapshot, DexFeedError> {
    let mut weighted = 0.0;
    let mut total_liquidity = 0.0;
    let mut volume = 0.0;
    let mut buys = 0i64;
    let mut sells = 0i64;

    for pair in pairs {
        let price = pair.price_usd.as_deref().and_then(|p| p.parse::<f64>().ok());
        let liquidity = pair.liquidity.as_ref().and_then(|l| l.usd);

        if let (Some(price), Some(liquidity)) = (price, liquidity) {
            if liquidity > 0.0 && price.is_finite() && price > 0.0 {
                weighted += price * liquidity;
                total_liquidity += liquidity;
            }
        }

        if let Some(m5) = pair.volume.as_ref().and_then(|v| v.m5) {
            volume += m5;
        }
        if let Some(txns) = pair.txns.as_ref().and_then(|t| t.m5.as_ref()) {
            buys += txns.buys;
            sells += txns.sells;
        }
    }

    if total_liquidity <= 0.0 {
        return Err(DexFeedError::NoLiquidity);
    }

    Ok(DexSnapshot {
        price_usd: weighted / total_liquidity,
        volume_m5: volume,
        buys_m5: buys,
        sells_m5: sells,
    })
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ============================================================================
// Feed
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct DexFeedStats {
    pub polls: u64,
    pub poll_errors: u64,
    pub candles_emitted: u64,
    pub last_price: Option<f64>,
}

impl fmt::Display for DexFeedStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DexFeedStats(polls={}, errors={}, candles={}, last_price={:?})",
            self.polls, self.poll_errors, self.candles_emitted, self.last_price
        )
    }
}

pub struct DexFeed {
    url: String,
    client: Client,
    poll_interval: Duration,
    aggregator: CandleAggregator,
    stats: DexFeedStats,
}

impl DexFeed {
    pub fn new(
        base_url: &str,
        token_address: &str,
        poll_interval_ms: u64,
        candle_duration_ms: i64,
        timeout_seconds: u64,
    ) -> Result<Self, DexFeedError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .build()?;
        Ok(Self {
            url: format!("{}/latest/dex/tokens/{}", base_url.trim_end_matches('/'), token_address),
            client,
            poll_interval: Duration::from_millis(poll_interval_ms.max(1)),
            aggregator: CandleAggregator::new(candle_duration_ms),
            stats: DexFeedStats::default(),
        })
    }

    pub fn from_config(exchange: &ExchangeConfig, aggregator: &AggregatorConfig) -> Result<Self, DexFeedError> {
        Self::new(
            &exchange.dex_base_url,
            &exchange.dex_token_address,
            aggregator.poll_interval_ms,
            aggregator.candle_duration_ms,
            exchange.request_timeout_seconds,
        )
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// One request, pools aggregated
    pub async fn poll_once(&self) -> Result<DexSnapshot, DexFeedError> {
        let response = self.client.get(&self.url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(DexFeedError::Status(status.as_u16()));
        }
        let body = response.bytes().await?;
        let parsed: DexResponse = serde_json::from_slice(&body)?;
        aggregate_pairs(parsed.pairs.as_deref().unwrap_or_default())
    }

    /// Fold a snapshot into the open candle; returns the finalized candle on rollover
    pub fn ingest(&mut self, timestamp_ms: i64, snapshot: &DexSnapshot) -> Option<Candle> {
        self.stats.last_price = Some(snapshot.price_usd);
        let finished = self.aggregator.observe(
            timestamp_ms,
            snapshot.price_usd,
            snapshot.volume_per_minute(),
            snapshot.trades_per_minute(),
        );
        if finished.is_some() {
            self.stats.candles_emitted += 1;
        }
        finished
    }

    /// Poll until cancelled. The open candle is discarded on shutdown.
    pub async fn run(mut self, tx: mpsc::Sender<Candle>, shutdown: CancellationToken) -> DexFeedStats {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(url = %self.url, interval_ms = self.poll_interval.as_millis() as u64, "DEX feed started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.stats.polls += 1;
                    let snapshot = match self.poll_once().await {
                        Ok(snapshot) => snapshot,
                        Err(e) => {
                            self.stats.poll_errors += 1;
                            warn!(error = %e, "DEX poll failed");
                            continue;
                        }
                    };

                    if let Some(candle) = self.ingest(now_millis(), &snapshot) {
                        debug!(candle = %candle, "DEX candle finalized");
                        if tx.send(candle).await.is_err() {
                            info!("Candle consumer dropped, stopping DEX feed");
                            break;
                        }
                    }
                }
            }
        }

        info!(stats = %self.stats, "DEX feed stopped");
        self.stats
    }

    pub fn get_stats(&self) -> DexFeedStats {
        self.stats.clone()
    }
}

// REST Client for exchange kline history
// Interval rate limiter + /api/v3/klines fetcher, no retries

use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::core::config::ExchangeConfig;
use crate::core::types::Candle;
use crate::layer2::backfill::HistoricalRangeFetcher;
use crate::layer2::parser::{parse_rest_klines, ParseError};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum RestClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API error {code}: {message}")]
    Api { code: i64, message: String },
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),
}

// ============================================================================
// Rate Limiter
// ============================================================================

/// Fixed-interval gate: permits are spaced at least 1/rps apart.
/// Used behind Arc<Mutex<RateLimiter>>, so holders queue on the lock and
/// only the request-issue moment is serialized.
pub struct RateLimiter {
    interval: Duration,
    next_slot: Option<Instant>,
    permits_issued: u64,
}

impl RateLimiter {
    pub fn new(requests_per_second: u32) -> Self {
        let rps = requests_per_second.max(1) as f64;
        Self {
            interval: Duration::from_secs_f64(1.0 / rps),
            next_slot: None,
            permits_issued: 0,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn permits_issued(&self) -> u64 {
        self.permits_issued
    }

    /// Wait for the next slot (caller must hold the Mutex)
    pub async fn acquire(&mut self) {
        let now = Instant::now();
        let slot = match self.next_slot {
            Some(slot) if slot > now => {
                tokio::time::sleep_until(slot).await;
                slot
            }
            _ => now,
        };
        self.next_slot = Some(slot + self.interval);
        self.permits_issued += 1;
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ============================================================================
// Client Statistics
// ============================================================================

#[derive(Debug, Clone)]
pub struct RestClientStats {
    pub requests_sent: u64,
    pub requests_succeeded: u64,
    pub requests_failed: u64,
    pub success_rate: f64,
}

impl fmt::Display for RestClientStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RestClientStats(sent={}, ok={}, fail={}, rate={:.2}%)",
            self.requests_sent, self.requests_succeeded, self.requests_failed,
            self.success_rate * 100.0
        )
    }
}

// ============================================================================
// Kline REST Client
// ============================================================================

/// Kline history client for one symbol + interval
pub struct KlineRestClient {
    base_url: String,
    symbol: String,
    interval: String,
    client: Client,

    requests_sent: AtomicU64,
    requests_succeeded: AtomicU64,
    requests_failed: AtomicU64,
}

impl KlineRestClient {
    pub fn new(base_url: &str, symbol: &str, interval: &str, timeout_seconds: u64) -> Result<Self, RestClientError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .build()?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            symbol: symbol.to_uppercase(),
            interval: interval.to_string(),
            client,
            requests_sent: AtomicU64::new(0),
            requests_succeeded: AtomicU64::new(0),
            requests_failed: AtomicU64::new(0),
        })
    }

    /// Create from config
    pub fn from_config(config: &ExchangeConfig) -> Result<Self, RestClientError> {
        Self::new(
            &config.rest_base_url,
            &config.symbol,
            &config.interval,
            config.request_timeout_seconds,
        )
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    fn klines_params(&self, start_ms: Option<i64>, end_ms: Option<i64>, limit: u32) -> HashMap<String, String> {
        let mut params = HashMap::new();
        params.insert("symbol".to_string(), self.symbol.clone());
        params.insert("interval".to_string(), self.interval.clone());
        params.insert("limit".to_string(), limit.to_string());
        if let Some(st) = start_ms {
            params.insert("startTime".to_string(), st.to_string());
        }
        if let Some(et) = end_ms {
            params.insert("endTime".to_string(), et.to_string());
        }
        params
    }

    /// Raw `/api/v3/klines` page
    pub async fn get_klines_raw(
        &self,
        start_ms: Option<i64>,
        end_ms: Option<i64>,
        limit: u32,
    ) -> Result<Vec<u8>, RestClientError> {
        let url = format!("{}/api/v3/klines?{}", self.base_url, build_query_string(&self.klines_params(start_ms, end_ms, limit)));
        self.requests_sent.fetch_add(1, Ordering::Relaxed);
        debug!(url = %url, "Requesting klines");

        let response = match self.client.get(&url).send().await {
            Ok(response) => response,
            Err(e) => {
                self.requests_failed.fetch_add(1, Ordering::Relaxed);
                return Err(RestClientError::Http(e));
            }
        };

        let status = response.status();
        let body = match response.bytes().await {
            Ok(body) => body,
            Err(e) => {
                self.requests_failed.fetch_add(1, Ordering::Relaxed);
                return Err(RestClientError::Http(e));
            }
        };

        if status != StatusCode::OK {
            self.requests_failed.fetch_add(1, Ordering::Relaxed);
            let data: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
            let code = data.get("code").and_then(|c| c.as_i64()).unwrap_or(status.as_u16() as i64);
            let message = data.get("msg").and_then(|m| m.as_str()).unwrap_or("Unknown error").to_string();
            warn!(status = %status, code, message = %message, "Kline request rejected");
            return Err(RestClientError::Api { code, message });
        }

        self.requests_succeeded.fetch_add(1, Ordering::Relaxed);
        Ok(body.to_vec())
    }

    /// Most recent closed candles, oldest first. The in-progress candle is dropped.
    pub async fn recent_klines(&self, limit: u32) -> Result<Vec<Candle>, RestClientError> {
        let now = now_millis();
        // One extra row covers the in-progress candle that gets dropped
        let body = self.get_klines_raw(None, Some(now), limit.saturating_add(1)).await?;
        let mut candles = parse_rest_klines(&body)?;
        candles.retain(|c| c.close_time < now);
        if candles.len() > limit as usize {
            candles.drain(..candles.len() - limit as usize);
        }
        Ok(candles)
    }

    /// Get client statistics
    pub fn get_stats(&self) -> RestClientStats {
        let sent = self.requests_sent.load(Ordering::Relaxed);
        let succeeded = self.requests_succeeded.load(Ordering::Relaxed);
        let failed = self.requests_failed.load(Ordering::Relaxed);

        RestClientStats {
            requests_sent: sent,
            requests_succeeded: succeeded,
            requests_failed: failed,
            success_rate: if sent > 0 { succeeded as f64 / sent as f64 } else { 0.0 },
        }
    }
}

impl HistoricalRangeFetcher for KlineRestClient {
    type Error = RestClientError;

    async fn fetch(&self, start_ms: i64, end_ms: i64, max_per_request: u32) -> Result<Vec<u8>, RestClientError> {
        self.get_klines_raw(Some(start_ms), Some(end_ms), max_per_request).await
    }
}

/// Build URL query string from params (sorted for stable URLs)
fn build_query_string(params: &HashMap<String, String>) -> String {
    let mut sorted_keys: Vec<&String> = params.keys().collect();
    sorted_keys.sort();

    sorted_keys.iter()
        .map(|k| format!("{}={}", k, params[*k]))
        .collect::<Vec<_>>()
        .join("&")
}

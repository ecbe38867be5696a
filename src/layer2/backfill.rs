// Historical Backfill Pipeline - Chunked, rate-limited, concurrent kline download
// Bounded job queue -> fixed worker pool -> join barrier -> sort + dedupe

use parking_lot::RwLock;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use crate::core::config::ExchangeConfig;
use crate::core::types::Candle;
use crate::layer1::rest_client::RateLimiter;
use crate::layer2::parser::parse_rest_klines;

#[derive(Debug, Error, PartialEq)]
pub enum BackfillError {
    #[error("Invalid range: end {end} is before start {start}")]
    InvalidRange { start: i64, end: i64 },
    #[error("Invalid backfill config: {0}")]
    InvalidConfig(String),
}

/// Remote source of raw kline pages, one call per chunk
pub trait HistoricalRangeFetcher: Send + Sync + 'static {
    type Error: fmt::Display + Send + 'static;

    fn fetch(
        &self,
        start_ms: i64,
        end_ms: i64,
        max_per_request: u32,
    ) -> impl Future<Output = Result<Vec<u8>, Self::Error>> + Send;
}

// ============================================================================
// Config / Jobs / Stats
// ============================================================================

#[derive(Debug, Clone)]
pub struct BackfillConfig {
    pub interval_ms: i64,
    pub max_per_request: u32,
    pub workers: usize,
    pub requests_per_second: u32,
    pub queue_capacity: usize,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            interval_ms: 60_000,
            max_per_request: 1000,
            workers: 5,
            requests_per_second: 15,
            queue_capacity: 64,
        }
    }
}

impl BackfillConfig {
    pub fn from_exchange(config: &ExchangeConfig) -> Result<Self, BackfillError> {
        let interval_ms = config.interval_millis().ok_or_else(|| {
            BackfillError::InvalidConfig(format!("unsupported interval '{}'", config.interval))
        })?;
        let backfill = Self {
            interval_ms,
            max_per_request: config.max_candles_per_request,
            workers: config.backfill_workers,
            requests_per_second: config.requests_per_second,
            ..Self::default()
        };
        backfill.validate()?;
        Ok(backfill)
    }

    pub fn validate(&self) -> Result<(), BackfillError> {
        if self.interval_ms <= 0 {
            return Err(BackfillError::InvalidConfig("interval_ms must be positive".into()));
        }
        if self.max_per_request == 0 {
            return Err(BackfillError::InvalidConfig("max_per_request must be at least 1".into()));
        }
        if self.workers == 0 {
            return Err(BackfillError::InvalidConfig("workers must be at least 1".into()));
        }
        if self.requests_per_second == 0 {
            return Err(BackfillError::InvalidConfig("requests_per_second must be positive".into()));
        }
        Ok(())
    }

    fn chunk_ms(&self) -> i64 {
        self.max_per_request as i64 * self.interval_ms
    }
}

/// One request's worth of range, both ends inclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkJob {
    pub start_ms: i64,
    pub end_ms: i64,
}

#[derive(Debug, Clone, Default)]
pub struct BackfillStats {
    pub runs: u64,
    pub jobs_planned: u64,
    pub chunks_ok: u64,
    pub chunks_failed: u64,
    pub candles: u64,
    pub duplicates: u64,
}

impl fmt::Display for BackfillStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "BackfillStats(runs={}, jobs={}, ok={}, failed={}, candles={}, duplicates={})",
            self.runs, self.jobs_planned, self.chunks_ok, self.chunks_failed,
            self.candles, self.duplicates
        )
    }
}

/// Chunk plan for a range: chunk i covers [start + i*chunk, min(start + (i+1)*chunk - 1, end)]
pub fn plan_chunks(config: &BackfillConfig, start_ms: i64, end_ms: i64) -> Vec<ChunkJob> {
    let chunk = config.chunk_ms();
    if chunk <= 0 || end_ms <= start_ms {
        return Vec::new();
    }

    let total = end_ms - start_ms;
    let count = (total + chunk - 1) / chunk;
    (0..count)
        .map(|i| {
            let chunk_start = start_ms + i * chunk;
            ChunkJob {
                start_ms: chunk_start,
                end_ms: (chunk_start + chunk - 1).min(end_ms),
            }
        })
        .collect()
}

// ============================================================================
// Pipeline
// ============================================================================

pub struct BackfillPipeline<F: HistoricalRangeFetcher> {
    fetcher: Arc<F>,
    config: BackfillConfig,
    limiter: Arc<Mutex<RateLimiter>>,
    stats: Arc<RwLock<BackfillStats>>,
}

impl<F: HistoricalRangeFetcher> BackfillPipeline<F> {
    pub fn new(fetcher: F, config: BackfillConfig) -> Result<Self, BackfillError> {
        config.validate()?;
        let limiter = RateLimiter::new(config.requests_per_second);
        Ok(Self {
            fetcher: Arc::new(fetcher),
            config,
            limiter: Arc::new(Mutex::new(limiter)),
            stats: Arc::new(RwLock::new(BackfillStats::default())),
        })
    }

    pub fn config(&self) -> &BackfillConfig {
        &self.config
    }

    /// Candles a complete download of the range contains
    pub fn expected_candles(&self, start_ms: i64, end_ms: i64) -> usize {
        plan_chunks(&self.config, start_ms, end_ms)
            .iter()
            .map(|job| ((job.end_ms - job.start_ms) / self.config.interval_ms + 1) as usize)
            .sum()
    }

    /// Download a range. Failed chunks are logged and skipped, so the result
    /// may be short; compare against `expected_candles`.
    pub async fn fetch(&self, start_ms: i64, end_ms: i64) -> Result<Vec<Candle>, BackfillError> {
        if end_ms < start_ms {
            return Err(BackfillError::InvalidRange { start: start_ms, end: end_ms });
        }

        let jobs = plan_chunks(&self.config, start_ms, end_ms);
        {
            let mut stats = self.stats.write();
            stats.runs += 1;
            stats.jobs_planned += jobs.len() as u64;
        }
        info!(
            start_ms,
            end_ms,
            jobs = jobs.len(),
            workers = self.config.workers,
            "Starting historical backfill"
        );

        let (job_tx, job_rx) = mpsc::channel::<ChunkJob>(self.config.queue_capacity.max(1));
        let job_rx = Arc::new(Mutex::new(job_rx));
        let (result_tx, mut result_rx) = mpsc::unbounded_channel::<Vec<Candle>>();

        let mut handles = Vec::with_capacity(self.config.workers);
        for worker_id in 0..self.config.workers {
            let fetcher = Arc::clone(&self.fetcher);
            let limiter = Arc::clone(&self.limiter);
            let stats = Arc::clone(&self.stats);
            let job_rx = Arc::clone(&job_rx);
            let result_tx = result_tx.clone();
            let max_per_request = self.config.max_per_request;

            handles.push(tokio::spawn(async move {
                loop {
                    let job = { job_rx.lock().await.recv().await };
                    let Some(job) = job else { break };

                    limiter.lock().await.acquire().await;

                    let body = match fetcher.fetch(job.start_ms, job.end_ms, max_per_request).await {
                        Ok(body) => body,
                        Err(e) => {
                            stats.write().chunks_failed += 1;
                            warn!(worker_id, start_ms = job.start_ms, end_ms = job.end_ms, error = %e, "Chunk fetch failed, skipping");
                            continue;
                        }
                    };

                    match parse_rest_klines(&body) {
                        Ok(candles) => {
                            stats.write().chunks_ok += 1;
                            debug!(worker_id, start_ms = job.start_ms, candles = candles.len(), "Chunk fetched");
                            if result_tx.send(candles).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            stats.write().chunks_failed += 1;
                            warn!(worker_id, start_ms = job.start_ms, error = %e, "Chunk parse failed, skipping");
                        }
                    }
                }
            }));
        }
        drop(result_tx);

        for job in jobs {
            if job_tx.send(job).await.is_err() {
                error!("All backfill workers exited before the queue drained");
                break;
            }
        }
        drop(job_tx);

        // Join barrier
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Backfill worker panicked");
            }
        }

        let mut candles = Vec::new();
        while let Some(batch) = result_rx.recv().await {
            candles.extend(batch);
        }

        let duplicates = sort_and_dedupe(&mut candles);
        {
            let mut stats = self.stats.write();
            stats.candles += candles.len() as u64;
            stats.duplicates += duplicates as u64;
        }

        let expected = self.expected_candles(start_ms, end_ms);
        if candles.len() < expected {
            warn!(got = candles.len(), expected, "Backfill incomplete");
        }
        info!(candles = candles.len(), duplicates, "Historical backfill complete");
        Ok(candles)
    }

    pub fn get_stats(&self) -> BackfillStats {
        self.stats.read().clone()
    }
}

/// Stable sort by open_time, then drop repeated open_times (first arrival kept)
fn sort_and_dedupe(candles: &mut Vec<Candle>) -> usize {
    candles.sort_by_key(|c| c.open_time);
    let before = candles.len();
    candles.dedup_by_key(|c| c.open_time);
    let removed = before - candles.len();
    if removed > 0 {
        warn!(duplicates = removed, "Dropped candles with duplicate open_time");
    }
    removed
}

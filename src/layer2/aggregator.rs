// Candle Aggregator - Price observations -> fixed-duration OHLCV candles
// One open bucket at a time; a bucket rollover emits the finalized candle

use crate::core::types::Candle;
use std::fmt;
use tracing::{debug, warn};

#[derive(Debug, Clone, Default)]
pub struct AggregatorStats {
    pub observations: u64,
    pub candles_emitted: u64,
    pub rejected_stale: u64,
}

impl fmt::Display for AggregatorStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "AggregatorStats(observations={}, emitted={}, stale={})",
            self.observations, self.candles_emitted, self.rejected_stale
        )
    }
}

pub struct CandleAggregator {
    duration_ms: i64,
    current: Option<Candle>,
    stats: AggregatorStats,
}

impl Default for CandleAggregator {
    fn default() -> Self {
        Self::new(60_000)
    }
}

impl CandleAggregator {
    pub fn new(duration_ms: i64) -> Self {
        Self {
            duration_ms: duration_ms.max(1),
            current: None,
            stats: AggregatorStats::default(),
        }
    }

    pub fn duration_ms(&self) -> i64 {
        self.duration_ms
    }

    /// Bucket start for a timestamp
    pub fn bucket_start(&self, timestamp_ms: i64) -> i64 {
        timestamp_ms - timestamp_ms.rem_euclid(self.duration_ms)
    }

    /// Fold one observation in. Returns the previous candle, finalized, when a new bucket opens.
    pub fn observe(&mut self, timestamp_ms: i64, price: f64, delta_volume: f64, delta_trades: i64) -> Option<Candle> {
        self.stats.observations += 1;
        let bucket = self.bucket_start(timestamp_ms);

        if let Some(current) = self.current.as_mut() {
            if bucket < current.open_time {
                self.stats.rejected_stale += 1;
                warn!(
                    timestamp_ms,
                    open_bucket = current.open_time,
                    "Rejecting observation older than the open candle"
                );
                return None;
            }

            if bucket == current.open_time {
                // The open candle is never final
                if let Err(e) = current.update(price, delta_volume, delta_trades) {
                    warn!(error = %e, "Candle update rejected");
                }
                return None;
            }
        }

        let mut fresh = Candle::open_at(bucket, bucket + self.duration_ms - 1, price);
        fresh.volume = delta_volume;
        fresh.trade_count = delta_trades;

        let finished = self.current.replace(fresh).map(|mut done| {
            done.finalize();
            done
        });

        if let Some(done) = &finished {
            self.stats.candles_emitted += 1;
            debug!(candle = %done, "Candle finalized");
        }
        finished
    }

    /// Peek at the open candle
    pub fn current(&self) -> Option<&Candle> {
        self.current.as_ref()
    }

    pub fn get_stats(&self) -> AggregatorStats {
        self.stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buckets_and_rollover() {
        let mut agg = CandleAggregator::new(60_000);
        assert!(agg.observe(1_000, 10.0, 1.0, 1).is_none());
        assert!(agg.observe(30_000, 12.0, 2.0, 2).is_none());
        assert!(agg.observe(59_999, 9.0, 1.0, 1).is_none());

        let done = agg.observe(60_000, 11.0, 0.5, 1).unwrap();
        assert_eq!(done.open_time, 0);
        assert_eq!(done.close_time, 59_999);
        assert_eq!(done.open, 10.0);
        assert_eq!(done.high, 12.0);
        assert_eq!(done.low, 9.0);
        assert_eq!(done.close, 9.0);
        assert!((done.volume - 4.0).abs() < 1e-12);
        assert_eq!(done.trade_count, 4);
        assert!(done.is_final);

        let open = agg.current().unwrap();
        assert_eq!(open.open_time, 60_000);
        assert_eq!(open.open, 11.0);
        assert!(!open.is_final);
    }

    #[test]
    fn test_stale_observation_rejected() {
        let mut agg = CandleAggregator::new(60_000);
        agg.observe(120_500, 5.0, 1.0, 1);
        assert!(agg.observe(60_100, 99.0, 1.0, 1).is_none());

        let open = agg.current().unwrap();
        assert_eq!(open.high, 5.0);
        assert_eq!(agg.get_stats().rejected_stale, 1);
    }

    #[test]
    fn test_emitted_open_times_strictly_increase() {
        let mut agg = CandleAggregator::new(60_000);
        let mut emitted = Vec::new();
        // Irregular ticks, including gaps that skip whole buckets
        let mut t = 0i64;
        for i in 0..500 {
            t += 7_000 + (i % 13) * 3_100;
            if let Some(c) = agg.observe(t, 100.0 + (i % 7) as f64, 1.0, 1) {
                emitted.push(c);
            }
        }
        assert!(emitted.len() > 10);
        for pair in emitted.windows(2) {
            assert!(pair[1].open_time > pair[0].open_time);
            assert_eq!((pair[1].open_time - pair[0].open_time) % 60_000, 0);
            assert!(pair[0].close_time < pair[1].open_time);
        }
        assert_eq!(agg.get_stats().candles_emitted, emitted.len() as u64);
    }
}

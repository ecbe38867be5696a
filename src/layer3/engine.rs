// Signal Engine - ADX enrichment + state machine + sink
// Live mode consumes candles one at a time; replay runs a stored series

use crate::core::config::StrategyConfig;
use crate::core::types::{Candle, EnrichedCandle, SignalRecord};
use crate::layer3::adx::{enrich, AdxCalculator, IndicatorError};
use crate::layer3::signal::{SignalStateMachine, SignalStats};
use crate::layer3::sink::{SignalSink, SinkError};
use std::fmt;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Indicator error: {0}")]
    Indicator(#[from] IndicatorError),
    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),
    #[error("Insufficient candles for replay: need {needed}, got {got}")]
    InsufficientCandles { needed: usize, got: usize },
}

#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    pub candles_received: u64,
    pub candles_processed: u64,
    pub skipped_open: u64,
    pub skipped_stale: u64,
    pub records_written: u64,
}

impl fmt::Display for EngineStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "EngineStats(received={}, processed={}, open={}, stale={}, records={})",
            self.candles_received, self.candles_processed, self.skipped_open,
            self.skipped_stale, self.records_written
        )
    }
}

/// Live signal engine. Owns indicator state, window, lines and position.
pub struct SignalEngine<S: SignalSink> {
    calculator: AdxCalculator,
    machine: SignalStateMachine,
    sink: S,
    last_open_time: Option<i64>,
    stats: EngineStats,
}

impl<S: SignalSink> SignalEngine<S> {
    /// Seed the indicator from history and pre-fill the window with its tail
    pub fn from_history(history: &[Candle], config: StrategyConfig, sink: S) -> Result<Self, EngineError> {
        let calculator = AdxCalculator::seed(history, config.adx_period)?;
        let enriched = enrich(history, config.adx_period)?;

        let skip = enriched.len().saturating_sub(config.window_size);
        let mut machine = SignalStateMachine::new(config);
        machine.prime(enriched.into_iter().skip(skip));

        info!(
            history = history.len(),
            ready = machine.is_ready(),
            adx = ?calculator.state().adx(),
            "Signal engine seeded"
        );

        Ok(Self {
            calculator,
            machine,
            sink,
            last_open_time: history.last().map(|c| c.open_time),
            stats: EngineStats::default(),
        })
    }

    /// Feed one candle. Open or already-seen candles are skipped.
    pub fn on_candle(&mut self, candle: Candle) -> Result<Option<SignalRecord>, EngineError> {
        self.stats.candles_received += 1;

        if !candle.is_final {
            self.stats.skipped_open += 1;
            return Ok(None);
        }
        if let Some(last) = self.last_open_time {
            if candle.open_time <= last {
                self.stats.skipped_stale += 1;
                warn!(open_time = candle.open_time, last_open_time = last, "Dropping stale or duplicate candle");
                return Ok(None);
            }
        }
        self.last_open_time = Some(candle.open_time);
        self.stats.candles_processed += 1;

        let reading = self.calculator.update(&candle);
        let Some(record) = self.machine.process(EnrichedCandle::new(candle, reading)) else {
            return Ok(None);
        };

        self.sink.record(&record)?;
        self.stats.records_written += 1;
        if record.entry_signal != 0 || record.exit_signal != 0 {
            info!(
                open_time = record.open_time,
                close = record.close,
                entry = record.entry_signal,
                exit = record.exit_signal,
                "Signal"
            );
        }
        Ok(Some(record))
    }

    pub fn flush(&mut self) -> Result<(), EngineError> {
        self.sink.flush()?;
        Ok(())
    }

    pub fn machine(&self) -> &SignalStateMachine {
        &self.machine
    }

    pub fn calculator(&self) -> &AdxCalculator {
        &self.calculator
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    pub fn get_stats(&self) -> EngineStats {
        self.stats.clone()
    }
}

// ============================================================================
// Replay
// ============================================================================

#[derive(Debug, Clone)]
pub struct ReplaySummary {
    pub records: u64,
    pub signals: SignalStats,
}

impl fmt::Display for ReplaySummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReplaySummary(records={}, {})", self.records, self.signals)
    }
}

/// Label a stored series: enrich, drop the unseeded head, pre-fill the window
/// with the first `window_size` enriched candles, then one record per remaining candle.
pub fn replay<S: SignalSink>(candles: &[Candle], config: &StrategyConfig, sink: &mut S) -> Result<ReplaySummary, EngineError> {
    let needed = config.adx_period + config.window_size + 1;
    if candles.len() < needed {
        return Err(EngineError::InsufficientCandles { needed, got: candles.len() });
    }

    let mut enriched = enrich(candles, config.adx_period)?.into_iter();
    let mut machine = SignalStateMachine::new(config.clone());
    machine.prime(enriched.by_ref().take(config.window_size));

    let mut records = 0u64;
    for candle in enriched {
        if let Some(record) = machine.process(candle) {
            sink.record(&record)?;
            records += 1;
        }
    }
    sink.flush()?;

    let signals = machine.get_stats();
    debug!(records, %signals, "Replay complete");
    Ok(ReplaySummary { records, signals })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer3::sink::MemorySink;

    fn series(n: usize) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let x = i as f64;
                let mid = 100.0 + 10.0 * (x / 9.0).sin() + 4.0 * (x / 2.5).cos();
                let t = i as i64 * 60_000;
                Candle::new(t, t + 59_999, mid - 0.2, mid + 1.0, mid - 1.0, mid + 0.2, 5.0, 3, true)
            })
            .collect()
    }

    fn config() -> StrategyConfig {
        StrategyConfig {
            adx_period: 5,
            window_size: 10,
            adx_threshold: 20.0,
            adx_min: 10.0,
            idle_limit: 8,
            active_limit: 12,
            ..StrategyConfig::default()
        }
    }

    #[test]
    fn test_replay_one_record_per_candle() {
        let candles = series(200);
        let mut sink = MemorySink::new();
        let summary = replay(&candles, &config(), &mut sink).unwrap();

        // 5 unseeded candles trimmed, 10 used to pre-fill the window
        assert_eq!(summary.records, 185);
        assert_eq!(sink.len(), 185);
        assert_eq!(sink.records()[0].window_index, 10);
        assert_eq!(sink.records()[0].open_time, candles[15].open_time);
        assert!(sink
            .records()
            .windows(2)
            .all(|w| w[1].window_index == w[0].window_index + 1));
        assert_eq!(summary.signals.invariant_violations, 0);
    }

    #[test]
    fn test_replay_rejects_short_series() {
        let mut sink = MemorySink::new();
        match replay(&series(10), &config(), &mut sink) {
            Err(EngineError::InsufficientCandles { needed, got }) => {
                assert_eq!(needed, 16);
                assert_eq!(got, 10);
            }
            other => panic!("expected InsufficientCandles, got {:?}", other.map(|s| s.records)),
        }
    }

    #[test]
    fn test_live_engine_skips_open_and_stale() {
        let candles = series(40);
        let mut engine = SignalEngine::from_history(&candles[..30], config(), MemorySink::new()).unwrap();
        assert!(engine.machine().is_ready());

        let mut open = candles[30].clone();
        open.is_final = false;
        assert!(engine.on_candle(open).unwrap().is_none());
        assert!(engine.on_candle(candles[29].clone()).unwrap().is_none());

        for c in &candles[30..] {
            assert!(engine.on_candle(c.clone()).unwrap().is_some());
        }

        let stats = engine.get_stats();
        assert_eq!(stats.skipped_open, 1);
        assert_eq!(stats.skipped_stale, 1);
        assert_eq!(stats.records_written, 10);
        assert_eq!(engine.sink().len(), 10);
    }

    #[test]
    fn test_live_engine_matches_replay() {
        let candles = series(120);
        let cfg = config();
        // Replay pre-fills with enriched[0..10], i.e. candles[5..15]
        let mut replay_sink = MemorySink::new();
        replay(&candles, &cfg, &mut replay_sink).unwrap();

        let mut engine = SignalEngine::from_history(&candles[..15], cfg, MemorySink::new()).unwrap();
        for c in &candles[15..] {
            engine.on_candle(c.clone()).unwrap();
        }

        let live = engine.into_sink().into_records();
        let replayed = replay_sink.into_records();
        assert_eq!(live.len(), replayed.len());
        for (a, b) in live.iter().zip(replayed.iter()) {
            assert_eq!(a.open_time, b.open_time);
            assert_eq!(a.entry_signal, b.entry_signal);
            assert_eq!(a.exit_signal, b.exit_signal);
            match (a.indicator_value, b.indicator_value) {
                (Some(x), Some(y)) => assert!((x - y).abs() <= 1e-9 * y.abs().max(1.0)),
                (None, None) => {}
                other => panic!("indicator mismatch {:?}", other),
            }
        }
    }

    #[test]
    fn test_insufficient_seed_history() {
        let candles = series(5);
        match SignalEngine::from_history(&candles, config(), MemorySink::new()) {
            Err(EngineError::Indicator(IndicatorError::InsufficientHistory { needed: 6, got: 5 })) => {}
            Err(e) => panic!("unexpected error {}", e),
            Ok(_) => panic!("expected error"),
        }
    }
}

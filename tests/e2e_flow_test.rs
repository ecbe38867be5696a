// End-to-End Flow Tests for Trend Breakout
//
// These tests exercise the full data flow without network connections:
//   Fetcher -> Backfill -> Parser -> ADX -> Window/Trendlines -> State machine -> Sink
//   Stream frames / DEX ticks -> handoff channel -> Live pipeline
//
// Run with: cargo test --test e2e_flow_test

use std::io::BufRead;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use trend_breakout::core::{Candle, EnrichedCandle, IndicatorReading, Position, StrategyConfig};
use trend_breakout::layer2::{
    BackfillConfig, BackfillPipeline, CandleAggregator, HistoricalRangeFetcher, KlineParser,
    LivePipeline,
};
use trend_breakout::layer3::{
    calculate_adx, replay, AdxCalculator, ChannelSink, JsonLinesSink, MemorySink,
    SignalEngine, SignalSink, SignalStateMachine,
};

const MINUTE: i64 = 60_000;

// ============================================================================
// Helpers
// ============================================================================

/// Deterministic price path with trends, pullbacks and consolidation
fn price_at(i: i64) -> f64 {
    let x = i as f64;
    100.0 + 12.0 * (x / 40.0).sin() + 3.0 * (x / 7.0).cos() + 0.01 * x
}

fn candle_at(open_time: i64, is_final: bool) -> Candle {
    let i = open_time / MINUTE;
    let open = price_at(i - 1);
    let close = price_at(i);
    let high = open.max(close) + 0.6;
    let low = open.min(close) - 0.6;
    Candle::new(open_time, open_time + MINUTE - 1, open, high, low, close, 25.0, 12, is_final)
}

fn series(start: i64, count: usize) -> Vec<Candle> {
    (0..count as i64).map(|k| candle_at(start + k * MINUTE, true)).collect()
}

fn make_stream_kline_json(candle: &Candle, closed: bool) -> String {
    format!(
        r#"{{"e":"continuous_kline","E":{ts},"ps":"SOLUSDT","ct":"PERPETUAL","k":{{"t":{t},"T":{ct},"i":"1m","f":1,"L":2,"o":"{o}","c":"{c}","h":"{h}","l":"{l}","v":"{v}","n":{n},"x":{x},"q":"0","V":"0","Q":"0","B":"0"}}}}"#,
        ts = candle.close_time,
        t = candle.open_time,
        ct = candle.close_time,
        o = candle.open,
        c = candle.close,
        h = candle.high,
        l = candle.low,
        v = candle.volume,
        n = candle.trade_count,
        x = closed,
    )
}

/// Serves `[[openTime, "o", "h", "l", "c", "v", closeTime, ...]]` pages from the price path
struct SyntheticFetcher {
    calls: AtomicUsize,
}

impl HistoricalRangeFetcher for SyntheticFetcher {
    type Error = String;

    async fn fetch(&self, start_ms: i64, end_ms: i64, max_per_request: u32) -> Result<Vec<u8>, String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let first = (start_ms + MINUTE - 1) / MINUTE * MINUTE;
        let rows: Vec<serde_json::Value> = (0..max_per_request as i64)
            .map(|k| first + k * MINUTE)
            .take_while(|t| *t <= end_ms)
            .map(|t| {
                let c = candle_at(t, true);
                serde_json::json!([
                    c.open_time,
                    c.open.to_string(),
                    c.high.to_string(),
                    c.low.to_string(),
                    c.close.to_string(),
                    c.volume.to_string(),
                    c.close_time,
                    "0",
                    c.trade_count,
                    "0",
                    "0",
                    "0"
                ])
            })
            .collect();
        serde_json::to_vec(&rows).map_err(|e| e.to_string())
    }
}

fn backfill_config() -> BackfillConfig {
    BackfillConfig {
        max_per_request: 1000,
        workers: 5,
        requests_per_second: 1000,
        ..BackfillConfig::default()
    }
}

// ============================================================================
// Backfill -> Replay
// ============================================================================

#[tokio::test]
async fn test_backfill_then_replay() {
    let fetcher = SyntheticFetcher { calls: AtomicUsize::new(0) };
    let pipeline = BackfillPipeline::new(fetcher, backfill_config()).unwrap();

    let start = 1_700_000_040_000 / MINUTE * MINUTE;
    let end = start + 2000 * MINUTE;
    let candles = pipeline.fetch(start, end).await.unwrap();

    assert_eq!(pipeline.get_stats().jobs_planned, 2);
    assert_eq!(candles.len(), 2000);
    assert_eq!(pipeline.expected_candles(start, end), 2000);
    for pair in candles.windows(2) {
        assert_eq!(pair[1].open_time - pair[0].open_time, MINUTE);
    }

    let config = StrategyConfig::default();
    let mut sink = MemorySink::new();
    let summary = replay(&candles, &config, &mut sink).unwrap();

    let expected = 2000 - config.adx_period - config.window_size;
    assert_eq!(summary.records as usize, expected);
    assert_eq!(sink.len(), expected);
    assert_eq!(summary.signals.invariant_violations, 0);

    let records = sink.records();
    assert_eq!(records[0].open_time, candles[config.adx_period + config.window_size].open_time);
    for pair in records.windows(2) {
        assert!(pair[1].open_time > pair[0].open_time);
        assert_eq!(pair[1].window_index, pair[0].window_index + 1);
    }
    for r in records {
        assert!((-1..=1).contains(&r.entry_signal));
        assert!((-1..=1).contains(&r.exit_signal));
        // Both on one candle only as a reversal
        if r.entry_signal != 0 && r.exit_signal != 0 {
            assert_eq!(r.entry_signal, -r.exit_signal);
        }
    }
}

// ============================================================================
// Indicator modes
// ============================================================================

#[test]
fn test_batch_and_incremental_indicator_agree() {
    let candles = series(0, 500);
    let period = 14;
    let batch = calculate_adx(&candles, period).unwrap();

    let seed_len = 120;
    let mut calc = AdxCalculator::seed(&candles[..seed_len], period).unwrap();
    for (i, candle) in candles.iter().enumerate().skip(seed_len) {
        let live = calc.update(candle).unwrap();
        let expected = batch[i].unwrap();
        assert!((live.adx - expected.adx).abs() <= 1e-9 * expected.adx.abs().max(1.0), "adx at {}", i);
        assert!((live.plus_di - expected.plus_di).abs() <= 1e-9 * expected.plus_di.abs().max(1.0));
        assert!((live.minus_di - expected.minus_di).abs() <= 1e-9 * expected.minus_di.abs().max(1.0));
    }
}

// ============================================================================
// State machine scenarios
// ============================================================================

fn enriched(t: i64, high: f64, low: f64, reading: (f64, f64, f64)) -> EnrichedCandle {
    let mid = (high + low) / 2.0;
    EnrichedCandle::new(
        Candle::new(t * MINUTE, t * MINUTE + MINUTE - 1, mid, high, low, mid, 1.0, 1, true),
        Some(IndicatorReading { adx: reading.0, plus_di: reading.1, minus_di: reading.2 }),
    )
}

fn narrowing_machine() -> SignalStateMachine {
    let config = StrategyConfig {
        window_size: 4,
        idle_limit: 100,
        active_limit: 100,
        ..StrategyConfig::default()
    };
    let mut machine = SignalStateMachine::new(config);
    machine.prime((0..4).map(|t| {
        let t = t as i64;
        enriched(t, 110.0 - t as f64, 90.0 + t as f64, (30.0, 20.0, 20.0))
    }));
    machine
}

#[test]
fn test_support_breakout_then_weak_trend_exit() {
    let mut machine = narrowing_machine();

    // Support projects to 94 at x=4; low 93 with -DI leading and ADX 30
    let entry = machine.process(enriched(4, 100.0, 93.0, (30.0, 10.0, 25.0))).unwrap();
    assert_eq!(entry.entry_signal, -1);
    assert_eq!(machine.position(), Position::Short);

    // ADX below the hold floor closes the short before anything else
    let exit = machine.process(enriched(5, 100.0, 95.0, (15.0, 10.0, 25.0))).unwrap();
    assert_eq!(exit.exit_signal, -1);
    assert_eq!(exit.entry_signal, 0);
    assert_eq!(machine.position(), Position::Flat);

    let stats = machine.get_stats();
    assert_eq!(stats.entries, 1);
    assert_eq!(stats.weak_trend_exits, 1);
}

// ============================================================================
// Live path
// ============================================================================

#[tokio::test]
async fn test_stream_frames_through_live_pipeline_match_replay() {
    let config = StrategyConfig {
        adx_period: 5,
        window_size: 20,
        ..StrategyConfig::default()
    };
    let candles = series(0, 400);
    let seed = 100;

    // Same seed and tail fed directly, without the channel or the parser
    let mut expected = MemorySink::new();
    let mut direct = SignalEngine::from_history(&candles[..seed], config.clone(), MemorySink::new()).unwrap();
    for c in &candles[seed..] {
        if let Some(r) = direct.on_candle(c.clone()).unwrap() {
            expected.record(&r).unwrap();
        }
    }

    let (record_tx, mut record_rx) = mpsc::unbounded_channel();
    let engine = SignalEngine::from_history(&candles[..seed], config, ChannelSink::new(record_tx)).unwrap();
    let (tx, rx) = mpsc::channel(16);
    let shutdown = CancellationToken::new();

    let frames: Vec<String> = candles[seed..]
        .iter()
        .flat_map(|c| [make_stream_kline_json(c, false), make_stream_kline_json(c, true)])
        .collect();
    let token = shutdown.clone();
    let producer = tokio::spawn(async move {
        let mut parser = KlineParser::new();
        for frame in frames {
            if token.is_cancelled() {
                break;
            }
            let candle = parser.parse_stream(&frame).unwrap();
            if tx.send(candle).await.is_err() {
                break;
            }
        }
        parser.get_stats()
    });

    let (engine, stats) = LivePipeline::new(engine).run(rx).await;
    let parser_stats = producer.await.unwrap();
    shutdown.cancel();

    assert_eq!(parser_stats.candles_parsed, 600);
    assert_eq!(stats.skipped_open, 300);
    assert_eq!(stats.records, 300);
    assert_eq!(engine.get_stats().candles_processed, 300);

    let mut live = Vec::new();
    while let Ok(record) = record_rx.try_recv() {
        live.push(record);
    }
    assert_eq!(live.len(), expected.len());
    for (a, b) in live.iter().zip(expected.records()) {
        assert_eq!(a.open_time, b.open_time);
        assert_eq!(a.entry_signal, b.entry_signal);
        assert_eq!(a.exit_signal, b.exit_signal);
        assert_eq!(a.window_index, b.window_index);
    }
}

#[tokio::test]
async fn test_aggregated_ticks_feed_engine() {
    let config = StrategyConfig {
        adx_period: 3,
        window_size: 10,
        ..StrategyConfig::default()
    };
    let history = series(0, 50);
    let engine = SignalEngine::from_history(&history, config, MemorySink::new()).unwrap();
    let (tx, rx) = mpsc::channel(4);

    // Four ticks per minute starting right after the seeded history
    let first_bucket = 50 * MINUTE;
    let producer = tokio::spawn(async move {
        let mut aggregator = CandleAggregator::new(MINUTE);
        for step in 0..(30 * 4) {
            let ts = first_bucket + step * 15_000 + 10;
            let price = price_at(50 + step / 4) + (step % 4) as f64 * 0.1;
            if let Some(candle) = aggregator.observe(ts, price, 2.0, 1) {
                if tx.send(candle).await.is_err() {
                    break;
                }
            }
        }
        aggregator.get_stats()
    });

    let (engine, stats) = LivePipeline::new(engine).run(rx).await;
    let agg_stats = producer.await.unwrap();

    // The last bucket stays open
    assert_eq!(agg_stats.candles_emitted, 29);
    assert_eq!(stats.records, 29);
    assert_eq!(engine.get_stats().skipped_stale, 0);
    assert!(engine.calculator().last_reading().is_some());
}

// ============================================================================
// JSON lines sink
// ============================================================================

#[test]
fn test_replay_to_json_lines() {
    let config = StrategyConfig {
        adx_period: 5,
        window_size: 15,
        ..StrategyConfig::default()
    };
    let candles = series(0, 200);

    let mut sink = JsonLinesSink::new(Vec::new());
    let summary = replay(&candles, &config, &mut sink).unwrap();
    assert_eq!(sink.written(), summary.records);

    let bytes = sink.into_inner();
    let lines: Vec<String> = bytes.as_slice().lines().map(|l| l.unwrap()).collect();
    assert_eq!(lines.len() as u64, summary.records);

    let first: serde_json::Value = serde_json::from_str(&lines[0]).unwrap();
    assert_eq!(first["open_time"].as_i64(), Some(candles[20].open_time));
    assert!(first.get("entry_signal").is_some());
    assert!(first.get("exit_signal").is_some());
    assert!(first.get("window_index").is_some());
}

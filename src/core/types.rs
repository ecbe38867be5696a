// Core Type Definitions for the Trend Breakout engine
// Candles, indicator annotations, positions and signal records

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ============================================================================
// Enums
// ============================================================================

/// Held position of the signal state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Position {
    #[default]
    Flat,
    Long,
    Short,
}

impl Position {
    pub fn is_held(&self) -> bool {
        !matches!(self, Position::Flat)
    }

    /// Side an exit of this position reports
    pub fn as_side(&self) -> SignalSide {
        match self {
            Position::Flat => SignalSide::None,
            Position::Long => SignalSide::Long,
            Position::Short => SignalSide::Short,
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Side carried by an entry or exit signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SignalSide {
    #[default]
    None,
    Long,
    Short,
}

impl SignalSide {
    /// Wire encoding used by sink records: long = 1, short = -1, none = 0
    pub fn as_i8(&self) -> i8 {
        match self {
            SignalSide::None => 0,
            SignalSide::Long => 1,
            SignalSide::Short => -1,
        }
    }
}

impl fmt::Display for SignalSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Entry/exit pair emitted for every processed candle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Signal {
    pub entry: SignalSide,
    pub exit: SignalSide,
}

impl Signal {
    pub fn is_idle(&self) -> bool {
        self.entry == SignalSide::None && self.exit == SignalSide::None
    }
}

// ============================================================================
// Candle
// ============================================================================

#[derive(Debug, Error, PartialEq)]
pub enum CandleError {
    #[error("candle {open_time} is final and can no longer be updated")]
    Finalized { open_time: i64 },
}

/// Fixed-duration OHLCV aggregate. Timestamps are milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: i64,
    pub close_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub trade_count: i64,
    pub is_final: bool,
}

impl Candle {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        open_time: i64,
        close_time: i64,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
        trade_count: i64,
        is_final: bool,
    ) -> Self {
        Self {
            open_time,
            close_time,
            open,
            high,
            low,
            close,
            volume,
            trade_count,
            is_final,
        }
    }

    /// Open a fresh bucket at a single observed price
    pub fn open_at(open_time: i64, close_time: i64, price: f64) -> Self {
        Self::new(open_time, close_time, price, price, price, price, 0.0, 0, false)
    }

    /// Bounded in-bucket update: widen high/low, overwrite close, accumulate
    /// volume and trade count.
    pub fn update(&mut self, price: f64, delta_volume: f64, delta_trades: i64) -> Result<(), CandleError> {
        if self.is_final {
            return Err(CandleError::Finalized { open_time: self.open_time });
        }

        if price > self.high {
            self.high = price;
        }
        if price < self.low {
            self.low = price;
        }
        self.close = price;
        self.volume += delta_volume;
        self.trade_count += delta_trades;
        Ok(())
    }

    pub fn finalize(&mut self) {
        self.is_final = true;
    }

    pub fn range(&self) -> f64 {
        self.high - self.low
    }
}

impl fmt::Display for Candle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Candle(t={}, O={:.4}, H={:.4}, L={:.4}, C={:.4}, V={:.2}, final={})",
            self.open_time, self.open, self.high, self.low, self.close, self.volume, self.is_final
        )
    }
}

// ============================================================================
// Indicator annotation
// ============================================================================

/// Trend-strength reading for one candle
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IndicatorReading {
    pub adx: f64,
    pub plus_di: f64,
    pub minus_di: f64,
}

/// Candle plus its (optional) indicator annotation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedCandle {
    pub candle: Candle,
    pub indicator: Option<IndicatorReading>,
}

impl EnrichedCandle {
    pub fn new(candle: Candle, indicator: Option<IndicatorReading>) -> Self {
        Self { candle, indicator }
    }

    pub fn adx(&self) -> Option<f64> {
        self.indicator.map(|r| r.adx)
    }
}

/// Anything the trendline detector can read extremes and a timestamp from
pub trait PriceBar {
    fn high(&self) -> f64;
    fn low(&self) -> f64;
    fn open_time(&self) -> i64;
}

impl PriceBar for Candle {
    fn high(&self) -> f64 { self.high }
    fn low(&self) -> f64 { self.low }
    fn open_time(&self) -> i64 { self.open_time }
}

impl PriceBar for EnrichedCandle {
    fn high(&self) -> f64 { self.candle.high }
    fn low(&self) -> f64 { self.candle.low }
    fn open_time(&self) -> i64 { self.candle.open_time }
}

// ============================================================================
// Signal record (sink payload)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalRecord {
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub indicator_value: Option<f64>,
    pub window_index: u64,
    pub entry_signal: i8,
    pub exit_signal: i8,
}

impl SignalRecord {
    pub fn new(candle: &EnrichedCandle, window_index: u64, signal: Signal) -> Self {
        let c = &candle.candle;
        Self {
            open_time: c.open_time,
            open: c.open,
            high: c.high,
            low: c.low,
            close: c.close,
            volume: c.volume,
            indicator_value: candle.adx(),
            window_index,
            entry_signal: signal.entry.as_i8(),
            exit_signal: signal.exit.as_i8(),
        }
    }
}

impl fmt::Display for SignalRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SignalRecord(t={}, idx={}, close={:.4}, adx={:?}, entry={}, exit={})",
            self.open_time, self.window_index, self.close, self.indicator_value,
            self.entry_signal, self.exit_signal
        )
    }
}

// ============================================================================
// Intervals
// ============================================================================

/// Milliseconds covered by an exchange interval string ("1m", "4h", "1d", ...)
pub fn interval_to_millis(interval: &str) -> Option<i64> {
    let (split, unit) = interval.char_indices().last()?;
    let amount: i64 = interval[..split].parse().ok()?;
    if amount <= 0 {
        return None;
    }
    let unit_ms: i64 = match unit {
        's' => 1_000,
        'm' => 60_000,
        'h' => 3_600_000,
        'd' => 86_400_000,
        'w' => 604_800_000,
        _ => return None,
    };
    amount.checked_mul(unit_ms)
}

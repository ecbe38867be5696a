// ADX Calculator - Wilder-smoothed directional movement
// Batch and incremental modes share one recurrence so their values agree exactly

use crate::core::types::{Candle, EnrichedCandle, IndicatorReading};
use std::fmt;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, PartialEq)]
pub enum IndicatorError {
    #[error("ADX period must be at least 2, got {0}")]
    InvalidPeriod(usize),
    #[error("Insufficient history to seed ADX: need {needed} candles, got {got}")]
    InsufficientHistory { needed: usize, got: usize },
}

#[derive(Debug, Clone, Copy)]
struct Bar {
    high: f64,
    low: f64,
    close: f64,
}

impl From<&Candle> for Bar {
    fn from(c: &Candle) -> Self {
        Self { high: c.high, low: c.low, close: c.close }
    }
}

/// True range, +DM, -DM for one step
fn directional_step(prev: &Bar, cur: &Bar) -> (f64, f64, f64) {
    let up_move = cur.high - prev.high;
    let down_move = prev.low - cur.low;

    let plus_dm = if up_move > down_move && up_move > 0.0 { up_move } else { 0.0 };
    let minus_dm = if down_move > up_move && down_move > 0.0 { down_move } else { 0.0 };

    let tr = (cur.high - cur.low)
        .max((cur.high - prev.close).abs())
        .max((cur.low - prev.close).abs());

    (tr, plus_dm, minus_dm)
}

/// +DI, -DI and DX from smoothed sums. None when the denominator is degenerate.
fn directional_indices(tr: f64, plus_dm: f64, minus_dm: f64) -> Option<(f64, f64, f64)> {
    if tr <= 0.0 {
        return None;
    }
    let plus_di = 100.0 * plus_dm / tr;
    let minus_di = 100.0 * minus_dm / tr;
    let di_sum = plus_di + minus_di;
    if di_sum == 0.0 {
        return None;
    }
    let dx = 100.0 * (plus_di - minus_di).abs() / di_sum;
    Some((plus_di, minus_di, dx))
}

// ============================================================================
// Indicator State
// ============================================================================

/// Running Wilder state. Readings are undefined until `period + 1` candles.
#[derive(Debug, Clone)]
pub struct IndicatorState {
    period: usize,
    smoothed_tr: f64,
    smoothed_plus_dm: f64,
    smoothed_minus_dm: f64,
    adx: Option<f64>,
    observed: usize,
    last: Option<Bar>,
}

impl IndicatorState {
    fn new(period: usize) -> Self {
        Self {
            period,
            smoothed_tr: 0.0,
            smoothed_plus_dm: 0.0,
            smoothed_minus_dm: 0.0,
            adx: None,
            observed: 0,
            last: None,
        }
    }

    pub fn period(&self) -> usize {
        self.period
    }

    pub fn observed(&self) -> usize {
        self.observed
    }

    pub fn is_seeded(&self) -> bool {
        self.observed > self.period
    }

    pub fn adx(&self) -> Option<f64> {
        if self.is_seeded() { self.adx } else { None }
    }

    fn step(&mut self, candle: &Candle) -> Option<IndicatorReading> {
        let bar = Bar::from(candle);
        self.observed += 1;

        let prev = self.last.replace(bar)?;
        let (tr, plus_dm, minus_dm) = directional_step(&prev, &bar);
        let steps = self.observed - 1;

        if steps <= self.period {
            // Seed window: plain sums of the first `period` steps
            self.smoothed_tr += tr;
            self.smoothed_plus_dm += plus_dm;
            self.smoothed_minus_dm += minus_dm;
            if steps < self.period {
                return None;
            }

            let (plus_di, minus_di, dx) = directional_indices(
                self.smoothed_tr,
                self.smoothed_plus_dm,
                self.smoothed_minus_dm,
            )?;
            self.adx = Some(dx);
            return Some(IndicatorReading { adx: dx, plus_di, minus_di });
        }

        let p = self.period as f64;
        self.smoothed_tr = (self.smoothed_tr * (p - 1.0) + tr) / p;
        self.smoothed_plus_dm = (self.smoothed_plus_dm * (p - 1.0) + plus_dm) / p;
        self.smoothed_minus_dm = (self.smoothed_minus_dm * (p - 1.0) + minus_dm) / p;

        let Some((plus_di, minus_di, dx)) = directional_indices(
            self.smoothed_tr,
            self.smoothed_plus_dm,
            self.smoothed_minus_dm,
        ) else {
            debug!(open_time = candle.open_time, "Degenerate DI denominator, no ADX reading");
            return None;
        };

        // A degenerate seed leaves adx unset; the first defined DX takes its place
        let adx = match self.adx {
            Some(prev_adx) => (prev_adx * (p - 1.0) + dx) / p,
            None => dx,
        };
        self.adx = Some(adx);
        Some(IndicatorReading { adx, plus_di, minus_di })
    }
}

fn check_period(period: usize) -> Result<(), IndicatorError> {
    if period < 2 {
        return Err(IndicatorError::InvalidPeriod(period));
    }
    Ok(())
}

// ============================================================================
// Batch mode
// ============================================================================

/// Per-candle readings over a full series. The first `period` entries are None.
pub fn calculate_adx(candles: &[Candle], period: usize) -> Result<Vec<Option<IndicatorReading>>, IndicatorError> {
    check_period(period)?;
    let mut state = IndicatorState::new(period);
    Ok(candles.iter().map(|c| state.step(c)).collect())
}

/// Annotate a series with ADX and drop the leading `period` candles that have no reading
pub fn enrich(candles: &[Candle], period: usize) -> Result<Vec<EnrichedCandle>, IndicatorError> {
    let readings = calculate_adx(candles, period)?;
    Ok(candles
        .iter()
        .zip(readings)
        .skip(period)
        .map(|(c, r)| EnrichedCandle::new(c.clone(), r))
        .collect())
}

// ============================================================================
// Incremental mode
// ============================================================================

pub struct AdxCalculator {
    state: IndicatorState,
    last_reading: Option<IndicatorReading>,
    updates: u64,
    missing_readings: u64,
}

impl AdxCalculator {
    /// Seed from history; needs at least `period + 1` candles
    pub fn seed(history: &[Candle], period: usize) -> Result<Self, IndicatorError> {
        check_period(period)?;
        if history.len() < period + 1 {
            return Err(IndicatorError::InsufficientHistory {
                needed: period + 1,
                got: history.len(),
            });
        }

        let mut state = IndicatorState::new(period);
        let mut last_reading = None;
        for candle in history {
            last_reading = state.step(candle);
        }

        debug!(period, candles = history.len(), adx = ?state.adx(), "ADX seeded");

        Ok(Self {
            state,
            last_reading,
            updates: 0,
            missing_readings: 0,
        })
    }

    /// Apply one smoothing step against the stored previous candle
    pub fn update(&mut self, candle: &Candle) -> Option<IndicatorReading> {
        self.updates += 1;
        let reading = self.state.step(candle);
        if reading.is_none() {
            self.missing_readings += 1;
        }
        self.last_reading = reading;
        reading
    }

    pub fn last_reading(&self) -> Option<IndicatorReading> {
        self.last_reading
    }

    pub fn state(&self) -> &IndicatorState {
        &self.state
    }

    pub fn get_stats(&self) -> AdxCalculatorStats {
        AdxCalculatorStats {
            period: self.state.period,
            observed: self.state.observed,
            updates: self.updates,
            missing_readings: self.missing_readings,
            adx: self.state.adx(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AdxCalculatorStats {
    pub period: usize,
    pub observed: usize,
    pub updates: u64,
    pub missing_readings: u64,
    pub adx: Option<f64>,
}

impl fmt::Display for AdxCalculatorStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "AdxCalculatorStats(period={}, observed={}, updates={}, missing={}, adx={:?})",
            self.period, self.observed, self.updates, self.missing_readings, self.adx
        )
    }
}

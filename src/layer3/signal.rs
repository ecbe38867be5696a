// Signal State Machine - Breakout + trend strength -> position transitions
// Owns the window, active trendlines and position; single writer

use crate::core::config::StrategyConfig;
use crate::core::types::{EnrichedCandle, IndicatorReading, Position, Signal, SignalRecord};
use crate::layer3::trendline::{Breakouts, Trendline, TrendlineDetector};
use crate::layer3::window::SlidingWindow;
use std::fmt;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default)]
pub struct SignalStats {
    pub candles_processed: u64,
    pub warmup_candles: u64,
    pub breakouts: u64,
    pub entries: u64,
    pub exits: u64,
    pub weak_trend_exits: u64,
    pub timeout_exits: u64,
    pub recalibrations: u64,
    pub invariant_violations: u64,
}

impl fmt::Display for SignalStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SignalStats(processed={}, warmup={}, breakouts={}, entries={}, exits={}, recalibrations={}, violations={})",
            self.candles_processed, self.warmup_candles, self.breakouts, self.entries,
            self.exits, self.recalibrations, self.invariant_violations
        )
    }
}

pub struct SignalStateMachine {
    config: StrategyConfig,
    detector: TrendlineDetector,
    window: SlidingWindow<EnrichedCandle>,
    resistance: Option<Trendline>,
    support: Option<Trendline>,
    lines_ready: bool,
    position: Position,
    candles_since_update: u32,
    stats: SignalStats,
}

impl SignalStateMachine {
    pub fn new(config: StrategyConfig) -> Self {
        let detector = TrendlineDetector::new(config.strict_slopes, config.x_axis);
        let window = SlidingWindow::new(config.window_size);
        Self {
            config,
            detector,
            window,
            resistance: None,
            support: None,
            lines_ready: false,
            position: Position::Flat,
            candles_since_update: 0,
            stats: SignalStats::default(),
        }
    }

    /// Pre-fill the window from history without emitting records
    pub fn prime<I>(&mut self, candles: I)
    where
        I: IntoIterator<Item = EnrichedCandle>,
    {
        for candle in candles {
            self.warm_up(candle);
        }
    }

    fn warm_up(&mut self, candle: EnrichedCandle) {
        self.stats.warmup_candles += 1;
        self.window.append(candle);
        if self.window.is_full() {
            self.lines_ready = true;
            self.recalibrate();
        }
    }

    /// Run one candle through the transition rules. None while the window is still filling.
    pub fn process(&mut self, candle: EnrichedCandle) -> Option<SignalRecord> {
        if !self.lines_ready {
            self.warm_up(candle);
            return None;
        }

        self.stats.candles_processed += 1;
        let index = self.window.next_index();
        let x = self.detector.next_x(&self.window, &candle);
        let reading = candle.indicator;
        let mut signal = Signal::default();

        // Weak trend: holding requires adx >= adx_min
        if let Some(r) = reading {
            if self.position.is_held() && r.adx < self.config.adx_min {
                debug!(adx = r.adx, position = %self.position, "Trend weakened, exiting");
                self.stats.weak_trend_exits += 1;
                self.exit(&mut signal);
            }
        }

        let breakouts = self.detector.check_breakouts(
            self.resistance.as_ref(),
            self.support.as_ref(),
            &candle,
            x,
            self.position,
        );

        // Breakout against the held side
        if (breakouts.support && self.position == Position::Long)
            || (breakouts.resistance && self.position == Position::Short)
        {
            self.exit(&mut signal);
        }

        let breakout = breakouts.any();
        if breakout {
            self.stats.breakouts += 1;
            self.try_enter(&breakouts, reading, &mut signal);
        }

        self.window.append(candle.clone());

        if breakout {
            self.candles_since_update = 0;
            self.recalibrate();
        } else {
            self.candles_since_update += 1;
            let limit = if self.position.is_held() {
                self.config.active_limit
            } else {
                self.config.idle_limit
            };
            if self.candles_since_update >= limit {
                if self.position.is_held() {
                    debug!(position = %self.position, held = self.candles_since_update, "Hold limit reached, exiting");
                    self.stats.timeout_exits += 1;
                    self.exit(&mut signal);
                }
                self.candles_since_update = 0;
                self.recalibrate();
            }
        }

        Some(SignalRecord::new(&candle, index, signal))
    }

    fn try_enter(&mut self, breakouts: &Breakouts, reading: Option<IndicatorReading>, signal: &mut Signal) {
        // No reading, no trend confirmation
        let Some(r) = reading else {
            return;
        };
        if r.adx < self.config.adx_threshold {
            return;
        }

        if breakouts.resistance && r.plus_di > r.minus_di {
            self.enter(Position::Long, signal);
        } else if breakouts.support && r.minus_di > r.plus_di {
            self.enter(Position::Short, signal);
        }
    }

    fn enter(&mut self, target: Position, signal: &mut Signal) {
        // Unreachable through process(): breakouts on the held side are never checked
        if self.position == target {
            self.stats.invariant_violations += 1;
            warn!(position = %self.position, "Entry requested into the position already held");
            return;
        }

        if self.position.is_held() {
            self.exit(signal);
        }
        signal.entry = target.as_side();
        self.position = target;
        self.stats.entries += 1;
        info!(position = %target, "Entered position");
    }

    fn exit(&mut self, signal: &mut Signal) {
        if !self.position.is_held() {
            return;
        }
        signal.exit = self.position.as_side();
        info!(position = %self.position, "Exited position");
        self.position = Position::Flat;
        self.stats.exits += 1;
    }

    fn recalibrate(&mut self) {
        let (resistance, support) = self.detector.compute_lines(&self.window);
        self.resistance = resistance;
        self.support = support;
        self.stats.recalibrations += 1;
        debug!(
            resistance = ?self.resistance.map(|l| l.gradient),
            support = ?self.support.map(|l| l.gradient),
            "Trendlines recalibrated"
        );
    }

    pub fn position(&self) -> Position {
        self.position
    }

    pub fn resistance(&self) -> Option<&Trendline> {
        self.resistance.as_ref()
    }

    pub fn support(&self) -> Option<&Trendline> {
        self.support.as_ref()
    }

    pub fn is_ready(&self) -> bool {
        self.lines_ready
    }

    pub fn window(&self) -> &SlidingWindow<EnrichedCandle> {
        &self.window
    }

    pub fn candles_since_update(&self) -> u32 {
        self.candles_since_update
    }

    pub fn get_stats(&self) -> SignalStats {
        self.stats.clone()
    }
}

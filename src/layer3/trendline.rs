// Trendline Detector - Support/resistance lines from window extrema
// Lines are anchored on the window's extreme bar and validated against every bar after it

use crate::core::config::XAxis;
use crate::core::types::{Position, PriceBar};
use crate::layer3::window::SlidingWindow;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::trace;

/// (x, price) endpoint of a trendline
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Anchor {
    pub x: f64,
    pub price: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Trendline {
    pub gradient: f64,
    pub intercept: f64,
    pub anchor1: Anchor,
    pub anchor2: Anchor,
}

impl Trendline {
    /// Line through two anchors. None when they share an x.
    pub fn through(anchor1: Anchor, anchor2: Anchor) -> Option<Self> {
        let dx = anchor2.x - anchor1.x;
        if dx == 0.0 {
            return None;
        }
        let gradient = (anchor2.price - anchor1.price) / dx;
        let intercept = anchor1.price - gradient * anchor1.x;
        Some(Self { gradient, intercept, anchor1, anchor2 })
    }

    pub fn value_at(&self, x: f64) -> f64 {
        self.gradient * x + self.intercept
    }
}

impl fmt::Display for Trendline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Trendline(g={:.6}, c={:.4}, a1=({}, {:.4}), a2=({}, {:.4}))",
            self.gradient, self.intercept, self.anchor1.x, self.anchor1.price,
            self.anchor2.x, self.anchor2.price
        )
    }
}

/// Which sides broke on a candle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Breakouts {
    pub resistance: bool,
    pub support: bool,
}

impl Breakouts {
    pub fn any(&self) -> bool {
        self.resistance || self.support
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TrendlineDetector {
    strict: bool,
    x_axis: XAxis,
}

impl Default for TrendlineDetector {
    fn default() -> Self {
        Self::new(true, XAxis::Index)
    }
}

impl TrendlineDetector {
    pub fn new(strict: bool, x_axis: XAxis) -> Self {
        Self { strict, x_axis }
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    /// x coordinate of a bar already in the window
    pub fn x_at<T: PriceBar>(&self, window: &SlidingWindow<T>, position: usize) -> Option<f64> {
        match self.x_axis {
            XAxis::Index => window.index_at(position).map(|i| i as f64),
            XAxis::OpenTime => window.get(position).map(|b| b.open_time() as f64),
        }
    }

    /// x coordinate a bar about to be appended will have
    pub fn next_x<T: PriceBar, B: PriceBar>(&self, window: &SlidingWindow<T>, bar: &B) -> f64 {
        match self.x_axis {
            XAxis::Index => window.next_index() as f64,
            XAxis::OpenTime => bar.open_time() as f64,
        }
    }

    /// Position of the first maximum high (or minimum low). Earliest wins ties.
    pub fn find_extremum<T: PriceBar>(&self, window: &SlidingWindow<T>, is_high: bool) -> Option<usize> {
        let mut best: Option<(usize, f64)> = None;
        for (pos, bar) in window.iter().enumerate() {
            let value = side_price(bar, is_high);
            let better = match best {
                None => true,
                Some((_, current)) => {
                    if is_high { value > current } else { value < current }
                }
            };
            if better {
                best = Some((pos, value));
            }
        }
        best.map(|(pos, _)| pos)
    }

    /// Build a line anchored at `pivot` with no violations between its anchors
    pub fn build_line<T: PriceBar>(
        &self,
        window: &SlidingWindow<T>,
        pivot: usize,
        is_resistance: bool,
    ) -> Option<Trendline> {
        let pivot_bar = window.get(pivot)?;
        let pivot_price = side_price(pivot_bar, is_resistance);
        let pivot_x = self.x_at(window, pivot)?;

        let mut end = window.len().checked_sub(1)?;

        loop {
            let mut a2 = end;
            if self.strict {
                while a2 > pivot && !self.slope_ok(window, pivot_price, a2, is_resistance) {
                    a2 -= 1;
                }
            }
            if a2 <= pivot {
                return None;
            }

            let anchor2 = Anchor {
                x: self.x_at(window, a2)?,
                price: side_price(window.get(a2)?, is_resistance),
            };
            let line = Trendline::through(Anchor { x: pivot_x, price: pivot_price }, anchor2)?;

            match self.validate_no_violation(window, &line, pivot + 1, a2, is_resistance) {
                None => return Some(line),
                Some(k) => {
                    trace!(pivot, anchor2 = a2, violation = k, is_resistance, "Trendline violated, shrinking");
                    end = k;
                }
            }
        }
    }

    fn slope_ok<T: PriceBar>(&self, window: &SlidingWindow<T>, pivot_price: f64, position: usize, is_resistance: bool) -> bool {
        match window.get(position) {
            Some(bar) if is_resistance => bar.high() < pivot_price,
            Some(bar) => bar.low() > pivot_price,
            None => false,
        }
    }

    /// Scan positions `from..to` backward; the latest violating position, if any
    pub fn validate_no_violation<T: PriceBar>(
        &self,
        window: &SlidingWindow<T>,
        line: &Trendline,
        from: usize,
        to: usize,
        is_resistance: bool,
    ) -> Option<usize> {
        (from..to).rev().find(|&pos| {
            match (window.get(pos), self.x_at(window, pos)) {
                (Some(bar), Some(x)) => violates(line, bar, x, is_resistance),
                _ => false,
            }
        })
    }

    /// Resistance breaks on high above the line, support on low below it
    pub fn check_breakout<B: PriceBar>(&self, line: &Trendline, bar: &B, x: f64, is_resistance: bool) -> bool {
        violates(line, bar, x, is_resistance)
    }

    /// Only the side that matters for the held position is checked. Missing lines never break.
    pub fn check_breakouts<B: PriceBar>(
        &self,
        resistance: Option<&Trendline>,
        support: Option<&Trendline>,
        bar: &B,
        x: f64,
        position: Position,
    ) -> Breakouts {
        let check_res = position != Position::Long;
        let check_sup = position != Position::Short;

        Breakouts {
            resistance: check_res
                && resistance.is_some_and(|line| self.check_breakout(line, bar, x, true)),
            support: check_sup
                && support.is_some_and(|line| self.check_breakout(line, bar, x, false)),
        }
    }

    /// Fresh (resistance, support) pair for the current window
    pub fn compute_lines<T: PriceBar>(&self, window: &SlidingWindow<T>) -> (Option<Trendline>, Option<Trendline>) {
        let resistance = self
            .find_extremum(window, true)
            .and_then(|pivot| self.build_line(window, pivot, true));
        let support = self
            .find_extremum(window, false)
            .and_then(|pivot| self.build_line(window, pivot, false));
        (resistance, support)
    }
}

fn side_price<B: PriceBar>(bar: &B, high_side: bool) -> f64 {
    if high_side { bar.high() } else { bar.low() }
}

fn violates<B: PriceBar>(line: &Trendline, bar: &B, x: f64, is_resistance: bool) -> bool {
    let expected = line.value_at(x);
    if is_resistance {
        bar.high() > expected
    } else {
        bar.low() < expected
    }
}

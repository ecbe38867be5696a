// Layer 3 - Signal Generation
// Trend strength, trendlines and the position state machine

pub mod adx;
pub mod window;
pub mod trendline;
pub mod signal;
pub mod sink;
pub mod engine;

pub use adx::{calculate_adx, enrich, AdxCalculator, AdxCalculatorStats, IndicatorError, IndicatorState};
pub use window::SlidingWindow;
pub use trendline::{Anchor, Breakouts, Trendline, TrendlineDetector};
pub use signal::{SignalStateMachine, SignalStats};
pub use sink::{ChannelSink, JsonLinesSink, MemorySink, SignalSink, SinkError};
pub use engine::{replay, EngineError, EngineStats, ReplaySummary, SignalEngine};

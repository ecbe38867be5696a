// Trend Breakout - Trendline breakout + ADX signal engine
//
// core   - types, configuration, logging
// layer1 - data connectors (REST klines, kline stream, DEX feed)
// layer2 - parsing, candle aggregation, historical backfill, live pipeline
// layer3 - indicator, sliding window, trendlines, state machine, sinks

pub mod core;
pub mod layer1;
pub mod layer2;
pub mod layer3;

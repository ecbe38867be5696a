// Layer 2 - Candle Production
// Parsing, aggregation, concurrent historical backfill and the live handoff

pub mod parser;
pub mod aggregator;
pub mod backfill;
pub mod pipeline;

// Re-export commonly used items
pub use parser::{parse_rest_klines, parse_stream_kline, KlineParser, ParseError, ParserStats};
pub use aggregator::{AggregatorStats, CandleAggregator};
pub use backfill::{
    plan_chunks, BackfillConfig, BackfillError, BackfillPipeline, BackfillStats,
    ChunkJob, HistoricalRangeFetcher,
};
pub use pipeline::{run_live, LivePipeline, LiveSource, PipelineError, PipelineStats};

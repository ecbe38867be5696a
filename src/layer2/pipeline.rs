// Live Pipeline - Candle producers -> handoff channel -> signal engine
// One consumer task owns all signal state; producers stop on cancellation and the consumer drains

use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::config::{AggregatorConfig, ExchangeConfig, StrategyConfig};
use crate::core::types::Candle;
use crate::layer1::dex_feed::{DexFeed, DexFeedError};
use crate::layer1::rest_client::{KlineRestClient, RestClientError};
use crate::layer1::websocket::KlineStream;
use crate::layer3::engine::{EngineError, SignalEngine};
use crate::layer3::sink::SignalSink;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),
    #[error("REST client error: {0}")]
    RestClient(#[from] RestClientError),
    #[error("DEX feed error: {0}")]
    DexFeed(#[from] DexFeedError),
    #[error("Producer task failed: {0}")]
    Producer(String),
}

/// Where live candles come from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveSource {
    /// Exchange continuous-kline WebSocket
    KlineStream,
    /// Polled DEX price aggregated into candles
    DexFeed,
}

/// Pipeline statistics
#[derive(Debug, Clone, Default)]
pub struct PipelineStats {
    pub candles_received: u64,
    pub skipped_open: u64,
    pub records: u64,
    pub signals: u64,
    pub errors: u64,
}

impl fmt::Display for PipelineStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Pipeline(received={}, open={}, records={}, signals={}, errors={})",
            self.candles_received, self.skipped_open, self.records, self.signals, self.errors
        )
    }
}

/// Consumer side of the handoff channel
pub struct LivePipeline<S: SignalSink> {
    engine: SignalEngine<S>,
    stats: PipelineStats,
}

impl<S: SignalSink> LivePipeline<S> {
    pub fn new(engine: SignalEngine<S>) -> Self {
        Self {
            engine,
            stats: PipelineStats::default(),
        }
    }

    /// Process one candle from the channel. Sink failures are logged and counted.
    pub fn consume(&mut self, candle: Candle) {
        self.stats.candles_received += 1;
        if !candle.is_final {
            self.stats.skipped_open += 1;
            return;
        }

        match self.engine.on_candle(candle) {
            Ok(Some(record)) => {
                self.stats.records += 1;
                if record.entry_signal != 0 || record.exit_signal != 0 {
                    self.stats.signals += 1;
                }
            }
            Ok(None) => {}
            Err(e) => {
                self.stats.errors += 1;
                error!(error = %e, "Failed to process candle");
            }
        }
    }

    /// Consume until every sender is dropped, then flush the sink
    pub async fn run(mut self, mut rx: mpsc::Receiver<Candle>) -> (SignalEngine<S>, PipelineStats) {
        info!("Live pipeline consuming candles");
        while let Some(candle) = rx.recv().await {
            debug!(candle = %candle, "Candle received");
            self.consume(candle);
        }

        if let Err(e) = self.engine.flush() {
            self.stats.errors += 1;
            warn!(error = %e, "Sink flush failed");
        }
        info!(stats = %self.stats, engine = %self.engine.get_stats(), "Live pipeline drained");
        (self.engine, self.stats)
    }

    pub fn engine(&self) -> &SignalEngine<S> {
        &self.engine
    }

    pub fn get_stats(&self) -> PipelineStats {
        self.stats.clone()
    }
}

/// Seed from recent exchange history, start the producer, run the consumer
/// until `shutdown` fires and the channel drains.
pub async fn run_live<S: SignalSink>(
    exchange: &ExchangeConfig,
    aggregator: &AggregatorConfig,
    strategy: StrategyConfig,
    source: LiveSource,
    sink: S,
    shutdown: CancellationToken,
) -> Result<PipelineStats, PipelineError> {
    let seed_count = exchange
        .seed_candles
        .max((strategy.adx_period + strategy.window_size + 1) as u32);
    let rest = KlineRestClient::from_config(exchange)?;
    let history = rest.recent_klines(seed_count).await?;
    info!(candles = history.len(), source = ?source, "Seed history fetched");

    let engine = SignalEngine::from_history(&history, strategy, sink)?;
    let (tx, rx) = mpsc::channel(aggregator.handoff_capacity.max(1));

    let producer = match source {
        LiveSource::KlineStream => {
            let stream = KlineStream::from_config(exchange);
            let token = shutdown.clone();
            tokio::spawn(async move {
                stream
                    .run(tx, token)
                    .await
                    .map_err(|e| PipelineError::Producer(e.to_string()))
            })
        }
        LiveSource::DexFeed => {
            let feed = DexFeed::from_config(exchange, aggregator)?;
            let token = shutdown.clone();
            tokio::spawn(async move {
                let stats = feed.run(tx, token).await;
                debug!(stats = %stats, "DEX feed finished");
                Ok(())
            })
        }
    };

    let (_engine, stats) = LivePipeline::new(engine).run(rx).await;

    match producer.await {
        Ok(Ok(())) => Ok(stats),
        Ok(Err(e)) => Err(e),
        Err(e) => Err(PipelineError::Producer(e.to_string())),
    }
}

// Kline Stream - Continuous-kline WebSocket feed
// Pushes parsed candles into the handoff channel until cancelled

use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::config::ExchangeConfig;
use crate::core::types::Candle;
use crate::layer2::parser::KlineParser;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("Max reconnection attempts ({0}) reached")]
    MaxReconnects(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

/// How a single connection ended
enum SessionEnd {
    Cancelled,
    ConsumerGone,
    Closed,
}

/// WebSocket statistics
#[derive(Debug, Clone)]
pub struct KlineStreamStats {
    pub state: StreamState,
    pub message_count: u64,
    pub candles_forwarded: u64,
    pub error_count: u64,
    pub reconnects: u64,
}

impl fmt::Display for KlineStreamStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "KlineStreamStats(state={:?}, messages={}, candles={}, errors={}, reconnects={})",
            self.state, self.message_count, self.candles_forwarded, self.error_count, self.reconnects
        )
    }
}

pub struct KlineStream {
    url: String,
    state: Arc<RwLock<StreamState>>,
    message_count: AtomicU64,
    candles_forwarded: AtomicU64,
    error_count: AtomicU64,
    reconnects: AtomicU64,
    parser: parking_lot::Mutex<KlineParser>,
    max_reconnect_attempts: u32,
    ping_interval_secs: u64,
}

impl KlineStream {
    pub fn new(ws_base_url: &str, symbol: &str, interval: &str) -> Self {
        let url = Self::stream_url(ws_base_url, symbol, interval);
        info!(url = %url, "Kline stream created");
        Self {
            url,
            state: Arc::new(RwLock::new(StreamState::Disconnected)),
            message_count: AtomicU64::new(0),
            candles_forwarded: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            parser: parking_lot::Mutex::new(KlineParser::new()),
            max_reconnect_attempts: 10,
            ping_interval_secs: 20,
        }
    }

    pub fn from_config(config: &ExchangeConfig) -> Self {
        Self::new(&config.ws_base_url, &config.symbol, &config.interval)
    }

    /// `{base}/ws/{symbol}_perpetual@continuousKline_{interval}`
    pub fn stream_url(ws_base_url: &str, symbol: &str, interval: &str) -> String {
        format!(
            "{}/ws/{}_perpetual@continuousKline_{}",
            ws_base_url.trim_end_matches('/'),
            symbol.to_lowercase(),
            interval
        )
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn with_max_reconnects(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    /// Stream until cancelled, reconnecting with exponential backoff.
    /// Dropping out of this function drops the sender, which closes the handoff.
    pub async fn run(&self, tx: mpsc::Sender<Candle>, shutdown: CancellationToken) -> Result<(), StreamError> {
        let mut reconnect_attempt = 0u32;

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            match self.session(&tx, &shutdown).await {
                Ok(SessionEnd::Cancelled) => break,
                Ok(SessionEnd::ConsumerGone) => {
                    info!("Candle consumer dropped, stopping stream");
                    break;
                }
                Ok(SessionEnd::Closed) => {
                    info!("Kline stream closed by server");
                    reconnect_attempt = 0;
                }
                Err(e) => {
                    error!(error = %e, "Kline stream connection error");
                    self.error_count.fetch_add(1, Ordering::Relaxed);
                    *self.state.write() = StreamState::Failed;
                }
            }

            if reconnect_attempt >= self.max_reconnect_attempts {
                error!(max_attempts = self.max_reconnect_attempts, "Max reconnection attempts reached");
                *self.state.write() = StreamState::Failed;
                return Err(StreamError::MaxReconnects(self.max_reconnect_attempts));
            }

            let delay_secs = std::cmp::min(2_u64.pow(reconnect_attempt), 60);
            reconnect_attempt += 1;
            self.reconnects.fetch_add(1, Ordering::Relaxed);
            warn!(delay_secs, attempt = reconnect_attempt, "Reconnecting kline stream");
            *self.state.write() = StreamState::Disconnected;

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_secs(delay_secs)) => {}
            }
        }

        *self.state.write() = StreamState::Disconnected;
        info!("Kline stream stopped");
        Ok(())
    }

    async fn session(&self, tx: &mpsc::Sender<Candle>, shutdown: &CancellationToken) -> Result<SessionEnd, StreamError> {
        *self.state.write() = StreamState::Connecting;
        debug!(url = %self.url, "Connecting to kline stream");

        let ws_stream = tokio::select! {
            _ = shutdown.cancelled() => return Ok(SessionEnd::Cancelled),
            result = connect_async(self.url.as_str()) => result?.0,
        };

        info!(url = %self.url, "Kline stream connected");
        *self.state.write() = StreamState::Connected;

        let (mut write, mut read) = ws_stream.split();
        let mut ping = tokio::time::interval(Duration::from_secs(self.ping_interval_secs));
        ping.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(SessionEnd::Cancelled);
                }
                _ = ping.tick() => {
                    if let Err(e) = write.send(Message::Ping(vec![])).await {
                        warn!(error = %e, "Ping failed");
                        return Err(e.into());
                    }
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            let Some(candle) = self.handle_text(&text) else { continue };
                            if tx.send(candle).await.is_err() {
                                return Ok(SessionEnd::ConsumerGone);
                            }
                            self.candles_forwarded.fetch_add(1, Ordering::Relaxed);
                        }
                        Some(Ok(Message::Ping(data))) => {
                            let _ = write.send(Message::Pong(data)).await;
                        }
                        Some(Ok(Message::Close(_))) | None => return Ok(SessionEnd::Closed),
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(e.into()),
                    }
                }
            }
        }
    }

    /// Parse one text frame; subscription acks and malformed frames yield None
    fn handle_text(&self, text: &str) -> Option<Candle> {
        self.message_count.fetch_add(1, Ordering::Relaxed);
        match self.parser.lock().parse_stream(text) {
            Ok(candle) => Some(candle),
            Err(_) => {
                self.error_count.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        *self.state.read() == StreamState::Connected
    }

    pub fn get_stats(&self) -> KlineStreamStats {
        KlineStreamStats {
            state: *self.state.read(),
            message_count: self.message_count.load(Ordering::Relaxed),
            candles_forwarded: self.candles_forwarded.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_url() {
        assert_eq!(
            KlineStream::stream_url("wss://fstream.binance.com/", "SOLUSDT", "1m"),
            "wss://fstream.binance.com/ws/solusdt_perpetual@continuousKline_1m"
        );
        let stream = KlineStream::from_config(&ExchangeConfig::default());
        assert!(stream.url().ends_with("solusdt_perpetual@continuousKline_1m"));
        assert!(!stream.is_connected());
    }

    #[test]
    fn test_handle_text_counts_errors() {
        let stream = KlineStream::new("wss://example.invalid", "SOLUSDT", "1m");
        assert!(stream.handle_text(r#"{"result":null,"id":1}"#).is_none());

        let frame = r#"{"k":{"t":0,"T":59999,"o":"1","c":"1.5","h":"2","l":"0.5","v":"10","n":3,"x":true}}"#;
        let candle = stream.handle_text(frame).unwrap();
        assert!(candle.is_final);

        let stats = stream.get_stats();
        assert_eq!(stats.message_count, 2);
        assert_eq!(stats.error_count, 1);
    }

    #[tokio::test]
    async fn test_run_returns_when_already_cancelled() {
        let stream = KlineStream::new("wss://example.invalid", "SOLUSDT", "1m");
        let (tx, mut rx) = mpsc::channel(4);
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        stream.run(tx, shutdown).await.unwrap();
        // Sender dropped by run, channel closes
        assert!(rx.recv().await.is_none());
        assert_eq!(stream.get_stats().state, StreamState::Disconnected);
    }
}

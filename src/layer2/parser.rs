// Kline Parser - REST kline rows and continuous-kline stream messages
// Both paths produce validated Candles

use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use thiserror::Error;
use tracing::warn;

use crate::core::types::Candle;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Invalid JSON: {0}")]
    InvalidJson(String),
    #[error("Invalid kline row {row}: {reason}")]
    InvalidRow { row: usize, reason: String },
    #[error("Validation failed: {0}")]
    ValidationFailed(String),
}

/// Parse a string field as f64, returning ParseError on failure
fn parse_f64_field(value: &str, field_name: &str) -> Result<f64, ParseError> {
    value.parse::<f64>()
        .map_err(|_| ParseError::InvalidJson(format!("Invalid {}: '{}'", field_name, value)))
}

fn validate_candle(candle: &Candle) -> Result<(), ParseError> {
    let prices = [candle.open, candle.high, candle.low, candle.close];
    if prices.iter().any(|p| !p.is_finite() || *p <= 0.0) {
        return Err(ParseError::ValidationFailed(format!("non-positive price in candle {}", candle.open_time)));
    }
    if candle.high < candle.low {
        return Err(ParseError::ValidationFailed(format!("high below low in candle {}", candle.open_time)));
    }
    if candle.volume < 0.0 || candle.close_time < candle.open_time {
        return Err(ParseError::ValidationFailed(format!("inconsistent candle {}", candle.open_time)));
    }
    Ok(())
}

// ============================================================================
// REST rows
// ============================================================================
//
// [openTime, "open", "high", "low", "close", "volume", closeTime,
//  "quoteVolume", trades, "takerBase", "takerQuote", "ignore"]

fn row_i64(row: &[Value], idx: usize, row_no: usize, field: &str) -> Result<i64, ParseError> {
    let value = row.get(idx).ok_or_else(|| ParseError::InvalidRow {
        row: row_no,
        reason: format!("missing {}", field),
    })?;
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.parse::<i64>().ok(),
        _ => None,
    }
    .ok_or_else(|| ParseError::InvalidRow { row: row_no, reason: format!("invalid {}", field) })
}

fn row_f64(row: &[Value], idx: usize, row_no: usize, field: &str) -> Result<f64, ParseError> {
    match row.get(idx) {
        Some(Value::String(s)) => parse_f64_field(s, field),
        Some(Value::Number(n)) => n.as_f64().ok_or_else(|| ParseError::InvalidRow {
            row: row_no,
            reason: format!("invalid {}", field),
        }),
        _ => Err(ParseError::InvalidRow { row: row_no, reason: format!("missing {}", field) }),
    }
}

/// Parse a `/klines` response body. REST rows are closed candles.
pub fn parse_rest_klines(body: &[u8]) -> Result<Vec<Candle>, ParseError> {
    let rows: Vec<Vec<Value>> = serde_json::from_slice(body)
        .map_err(|e| ParseError::InvalidJson(e.to_string()))?;

    rows.iter()
        .enumerate()
        .map(|(row_no, row)| {
            let candle = Candle::new(
                row_i64(row, 0, row_no, "open_time")?,
                row_i64(row, 6, row_no, "close_time")?,
                row_f64(row, 1, row_no, "open")?,
                row_f64(row, 2, row_no, "high")?,
                row_f64(row, 3, row_no, "low")?,
                row_f64(row, 4, row_no, "close")?,
                row_f64(row, 5, row_no, "volume")?,
                row_i64(row, 8, row_no, "trades").unwrap_or(0),
                true,
            );
            validate_candle(&candle)?;
            Ok(candle)
        })
        .collect()
}

// ============================================================================
// Stream messages
// ============================================================================

#[derive(Debug, Deserialize)]
struct RawKlineData {
    #[serde(rename = "t")]
    open_time: i64,
    #[serde(rename = "T")]
    close_time: i64,
    #[serde(rename = "o")]
    open: String,
    #[serde(rename = "c")]
    close: String,
    #[serde(rename = "h")]
    high: String,
    #[serde(rename = "l")]
    low: String,
    #[serde(rename = "v")]
    volume: String,
    #[serde(rename = "n")]
    trades: i64,
    #[serde(rename = "x")]
    is_closed: bool,
}

#[derive(Debug, Deserialize)]
struct RawKlineEvent {
    #[serde(rename = "k")]
    kline: RawKlineData,
}

/// Parse a kline / continuous-kline event (bare or wrapped in `{"stream", "data"}`)
pub fn parse_stream_kline(raw_json: &str) -> Result<Candle, ParseError> {
    let value: Value = serde_json::from_str(raw_json)
        .map_err(|e| ParseError::InvalidJson(e.to_string()))?;

    // Unwrap combined stream format
    let data = match value.get("data") {
        Some(inner) => inner.clone(),
        None => value,
    };

    let raw: RawKlineEvent = serde_json::from_value(data)
        .map_err(|e| ParseError::InvalidJson(e.to_string()))?;
    let k = raw.kline;

    let candle = Candle::new(
        k.open_time,
        k.close_time,
        parse_f64_field(&k.open, "kline.open")?,
        parse_f64_field(&k.high, "kline.high")?,
        parse_f64_field(&k.low, "kline.low")?,
        parse_f64_field(&k.close, "kline.close")?,
        parse_f64_field(&k.volume, "kline.volume")?,
        k.trades,
        k.is_closed,
    );
    validate_candle(&candle)?;
    Ok(candle)
}

// ============================================================================
// Stateful parser (stats)
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct ParserStats {
    pub messages_parsed: u64,
    pub candles_parsed: u64,
    pub parse_errors: u64,
    pub validation_failures: u64,
}

impl ParserStats {
    pub fn error_rate(&self) -> f64 {
        let total = self.messages_parsed + self.parse_errors + self.validation_failures;
        if total > 0 {
            (self.parse_errors + self.validation_failures) as f64 / total as f64
        } else {
            0.0
        }
    }
}

impl fmt::Display for ParserStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ParserStats(messages={}, candles={}, errors={}, invalid={})",
            self.messages_parsed, self.candles_parsed, self.parse_errors, self.validation_failures
        )
    }
}

#[derive(Debug, Default)]
pub struct KlineParser {
    pub stats: ParserStats,
}

impl KlineParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse_rest(&mut self, body: &[u8]) -> Result<Vec<Candle>, ParseError> {
        let result = parse_rest_klines(body);
        match &result {
            Ok(candles) => {
                self.stats.messages_parsed += 1;
                self.stats.candles_parsed += candles.len() as u64;
            }
            Err(e) => self.record_error(e),
        }
        result
    }

    pub fn parse_stream(&mut self, raw_json: &str) -> Result<Candle, ParseError> {
        let result = parse_stream_kline(raw_json);
        match &result {
            Ok(_) => {
                self.stats.messages_parsed += 1;
                self.stats.candles_parsed += 1;
            }
            Err(e) => self.record_error(e),
        }
        result
    }

    fn record_error(&mut self, error: &ParseError) {
        match error {
            ParseError::ValidationFailed(_) => self.stats.validation_failures += 1,
            _ => self.stats.parse_errors += 1,
        }
        warn!(error = %error, "Failed to parse kline payload");
    }

    pub fn get_stats(&self) -> ParserStats {
        self.stats.clone()
    }
}

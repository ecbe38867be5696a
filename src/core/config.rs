// Configuration Management for the Trend Breakout engine
// JSON file + environment overlay, validated before use

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use parking_lot::RwLock;
use thiserror::Error;
use tracing::{info, warn};

use crate::core::types::interval_to_millis;

// ============================================================================
// Error Type
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

// ============================================================================
// Configuration Structures
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    pub symbol: String,
    pub interval: String,
    pub rest_base_url: String,
    pub ws_base_url: String,
    pub dex_base_url: String,
    pub dex_token_address: String,
    pub request_timeout_seconds: u64,

    // Backfill
    pub backfill_workers: usize,
    pub requests_per_second: u32,
    pub max_candles_per_request: u32,
    pub seed_candles: u32,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            symbol: "SOLUSDT".to_string(),
            interval: "1m".to_string(),
            rest_base_url: "https://api.binance.com".to_string(),
            ws_base_url: "wss://fstream.binance.com".to_string(),
            dex_base_url: "https://api.dexscreener.com".to_string(),
            dex_token_address: "So11111111111111111111111111111111111111112".to_string(),
            request_timeout_seconds: 10,
            backfill_workers: 5,
            requests_per_second: 15,
            max_candles_per_request: 1000,
            seed_candles: 50,
        }
    }
}

impl ExchangeConfig {
    pub fn interval_millis(&self) -> Option<i64> {
        interval_to_millis(&self.interval)
    }
}

/// Which coordinate trendlines use on their x-axis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum XAxis {
    /// Running window index (avoids near-zero slopes from millisecond timestamps)
    #[default]
    Index,
    OpenTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    pub adx_period: usize,
    pub window_size: usize,
    /// Minimum ADX to open a position on a breakout
    pub adx_threshold: f64,
    /// Minimum ADX to keep holding a position
    pub adx_min: f64,
    /// Candles flat before trendlines are recalibrated
    pub idle_limit: u32,
    /// Candles held before the position is force-closed
    pub active_limit: u32,
    pub strict_slopes: bool,
    pub x_axis: XAxis,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            adx_period: 14,
            window_size: 50,
            adx_threshold: 25.0,
            adx_min: 20.0,
            idle_limit: 30,
            active_limit: 60,
            strict_slopes: true,
            x_axis: XAxis::Index,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    pub candle_duration_ms: i64,
    /// Poll spacing for the DEX feed (5 req/s limit plus a 10ms buffer)
    pub poll_interval_ms: u64,
    pub handoff_capacity: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            candle_duration_ms: 60_000,
            poll_interval_ms: 210,
            handoff_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub log_level: String,
    pub json_logs: bool,
    pub console_output: bool,
    pub signal_log_path: String,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            log_level: "INFO".to_string(),
            json_logs: false,
            console_output: true,
            signal_log_path: "data/signals.jsonl".to_string(),
        }
    }
}

// ============================================================================
// Configuration Summary
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct ConfigSummary {
    pub symbol: String,
    pub interval: String,
    pub adx_period: usize,
    pub window_size: usize,
    pub adx_threshold: f64,
    pub adx_min: f64,
    pub log_level: String,
}

// ============================================================================
// Configuration Manager
// ============================================================================

pub struct ConfigManager {
    exchange: Arc<RwLock<ExchangeConfig>>,
    strategy: Arc<RwLock<StrategyConfig>>,
    aggregator: Arc<RwLock<AggregatorConfig>>,
    monitoring: Arc<RwLock<MonitoringConfig>>,
}

impl ConfigManager {
    pub fn new(config_path: Option<&str>) -> Result<Self, ConfigError> {
        let mut manager = Self {
            exchange: Arc::new(RwLock::new(ExchangeConfig::default())),
            strategy: Arc::new(RwLock::new(StrategyConfig::default())),
            aggregator: Arc::new(RwLock::new(AggregatorConfig::default())),
            monitoring: Arc::new(RwLock::new(MonitoringConfig::default())),
        };

        if let Some(path) = config_path {
            manager.load_from_file(path)?;
        }

        manager.load_from_env();

        info!("Configuration initialized");
        Ok(manager)
    }

    /// Load configuration from JSON file
    pub fn load_from_file(&mut self, config_path: &str) -> Result<(), ConfigError> {
        let path = Path::new(config_path);
        if !path.exists() {
            warn!(path = config_path, "Config file not found");
            return Ok(());
        }

        let content = fs::read_to_string(path)?;
        let config_data: HashMap<String, serde_json::Value> = serde_json::from_str(&content)?;

        if let Some(data) = config_data.get("exchange") {
            *self.exchange.write() = serde_json::from_value(data.clone())?;
        }
        if let Some(data) = config_data.get("strategy") {
            *self.strategy.write() = serde_json::from_value(data.clone())?;
        }
        if let Some(data) = config_data.get("aggregator") {
            *self.aggregator.write() = serde_json::from_value(data.clone())?;
        }
        if let Some(data) = config_data.get("monitoring") {
            *self.monitoring.write() = serde_json::from_value(data.clone())?;
        }

        info!(path = config_path, "Configuration loaded");
        Ok(())
    }

    /// Overlay strategy knobs from the environment
    pub fn load_from_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(symbol) = lookup("SYMBOL") {
            self.exchange.write().symbol = symbol.to_uppercase();
        }

        let mut strategy = self.strategy.write();
        override_parsed(&lookup, "ADX_PERIOD", &mut strategy.adx_period);
        override_parsed(&lookup, "WINDOW_SIZE", &mut strategy.window_size);
        override_parsed(&lookup, "ADX_THRESHOLD", &mut strategy.adx_threshold);
        override_parsed(&lookup, "ADX_MIN", &mut strategy.adx_min);
        override_parsed(&lookup, "IDLE_LIMIT", &mut strategy.idle_limit);
        override_parsed(&lookup, "ACTIVE_LIMIT", &mut strategy.active_limit);
    }

    /// Save configuration to JSON file
    pub fn save_to_file(&self, config_path: &str) -> Result<(), ConfigError> {
        let mut config_map = HashMap::new();
        config_map.insert("exchange", serde_json::to_value(&*self.exchange.read())?);
        config_map.insert("strategy", serde_json::to_value(&*self.strategy.read())?);
        config_map.insert("aggregator", serde_json::to_value(&*self.aggregator.read())?);
        config_map.insert("monitoring", serde_json::to_value(&*self.monitoring.read())?);

        if let Some(parent) = Path::new(config_path).parent() {
            fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(&config_map)?;
        fs::write(config_path, json)?;

        info!(path = config_path, "Configuration saved");
        Ok(())
    }

    /// Validate configuration. Every problem is logged; the first one is returned.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();
        let exchange = self.exchange.read();
        let strategy = self.strategy.read();
        let aggregator = self.aggregator.read();

        if strategy.adx_period < 2 {
            errors.push("adx_period must be at least 2".to_string());
        }
        if strategy.window_size < 2 {
            errors.push("window_size must be at least 2".to_string());
        }
        if strategy.adx_min > strategy.adx_threshold {
            errors.push("adx_min must not exceed adx_threshold".to_string());
        }
        if strategy.idle_limit == 0 || strategy.active_limit == 0 {
            errors.push("idle_limit and active_limit must be at least 1".to_string());
        }
        if exchange.backfill_workers == 0 {
            errors.push("backfill_workers must be at least 1".to_string());
        }
        if exchange.requests_per_second == 0 {
            errors.push("requests_per_second must be positive".to_string());
        }
        if exchange.max_candles_per_request == 0 {
            errors.push("max_candles_per_request must be at least 1".to_string());
        }
        if exchange.interval_millis().is_none() {
            errors.push(format!("unsupported interval '{}'", exchange.interval));
        }
        if (exchange.seed_candles as usize) <= strategy.adx_period {
            errors.push("seed_candles must exceed adx_period".to_string());
        }
        if aggregator.candle_duration_ms <= 0 {
            errors.push("candle_duration_ms must be positive".to_string());
        }

        if let Some(first) = errors.first().cloned() {
            for error in &errors {
                warn!(error = %error, "Config validation error");
            }
            return Err(ConfigError::Validation(first));
        }

        info!("Configuration validated successfully");
        Ok(())
    }

    pub fn get_summary(&self) -> ConfigSummary {
        let exchange = self.exchange.read();
        let strategy = self.strategy.read();
        let monitoring = self.monitoring.read();

        ConfigSummary {
            symbol: exchange.symbol.clone(),
            interval: exchange.interval.clone(),
            adx_period: strategy.adx_period,
            window_size: strategy.window_size,
            adx_threshold: strategy.adx_threshold,
            adx_min: strategy.adx_min,
            log_level: monitoring.log_level.clone(),
        }
    }

    pub fn exchange(&self) -> ExchangeConfig {
        self.exchange.read().clone()
    }

    pub fn strategy(&self) -> StrategyConfig {
        self.strategy.read().clone()
    }

    pub fn aggregator(&self) -> AggregatorConfig {
        self.aggregator.read().clone()
    }

    pub fn monitoring(&self) -> MonitoringConfig {
        self.monitoring.read().clone()
    }
}

fn override_parsed<T, F>(lookup: &F, key: &str, slot: &mut T)
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = lookup(key) {
        match raw.trim().parse::<T>() {
            Ok(value) => *slot = value,
            Err(_) => warn!(key = key, value = %raw, "Ignoring unparsable environment override"),
        }
    }
}

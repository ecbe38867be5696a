// Signal Sinks - Destinations for per-candle signal records
// In-memory, JSON lines, and channel forwarding

use crate::core::config::MonitoringConfig;
use crate::core::types::SignalRecord;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Sink channel closed")]
    ChannelClosed,
}

/// Consumer of one record per processed candle. Lifecycle belongs to the caller.
pub trait SignalSink {
    fn record(&mut self, record: &SignalRecord) -> Result<(), SinkError>;

    fn flush(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

impl<S: SignalSink + ?Sized> SignalSink for Box<S> {
    fn record(&mut self, record: &SignalRecord) -> Result<(), SinkError> {
        (**self).record(record)
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        (**self).flush()
    }
}

impl<S: SignalSink + ?Sized> SignalSink for &mut S {
    fn record(&mut self, record: &SignalRecord) -> Result<(), SinkError> {
        (**self).record(record)
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        (**self).flush()
    }
}

#[derive(Debug, Default)]
pub struct MemorySink {
    records: Vec<SignalRecord>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> &[SignalRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<SignalRecord> {
        self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl SignalSink for MemorySink {
    fn record(&mut self, record: &SignalRecord) -> Result<(), SinkError> {
        self.records.push(record.clone());
        Ok(())
    }
}

/// One JSON object per line
pub struct JsonLinesSink<W: Write> {
    writer: W,
    written: u64,
}

impl JsonLinesSink<BufWriter<File>> {
    pub fn create(path: &str) -> Result<Self, SinkError> {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = File::create(path)?;
        Ok(Self::new(BufWriter::new(file)))
    }

    /// Open the signal log named in the monitoring config
    pub fn from_config(config: &MonitoringConfig) -> Result<Self, SinkError> {
        Self::create(&config.signal_log_path)
    }
}

impl<W: Write> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer, written: 0 }
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> SignalSink for JsonLinesSink<W> {
    fn record(&mut self, record: &SignalRecord) -> Result<(), SinkError> {
        serde_json::to_writer(&mut self.writer, record)?;
        self.writer.write_all(b"\n")?;
        self.written += 1;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Forwards records to another task
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<SignalRecord>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::UnboundedSender<SignalRecord>) -> Self {
        Self { tx }
    }
}

impl SignalSink for ChannelSink {
    fn record(&mut self, record: &SignalRecord) -> Result<(), SinkError> {
        self.tx.send(record.clone()).map_err(|_| SinkError::ChannelClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(t: i64, entry: i8) -> SignalRecord {
        SignalRecord {
            open_time: t,
            open: 1.0,
            high: 2.0,
            low: 0.5,
            close: 1.5,
            volume: 10.0,
            indicator_value: Some(31.5),
            window_index: 7,
            entry_signal: entry,
            exit_signal: 0,
        }
    }

    #[test]
    fn test_memory_sink() {
        let mut sink = MemorySink::new();
        sink.record(&record(1, 1)).unwrap();
        sink.record(&record(2, 0)).unwrap();
        assert_eq!(sink.len(), 2);
        assert_eq!(sink.records()[0].entry_signal, 1);
    }

    #[test]
    fn test_json_lines_sink() {
        let mut sink = JsonLinesSink::new(Vec::new());
        sink.record(&record(60_000, -1)).unwrap();
        sink.record(&record(120_000, 0)).unwrap();
        sink.flush().unwrap();
        assert_eq!(sink.written(), 2);

        let text = String::from_utf8(sink.into_inner()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: SignalRecord = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed.open_time, 60_000);
        assert_eq!(parsed.entry_signal, -1);
        assert_eq!(parsed.indicator_value, Some(31.5));
    }

    #[test]
    fn test_json_lines_sink_from_config() {
        let dir = std::env::temp_dir().join(format!("trend_breakout_sink_{}", std::process::id()));
        let path = dir.join("nested").join("signals.jsonl");
        let config = MonitoringConfig {
            signal_log_path: path.to_string_lossy().into_owned(),
            ..MonitoringConfig::default()
        };

        let mut sink = JsonLinesSink::from_config(&config).unwrap();
        sink.record(&record(60_000, 1)).unwrap();
        sink.flush().unwrap();
        drop(sink);

        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 1);
        let parsed: SignalRecord = serde_json::from_str(text.trim_end()).unwrap();
        assert_eq!(parsed.entry_signal, 1);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_channel_sink() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut sink = ChannelSink::new(tx);
        sink.record(&record(5, 1)).unwrap();
        assert_eq!(rx.try_recv().unwrap().open_time, 5);

        drop(rx);
        assert!(matches!(sink.record(&record(6, 0)), Err(SinkError::ChannelClosed)));
    }

    #[test]
    fn test_boxed_sink() {
        let mut sink: Box<dyn SignalSink> = Box::new(MemorySink::new());
        assert!(sink.record(&record(1, 0)).is_ok());
    }
}

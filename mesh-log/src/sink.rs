//! Log sinks

use crate::Level;
use crate::error::LogResult;
use crate::record::{Attr, LogRecord, attrs_to_json, merge_value, nest_in_groups};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::fmt;
use std::io::{self, Write};
use std::sync::Arc;

/// Final destination of log records.
///
/// Derivations return new sinks sharing the same output.
pub trait LogSink: Send + Sync + fmt::Debug {
    /// Whether records at `level` are written.
    fn enabled(&self, level: Level) -> bool;

    /// Write a record.
    fn handle(&self, record: &LogRecord) -> LogResult<()>;

    /// Sink that writes `attrs` with every record.
    fn with_attrs(&self, attrs: Vec<Attr>) -> Arc<dyn LogSink>;

    /// Sink that nests every following attribute under `name`.
    fn with_group(&self, name: &str) -> Arc<dyn LogSink>;
}

type SharedWriter = Arc<Mutex<Box<dyn Write + Send>>>;

/// Writes one JSON object per line: `time`, `level`, `msg`, then attributes.
#[derive(Clone)]
pub struct JsonSink {
    writer: SharedWriter,
    min_level: Level,
    preset: Vec<Attr>,
    groups: Vec<String>,
}

impl JsonSink {
    /// Sink writing to `writer`, dropping records below `min_level`.
    pub fn new<W>(writer: W, min_level: Level) -> Self
    where
        W: Write + Send + 'static,
    {
        Self {
            writer: Arc::new(Mutex::new(Box::new(writer))),
            min_level,
            preset: Vec::new(),
            groups: Vec::new(),
        }
    }

    /// Sink writing to standard output
    pub fn stdout(min_level: Level) -> Self {
        Self::new(io::stdout(), min_level)
    }

    /// Render `record` as a JSON object.
    pub fn render(&self, record: &LogRecord) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert(
            "time".to_string(),
            Value::String(record.timestamp.to_rfc3339()),
        );
        map.insert(
            "level".to_string(),
            Value::String(record.level.as_str().to_string()),
        );
        map.insert("msg".to_string(), Value::String(record.message.clone()));

        for (key, value) in attrs_to_json(&self.preset) {
            merge_value(&mut map, key, value);
        }

        let attrs = nest_in_groups(&self.groups, record.attrs.clone());
        for (key, value) in attrs_to_json(&attrs) {
            merge_value(&mut map, key, value);
        }

        map
    }
}

impl fmt::Debug for JsonSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonSink")
            .field("min_level", &self.min_level)
            .field("preset", &self.preset.len())
            .field("groups", &self.groups)
            .finish_non_exhaustive()
    }
}

impl LogSink for JsonSink {
    fn enabled(&self, level: Level) -> bool {
        level >= self.min_level && level != Level::Off
    }

    fn handle(&self, record: &LogRecord) -> LogResult<()> {
        let mut line = serde_json::to_vec(&Value::Object(self.render(record)))?;
        line.push(b'\n');

        let mut writer = self.writer.lock();
        writer.write_all(&line)?;
        writer.flush()?;
        Ok(())
    }

    fn with_attrs(&self, attrs: Vec<Attr>) -> Arc<dyn LogSink> {
        let mut sink = self.clone();
        if !attrs.is_empty() {
            sink.preset.extend(nest_in_groups(&self.groups, attrs));
        }
        Arc::new(sink)
    }

    fn with_group(&self, name: &str) -> Arc<dyn LogSink> {
        let mut sink = self.clone();
        if !name.is_empty() {
            sink.groups.push(name.to_string());
        }
        Arc::new(sink)
    }
}

/// Cloneable in-memory writer, handy for capturing output.
#[derive(Debug, Clone, Default)]
pub struct MemoryWriter {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl MemoryWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything written so far
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.buffer.lock()).into_owned()
    }

    /// Written lines parsed as JSON; unparsable lines are skipped
    pub fn json_lines(&self) -> Vec<Value> {
        self.contents()
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }
}

impl Write for MemoryWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

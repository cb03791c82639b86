//! Human-readable rendering of JSON log lines
//!
//! [`PrettyWriter`] sits behind a [`JsonSink`](crate::JsonSink) on developer
//! machines. Each JSON line is re-read and printed as
//!
//! ```text
//! [2024-05-01 14:03:22] INFO order placed {
//!   "id": 7,
//!   "level": "INFO",
//!   "msg": "order placed",
//!   "time": "2024-05-01T14:03:22.120Z"
//! }
//! ```
//!
//! with the level coloured: debug cyan, info green, warn yellow, error red.

use chrono::{DateTime, Local};
use serde_json::{Map, Value};
use std::io::{self, Write};

/// `io::Write` adapter turning JSON log lines into pretty output.
#[derive(Debug)]
pub struct PrettyWriter<W: Write> {
    inner: W,
    color: bool,
    pending: Vec<u8>,
}

impl<W: Write> PrettyWriter<W> {
    pub fn new(inner: W, color: bool) -> Self {
        Self {
            inner,
            color,
            pending: Vec::new(),
        }
    }

    /// Wrapped writer
    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    fn write_line(&mut self, line: &[u8]) -> io::Result<()> {
        let fields: Map<String, Value> = match serde_json::from_slice(line) {
            Ok(fields) => fields,
            // not one of ours, pass through untouched
            Err(_) => {
                self.inner.write_all(line)?;
                return self.inner.write_all(b"\n");
            }
        };

        let time = fields
            .get("time")
            .and_then(Value::as_str)
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.with_timezone(&Local).format("[%Y-%m-%d %H:%M:%S]").to_string())
            .unwrap_or_default();
        let level = fields.get("level").and_then(Value::as_str).unwrap_or("");
        let msg = fields.get("msg").and_then(Value::as_str).unwrap_or("");
        let body = serde_json::to_string_pretty(&fields).map_err(io::Error::other)?;

        writeln!(
            self.inner,
            "{} {} {} {}",
            time,
            paint(level, self.color),
            msg,
            body
        )
    }
}

#[cfg(feature = "color")]
fn paint(level: &str, color: bool) -> String {
    use colored::Colorize;

    if !color {
        return level.to_string();
    }
    match level {
        "DEBUG" => level.cyan().to_string(),
        "INFO" => level.green().to_string(),
        "WARN" => level.yellow().to_string(),
        "ERROR" => level.red().to_string(),
        _ => level.white().to_string(),
    }
}

#[cfg(not(feature = "color"))]
fn paint(level: &str, _color: bool) -> String {
    level.to_string()
}

impl<W: Write> Write for PrettyWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pending.extend_from_slice(buf);

        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            self.write_line(&line[..line.len() - 1])?;
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

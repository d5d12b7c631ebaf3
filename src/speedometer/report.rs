//! # Telemetry Lines
//!
//! The aggregator renders every progress and summary report as one line with
//! a fixed shape that downstream tooling parses:
//!
//! ```text
//! {speedometer: {label: nightly, active: 4, total: 13.5mb, sec: 1:51, speed: 121kb/s, records: 269,748, record-speed: 2,435/s}}
//!                └─ only when a label is configured
//! ```
//!
//! Lines are handed to a [`ReportSink`]. The default sink forwards them to
//! `tracing` at `INFO`; [`MemorySink`] keeps them for inspection.

use super::format::{to_byte_text, to_decimal_text, to_time_text};
use std::fmt;
use std::sync::Mutex;
use tracing::info;

/// One throughput report, ready to render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeedReport {
    /// Optional run label.
    pub label: Option<String>,
    /// Controllers registered at report time.
    pub active: usize,
    /// Bytes metered so far.
    pub total_bytes: u64,
    /// Milliseconds since the run's global start.
    pub elapsed_ms: u64,
    /// Aggregate bytes per second.
    pub bytes_per_sec: u64,
    /// Records metered so far.
    pub total_records: u64,
    /// Aggregate records per second.
    pub records_per_sec: u64,
}

impl fmt::Display for SpeedReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{speedometer: {")?;
        if let Some(label) = self.label.as_deref().filter(|l| !l.is_empty()) {
            write!(f, "label: {}, ", label)?;
        }
        write!(
            f,
            "active: {}, total: {}, sec: {}, speed: {}/s, records: {}, record-speed: {}/s}}}}",
            self.active,
            to_byte_text(self.total_bytes),
            to_time_text(self.elapsed_ms),
            to_byte_text(self.bytes_per_sec),
            to_decimal_text(self.total_records),
            to_decimal_text(self.records_per_sec),
        )
    }
}

/// Destination of rendered telemetry lines.
///
/// Implementations must be cheap: `emit` runs on a worker thread that just
/// won a report cycle, or on the thread stopping the last controller.
pub trait ReportSink: Send + Sync {
    /// Receives one rendered line.
    fn emit(&self, line: &str);
}

/// Forwards lines to `tracing::info!` with target `speedometer`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl ReportSink for TracingSink {
    fn emit(&self, line: &str) {
        info!(target: "speedometer", "{}", line);
    }
}

/// Keeps every line in memory.
///
/// Useful for tests and for embedders that want to post-process lines.
///
/// ```rust
/// use speedometer::{MemorySink, ReportSink};
///
/// let sink = MemorySink::new();
/// sink.emit("{speedometer: {active: 0}}");
/// assert_eq!(sink.lines().len(), 1);
/// ```
#[derive(Debug, Default)]
pub struct MemorySink {
    lines: Mutex<Vec<String>>,
}

impl MemorySink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of all lines received so far.
    pub fn lines(&self) -> Vec<String> {
        match self.lines.lock() {
            Ok(lines) => lines.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Number of lines received so far.
    pub fn len(&self) -> usize {
        match self.lines.lock() {
            Ok(lines) => lines.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    /// Returns `true` if nothing was emitted yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes and returns all lines.
    pub fn take(&self) -> Vec<String> {
        match self.lines.lock() {
            Ok(mut lines) => std::mem::take(&mut *lines),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }
}

impl ReportSink for MemorySink {
    fn emit(&self, line: &str) {
        match self.lines.lock() {
            Ok(mut lines) => lines.push(line.to_string()),
            Err(poisoned) => poisoned.into_inner().push(line.to_string()),
        }
    }
}

/// Splits a rendered line back into `(key, value)` pairs.
///
/// Returns `None` if `line` does not have the `{speedometer: {...}}` shape.
///
/// ```rust
/// use speedometer::parse_report_line;
///
/// let fields = parse_report_line(
///     "{speedometer: {active: 2, total: 1.0kb, sec: 0.50, speed: 2.0kb/s, records: 10, record-speed: 20/s}}",
/// ).unwrap();
/// assert_eq!(fields[0], ("active", "2"));
/// assert_eq!(fields.len(), 6);
/// ```
pub fn parse_report_line(line: &str) -> Option<Vec<(&str, &str)>> {
    let body = line
        .trim()
        .strip_prefix("{speedometer: {")?
        .strip_suffix("}}")?;

    // `records` uses `,` as a thousands separator, so split on ", <key>: ".
    let mut fields = Vec::new();
    let mut rest = body;
    loop {
        let (key, after_key) = rest.split_once(": ")?;
        match find_next_field(after_key) {
            Some(end) => {
                fields.push((key, &after_key[..end]));
                rest = &after_key[end + 2..];
            }
            None => {
                fields.push((key, after_key));
                return Some(fields);
            }
        }
    }
}

/// Byte offset of the `, ` that starts the next `key: ` pair.
fn find_next_field(value: &str) -> Option<usize> {
    let mut search_from = 0;
    while let Some(pos) = value[search_from..].find(", ") {
        let start = search_from + pos;
        let tail = &value[start + 2..];
        let is_key = tail
            .split_once(": ")
            .map(|(key, _)| !key.is_empty() && key.chars().all(|c| c.is_ascii_lowercase() || c == '-'))
            .unwrap_or(false);
        if is_key {
            return Some(start);
        }
        search_from = start + 2;
    }
    None
}

//! # Speedometer Module
//!
//! Internal implementation of metering, throttling and telemetry. Each
//! submodule owns one concern.
//!
//! ## Module Structure
//!
//! ```text
//!     speedometer/
//!     ├── mod.rs          (module organization)
//!     ├── aggregator.rs   (shared registry, fair share, report cycle)
//!     ├── config.rs       (YAML settings and validation)
//!     ├── controller.rs   (per-worker metering and throttling)
//!     ├── error.rs        (configuration errors)
//!     ├── format.rs       (byte/count/time text for log lines)
//!     ├── meter.rs        (records to byte counts)
//!     ├── metrics.rs      (monitoring snapshots)
//!     ├── report.rs       (log line rendering and sinks)
//!     └── utils.rs        (clock and cache alignment)
//! ```
//!
//! ## Data Flow
//!
//! ```text
//!     record
//!       │
//!       ▼
//!     ┌─────────────┐
//!     │ RecordMeter │ ◄── text length per column, delimiter, padding
//!     └──────┬──────┘
//!            ▼
//!     ┌─────────────────┐
//!     │ SpeedController │ ◄── period counters, sleeps when over its share
//!     └──────┬──────────┘
//!            ▼
//!     ┌─────────────────┐
//!     │ SpeedAggregator │ ◄── fair share, periodic report, final summary
//!     └──────┬──────────┘
//!            ▼
//!     ┌────────────┐
//!     │ ReportSink │ ◄── {speedometer: {...}} lines
//!     └────────────┘
//! ```

mod aggregator;
mod config;
mod controller;
mod error;
pub mod format;
mod meter;
mod metrics;
mod report;
mod utils;

/// Shared aggregator and the fair-share rule
pub use aggregator::{fair_share, SharedAggregator, SpeedAggregator};

/// Settings for controllers, meters and aggregators
pub use config::{
    ControllerConfig, SpeedometerConfig, TimestampColumnOption, DEFAULT_LOG_INTERVAL_SECONDS,
    DEFAULT_MAX_SLEEP_MILLISEC, DEFAULT_TIMESTAMP_FORMAT,
};

/// Per-worker rate controller
pub use controller::{sleep_millis, ControllerState, ControllerStats, SpeedController};

/// Configuration errors
pub use error::{ConfigError, ConfigResult};

/// Record-to-bytes adapter
pub use meter::{Column, ColumnType, ColumnValue, RecordMeter, Schema};

/// Monitoring snapshots
pub use metrics::{AggregatorStats, ControllerMetrics};

/// Telemetry line rendering and delivery
pub use report::{parse_report_line, MemorySink, ReportSink, SpeedReport, TracingSink};

/// Clock and layout helpers
pub use utils::{current_time_ms, CACHE_LINE_SIZE};

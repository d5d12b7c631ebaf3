//! # Speedometer - Shared Byte-Rate Throttling for Worker Pools
//!
//! A small library that meters the data a pool of worker threads produces,
//! keeps the pool as a whole under one bytes-per-second budget, and prints a
//! progress line every few seconds.
//!
//! ## How It Works
//!
//! Every worker owns a [`SpeedController`]. All controllers of a run share one
//! [`SpeedAggregator`]:
//!
//! ```text
//!     speed_limit = 300 B/s, 3 workers active
//!
//!     worker A ─ 120 B/s ─► over its 100 B/s share ─► sleeps a little
//!     worker B ─  90 B/s ─► under                   ─► keeps going
//!     worker C ─  80 B/s ─► under                   ─► keeps going
//!
//!     worker C stops ──► shares become 150 B/s on the next call
//! ```
//!
//! - The fair share is `speed_limit / active workers`, recomputed on every call.
//! - A worker that runs ahead of its share sleeps on its own thread, which is
//!   the only backpressure there is. Each sleep is capped at `max_sleep_millisec`.
//! - Every `log_interval` one worker (whoever gets there first) sums up all
//!   counters, writes a line, and starts a new measurement period everywhere.
//!
//! ## Log Line
//!
//! ```text
//! {speedometer: {label: nightly, active: 4, total: 13.5mb, sec: 1:51, speed: 121kb/s, records: 269,748, record-speed: 2,435/s}}
//! ```
//!
//! The shape is stable; downstream tooling matches on it. See
//! [`parse_report_line`] for the reverse direction.
//!
//! ## Quick Start
//!
//! ```rust
//! use speedometer::{current_time_ms, ControllerConfig, SpeedAggregator, SpeedController};
//! use std::sync::Arc;
//! use std::thread;
//!
//! let aggregator = Arc::new(SpeedAggregator::new(Some("demo".to_string())));
//! let config = ControllerConfig::default().with_speed_limit(1_000_000);
//!
//! let handles: Vec<_> = (0..4)
//!     .map(|_| {
//!         let aggregator = aggregator.clone();
//!         thread::spawn(move || {
//!             let mut controller = SpeedController::new(config, aggregator);
//!             for _ in 0..100 {
//!                 controller.check_speed_limit(current_time_ms(), 10, true);
//!             }
//!             controller.stop();
//!         })
//!     })
//!     .collect();
//!
//! for handle in handles {
//!     handle.join().unwrap();
//! }
//! assert_eq!(aggregator.global_total_bytes(), 4_000);
//! ```
//!
//! ## Records
//!
//! [`RecordMeter`] turns typed records into byte counts the way a delimited
//! text file would store them, driven by a [`SpeedometerConfig`] that is
//! usually loaded from YAML.
//!
//! See `demos/basic.rs` for a runnable program with `tracing` output.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    rust_2018_idioms,
    unreachable_pub,
    missing_debug_implementations
)]
#![forbid(unsafe_op_in_unsafe_fn)]

// Internal module
mod speedometer;

// Public re-exports
pub use crate::speedometer::{
    current_time_ms, fair_share, format, parse_report_line, sleep_millis, AggregatorStats,
    Column, ColumnType, ColumnValue, ConfigError, ConfigResult, ControllerConfig,
    ControllerMetrics, ControllerState, ControllerStats, MemorySink, RecordMeter, ReportSink,
    Schema, SharedAggregator, SpeedAggregator, SpeedController, SpeedReport, SpeedometerConfig,
    TimestampColumnOption, TracingSink, CACHE_LINE_SIZE, DEFAULT_LOG_INTERVAL_SECONDS,
    DEFAULT_MAX_SLEEP_MILLISEC, DEFAULT_TIMESTAMP_FORMAT,
};

use std::sync::Arc;

/// Version information for the crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Minimum supported Rust version.
///
/// `std::sync::OnceLock` backs the process clock.
pub const MSRV: &str = "1.70.0";

/// Prelude module for convenient imports.
///
/// ```rust
/// use speedometer::prelude::*;
/// ```
pub mod prelude {
    //! Common imports for a metered worker pool.
    //!
    //! # Example
    //! ```rust
    //! use speedometer::prelude::*;
    //! use std::sync::Arc;
    //!
    //! let aggregator: SharedAggregator = Arc::new(SpeedAggregatorBuilder::new().build());
    //! let controller = SpeedController::new(ControllerConfig::default(), aggregator);
    //! assert_eq!(controller.state(), ControllerState::Unregistered);
    //! ```

    pub use crate::{
        current_time_ms, ColumnValue, ControllerConfig, ControllerState, RecordMeter, Schema,
        SharedAggregator, SpeedAggregator, SpeedAggregatorBuilder, SpeedController,
        SpeedometerConfig,
    };
}

/// Builder for [`SpeedAggregator`].
///
/// By default the aggregator has no label and logs through `tracing`.
///
/// # Example
///
/// ```rust
/// use speedometer::{MemorySink, SpeedAggregatorBuilder};
/// use std::sync::Arc;
///
/// let sink = Arc::new(MemorySink::new());
/// let aggregator = SpeedAggregatorBuilder::new()
///     .label("nightly")
///     .sink(Some(sink.clone()))
///     .build();
///
/// assert_eq!(aggregator.label(), Some("nightly"));
/// assert!(sink.lines()[0].starts_with("{speedometer: {label: nightly, active: 0"));
///
/// // An empty label is rejected by try_build().
/// assert!(SpeedAggregatorBuilder::new().label("").try_build().is_err());
/// ```
pub struct SpeedAggregatorBuilder {
    label: Option<String>,
    sink: Option<Arc<dyn ReportSink>>,
}

impl SpeedAggregatorBuilder {
    /// Creates a builder with no label and a [`TracingSink`].
    pub fn new() -> Self {
        Self {
            label: None,
            sink: Some(Arc::new(TracingSink)),
        }
    }

    /// Takes the label from a loaded configuration.
    pub fn from_config(config: &SpeedometerConfig) -> Self {
        Self {
            label: config.label.clone(),
            ..Self::new()
        }
    }

    /// Sets the label printed in every line.
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Replaces the sink. `None` drops every line.
    pub fn sink(mut self, sink: Option<Arc<dyn ReportSink>>) -> Self {
        self.sink = sink;
        self
    }

    /// Builds the aggregator. The initial all-zero line is emitted here.
    pub fn build(self) -> SpeedAggregator {
        SpeedAggregator::with_sink(self.label, self.sink)
    }

    /// Builds the aggregator wrapped for sharing with controllers.
    pub fn build_shared(self) -> SharedAggregator {
        Arc::new(self.build())
    }

    /// Builds the aggregator after checking the label.
    ///
    /// # Errors
    ///
    /// [`ConfigError::EmptyLabel`] if the label was set to `""`.
    pub fn try_build(self) -> ConfigResult<SpeedAggregator> {
        if matches!(self.label.as_deref(), Some("")) {
            return Err(ConfigError::EmptyLabel);
        }
        Ok(self.build())
    }
}

impl Default for SpeedAggregatorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SpeedAggregatorBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpeedAggregatorBuilder")
            .field("label", &self.label)
            .field("has_sink", &self.sink.is_some())
            .finish()
    }
}

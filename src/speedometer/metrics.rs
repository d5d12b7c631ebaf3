//! # Snapshots for Monitoring
//!
//! Point-in-time views of a single controller and of the aggregator. Neither
//! snapshot is part of the log-line contract; they exist for embedders that
//! want to look at throttling behaviour directly.
//!
//! ```text
//!     SpeedController::metrics() ──► ControllerMetrics
//!     │  ├─ bytes / records (lifetime and current period)
//!     │  └─ sleeps taken and time spent sleeping
//!     │
//!     SpeedAggregator::stats()   ──► AggregatorStats
//!        ├─ active controllers / registry size
//!        └─ global start time and folded-in totals
//! ```

use super::controller::ControllerState;
use super::format::{to_byte_text, to_decimal_text};
use std::fmt;

/// Snapshot of one controller.
///
/// ## Example
///
/// ```rust
/// use speedometer::{ControllerConfig, SpeedAggregator, SpeedController};
/// use std::sync::Arc;
///
/// let aggregator = Arc::new(SpeedAggregator::new(None));
/// let mut controller = SpeedController::new(ControllerConfig::default(), aggregator);
/// controller.check_speed_limit(1_000, 128, true);
///
/// let metrics = controller.metrics();
/// assert_eq!(metrics.total_bytes, 128);
/// assert!(!metrics.is_throttled());
/// println!("{}", metrics.summary());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerMetrics {
    /// Registry key of the controller.
    pub controller_id: u64,

    /// Lifecycle state at snapshot time.
    pub state: ControllerState,

    /// Bytes metered over the controller's lifetime.
    pub total_bytes: u64,

    /// Records completed over the controller's lifetime.
    pub total_records: u64,

    /// Bytes metered in the current period.
    pub period_bytes: u64,

    /// Records completed in the current period.
    pub period_records: u64,

    /// Number of throttling sleeps taken.
    pub sleep_count: u64,

    /// Milliseconds spent in throttling sleeps.
    pub total_sleep_ms: u64,

    /// Length of the sleep computed on the most recent call (0 = none).
    pub last_sleep_ms: u64,
}

impl ControllerMetrics {
    /// Returns `true` if the controller has ever slept.
    #[inline]
    pub fn is_throttled(&self) -> bool {
        self.sleep_count > 0
    }

    /// Mean length of a throttling sleep in milliseconds.
    #[inline]
    pub fn average_sleep_ms(&self) -> f64 {
        if self.sleep_count == 0 {
            0.0
        } else {
            self.total_sleep_ms as f64 / self.sleep_count as f64
        }
    }

    /// Mean record size in bytes, or 0 before the first record completes.
    #[inline]
    pub fn average_record_bytes(&self) -> u64 {
        if self.total_records == 0 {
            0
        } else {
            self.total_bytes / self.total_records
        }
    }

    /// Human-readable multi-line summary.
    ///
    /// # Example Output
    ///
    /// ```text
    /// SpeedController #3 (Active):
    /// ├─ Volume:
    /// │  ├─ Total: 1.2mb in 4,096 records
    /// │  └─ Current Period: 12.0kb in 40 records
    /// └─ Throttling:
    ///    ├─ Sleeps: 12
    ///    ├─ Time Slept: 840ms (avg 70.0ms)
    ///    └─ Last Sleep: 70ms
    /// ```
    pub fn summary(&self) -> String {
        format!(
            "SpeedController #{} ({:?}):\n\
             ├─ Volume:\n\
             │  ├─ Total: {} in {} records\n\
             │  └─ Current Period: {} in {} records\n\
             └─ Throttling:\n\
                ├─ Sleeps: {}\n\
                ├─ Time Slept: {}ms (avg {:.1}ms)\n\
                └─ Last Sleep: {}ms",
            self.controller_id,
            self.state,
            to_byte_text(self.total_bytes),
            to_decimal_text(self.total_records),
            to_byte_text(self.period_bytes),
            to_decimal_text(self.period_records),
            to_decimal_text(self.sleep_count),
            self.total_sleep_ms,
            self.average_sleep_ms(),
            self.last_sleep_ms,
        )
    }
}

impl fmt::Display for ControllerMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.summary())
    }
}

/// Snapshot of the aggregator.
///
/// `global_total_*` only include controllers that have stopped; live
/// controllers are summed separately at report time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregatorStats {
    /// Controllers counted towards the fair share.
    pub active_controllers: usize,

    /// Entries in the registry. Equals `active_controllers` once every
    /// in-flight start/stop has finished.
    pub registered_controllers: usize,

    /// Start time of the first controller in milliseconds (0 = none yet).
    pub global_start_ms: u64,

    /// Bytes folded in from stopped controllers.
    pub global_total_bytes: u64,

    /// Records folded in from stopped controllers.
    pub global_total_records: u64,

    /// Time of the last progress report in milliseconds (0 = none yet).
    pub previous_report_ms: u64,
}

impl AggregatorStats {
    /// Returns `true` if no controller is currently active.
    #[inline]
    pub fn is_idle(&self) -> bool {
        self.active_controllers == 0
    }

    /// Returns a human-readable summary of the statistics.
    pub fn summary(&self) -> String {
        format!(
            "SpeedAggregator Stats:\n\
             ├─ Controllers:\n\
             │  ├─ Active: {}\n\
             │  └─ Registered: {}\n\
             └─ Stopped Totals:\n\
                ├─ Bytes: {}\n\
                ├─ Records: {}\n\
                └─ Started At: {}ms",
            self.active_controllers,
            self.registered_controllers,
            to_byte_text(self.global_total_bytes),
            to_decimal_text(self.global_total_records),
            self.global_start_ms,
        )
    }
}

impl fmt::Display for AggregatorStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.summary())
    }
}

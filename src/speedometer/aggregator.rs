//! # Global Aggregator
//!
//! Shared state every controller of a run reports to. It has no thread of
//! its own: all work happens on whichever worker calls into it.
//!
//! ## Architecture
//!
//! ```text
//!     worker 1 ── SpeedController ──┐
//!     worker 2 ── SpeedController ──┼──► SpeedAggregator
//!     worker N ── SpeedController ──┘         │
//!                                             ▼
//!                                  ┌──────────────────────┐
//!                                  │ DashMap              │
//!                                  │  id → ControllerStats│
//!                                  ├──────────────────────┤
//!                                  │ active count         │ ─► fair share = limit / active
//!                                  │ global start (CAS)   │
//!                                  │ previous report (CAS)│ ─► one reporter per interval
//!                                  │ stopped totals       │
//!                                  └──────────────────────┘
//! ```
//!
//! ## Report cycle
//!
//! ```text
//!     check_progress(now, interval)
//!       │
//!       ├─ interval == 0 ─────────────► return
//!       ├─ first call ── CAS(0, now) ─► return (no line)
//!       ├─ now < previous + interval ─► return
//!       └─ CAS(previous, now)
//!            ├─ lost ─────────────────► return
//!            └─ won: sum live + stopped totals, emit line,
//!                    renew_period() on every live controller
//! ```
//!
//! The live count and the registry are updated by separate operations, so a
//! snapshot may briefly disagree with the count. Reports tolerate that; the
//! count is only used for the fair share and the `active` field.

use super::{
    config::SpeedometerConfig,
    controller::ControllerStats,
    metrics::AggregatorStats,
    report::{ReportSink, SpeedReport, TracingSink},
    utils::{current_time_ms, per_second},
};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Registry pre-size; runs rarely have more workers than this.
const INITIAL_REGISTRY_CAPACITY: usize = 64;

/// Aggregator shared by every controller of a run.
pub type SharedAggregator = Arc<SpeedAggregator>;

/// Fair share of `speed_limit` for one of `active_controllers` peers.
///
/// An empty run is treated as a single controller, so the share is never a
/// division by zero.
///
/// ```rust
/// use speedometer::fair_share;
///
/// assert_eq!(fair_share(100, 2), 50);
/// assert_eq!(fair_share(100, 0), 100);
/// assert_eq!(fair_share(10, 3), 3);
/// ```
#[inline]
pub fn fair_share(speed_limit: u64, active_controllers: usize) -> u64 {
    speed_limit / (active_controllers.max(1) as u64)
}

/// Global aggregator for a group of [`SpeedController`](crate::SpeedController)s.
///
/// Tracks which controllers are live, divides the speed limit among them,
/// emits periodic throughput lines, and keeps the totals of controllers
/// that already stopped.
///
/// # Example
///
/// ```rust
/// use speedometer::{ControllerConfig, MemorySink, SpeedAggregator, SpeedController};
/// use std::sync::Arc;
///
/// let sink = Arc::new(MemorySink::new());
/// let aggregator = Arc::new(SpeedAggregator::with_sink(
///     Some("import".to_string()),
///     Some(sink.clone()),
/// ));
///
/// let mut controller = SpeedController::new(ControllerConfig::default(), aggregator.clone());
/// controller.check_speed_limit(1_000, 10, true);
/// assert_eq!(aggregator.active_controller_count(), 1);
///
/// controller.stop();
/// assert_eq!(aggregator.global_total_bytes(), 10);
///
/// // Initial line at construction, overall summary when the last one stopped.
/// assert_eq!(sink.len(), 2);
/// assert!(sink.lines()[1].starts_with("{speedometer: {label: import, active: 0, total: 10.0b"));
/// ```
pub struct SpeedAggregator {
    /// Live controllers keyed by id.
    controllers: DashMap<u64, Arc<ControllerStats>, ahash::RandomState>,

    /// Controllers counted towards the fair share.
    active_count: AtomicUsize,

    /// Id source for new controllers.
    next_id: AtomicU64,

    /// Start time of the first registered controller (0 = unset).
    global_start_time: AtomicU64,

    /// Time of the last progress report (0 = never checked).
    previous_report_time: AtomicU64,

    /// Bytes of controllers that have stopped.
    global_total_bytes: AtomicU64,

    /// Records of controllers that have stopped.
    global_total_records: AtomicU64,

    label: Option<String>,
    sink: Option<Arc<dyn ReportSink>>,
}

impl SpeedAggregator {
    /// Creates an aggregator that logs through `tracing`.
    pub fn new(label: Option<String>) -> Self {
        Self::with_sink(label, Some(Arc::new(TracingSink)))
    }

    /// Creates an aggregator that hands its lines to `sink`.
    ///
    /// With `None` every line is dropped; throttling is unaffected.
    pub fn with_sink(label: Option<String>, sink: Option<Arc<dyn ReportSink>>) -> Self {
        let num_shards = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(8)
            .next_power_of_two()
            .clamp(2, 64);

        let aggregator = Self {
            controllers: DashMap::with_capacity_and_hasher_and_shard_amount(
                INITIAL_REGISTRY_CAPACITY,
                ahash::RandomState::new(),
                num_shards,
            ),
            active_count: AtomicUsize::new(0),
            next_id: AtomicU64::new(0),
            global_start_time: AtomicU64::new(0),
            previous_report_time: AtomicU64::new(0),
            global_total_bytes: AtomicU64::new(0),
            global_total_records: AtomicU64::new(0),
            label,
            sink,
        };

        // Announce the run, including its label, before any data flows.
        aggregator.emit(&aggregator.report(0, 0, 0, 0, 0, 0));
        aggregator
    }

    /// Creates a tracing-backed aggregator labelled from `config`.
    pub fn from_config(config: &SpeedometerConfig) -> Self {
        Self::new(config.label.clone())
    }

    /// Hands out a fresh controller id.
    pub(crate) fn next_controller_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Registers a controller that just metered its first unit at `now_ms`.
    ///
    /// The first registrant of the run fixes the global start time.
    pub fn start_controller(&self, controller: &Arc<ControllerStats>, now_ms: u64) {
        let _ = self.global_start_time.compare_exchange(
            0,
            now_ms,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if self
            .controllers
            .insert(controller.id(), Arc::clone(controller))
            .is_some()
        {
            debug!(controller = controller.id(), "controller already started");
            return;
        }
        let active = self.active_count.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(controller = controller.id(), active, "controller started");
    }

    /// Deregisters a controller and folds its final totals into the
    /// global totals.
    ///
    /// When the live count drops to zero the overall summary is emitted.
    /// Overlapping waves of controllers can bring the count to zero more
    /// than once per run, and each time produces a summary.
    pub fn stop_controller(&self, controller: &Arc<ControllerStats>) {
        if self.controllers.remove(&controller.id()).is_none() {
            debug!(controller = controller.id(), "stop for unknown controller ignored");
            return;
        }
        let previous = self.active_count.fetch_sub(1, Ordering::AcqRel);

        self.global_total_bytes
            .fetch_add(controller.total_bytes(), Ordering::AcqRel);
        self.global_total_records
            .fetch_add(controller.total_records(), Ordering::AcqRel);

        if previous == 1 {
            self.emit_overall_summary(current_time_ms());
        }
    }

    /// Fair share of the speed limit for `controller` right now.
    ///
    /// Recomputed on every call, so the share grows as peers stop and
    /// shrinks as new peers start.
    #[inline]
    pub fn speed_limit_for(&self, controller: &ControllerStats) -> u64 {
        fair_share(controller.speed_limit(), self.active_controller_count())
    }

    /// Emits a progress line if `log_interval_millisec` has passed since
    /// the previous one.
    ///
    /// Safe to call from every worker on every metered unit: at most one
    /// caller per interval wins the compare-and-swap and does the work.
    pub fn check_progress(&self, now_ms: u64, log_interval_millisec: u64) {
        if log_interval_millisec == 0 {
            return;
        }

        let previous = self.previous_report_time.load(Ordering::Acquire);
        if previous == 0 {
            let _ = self.previous_report_time.compare_exchange(
                0,
                now_ms,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
            return;
        }

        if now_ms < previous.saturating_add(log_interval_millisec) {
            return;
        }

        if self
            .previous_report_time
            .compare_exchange(previous, now_ms, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        self.report_progress(now_ms);
    }

    /// Live controllers at this instant.
    pub fn snapshot(&self) -> Vec<Arc<ControllerStats>> {
        self.controllers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Controllers counted towards the fair share.
    #[inline]
    pub fn active_controller_count(&self) -> usize {
        self.active_count.load(Ordering::Acquire)
    }

    /// Start time of the first controller, or 0 if none registered yet.
    #[inline]
    pub fn global_start_time(&self) -> u64 {
        self.global_start_time.load(Ordering::Acquire)
    }

    /// Bytes folded in from stopped controllers.
    #[inline]
    pub fn global_total_bytes(&self) -> u64 {
        self.global_total_bytes.load(Ordering::Acquire)
    }

    /// Records folded in from stopped controllers.
    #[inline]
    pub fn global_total_records(&self) -> u64 {
        self.global_total_records.load(Ordering::Acquire)
    }

    /// Label printed in every line, if any.
    #[inline]
    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    /// Returns aggregator statistics.
    pub fn stats(&self) -> AggregatorStats {
        AggregatorStats {
            active_controllers: self.active_controller_count(),
            registered_controllers: self.controllers.len(),
            global_start_ms: self.global_start_time(),
            global_total_bytes: self.global_total_bytes(),
            global_total_records: self.global_total_records(),
            previous_report_ms: self.previous_report_time.load(Ordering::Acquire),
        }
    }

    fn report_progress(&self, now_ms: u64) {
        self.report_progress_with(now_ms, || {});
    }

    /// Stopped totals are read before the registry snapshot. A controller
    /// that stops in between is then missing from both, never in both.
    fn report_progress_with<F: FnOnce()>(&self, now_ms: u64, after_totals: F) {
        let mut total_bytes = self.global_total_bytes();
        let mut total_records = self.global_total_records();
        after_totals();
        let live = self.snapshot();

        let mut bytes_per_sec = 0u64;
        let mut records_per_sec = 0u64;
        for controller in &live {
            total_bytes = total_bytes.saturating_add(controller.total_bytes());
            total_records = total_records.saturating_add(controller.total_records());
            bytes_per_sec = bytes_per_sec.saturating_add(controller.period_bytes_per_sec(now_ms));
            records_per_sec =
                records_per_sec.saturating_add(controller.period_records_per_sec(now_ms));
        }

        let elapsed_ms = now_ms.saturating_sub(self.global_start_time());
        self.emit(&self.report(
            self.active_controller_count(),
            total_bytes,
            elapsed_ms,
            bytes_per_sec,
            total_records,
            records_per_sec,
        ));

        for controller in &live {
            controller.renew_period();
        }
    }

    fn emit_overall_summary(&self, now_ms: u64) {
        let total_bytes = self.global_total_bytes();
        let total_records = self.global_total_records();
        let start = self.global_start_time();
        let elapsed_ms = now_ms.saturating_sub(start);

        self.emit(&self.report(
            self.active_controller_count(),
            total_bytes,
            elapsed_ms,
            per_second(total_bytes, elapsed_ms),
            total_records,
            per_second(total_records, elapsed_ms),
        ));
    }

    fn report(
        &self,
        active: usize,
        total_bytes: u64,
        elapsed_ms: u64,
        bytes_per_sec: u64,
        total_records: u64,
        records_per_sec: u64,
    ) -> SpeedReport {
        SpeedReport {
            label: self.label.clone(),
            active,
            total_bytes,
            elapsed_ms,
            bytes_per_sec,
            total_records,
            records_per_sec,
        }
    }

    fn emit(&self, report: &SpeedReport) {
        if let Some(sink) = &self.sink {
            sink.emit(&report.to_string());
        }
    }
}

impl std::fmt::Debug for SpeedAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpeedAggregator")
            .field("label", &self.label)
            .field("active_controllers", &self.active_controller_count())
            .field("registered_controllers", &self.controllers.len())
            .field("global_start_time", &self.global_start_time())
            .field("global_total_bytes", &self.global_total_bytes())
            .field("has_sink", &self.sink.is_some())
            .finish()
    }
}

//! # Speed Controller
//!
//! One controller per worker. It meters every unit of data the worker
//! produces, and when the worker (together with all its peers) runs faster
//! than the shared limit, it puts the worker to sleep just long enough to
//! bring its share back in line.
//!
//! ## Periods
//!
//! ```text
//!     period 1            period 2            period 3
//!     ├───────────────────┼───────────────────┼──────────►
//!     bytes: 4kb          bytes: 3kb          bytes: ...
//!                         ▲                   ▲
//!                         └── renew flag set by the aggregator after a
//!                             report; the worker rolls over on its next call
//!
//!     total_bytes = thread_total_bytes (closed periods) + period_bytes
//! ```
//!
//! Throughput is always measured over the current period only, so a worker
//! that was idle for an hour does not earn an hour of burst credit.
//!
//! ## Ownership
//!
//! ```text
//!     worker thread ──owns──► SpeedController ──Arc──► ControllerStats ◄──Arc── aggregator registry
//!                                   │                        ▲
//!                                   └── writes counters ─────┘   reads counters, sets renew flag
//! ```
//!
//! Period counters are written only by the owning worker. The renew flag is
//! the single field another thread ever writes.

use super::{
    aggregator::SharedAggregator,
    config::ControllerConfig,
    metrics::ControllerMetrics,
    utils::{elapsed_floor_ms, per_second, CacheAligned},
};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Lifecycle of a controller as the aggregator sees it.
///
/// ```text
///     Unregistered ──first check_speed_limit──► Active ──stop()──► Removed
/// ```
///
/// A removed controller never becomes active again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    /// Constructed but never metered; not counted by the aggregator.
    Unregistered,
    /// Registered and counted towards the fair share.
    Active,
    /// Stopped; its totals were folded into the global totals.
    Removed,
}

/// Counters of one controller, shared with the aggregator.
///
/// The owning [`SpeedController`] is the only writer of the period and
/// total counters. The aggregator reads them to build reports and calls
/// [`renew_period`](Self::renew_period) to request a rollover.
#[derive(Debug)]
pub struct ControllerStats {
    /// Registry key, unique per aggregator.
    id: u64,

    /// Configured global limit; the fair share is derived from it.
    speed_limit: u64,

    /// Bytes in the current period (hot: written on every metered unit).
    period_bytes: CacheAligned<AtomicU64>,

    /// Set by the reporting thread, cleared by the owner on rollover.
    renew_requested: CacheAligned<AtomicBool>,

    /// Start of the current period, in milliseconds.
    period_start_ms: AtomicU64,

    /// Records completed in the current period.
    period_records: AtomicU64,

    /// Bytes carried over from closed periods.
    thread_total_bytes: AtomicU64,

    /// Records carried over from closed periods.
    thread_total_records: AtomicU64,
}

impl ControllerStats {
    pub(crate) fn new(id: u64, speed_limit: u64) -> Self {
        Self {
            id,
            speed_limit,
            period_bytes: CacheAligned::new(AtomicU64::new(0)),
            renew_requested: CacheAligned::new(AtomicBool::new(false)),
            period_start_ms: AtomicU64::new(0),
            period_records: AtomicU64::new(0),
            thread_total_bytes: AtomicU64::new(0),
            thread_total_records: AtomicU64::new(0),
        }
    }

    /// Registry key of this controller.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The configured global speed limit (bytes/sec, 0 = disabled).
    #[inline]
    pub fn speed_limit(&self) -> u64 {
        self.speed_limit
    }

    /// Bytes metered over the controller's whole lifetime.
    #[inline]
    pub fn total_bytes(&self) -> u64 {
        self.thread_total_bytes
            .load(Ordering::Acquire)
            .saturating_add(self.period_bytes.get().load(Ordering::Acquire))
    }

    /// Records completed over the controller's whole lifetime.
    #[inline]
    pub fn total_records(&self) -> u64 {
        self.thread_total_records
            .load(Ordering::Acquire)
            .saturating_add(self.period_records.load(Ordering::Acquire))
    }

    /// Bytes metered in the current period.
    #[inline]
    pub fn period_bytes(&self) -> u64 {
        self.period_bytes.get().load(Ordering::Acquire)
    }

    /// Records completed in the current period.
    #[inline]
    pub fn period_records(&self) -> u64 {
        self.period_records.load(Ordering::Acquire)
    }

    /// Start of the current period in milliseconds (0 before first use).
    #[inline]
    pub fn period_start_ms(&self) -> u64 {
        self.period_start_ms.load(Ordering::Acquire)
    }

    /// Current-period byte rate at `now_ms`. Elapsed time is floored to 1ms.
    pub fn period_bytes_per_sec(&self, now_ms: u64) -> u64 {
        per_second(
            self.period_bytes(),
            elapsed_floor_ms(now_ms, self.period_start_ms()),
        )
    }

    /// Current-period record rate at `now_ms`. Elapsed time is floored to 1ms.
    pub fn period_records_per_sec(&self, now_ms: u64) -> u64 {
        per_second(
            self.period_records(),
            elapsed_floor_ms(now_ms, self.period_start_ms()),
        )
    }

    /// Requests a period rollover. Callable from any thread.
    ///
    /// The rollover itself happens on the owner's next
    /// [`check_speed_limit`](SpeedController::check_speed_limit) call.
    #[inline]
    pub fn renew_period(&self) {
        self.renew_requested.get().store(true, Ordering::Release);
    }

    /// Returns `true` if a rollover was requested and not yet performed.
    #[inline]
    pub fn is_renew_requested(&self) -> bool {
        self.renew_requested.get().load(Ordering::Acquire)
    }

    // --- owner-only writers -------------------------------------------------

    /// Clears the renew flag, returning whether it was set.
    #[inline]
    pub(crate) fn take_renew_request(&self) -> bool {
        self.renew_requested.get().swap(false, Ordering::AcqRel)
    }

    /// Moves the period counters into the carried-over totals and starts a
    /// new period at `new_period_start_ms`.
    pub(crate) fn roll_over(&self, new_period_start_ms: u64) {
        let bytes = self.period_bytes.get().load(Ordering::Acquire);
        let records = self.period_records.load(Ordering::Acquire);

        // Zero the period before carrying it over: a concurrent reader may
        // briefly under-count, but never sees the period twice.
        self.period_bytes.get().store(0, Ordering::Release);
        self.period_records.store(0, Ordering::Release);
        self.thread_total_bytes.fetch_add(bytes, Ordering::AcqRel);
        self.thread_total_records.fetch_add(records, Ordering::AcqRel);
        self.period_start_ms
            .store(new_period_start_ms, Ordering::Release);
    }

    #[inline]
    pub(crate) fn begin_period(&self, now_ms: u64) {
        self.period_start_ms.store(now_ms, Ordering::Release);
    }

    #[inline]
    pub(crate) fn add(&self, data_size: u64, end_of_record: bool) {
        let bytes = self.period_bytes.get().load(Ordering::Relaxed);
        self.period_bytes
            .get()
            .store(bytes.saturating_add(data_size), Ordering::Release);
        if end_of_record {
            self.period_records.fetch_add(1, Ordering::AcqRel);
        }
    }
}

/// Milliseconds a worker must sleep to bring its period average back to
/// `fair_share`, clipped to `[0, max_sleep_ms]`.
///
/// Returns 0 while the period rate is at or below the share.
///
/// ```rust
/// use speedometer::sleep_millis;
///
/// // 100 bytes in 1 ms against a 1000 B/s share: 99 ms behind, capped at 20.
/// assert_eq!(sleep_millis(100, 1, 1000, 20), 20);
/// // Exactly on budget: no sleep.
/// assert_eq!(sleep_millis(1000, 1000, 1000, 20), 0);
/// ```
pub fn sleep_millis(period_bytes: u64, elapsed_ms: u64, fair_share: u64, max_sleep_ms: u32) -> u64 {
    let elapsed_ms = elapsed_ms.max(1);
    if per_second(period_bytes, elapsed_ms) <= fair_share {
        return 0;
    }
    // Time the period's bytes should have taken at the fair share.
    let target_ms = per_second(period_bytes, 1) / fair_share.max(1);
    target_ms
        .saturating_sub(elapsed_ms)
        .min(u64::from(max_sleep_ms))
}

/// Per-worker rate controller.
///
/// Owned by exactly one worker thread; all methods that mutate counters take
/// `&mut self`. The aggregator it registers with is passed in explicitly, so
/// every controller of a run shares the same [`SharedAggregator`].
///
/// # Example
///
/// ```rust
/// use speedometer::{ControllerConfig, SpeedAggregator, SpeedController, current_time_ms};
/// use std::sync::Arc;
///
/// let aggregator = Arc::new(SpeedAggregator::new(None));
/// let mut controller = SpeedController::new(ControllerConfig::default(), aggregator.clone());
///
/// for _ in 0..10 {
///     controller.check_speed_limit(current_time_ms(), 5, false);
/// }
/// controller.check_speed_limit(current_time_ms(), 1, true);
///
/// assert_eq!(controller.total_bytes(), 51);
/// assert_eq!(controller.total_records(), 1);
///
/// controller.stop();
/// assert_eq!(aggregator.global_total_bytes(), 51);
/// ```
pub struct SpeedController {
    stats: std::sync::Arc<ControllerStats>,
    aggregator: SharedAggregator,
    config: ControllerConfig,
    state: ControllerState,

    /// First timestamp this controller observed.
    start_time_ms: Option<u64>,

    // Owner-only throttling bookkeeping.
    sleep_count: u64,
    total_sleep_ms: u64,
    last_sleep_ms: u64,

    warned_after_stop: bool,
}

impl SpeedController {
    /// Creates a controller bound to `aggregator`.
    ///
    /// The controller is not counted by the aggregator until its first
    /// [`check_speed_limit`](Self::check_speed_limit) call, so controllers can
    /// be created ahead of time without shrinking everyone's fair share.
    pub fn new(config: ControllerConfig, aggregator: SharedAggregator) -> Self {
        let id = aggregator.next_controller_id();
        Self {
            stats: std::sync::Arc::new(ControllerStats::new(id, config.speed_limit)),
            aggregator,
            config,
            state: ControllerState::Unregistered,
            start_time_ms: None,
            sleep_count: 0,
            total_sleep_ms: 0,
            last_sleep_ms: 0,
            warned_after_stop: false,
        }
    }

    /// Marks the start of the first period without registering.
    ///
    /// Optional: the first [`check_speed_limit`](Self::check_speed_limit)
    /// starts the period if this was never called.
    pub fn start(&mut self, now_ms: u64) {
        if self.state == ControllerState::Unregistered && self.stats.period_start_ms() == 0 {
            self.stats.begin_period(now_ms);
        }
    }

    /// Meters one unit of data and throttles the calling thread if needed.
    ///
    /// Call once per meterable unit (a column value, a delimiter, a record's
    /// padding) with `end_of_record` set on the last unit of a record.
    ///
    /// ## Flow
    ///
    /// ```text
    ///     first call? ──► register with aggregator (fixes global start time)
    ///          │
    ///     renew flag? ──► roll period over at now_ms
    ///          │
    ///     add bytes / record
    ///          │
    ///     aggregator.check_progress ──► maybe report + renew everyone
    ///          │
    ///     limit > 0 and period rate > fair share? ──► sleep (≤ max_sleep)
    /// ```
    ///
    /// The sleep blocks the worker itself: this is the backpressure.
    pub fn check_speed_limit(&mut self, now_ms: u64, data_size: u64, end_of_record: bool) {
        match self.state {
            ControllerState::Unregistered => self.register(now_ms),
            ControllerState::Active => {}
            ControllerState::Removed => {
                if self.warned_after_stop {
                    trace!(controller = self.stats.id(), data_size, "metering after stop");
                } else {
                    warn!(
                        controller = self.stats.id(),
                        "metering after stop; bytes are not reported to the aggregator"
                    );
                    self.warned_after_stop = true;
                }
                self.stats.add(data_size, end_of_record);
                return;
            }
        }

        if self.stats.take_renew_request() {
            self.stats.roll_over(now_ms);
        }

        self.stats.add(data_size, end_of_record);
        self.aggregator
            .check_progress(now_ms, self.config.log_interval_millisec);

        if !self.config.is_throttling() {
            return;
        }

        let fair_share = self.aggregator.speed_limit_for(&self.stats);
        let elapsed_ms = elapsed_floor_ms(now_ms, self.stats.period_start_ms());
        let sleep_ms = sleep_millis(
            self.stats.period_bytes(),
            elapsed_ms,
            fair_share,
            self.config.max_sleep_millisec,
        );
        if sleep_ms > 0 {
            trace!(
                controller = self.stats.id(),
                fair_share,
                sleep_ms,
                "throttling"
            );
            thread::sleep(Duration::from_millis(sleep_ms));
            self.sleep_count += 1;
            self.total_sleep_ms = self.total_sleep_ms.saturating_add(sleep_ms);
        }
        self.last_sleep_ms = sleep_ms;
    }

    /// Closes the last period and deregisters from the aggregator.
    ///
    /// The aggregator folds this controller's totals into its global totals
    /// and, if no controller remains active, emits the overall summary.
    /// Calling `stop` again, or on a controller that never metered anything,
    /// does nothing.
    pub fn stop(&mut self) {
        match self.state {
            ControllerState::Active => {
                self.stats.roll_over(0);
                self.state = ControllerState::Removed;
                self.aggregator.stop_controller(&self.stats);
                debug!(
                    controller = self.stats.id(),
                    total_bytes = self.stats.total_bytes(),
                    total_records = self.stats.total_records(),
                    "controller stopped"
                );
            }
            ControllerState::Unregistered => {
                self.stats.roll_over(0);
                self.state = ControllerState::Removed;
            }
            ControllerState::Removed => {}
        }
    }

    /// Requests a period rollover on the next metered unit.
    #[inline]
    pub fn renew_period(&self) {
        self.stats.renew_period();
    }

    /// Returns `true` if a rollover is pending.
    #[inline]
    pub fn is_renew_period_set(&self) -> bool {
        self.stats.is_renew_requested()
    }

    /// Bytes metered so far, across all periods.
    #[inline]
    pub fn total_bytes(&self) -> u64 {
        self.stats.total_bytes()
    }

    /// Records completed so far, across all periods.
    #[inline]
    pub fn total_records(&self) -> u64 {
        self.stats.total_records()
    }

    /// Current-period byte rate at `now_ms`.
    #[inline]
    pub fn period_bytes_per_sec(&self, now_ms: u64) -> u64 {
        self.stats.period_bytes_per_sec(now_ms)
    }

    /// Current-period record rate at `now_ms`.
    #[inline]
    pub fn period_records_per_sec(&self, now_ms: u64) -> u64 {
        self.stats.period_records_per_sec(now_ms)
    }

    /// Configured global speed limit.
    #[inline]
    pub fn speed_limit(&self) -> u64 {
        self.config.speed_limit
    }

    /// Upper bound of a single throttling sleep.
    #[inline]
    pub fn max_sleep_millisec(&self) -> u32 {
        self.config.max_sleep_millisec
    }

    /// Progress report interval handed to the aggregator.
    #[inline]
    pub fn log_interval_millisec(&self) -> u64 {
        self.config.log_interval_millisec
    }

    /// Where this controller is in its lifecycle.
    #[inline]
    pub fn state(&self) -> ControllerState {
        self.state
    }

    /// First timestamp this controller metered at, if any.
    #[inline]
    pub fn start_time_ms(&self) -> Option<u64> {
        self.start_time_ms
    }

    /// The aggregator this controller reports to.
    #[inline]
    pub fn aggregator(&self) -> &SharedAggregator {
        &self.aggregator
    }

    /// The counters shared with the aggregator.
    #[inline]
    pub fn stats(&self) -> &std::sync::Arc<ControllerStats> {
        &self.stats
    }

    /// Snapshot of counters and throttling history.
    pub fn metrics(&self) -> ControllerMetrics {
        ControllerMetrics {
            controller_id: self.stats.id(),
            state: self.state,
            total_bytes: self.stats.total_bytes(),
            total_records: self.stats.total_records(),
            period_bytes: self.stats.period_bytes(),
            period_records: self.stats.period_records(),
            sleep_count: self.sleep_count,
            total_sleep_ms: self.total_sleep_ms,
            last_sleep_ms: self.last_sleep_ms,
        }
    }

    fn register(&mut self, now_ms: u64) {
        self.start_time_ms = Some(now_ms);
        if self.stats.period_start_ms() == 0 {
            self.stats.begin_period(now_ms);
        }
        self.aggregator.start_controller(&self.stats, now_ms);
        self.state = ControllerState::Active;
        debug!(controller = self.stats.id(), now_ms, "controller registered");
    }
}

impl Drop for SpeedController {
    fn drop(&mut self) {
        if self.state == ControllerState::Active {
            self.stop();
        }
    }
}

impl std::fmt::Debug for SpeedController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpeedController")
            .field("id", &self.stats.id())
            .field("state", &self.state)
            .field("speed_limit", &self.config.speed_limit)
            .field("max_sleep_millisec", &self.config.max_sleep_millisec)
            .field("total_bytes", &self.stats.total_bytes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::speedometer::aggregator::SpeedAggregator;
    use crate::speedometer::report::MemorySink;
    use std::sync::Arc;

    fn quiet_aggregator() -> SharedAggregator {
        Arc::new(SpeedAggregator::with_sink(None, None))
    }

    fn config(speed_limit: u64, max_sleep: u32, interval_ms: u64) -> ControllerConfig {
        ControllerConfig::new(speed_limit, max_sleep, interval_ms)
    }

    #[test]
    fn test_construction() {
        let aggregator = quiet_aggregator();
        let controller = SpeedController::new(config(1, 2, 3000), aggregator.clone());

        assert!(Arc::ptr_eq(controller.aggregator(), &aggregator));
        assert_eq!(controller.speed_limit(), 1);
        assert_eq!(controller.max_sleep_millisec(), 2);
        assert_eq!(controller.log_interval_millisec(), 3000);
        assert_eq!(controller.state(), ControllerState::Unregistered);
        assert_eq!(aggregator.active_controller_count(), 0);
    }

    #[test]
    fn test_lazy_registration() {
        let aggregator = quiet_aggregator();
        let mut controller = SpeedController::new(config(0, 0, 0), aggregator.clone());
        assert_eq!(aggregator.active_controller_count(), 0);

        controller.check_speed_limit(5_000, 3, false);
        assert_eq!(controller.state(), ControllerState::Active);
        assert_eq!(controller.start_time_ms(), Some(5_000));
        assert_eq!(aggregator.active_controller_count(), 1);
        assert_eq!(aggregator.global_start_time(), 5_000);

        controller.check_speed_limit(6_000, 3, false);
        assert_eq!(aggregator.active_controller_count(), 1);
        assert_eq!(controller.start_time_ms(), Some(5_000));
    }

    #[test]
    fn test_total_bytes() {
        let mut controller = SpeedController::new(config(1, 2, 3000), quiet_aggregator());
        let now = 10_000;

        controller.check_speed_limit(now, 3, false);
        assert_eq!(controller.total_bytes(), 3);
        controller.check_speed_limit(now + 1, 3, false);
        assert_eq!(controller.total_bytes(), 6);
    }

    #[test]
    fn test_total_records() {
        let mut controller = SpeedController::new(config(0, 2, 3000), quiet_aggregator());
        let now = 10_000;

        assert_eq!(controller.total_records(), 0);
        controller.check_speed_limit(now, 3, false);
        assert_eq!(controller.total_records(), 0);
        controller.check_speed_limit(now + 1, 3, true);
        assert_eq!(controller.total_records(), 1);
    }

    #[test]
    fn test_period_rates() {
        let mut controller = SpeedController::new(config(0, 2, 0), quiet_aggregator());
        let now = 10_000;

        assert_eq!(controller.period_records_per_sec(now), 0);
        controller.check_speed_limit(now, 3, false);
        assert_eq!(controller.period_records_per_sec(now + 500), 0);
        assert_eq!(controller.period_bytes_per_sec(now + 500), 6);

        controller.check_speed_limit(now, 3, true);
        assert_eq!(controller.period_records_per_sec(now + 500), 2);
        // Same millisecond is treated as 1ms.
        assert_eq!(controller.period_bytes_per_sec(now), 6_000);
    }

    #[test]
    fn test_unlimited_never_sleeps() {
        let mut controller = SpeedController::new(config(0, 1000, 0), quiet_aggregator());
        let now = 10_000;

        for i in 1..=10 {
            controller.check_speed_limit(now, 5, i == 10);
        }

        let metrics = controller.metrics();
        assert_eq!(metrics.total_bytes, 50);
        assert_eq!(metrics.total_records, 1);
        assert_eq!(metrics.sleep_count, 0);
        assert_eq!(metrics.total_sleep_ms, 0);
    }

    #[test]
    fn test_renew_period_rolls_over_lazily() {
        let mut controller = SpeedController::new(config(0, 0, 0), quiet_aggregator());

        controller.check_speed_limit(1_000, 10, true);
        controller.renew_period();
        assert!(controller.is_renew_period_set());
        // Nothing moves until the owner meters again.
        assert_eq!(controller.stats().period_bytes(), 10);

        controller.check_speed_limit(2_000, 4, false);
        assert!(!controller.is_renew_period_set());
        assert_eq!(controller.stats().period_bytes(), 4);
        assert_eq!(controller.stats().period_records(), 0);
        assert_eq!(controller.stats().period_start_ms(), 2_000);
        assert_eq!(controller.total_bytes(), 14);
        assert_eq!(controller.total_records(), 1);
    }

    #[test]
    fn test_totals_survive_many_rollovers() {
        let mut controller = SpeedController::new(config(0, 0, 0), quiet_aggregator());
        let mut expected_bytes = 0;
        let mut expected_records = 0;

        for i in 0..200u64 {
            let size = (i * 7) % 13;
            let end = i % 3 == 0;
            if i % 5 == 0 {
                controller.renew_period();
            }
            controller.check_speed_limit(1_000 + i, size, end);
            expected_bytes += size;
            expected_records += u64::from(end);
            assert_eq!(controller.total_bytes(), expected_bytes);
        }

        assert_eq!(controller.total_records(), expected_records);
        controller.stop();
        assert_eq!(controller.total_bytes(), expected_bytes);
        assert_eq!(controller.total_records(), expected_records);
    }

    #[test]
    fn test_stop_folds_into_aggregator() {
        let aggregator = quiet_aggregator();
        let mut controller = SpeedController::new(config(0, 0, 0), aggregator.clone());

        controller.check_speed_limit(1_000, 11, false);
        controller.check_speed_limit(1_001, 0, true);
        controller.stop();

        assert_eq!(controller.state(), ControllerState::Removed);
        assert_eq!(controller.stats().period_bytes(), 0);
        assert_eq!(controller.total_bytes(), 11);
        assert_eq!(aggregator.active_controller_count(), 0);
        assert_eq!(aggregator.global_total_bytes(), 11);
        assert_eq!(aggregator.global_total_records(), 1);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let aggregator = quiet_aggregator();
        let mut controller = SpeedController::new(config(0, 0, 0), aggregator.clone());

        controller.check_speed_limit(1_000, 5, true);
        controller.stop();
        controller.stop();

        assert_eq!(aggregator.global_total_bytes(), 5);
        assert_eq!(aggregator.active_controller_count(), 0);
    }

    #[test]
    fn test_stop_unregistered_leaves_aggregator_alone() {
        let sink = Arc::new(MemorySink::new());
        let aggregator = Arc::new(SpeedAggregator::with_sink(None, Some(sink.clone())));
        sink.take();

        let mut controller = SpeedController::new(config(0, 0, 0), aggregator.clone());
        controller.stop();

        assert_eq!(controller.state(), ControllerState::Removed);
        assert_eq!(aggregator.active_controller_count(), 0);
        assert!(sink.is_empty());
    }

    #[test]
    fn test_metering_after_stop_stays_local() {
        let aggregator = quiet_aggregator();
        let mut controller = SpeedController::new(config(0, 0, 0), aggregator.clone());

        controller.check_speed_limit(1_000, 5, false);
        controller.stop();
        controller.check_speed_limit(1_001, 5, false);

        assert_eq!(controller.state(), ControllerState::Removed);
        assert_eq!(controller.total_bytes(), 10);
        assert_eq!(aggregator.global_total_bytes(), 5);
        assert_eq!(aggregator.active_controller_count(), 0);
    }

    #[test]
    fn test_warns_once_after_stop() {
        let mut controller = SpeedController::new(config(0, 0, 0), quiet_aggregator());

        controller.check_speed_limit(1_000, 1, false);
        controller.stop();
        assert!(!controller.warned_after_stop);

        for _ in 0..5 {
            controller.check_speed_limit(1_001, 1, false);
        }
        assert!(controller.warned_after_stop);
        assert_eq!(controller.total_bytes(), 6);
    }

    #[test]
    fn test_start_sets_period_without_registering() {
        let aggregator = quiet_aggregator();
        let mut controller = SpeedController::new(config(0, 0, 0), aggregator.clone());

        controller.start(4_000);
        assert_eq!(controller.state(), ControllerState::Unregistered);
        assert_eq!(controller.stats().period_start_ms(), 4_000);
        assert_eq!(aggregator.active_controller_count(), 0);

        // A second start does not move the period.
        controller.start(4_500);
        assert_eq!(controller.stats().period_start_ms(), 4_000);

        // First metered unit registers but keeps the period start.
        controller.check_speed_limit(5_000, 10, false);
        assert_eq!(controller.state(), ControllerState::Active);
        assert_eq!(controller.stats().period_start_ms(), 4_000);
        assert_eq!(controller.period_bytes_per_sec(5_000), 10);
    }

    #[test]
    fn test_concurrent_reader_never_sees_more_than_metered() {
        let aggregator = quiet_aggregator();
        let mut controller = SpeedController::new(config(0, 0, 0), aggregator);
        let stats = Arc::clone(controller.stats());
        let rounds = 20_000u64;

        let reader = std::thread::spawn(move || {
            let mut highest = 0;
            while highest < rounds {
                let seen = stats.total_bytes();
                assert!(seen <= rounds, "read {} of {} bytes", seen, rounds);
                highest = highest.max(seen);
            }
        });

        for i in 0..rounds {
            controller.renew_period();
            controller.check_speed_limit(1_000 + i, 1, false);
        }
        reader.join().unwrap();
        assert_eq!(controller.total_bytes(), rounds);
    }

    #[test]
    fn test_drop_stops_active_controller() {
        let aggregator = quiet_aggregator();
        {
            let mut controller = SpeedController::new(config(0, 0, 0), aggregator.clone());
            controller.check_speed_limit(1_000, 9, true);
            assert_eq!(aggregator.active_controller_count(), 1);
        }
        assert_eq!(aggregator.active_controller_count(), 0);
        assert_eq!(aggregator.global_total_bytes(), 9);
    }

    #[test]
    fn test_throttling_sleep_is_capped() {
        let mut controller = SpeedController::new(config(100, 5, 0), quiet_aggregator());
        let now = crate::current_time_ms();

        // 1000 bytes in the first millisecond against 100 B/s: far behind.
        let started = std::time::Instant::now();
        controller.check_speed_limit(now, 1000, false);
        let metrics = controller.metrics();

        assert_eq!(metrics.sleep_count, 1);
        assert_eq!(metrics.last_sleep_ms, 5);
        assert!(started.elapsed() >= Duration::from_millis(5));
    }

    #[test]
    fn test_two_controllers_split_the_limit() {
        let aggregator = quiet_aggregator();
        let mut a = SpeedController::new(config(100, 5, 0), aggregator.clone());
        let mut b = SpeedController::new(config(100, 5, 0), aggregator.clone());
        let now = crate::current_time_ms();

        a.check_speed_limit(now, 0, false);
        b.check_speed_limit(now, 0, false);
        assert_eq!(aggregator.speed_limit_for(a.stats()), 50);
        assert_eq!(aggregator.speed_limit_for(b.stats()), 50);

        a.check_speed_limit(now, 1_000, false);
        b.check_speed_limit(now, 1_000, false);
        for controller in [&a, &b] {
            let metrics = controller.metrics();
            assert_eq!(metrics.sleep_count, 1);
            assert_eq!(metrics.last_sleep_ms, 5);
        }
    }

    #[test]
    fn test_under_limit_does_not_sleep() {
        let mut controller = SpeedController::new(config(1_000_000, 50, 0), quiet_aggregator());

        controller.check_speed_limit(1_000, 10, false);
        controller.check_speed_limit(2_000, 10, false);
        assert_eq!(controller.metrics().sleep_count, 0);
    }

    #[test]
    fn test_sleep_millis() {
        // Not over the share.
        assert_eq!(sleep_millis(50, 1000, 50, 100), 0);
        assert_eq!(sleep_millis(0, 1, 0, 100), 0);
        // 1000 bytes at 50 B/s should take 20_000ms; 10ms elapsed.
        assert_eq!(sleep_millis(1000, 10, 50, u32::MAX), 19_990);
        assert_eq!(sleep_millis(1000, 10, 50, 100), 100);
        // Zero elapsed is treated as 1ms.
        assert_eq!(sleep_millis(100, 0, 1000, 1000), 99);
        // A fair share of 0 is floored to 1.
        assert_eq!(sleep_millis(1, 1, 0, 1000), 999);
        assert_eq!(sleep_millis(u64::MAX, 1, 1, 7), 7);
    }

    #[test]
    fn test_debug_impl() {
        let controller = SpeedController::new(config(10, 5, 0), quiet_aggregator());
        let debug_str = format!("{:?}", controller);
        assert!(debug_str.contains("SpeedController"));
        assert!(debug_str.contains("speed_limit: 10"));
    }
}

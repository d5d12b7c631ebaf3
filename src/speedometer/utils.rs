//! # Utility Functions (utils.rs)
//!
//! Clock and memory-layout helpers shared by the controller and the aggregator.
//!
//! ```text
//!     Clock:
//!     ├─ Wall-clock epoch captured once at first use
//!     └─ Advanced by a monotonic Instant afterwards
//!
//!     Layout:
//!     └─ CacheAligned<T> keeps a hot counter on its own cache line
//! ```

use std::sync::OnceLock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Cache line size for x86_64 processors (Intel/AMD).
#[cfg(target_arch = "x86_64")]
pub const CACHE_LINE_SIZE: usize = 64;

/// Cache line size for ARM64 processors.
///
/// Many ARM processors use 128-byte cache lines.
#[cfg(target_arch = "aarch64")]
pub const CACHE_LINE_SIZE: usize = 128;

/// Default cache line size for other architectures.
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
pub const CACHE_LINE_SIZE: usize = 64;

// Wall-clock epoch milliseconds at first use, advanced with a monotonic
// Instant so a jumping system clock never makes elapsed time negative.
static START_TIME_BASE: OnceLock<(Instant, u64)> = OnceLock::new();

/// Returns the current time in milliseconds since UNIX epoch.
///
/// This is the clock a worker passes to
/// [`SpeedController::check_speed_limit`](crate::SpeedController::check_speed_limit)
/// and the clock the aggregator uses for its overall summary. It never goes
/// backwards within a process.
///
/// # Example
///
/// ```rust
/// use speedometer::current_time_ms;
///
/// let before = current_time_ms();
/// let after = current_time_ms();
/// assert!(after >= before);
/// ```
#[inline(always)]
pub fn current_time_ms() -> u64 {
    let (start, base_ms) = START_TIME_BASE.get_or_init(|| {
        let epoch_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        (Instant::now(), epoch_ms)
    });
    base_ms.saturating_add(start.elapsed().as_millis() as u64)
}

/// Cache-aligned wrapper for values to prevent false sharing.
///
/// A controller's period byte counter is written on every metered unit by
/// its worker while the renew flag next to it is written by whichever thread
/// wins a report cycle. Keeping the counter on its own line stops the two
/// writers from invalidating each other's cache.
///
/// ```text
///     ┌─────────────────────────┐
///     │   period_bytes (worker)  │ ← Own cache line
///     └─────────────────────────┘
///     ┌─────────────────────────┐
///     │   renew flag (reporter)  │ ← Own cache line
///     └─────────────────────────┘
/// ```
#[cfg(target_arch = "x86_64")]
#[repr(C, align(64))]
pub(crate) struct CacheAligned<T>(pub(crate) T);
#[cfg(target_arch = "aarch64")]
#[repr(C, align(128))]
pub(crate) struct CacheAligned<T>(pub(crate) T);
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
#[repr(C, align(64))]
pub(crate) struct CacheAligned<T>(pub(crate) T);

impl<T> CacheAligned<T> {
    /// Creates a new cache-aligned value.
    #[inline(always)]
    pub(crate) const fn new(value: T) -> Self {
        Self(value)
    }

    /// Gets a reference to the inner value.
    #[inline(always)]
    pub(crate) fn get(&self) -> &T {
        &self.0
    }
}

impl<T: Default> Default for CacheAligned<T> {
    fn default() -> Self {
        Self(T::default())
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for CacheAligned<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Milliseconds elapsed from `since` to `now`, floored to 1.
///
/// Every rate in the crate divides by this value, so same-millisecond calls
/// and clocks that have not advanced are treated as 1ms.
#[inline(always)]
pub(crate) fn elapsed_floor_ms(now_ms: u64, since_ms: u64) -> u64 {
    if now_ms > since_ms {
        now_ms - since_ms
    } else {
        1
    }
}

/// Per-second rate of `amount` accumulated over `elapsed_ms` milliseconds.
#[inline(always)]
pub(crate) fn per_second(amount: u64, elapsed_ms: u64) -> u64 {
    amount.saturating_mul(1000) / elapsed_ms.max(1)
}

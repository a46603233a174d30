//! Timestamp utilities for lock-free sample storage
//!
//! Provides conversion between `Instant` and nanoseconds so timestamps can live
//! in an `AtomicU64` next to the value they describe.

use std::sync::LazyLock;
use std::time::{Duration, Instant};

/// Global epoch for converting Instant to/from u64 nanoseconds
///
/// All Instant values are stored as nanoseconds relative to this epoch.
fn timestamp_epoch() -> &'static Instant {
    static EPOCH: LazyLock<Instant> = LazyLock::new(Instant::now);
    &EPOCH
}

/// Convert Instant to nanoseconds since epoch for atomic storage
///
/// Uses (seconds * `1_000_000_000` + `subsec_nanos`) to avoid u128→u64 truncation.
#[inline]
pub fn instant_to_nanos(instant: Instant) -> u64 {
    let duration = instant.saturating_duration_since(*timestamp_epoch());
    let secs = duration.as_secs();
    let nanos = u64::from(duration.subsec_nanos());

    secs.saturating_mul(1_000_000_000).saturating_add(nanos)
}

/// Convert nanoseconds since epoch back to Instant
#[inline]
pub fn nanos_to_instant(nanos: u64) -> Instant {
    *timestamp_epoch() + Duration::from_nanos(nanos)
}

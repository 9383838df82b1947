use once_cell::sync::Lazy;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// One second in microseconds; all engine timestamps and timeouts are µs.
pub const USEC: u64 = 1_000_000;

/// Process clock origin, sampled once.
static ORIGIN: Lazy<(Instant, u64)> = Lazy::new(|| {
    let wall = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    (Instant::now(), wall.as_micros() as u64)
});

/// Wall-clock microseconds since the Unix epoch.
///
/// Derived from a monotonic `Instant` against a cached origin, so it never
/// goes backwards even if the system clock is stepped.
#[inline]
pub fn now_usec() -> u64 {
    let (origin, wall0) = *ORIGIN;
    wall0 + origin.elapsed().as_micros() as u64
}

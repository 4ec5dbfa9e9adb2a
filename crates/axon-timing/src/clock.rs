use std::time::{Instant, SystemTime, UNIX_EPOCH};

use once_cell::sync::OnceCell;

use crate::Timespan;

// Anchor for the monotonic clock; initialized on first use.
static MONOTONIC_ANCHOR: OnceCell<Instant> = OnceCell::new();

/// Process-wide clock access.
///
/// `monotonic` is the time base of selectors and timers; it never jumps.
/// `wall` is only used where calendar time is meaningful, e.g. the HTTP
/// `Date` header.
pub struct Clock;

impl Clock {
    /// Monotonic time since an arbitrary process-local anchor.
    #[inline]
    pub fn monotonic() -> Timespan {
        let anchor = MONOTONIC_ANCHOR.get_or_init(Instant::now);
        Timespan(anchor.elapsed().as_micros() as i64)
    }

    /// Wall-clock time since the Unix epoch.
    #[inline]
    pub fn wall() -> Timespan {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(d) => Timespan(d.as_micros() as i64),
            Err(e) => Timespan(-(e.duration().as_micros() as i64)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_is_monotonic() {
        let a = Clock::monotonic();
        let b = Clock::monotonic();
        assert!(b >= a);
    }

    #[test]
    fn wall_is_after_2020() {
        assert!(Clock::wall() > Timespan::from_secs(1_577_836_800));
    }
}

mod clock;
mod httpdate;
mod timespan;

pub use clock::Clock;
pub use httpdate::format_rfc1123;
pub use timespan::Timespan;

/// Advances `due` past `now` in whole multiples of `interval`.
///
/// Used by periodic timers: however many periods elapsed while the loop was
/// busy, only one tick fires and the next due time lands strictly after
/// `now`.
#[inline]
pub fn next_tick(due: Timespan, interval: Timespan, now: Timespan) -> Timespan {
    debug_assert!(interval > Timespan::ZERO);
    let mut due = due;
    while due <= now {
        due += interval;
    }
    due
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_tick_advances_past_now() {
        let interval = Timespan::from_millis(10);
        let due = Timespan::from_millis(100);
        let now = Timespan::from_millis(137);
        assert_eq!(next_tick(due, interval, now), Timespan::from_millis(140));
    }

    #[test]
    fn next_tick_single_period() {
        let interval = Timespan::from_secs(1);
        let due = Timespan::from_secs(5);
        assert_eq!(next_tick(due, interval, Timespan::from_secs(5)), Timespan::from_secs(6));
    }
}

use std::{
    fmt,
    ops::{Add, AddAssign, Div, DivAssign, Mul, MulAssign, Neg, Sub, SubAssign},
};

use serde::{Deserialize, Serialize};

/// A span of time with microsecond resolution.
///
/// Stored as a signed 64-bit microsecond count, which covers roughly
/// ±292,000 years. Negative spans are legal and are what the selector uses
/// to express "no deadline".
#[derive(Copy, Clone, Debug, Default, Serialize, Deserialize, Hash, PartialEq, Eq)]
#[repr(C)]
pub struct Timespan(pub i64);

impl Timespan {
    pub const MAX: Self = Self(i64::MAX);
    pub const MIN: Self = Self(i64::MIN);
    pub const ZERO: Self = Self(0);

    const MICROS_PER_MILLI: i64 = 1_000;
    const MICROS_PER_SEC: i64 = 1_000_000;
    const MICROS_PER_MIN: i64 = 60 * Self::MICROS_PER_SEC;
    const MICROS_PER_HOUR: i64 = 60 * Self::MICROS_PER_MIN;
    const MICROS_PER_DAY: i64 = 24 * Self::MICROS_PER_HOUR;

    #[inline]
    pub const fn from_micros(us: i64) -> Self {
        Self(us)
    }

    #[inline]
    pub const fn from_millis(ms: i64) -> Self {
        Self(ms * Self::MICROS_PER_MILLI)
    }

    #[inline]
    pub const fn from_secs(s: i64) -> Self {
        Self(s * Self::MICROS_PER_SEC)
    }

    #[inline]
    pub const fn from_mins(m: i64) -> Self {
        Self(m * Self::MICROS_PER_MIN)
    }

    #[inline]
    pub const fn from_hours(h: i64) -> Self {
        Self(h * Self::MICROS_PER_HOUR)
    }

    #[inline]
    pub const fn from_days(d: i64) -> Self {
        Self(d * Self::MICROS_PER_DAY)
    }

    #[inline]
    pub fn from_secs_f64(s: f64) -> Self {
        Self((s * Self::MICROS_PER_SEC as f64).round() as i64)
    }

    #[inline]
    pub fn from_millis_f64(ms: f64) -> Self {
        Self((ms * Self::MICROS_PER_MILLI as f64).round() as i64)
    }

    /// Days part of the decomposition.
    #[inline]
    pub const fn days(&self) -> i64 {
        self.0 / Self::MICROS_PER_DAY
    }

    /// Hours part, 0..24.
    #[inline]
    pub const fn hours(&self) -> i64 {
        self.0 / Self::MICROS_PER_HOUR % 24
    }

    /// Minutes part, 0..60.
    #[inline]
    pub const fn minutes(&self) -> i64 {
        self.0 / Self::MICROS_PER_MIN % 60
    }

    /// Seconds part, 0..60.
    #[inline]
    pub const fn seconds(&self) -> i64 {
        self.0 / Self::MICROS_PER_SEC % 60
    }

    /// Milliseconds part, 0..1000.
    #[inline]
    pub const fn millis(&self) -> i64 {
        self.0 / Self::MICROS_PER_MILLI % 1_000
    }

    /// Microseconds part, 0..1000.
    #[inline]
    pub const fn micros(&self) -> i64 {
        self.0 % 1_000
    }

    #[inline]
    pub const fn total_days(&self) -> i64 {
        self.0 / Self::MICROS_PER_DAY
    }

    #[inline]
    pub const fn total_hours(&self) -> i64 {
        self.0 / Self::MICROS_PER_HOUR
    }

    #[inline]
    pub const fn total_mins(&self) -> i64 {
        self.0 / Self::MICROS_PER_MIN
    }

    #[inline]
    pub const fn total_secs(&self) -> i64 {
        self.0 / Self::MICROS_PER_SEC
    }

    #[inline]
    pub const fn total_millis(&self) -> i64 {
        self.0 / Self::MICROS_PER_MILLI
    }

    #[inline]
    pub const fn total_micros(&self) -> i64 {
        self.0
    }

    #[inline]
    pub fn as_secs_f64(&self) -> f64 {
        self.0 as f64 / Self::MICROS_PER_SEC as f64
    }

    #[inline]
    pub const fn is_negative(&self) -> bool {
        self.0 < 0
    }

    #[inline]
    pub fn saturating_add(self, rhs: Timespan) -> Self {
        Self(self.0.saturating_add(rhs.0))
    }

    #[inline]
    pub fn saturating_sub(self, rhs: Timespan) -> Self {
        Self(self.0.saturating_sub(rhs.0))
    }

    /// Conversion for handing deadlines to the OS poll call.
    ///
    /// Negative spans clamp to zero.
    #[inline]
    pub fn to_std(self) -> std::time::Duration {
        std::time::Duration::from_micros(self.0.max(0) as u64)
    }
}

impl fmt::Display for Timespan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let us = self.0.unsigned_abs();
        let sign = if self.0 < 0 { "-" } else { "" };
        if us >= Self::MICROS_PER_SEC as u64 {
            write!(f, "{sign}{}.{:06}s", us / 1_000_000, us % 1_000_000)
        } else if us >= Self::MICROS_PER_MILLI as u64 {
            write!(f, "{sign}{}.{:03}ms", us / 1_000, us % 1_000)
        } else {
            write!(f, "{sign}{us}us")
        }
    }
}

impl Add for Timespan {
    type Output = Timespan;

    #[inline]
    fn add(self, rhs: Timespan) -> Timespan {
        Timespan(self.0 + rhs.0)
    }
}

impl AddAssign for Timespan {
    #[inline]
    fn add_assign(&mut self, rhs: Timespan) {
        *self = *self + rhs;
    }
}

impl Sub for Timespan {
    type Output = Timespan;

    #[inline]
    fn sub(self, rhs: Timespan) -> Timespan {
        Timespan(self.0 - rhs.0)
    }
}

impl SubAssign for Timespan {
    #[inline]
    fn sub_assign(&mut self, rhs: Timespan) {
        *self = *self - rhs;
    }
}

impl Neg for Timespan {
    type Output = Timespan;

    #[inline]
    fn neg(self) -> Timespan {
        Timespan(-self.0)
    }
}

impl Mul<i64> for Timespan {
    type Output = Timespan;

    #[inline]
    fn mul(self, rhs: i64) -> Timespan {
        Timespan(self.0 * rhs)
    }
}

impl Mul<Timespan> for i64 {
    type Output = Timespan;

    #[inline]
    fn mul(self, rhs: Timespan) -> Timespan {
        rhs * self
    }
}

impl MulAssign<i64> for Timespan {
    #[inline]
    fn mul_assign(&mut self, rhs: i64) {
        *self = *self * rhs;
    }
}

impl Div<i64> for Timespan {
    type Output = Timespan;

    #[inline]
    fn div(self, rhs: i64) -> Timespan {
        Timespan(self.0 / rhs)
    }
}

impl Div<Timespan> for Timespan {
    type Output = i64;

    #[inline]
    fn div(self, rhs: Timespan) -> i64 {
        self.0 / rhs.0
    }
}

impl DivAssign<i64> for Timespan {
    #[inline]
    fn div_assign(&mut self, rhs: i64) {
        *self = *self / rhs;
    }
}

impl PartialOrd for Timespan {
    #[inline]
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timespan {
    #[inline]
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

impl From<std::time::Duration> for Timespan {
    #[inline]
    fn from(value: std::time::Duration) -> Self {
        Self(value.as_micros() as i64)
    }
}

impl From<i64> for Timespan {
    #[inline]
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<Timespan> for i64 {
    #[inline]
    fn from(value: Timespan) -> Self {
        value.0
    }
}

impl std::iter::Sum for Timespan {
    #[inline]
    fn sum<I>(iter: I) -> Self
    where
        I: Iterator<Item = Self>,
    {
        Timespan(iter.map(|v| v.0).sum())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decomposition() {
        let ts = Timespan::from_days(2)
            + Timespan::from_hours(3)
            + Timespan::from_mins(4)
            + Timespan::from_secs(5)
            + Timespan::from_millis(6)
            + Timespan::from_micros(7);
        assert_eq!(ts.days(), 2);
        assert_eq!(ts.hours(), 3);
        assert_eq!(ts.minutes(), 4);
        assert_eq!(ts.seconds(), 5);
        assert_eq!(ts.millis(), 6);
        assert_eq!(ts.micros(), 7);
    }

    #[test]
    fn totals() {
        let ts = Timespan::from_hours(25);
        assert_eq!(ts.total_days(), 1);
        assert_eq!(ts.total_hours(), 25);
        assert_eq!(ts.total_mins(), 1500);
    }

    #[test]
    fn arithmetic_and_ordering() {
        let a = Timespan::from_millis(100);
        let b = Timespan::from_millis(250);
        assert_eq!(a + b, Timespan::from_millis(350));
        assert_eq!(b - a, Timespan::from_millis(150));
        assert_eq!(a * 3, Timespan::from_micros(300_000));
        assert_eq!(b / a, 2);
        assert!(a < b);
        assert_eq!(-a, Timespan::from_millis(-100));
        assert!((-a).is_negative());
    }

    #[test]
    fn display() {
        assert_eq!(Timespan::from_secs(3).to_string(), "3.000000s");
        assert_eq!(Timespan::from_millis(12).to_string(), "12.000ms");
        assert_eq!(Timespan::from_micros(7).to_string(), "7us");
        assert_eq!(Timespan::from_millis(-12).to_string(), "-12.000ms");
    }

    #[test]
    fn std_conversion_clamps_negative() {
        assert_eq!(Timespan::from_millis(-5).to_std(), std::time::Duration::ZERO);
        assert_eq!(Timespan::from_millis(5).to_std(), std::time::Duration::from_millis(5));
    }
}

//! Microsecond time base shared by the scheduler and the worker pipeline.
//!
//! All correlator arithmetic (slice boundaries, integration alignment, frame
//! timestamps) is done on integer microseconds so that alignment checks are
//! exact. Conversion to calendar time goes through `chrono`.

use std::fmt;
use std::ops::{Add, Sub};

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};

/// Microseconds in one second.
pub const MICROS_PER_SECOND: i64 = 1_000_000;

/// An instant, in microseconds since the Unix epoch (UTC).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Time(i64);

impl Time {
    pub const fn from_micros(micros: i64) -> Self {
        Self(micros)
    }

    pub fn from_seconds(seconds: f64) -> Self {
        Self((seconds * MICROS_PER_SECOND as f64).round() as i64)
    }

    pub fn from_datetime(dt: &DateTime<Utc>) -> Self {
        Self(dt.timestamp_micros())
    }

    pub const fn as_micros(self) -> i64 {
        self.0
    }

    pub fn as_seconds(self) -> f64 {
        self.0 as f64 / MICROS_PER_SECOND as f64
    }

    /// Calendar representation, `None` when out of chrono's range.
    pub fn to_datetime(self) -> Option<DateTime<Utc>> {
        Utc.timestamp_micros(self.0).single()
    }

    /// Signed distance `self - earlier` in microseconds.
    pub const fn micros_since(self, earlier: Time) -> i64 {
        self.0 - earlier.0
    }

    pub const fn add_micros(self, micros: i64) -> Self {
        Self(self.0 + micros)
    }

    /// Year, day of year (1-based) and seconds since midnight, as used by the
    /// output global header.
    pub fn year_day_seconds(self) -> Option<(i32, u32, u32)> {
        let dt = self.to_datetime()?;
        Some((dt.year(), dt.ordinal(), dt.num_seconds_from_midnight()))
    }
}

impl Add<i64> for Time {
    type Output = Time;

    fn add(self, micros: i64) -> Time {
        self.add_micros(micros)
    }
}

impl Sub for Time {
    type Output = i64;

    fn sub(self, rhs: Time) -> i64 {
        self.micros_since(rhs)
    }
}

impl From<DateTime<Utc>> for Time {
    fn from(dt: DateTime<Utc>) -> Self {
        Self::from_datetime(&dt)
    }
}

impl fmt::Display for Time {
    /// Day-of-year notation, e.g. `2024y122d12h00m01.500000s`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_datetime() {
            Some(dt) => write!(
                f,
                "{}y{:03}d{:02}h{:02}m{:02}.{:06}s",
                dt.year(),
                dt.ordinal(),
                dt.hour(),
                dt.minute(),
                dt.second(),
                dt.timestamp_subsec_micros()
            ),
            None => write!(f, "{}us", self.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_datetime_round_trip() {
        let dt = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let t = Time::from_datetime(&dt);
        assert_eq!(t.to_datetime(), Some(dt));
    }

    #[test]
    fn test_arithmetic() {
        let t = Time::from_micros(10);
        assert_eq!((t + 5).as_micros(), 15);
        assert_eq!(Time::from_micros(15) - t, 5);
        assert_eq!(t - Time::from_micros(15), -5);
    }

    #[test]
    fn test_year_day_seconds() {
        let dt = Utc.with_ymd_and_hms(2024, 2, 1, 1, 2, 3).unwrap();
        let t = Time::from_datetime(&dt);
        assert_eq!(t.year_day_seconds(), Some((2024, 32, 3723)));
    }

    #[test]
    fn test_display_day_of_year() {
        let dt = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 1).unwrap();
        let t = Time::from_datetime(&dt) + 500_000;
        assert_eq!(t.to_string(), "2024y122d12h00m01.500000s");
    }
}

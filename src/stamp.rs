//! Wall-clock timestamps with nanosecond resolution.
//!
//! Every subsystem in this crate measures time the same way: a signed
//! 64-bit count of nanoseconds since the Unix epoch. `Stamp` wraps that
//! count and carries the conversions the wire protocols need (RFC 1123
//! header dates, log break headers, IND receive stamps).

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use std::fmt;
use std::ops::{Add, AddAssign, Sub, SubAssign};

/// Nanoseconds in one microsecond.
pub const NSEC_PER_USEC: i64 = 1_000;
/// Nanoseconds in one millisecond.
pub const NSEC_PER_MSEC: i64 = 1_000_000;
/// Nanoseconds in one second.
pub const NSEC_PER_SEC: i64 = 1_000_000_000;
/// Nanoseconds in one minute.
pub const NSEC_PER_MIN: i64 = 60 * NSEC_PER_SEC;
/// Nanoseconds in one hour.
pub const NSEC_PER_HOUR: i64 = 60 * NSEC_PER_MIN;
/// Nanoseconds in one day.
pub const NSEC_PER_DAY: i64 = 24 * NSEC_PER_HOUR;
/// Nanoseconds in one week.
pub const NSEC_PER_WEEK: i64 = 7 * NSEC_PER_DAY;

/// A point in wall-clock time, counted as nanoseconds since the Unix
/// epoch. Negative values are before the epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Stamp(i64);

impl Stamp {
    /// Builds a stamp from a raw nanosecond count.
    #[must_use]
    pub const fn from_nanos(nanos: i64) -> Self {
        Self(nanos)
    }

    /// Reads the current system time.
    #[must_use]
    pub fn now() -> Self {
        let now = Utc::now();
        Self(now.timestamp() * NSEC_PER_SEC + i64::from(now.timestamp_subsec_nanos()))
    }

    /// Raw nanosecond count.
    #[must_use]
    pub const fn nanos(self) -> i64 {
        self.0
    }

    /// Whole milliseconds since the epoch, truncated toward zero.
    #[must_use]
    pub const fn millis(self) -> i64 {
        self.0 / NSEC_PER_MSEC
    }

    /// Builds a stamp from a POSIX seconds count.
    #[must_use]
    pub const fn from_secs(secs: i64) -> Self {
        Self(secs * NSEC_PER_SEC)
    }

    /// Snaps this stamp down to the most recent noon or midnight. The
    /// ALERT2 MANT time stamp is expressed as seconds past whichever of
    /// the two boundaries happened last.
    #[must_use]
    pub const fn latest_half_day(self) -> Self {
        Self(self.0 - self.0.rem_euclid(12 * NSEC_PER_HOUR))
    }

    /// Converts to a chrono UTC date-time. Returns the epoch for values
    /// chrono cannot represent.
    #[must_use]
    pub fn to_utc(self) -> DateTime<Utc> {
        let secs = self.0.div_euclid(NSEC_PER_SEC);
        let nanos = self.0.rem_euclid(NSEC_PER_SEC) as u32;
        Utc.timestamp_opt(secs, nanos)
            .single()
            .unwrap_or_else(|| Utc.timestamp_opt(0, 0).single().expect("epoch"))
    }

    /// Builds a stamp from a UTC date-time.
    #[must_use]
    pub fn from_utc(value: DateTime<Utc>) -> Self {
        Self(value.timestamp() * NSEC_PER_SEC + i64::from(value.timestamp_subsec_nanos()))
    }

    /// Builds a stamp from calendar components interpreted as UTC.
    #[must_use]
    pub fn from_ymd_hms(year: i32, month: u32, day: u32, hour: u32, min: u32, sec: u32) -> Option<Self> {
        let date = NaiveDate::from_ymd_opt(year, month, day)?;
        let time = date.and_hms_opt(hour, min, sec)?;
        Some(Self::from_utc(Utc.from_utc_datetime(&time)))
    }

    /// Formats as RFC 1123 (`Sun, 06 Nov 1994 08:49:37 GMT`), the form
    /// HTTP uses for `If-Modified-Since` and `Last-Modified`.
    #[must_use]
    pub fn to_rfc1123(self) -> String {
        self.to_utc().format("%a, %d %b %Y %H:%M:%S GMT").to_string()
    }

    /// Parses an RFC 1123 date.
    #[must_use]
    pub fn parse_rfc1123(text: &str) -> Option<Self> {
        DateTime::parse_from_rfc2822(text)
            .ok()
            .map(|parsed| Self::from_utc(parsed.with_timezone(&Utc)))
    }

    /// Formats as `YYYY-MM-DD HH:MM:SS.mmm`, the form the byte log uses
    /// in break headers.
    #[must_use]
    pub fn to_log_header(self) -> String {
        self.to_utc().format("%Y-%m-%d %H:%M:%S%.3f").to_string()
    }

    /// The start of the hour containing this stamp.
    #[must_use]
    pub const fn start_of_hour(self) -> Self {
        Self(self.0 - self.0.rem_euclid(NSEC_PER_HOUR))
    }

    /// The start of the UTC day containing this stamp.
    #[must_use]
    pub const fn start_of_day(self) -> Self {
        Self(self.0 - self.0.rem_euclid(NSEC_PER_DAY))
    }

    /// The start of the UTC week (Monday) containing this stamp.
    #[must_use]
    pub fn start_of_week(self) -> Self {
        let day = self.start_of_day();
        let weekday = day.to_utc().weekday().num_days_from_monday();
        Self(day.0 - i64::from(weekday) * NSEC_PER_DAY)
    }

    /// The start of the month containing this stamp.
    #[must_use]
    pub fn start_of_month(self) -> Self {
        let utc = self.to_utc();
        Self::from_ymd_hms(utc.year(), utc.month(), 1, 0, 0, 0).unwrap_or(self)
    }

    /// The start of the year containing this stamp.
    #[must_use]
    pub fn start_of_year(self) -> Self {
        let utc = self.to_utc();
        Self::from_ymd_hms(utc.year(), 1, 1, 0, 0, 0).unwrap_or(self)
    }

    /// Seconds-of-day helper used when reconstructing IND receive
    /// times from split calendar fields.
    #[must_use]
    pub fn with_seconds_fraction(self, fraction: f64) -> Self {
        Self(self.0 + (fraction * NSEC_PER_SEC as f64) as i64)
    }
}

impl fmt::Display for Stamp {
    fn fmt(&self, out: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(out, "{}", self.to_utc().format("%Y-%m-%d %H:%M:%S%.9f"))
    }
}

impl Add<i64> for Stamp {
    type Output = Stamp;

    fn add(self, nanos: i64) -> Stamp {
        Stamp(self.0 + nanos)
    }
}

impl AddAssign<i64> for Stamp {
    fn add_assign(&mut self, nanos: i64) {
        self.0 += nanos;
    }
}

impl Sub<i64> for Stamp {
    type Output = Stamp;

    fn sub(self, nanos: i64) -> Stamp {
        Stamp(self.0 - nanos)
    }
}

impl SubAssign<i64> for Stamp {
    fn sub_assign(&mut self, nanos: i64) {
        self.0 -= nanos;
    }
}

impl Sub for Stamp {
    type Output = i64;

    /// The signed nanosecond interval between two stamps.
    fn sub(self, other: Stamp) -> i64 {
        self.0 - other.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn half_day_snap_before_noon() {
        let stamp = Stamp::from_ymd_hms(2020, 3, 14, 9, 26, 53).unwrap();
        let snapped = stamp.latest_half_day();
        assert_eq!(snapped, Stamp::from_ymd_hms(2020, 3, 14, 0, 0, 0).unwrap());
    }

    #[test]
    fn half_day_snap_after_noon() {
        let stamp = Stamp::from_ymd_hms(2020, 3, 14, 15, 0, 1).unwrap();
        let snapped = stamp.latest_half_day();
        assert_eq!(snapped, Stamp::from_ymd_hms(2020, 3, 14, 12, 0, 0).unwrap());
    }

    #[test]
    fn rfc1123_round_trip() {
        let stamp = Stamp::from_ymd_hms(1994, 11, 6, 8, 49, 37).unwrap();
        let text = stamp.to_rfc1123();
        assert_eq!(text, "Sun, 06 Nov 1994 08:49:37 GMT");
        assert_eq!(Stamp::parse_rfc1123(&text), Some(stamp));
    }

    #[test]
    fn log_header_format() {
        let stamp = Stamp::from_ymd_hms(2021, 1, 2, 3, 4, 5).unwrap() + 250 * NSEC_PER_MSEC;
        assert_eq!(stamp.to_log_header(), "2021-01-02 03:04:05.250");
    }

    #[test]
    fn interval_arithmetic() {
        let a = Stamp::from_secs(100);
        let b = a + 2 * NSEC_PER_SEC;
        assert_eq!(b - a, 2 * NSEC_PER_SEC);
        assert_eq!(b - 2 * NSEC_PER_SEC, a);
    }

    #[test]
    fn week_starts_on_monday() {
        // 2020-03-14 was a Saturday.
        let stamp = Stamp::from_ymd_hms(2020, 3, 14, 9, 0, 0).unwrap();
        assert_eq!(
            stamp.start_of_week(),
            Stamp::from_ymd_hms(2020, 3, 9, 0, 0, 0).unwrap()
        );
    }
}

//! Source ranges and execution schedules.
//!
//! Both are parsed from the short strings used in component files:
//!
//! | Text | Parsed as |
//! |------|-----------|
//! | `12` | [`SourceRange::Count`] of 12 rows |
//! | `15m` | [`SourceRange::Duration`] of 900 s, or [`Schedule::Every`] 15 minutes |
//! | `1w` | [`SourceRange::Duration`] of one week (ranges only) |
//! | `04:30` | [`Schedule::Daily`] at 04:30 UTC |

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, NaiveTime, TimeDelta, Utc};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RangeError {
    #[error("empty range")]
    Empty,
    #[error("invalid duration '{0}' (expected <n>s, <n>m, <n>h, <n>d or <n>w)")]
    InvalidDuration(String),
    #[error("row count must be at least 1, got {0}")]
    InvalidCount(i64),
    #[error("invalid schedule '{0}' (expected <n>s, <n>m, <n>h, <n>d or HH:MM)")]
    InvalidSchedule(String),
}

/// How much new source data one harvester invocation consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceRange {
    /// Exactly this many new rows.
    Count(u64),
    /// One epoch-aligned period of this many seconds.
    Duration(i64),
}

impl Default for SourceRange {
    fn default() -> Self {
        SourceRange::Count(1)
    }
}

impl SourceRange {
    pub fn from_count(count: i64) -> Result<Self, RangeError> {
        if count < 1 {
            return Err(RangeError::InvalidCount(count));
        }
        Ok(SourceRange::Count(count as u64))
    }
}

impl FromStr for SourceRange {
    type Err = RangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(RangeError::Empty);
        }
        if s.bytes().all(|b| b.is_ascii_digit()) {
            let count: i64 = s
                .parse()
                .map_err(|_| RangeError::InvalidDuration(s.to_string()))?;
            return SourceRange::from_count(count);
        }
        parse_seconds(s, true)
            .map(SourceRange::Duration)
            .ok_or_else(|| RangeError::InvalidDuration(s.to_string()))
    }
}

impl fmt::Display for SourceRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceRange::Count(n) => write!(f, "{n} rows"),
            SourceRange::Duration(secs) => write!(f, "{secs}s"),
        }
    }
}

/// `<n><unit>` to seconds. Weeks are only meaningful for ranges.
fn parse_seconds(s: &str, allow_weeks: bool) -> Option<i64> {
    let unit = s.chars().last()?;
    let number: i64 = s[..s.len() - unit.len_utf8()].parse().ok()?;
    if number <= 0 {
        return None;
    }
    let factor = match unit {
        's' => 1,
        'm' => 60,
        'h' => 3_600,
        'd' => 86_400,
        'w' if allow_weeks => 604_800,
        _ => return None,
    };
    number.checked_mul(factor)
}

/// Start of the epoch-aligned period of length `period` containing `ts`.
///
/// Works for negative timestamps too: `round_down(-1, 60) == -60`.
pub fn round_down(ts: i64, period: i64) -> i64 {
    if period <= 0 {
        return ts;
    }
    ts - ts.rem_euclid(period)
}

/// When a collector fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    Every(Duration),
    /// Once a day at this UTC wall-clock time.
    Daily(NaiveTime),
}

impl Schedule {
    /// Time to wait from `now` until the next firing.
    ///
    /// For [`Schedule::Every`] this is the full interval; the runner ticks
    /// immediately on start and uses this only between ticks.
    pub fn delay_from(&self, now: DateTime<Utc>) -> Duration {
        match self {
            Schedule::Every(interval) => *interval,
            Schedule::Daily(at) => {
                let mut next = now.date_naive().and_time(*at).and_utc();
                if next <= now {
                    next += TimeDelta::days(1);
                }
                (next - now).to_std().unwrap_or(Duration::ZERO)
            }
        }
    }
}

impl FromStr for Schedule {
    type Err = RangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(RangeError::Empty);
        }
        if s.contains(':') {
            return NaiveTime::parse_from_str(s, "%H:%M")
                .map(Schedule::Daily)
                .map_err(|_| RangeError::InvalidSchedule(s.to_string()));
        }
        parse_seconds(s, false)
            .map(|secs| Schedule::Every(Duration::from_secs(secs as u64)))
            .ok_or_else(|| RangeError::InvalidSchedule(s.to_string()))
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Schedule::Every(d) => write!(f, "every {}s", d.as_secs()),
            Schedule::Daily(t) => write!(f, "daily at {} UTC", t.format("%H:%M")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_counts_and_durations() {
        assert_eq!("12".parse::<SourceRange>(), Ok(SourceRange::Count(12)));
        assert_eq!("30s".parse::<SourceRange>(), Ok(SourceRange::Duration(30)));
        assert_eq!("15m".parse::<SourceRange>(), Ok(SourceRange::Duration(900)));
        assert_eq!("2h".parse::<SourceRange>(), Ok(SourceRange::Duration(7200)));
        assert_eq!("1d".parse::<SourceRange>(), Ok(SourceRange::Duration(86_400)));
        assert_eq!("1w".parse::<SourceRange>(), Ok(SourceRange::Duration(604_800)));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!("".parse::<SourceRange>(), Err(RangeError::Empty));
        assert_eq!("0".parse::<SourceRange>(), Err(RangeError::InvalidCount(0)));
        assert!("5y".parse::<SourceRange>().is_err());
        assert!("m".parse::<SourceRange>().is_err());
        assert!("-3m".parse::<SourceRange>().is_err());
        assert_eq!(SourceRange::from_count(-1), Err(RangeError::InvalidCount(-1)));
    }

    #[test]
    fn test_round_down_is_epoch_aligned() {
        assert_eq!(round_down(125, 60), 120);
        assert_eq!(round_down(120, 60), 120);
        assert_eq!(round_down(-1, 60), -60);
        assert_eq!(round_down(90_000, 86_400), 86_400);
    }

    #[test]
    fn test_parse_schedules() {
        assert_eq!(
            "20s".parse::<Schedule>(),
            Ok(Schedule::Every(Duration::from_secs(20)))
        );
        assert_eq!(
            "04:30".parse::<Schedule>(),
            Ok(Schedule::Daily(NaiveTime::from_hms_opt(4, 30, 0).unwrap()))
        );
        assert!("1w".parse::<Schedule>().is_err());
        assert!("25:00".parse::<Schedule>().is_err());
    }

    #[test]
    fn test_daily_delay_rolls_over_midnight() {
        let schedule: Schedule = "04:30".parse().unwrap();
        let before = Utc.with_ymd_and_hms(2024, 3, 1, 4, 0, 0).unwrap();
        assert_eq!(schedule.delay_from(before), Duration::from_secs(1800));

        let after = Utc.with_ymd_and_hms(2024, 3, 1, 5, 0, 0).unwrap();
        assert_eq!(
            schedule.delay_from(after),
            Duration::from_secs(23 * 3600 + 1800)
        );

        let exactly = Utc.with_ymd_and_hms(2024, 3, 1, 4, 30, 0).unwrap();
        assert_eq!(schedule.delay_from(exactly), Duration::from_secs(86_400));
    }
}

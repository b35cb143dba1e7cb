//! Aligned accounting periods
//!
//! Budget windows are aligned to UTC boundaries so every node derives the
//! same bucket for the same instant. Weeks use ISO-8601 numbering,
//! Monday-anchored.

use agentoauth_core::Period;
use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};

const SECS_PER_HOUR: i64 = 3600;
const SECS_PER_DAY: i64 = 86_400;
const SECS_PER_WEEK: i64 = 7 * SECS_PER_DAY;

/// The id of the aligned period containing `at`, e.g. `2025-W45` or
/// `2025-11-05-12`
pub fn aligned_id(period: Period, at: DateTime<Utc>) -> String {
    match period {
        Period::Hour => at.format("%Y-%m-%d-%H").to_string(),
        Period::Day => at.format("%Y-%m-%d").to_string(),
        Period::Week => {
            let iso = at.iso_week();
            format!("{}-W{:02}", iso.year(), iso.week())
        }
        Period::Month => at.format("%Y-%m").to_string(),
    }
}

/// First instant of the next aligned period after `at`
pub fn period_end(period: Period, at: DateTime<Utc>) -> DateTime<Utc> {
    let ts = at.timestamp();
    let end_ts = match period {
        Period::Hour => ts - ts.rem_euclid(SECS_PER_HOUR) + SECS_PER_HOUR,
        Period::Day => ts - ts.rem_euclid(SECS_PER_DAY) + SECS_PER_DAY,
        Period::Week => {
            // The epoch fell on a Thursday; shift so weeks start Monday
            let days = ts.div_euclid(SECS_PER_DAY);
            let days_into_week = (days + 3).rem_euclid(7);
            (days - days_into_week + 7) * SECS_PER_DAY
        }
        Period::Month => {
            let (year, month) = if at.month() == 12 {
                (at.year() + 1, 1)
            } else {
                (at.year(), at.month() + 1)
            };
            let first = NaiveDate::from_ymd_opt(year, month, 1)
                .expect("first of month is a valid date");
            first.and_time(chrono::NaiveTime::MIN).and_utc().timestamp()
        }
    };
    DateTime::from_timestamp(end_ts, 0).expect("aligned period end is representable")
}

/// Nominal length of a period, used to extend entry TTLs one full period
/// past the window
pub fn span(period: Period) -> Duration {
    match period {
        Period::Hour => Duration::seconds(SECS_PER_HOUR),
        Period::Day => Duration::seconds(SECS_PER_DAY),
        Period::Week => Duration::seconds(SECS_PER_WEEK),
        // Long enough to cover any month
        Period::Month => Duration::days(31),
    }
}

//! Shared entity-level helpers: minute rounding and RFC3339 timestamp plumbing.
//!
//! Access-grant lifetimes are minute-rounded per the data model: a `start` floors
//! to the enclosing minute, an `end` ceils to the next one. Everything is stored
//! as RFC3339 text (sqlite has no native datetime type) with second precision.

use chrono::{DateTime, Duration, SubsecRound, Timelike, Utc};

use crate::utils::error::Error;
use crate::Result;

/// Floors `t` to the start of its minute.
pub fn floor_minute(t: DateTime<Utc>) -> DateTime<Utc> {
    let truncated = t.trunc_subsecs(0);
    truncated - Duration::seconds(truncated.second() as i64)
}

/// Ceils `t` to the start of the next minute, unless it already sits exactly on one.
pub fn ceil_minute(t: DateTime<Utc>) -> DateTime<Utc> {
    let floored = floor_minute(t);
    if floored == t {
        floored
    } else {
        floored + Duration::minutes(1)
    }
}

pub fn to_rfc3339(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

pub fn parse_rfc3339(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| Error::bad_database("stored timestamp is not valid RFC3339"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn floor_truncates_seconds() {
        let t = Utc.with_ymd_and_hms(2025, 3, 1, 10, 0, 37).unwrap();
        assert_eq!(floor_minute(t), Utc.with_ymd_and_hms(2025, 3, 1, 10, 0, 0).unwrap());
    }

    #[test]
    fn ceil_rounds_up_unless_exact() {
        let exact = Utc.with_ymd_and_hms(2025, 3, 1, 10, 0, 0).unwrap();
        assert_eq!(ceil_minute(exact), exact);

        let inexact = Utc.with_ymd_and_hms(2025, 3, 1, 10, 0, 1).unwrap();
        assert_eq!(ceil_minute(inexact), Utc.with_ymd_and_hms(2025, 3, 1, 10, 1, 0).unwrap());
    }

    #[test]
    fn rfc3339_round_trips() {
        let t = Utc.with_ymd_and_hms(2025, 3, 1, 10, 0, 0).unwrap();
        assert_eq!(parse_rfc3339(&to_rfc3339(t)).unwrap(), t);
    }
}

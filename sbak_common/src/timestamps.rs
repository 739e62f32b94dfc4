// sbak_common is the main sbak library implementing the backup engine logic.
// Copyright (C) 2024  Himbeer <himbeerserverde@gmail.com>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use crate::BackupError;

use chrono::{
    DateTime, Datelike, Duration, FixedOffset, Local, NaiveDate, NaiveDateTime, SecondsFormat,
    Timelike, Utc,
};

/// ISO-8601 forms accepted in addition to full RFC 3339,
/// reduced precision first with, then without an UTC offset.
/// Offset-free forms are taken as UTC.
const OFFSET_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%#z", "%Y-%m-%dT%H:%M%#z"];
const NAIVE_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M"];
const DATE_FORMAT: &str = "%Y-%m-%d";

/// Returns the minimum admissible instant.
///
/// Used as the default retention and decay threshold: every snapshot
/// is inside the retain intervals and none is old enough to decay.
pub fn earliest_time() -> DateTime<FixedOffset> {
    DateTime::<Utc>::MIN_UTC.fixed_offset()
}

/// Returns a timezone-aware instant for `now` in the local offset
/// with sub-second precision zeroed.
pub fn get_timestamp() -> DateTime<FixedOffset> {
    Local::now()
        .with_nanosecond(0)
        .expect("zero is a valid nanosecond value")
        .fixed_offset()
}

/// Serializes an instant to the ISO-8601 string used as snapshot name.
///
/// The fixed second precision and the trailing offset make names
/// of the same volume sort lexicographically in chronological order.
pub fn format_timestamp(timestamp: &DateTime<FixedOffset>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Secs, false)
}

/// Parses an ISO-8601 timestamp string, returns the corresponding instant.
pub fn parse_timestamp(string: &str) -> Result<DateTime<FixedOffset>, BackupError> {
    if let Ok(timestamp) = DateTime::parse_from_rfc3339(string) {
        return Ok(timestamp);
    }

    for format in OFFSET_FORMATS {
        if let Ok(timestamp) = DateTime::parse_from_str(string, format) {
            return Ok(timestamp);
        }
    }

    for format in NAIVE_FORMATS {
        if let Ok(timestamp) = NaiveDateTime::parse_from_str(string, format) {
            return Ok(timestamp.and_utc().fixed_offset());
        }
    }

    match NaiveDate::parse_from_str(string, DATE_FORMAT) {
        Ok(date) => Ok(date
            .and_hms_opt(0, 0, 0)
            .expect("midnight is a valid time of day")
            .and_utc()
            .fixed_offset()),
        Err(e) => Err(BackupError::TimestampParse {
            message: format!("`{string}` is not an ISO-8601 timestamp: {e}"),
            cause: Some(Box::new(e)),
        }),
    }
}

/// Reports whether the given string is a valid ISO-8601 timestamp.
pub fn is_timestamp(string: &str) -> bool {
    parse_timestamp(string).is_ok()
}

/// Resolves a human-readable relative date like `1 day` or `2 weeks ago`
/// into the instant that duration before now.
pub fn parse_relative(string: &str) -> Result<DateTime<FixedOffset>, BackupError> {
    let duration = humantime::parse_duration(string.trim().trim_end_matches("ago").trim())
        .map_err(|e| BackupError::TimestampParse {
            message: format!("could not parse `{string}`: {e}"),
            cause: Some(Box::new(e)),
        })?;

    let duration = Duration::from_std(duration).map_err(|e| BackupError::TimestampParse {
        message: format!("`{string}` exceeds the representable time range"),
        cause: Some(Box::new(e)),
    })?;

    Ok(get_timestamp() - duration)
}

/// Reports whether the given instants fall in the same clock hour
/// and are less than one hour apart. Requires `date1 < date2`.
pub fn is_same_hour(date1: DateTime<FixedOffset>, date2: DateTime<FixedOffset>) -> bool {
    debug_assert!(date1 < date2);
    date1.hour() == date2.hour() && date2 - date1 < Duration::hours(1)
}

/// Reports whether the given instants fall on the same calendar day
/// and are less than 24 hours apart. Requires `date1 < date2`.
pub fn is_same_day(date1: DateTime<FixedOffset>, date2: DateTime<FixedOffset>) -> bool {
    debug_assert!(date1 < date2);
    date1.day() == date2.day() && date2 - date1 < Duration::days(1)
}

/// Reports whether the given instants fall in the same ISO week
/// and are less than 7 days apart. Requires `date1 < date2`.
pub fn is_same_week(date1: DateTime<FixedOffset>, date2: DateTime<FixedOffset>) -> bool {
    debug_assert!(date1 < date2);
    date1.iso_week().week() == date2.iso_week().week() && date2 - date1 < Duration::weeks(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instant(s: &str) -> DateTime<FixedOffset> {
        parse_timestamp(s).unwrap()
    }

    #[test]
    fn timestamp_roundtrip_is_second_precise() {
        let now = get_timestamp();
        assert_eq!(parse_timestamp(&format_timestamp(&now)).unwrap(), now);
    }

    #[test]
    fn parse_accepts_reduced_iso_forms() {
        assert!(is_timestamp("1989-11-09"));
        assert!(is_timestamp("1989-11-09T18:53"));
        assert!(is_timestamp("1989-11-09T18:53:00"));
        assert!(is_timestamp("1989-11-09T18:53:00+01:00"));
        assert!(is_timestamp("1989-11-09T18:53:00Z"));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(!is_timestamp("some random string"));
        assert!(!is_timestamp("1989-13-09"));
        assert!(!is_timestamp(""));

        assert!(matches!(
            parse_timestamp("nope"),
            Err(BackupError::TimestampParse { .. })
        ));
    }

    #[test]
    fn date_only_parses_to_utc_midnight() {
        assert_eq!(instant("1989-11-09"), instant("1989-11-09T00:00:00+00:00"));
    }

    #[test]
    fn same_hour_boundaries() {
        let base = instant("1970-01-01T01:00:00+00:00");

        assert!(is_same_hour(base, instant("1970-01-01T01:59:59+00:00")));
        assert!(!is_same_hour(base, instant("1970-01-01T02:00:00+00:00")));
        // Shares the clock hour but is a day apart.
        assert!(!is_same_hour(base, instant("1970-01-02T01:00:00+00:00")));
    }

    #[test]
    fn same_day_boundaries() {
        let base = instant("1970-01-01T00:00:00+00:00");

        assert!(is_same_day(base, instant("1970-01-01T23:59:59+00:00")));
        assert!(!is_same_day(base, instant("1970-01-02T00:00:00+00:00")));
        // Shares the day of month but is a month apart.
        assert!(!is_same_day(base, instant("1970-02-01T00:00:00+00:00")));
    }

    #[test]
    fn same_week_boundaries() {
        let base = instant("1970-01-01T00:00:00+00:00");

        // 1970-01-04 is the Sunday closing ISO week 1.
        assert!(is_same_week(base, instant("1970-01-04T23:59:59+00:00")));
        assert!(!is_same_week(base, instant("1970-01-05T00:00:00+00:00")));
        assert!(!is_same_week(base, instant("1971-01-01T00:00:00+00:00")));
    }

    #[test]
    fn earliest_time_is_minimal() {
        let earliest = earliest_time();

        assert!(earliest < instant("0001-01-01T00:00:00+00:00"));
        assert!(earliest < get_timestamp());
    }

    #[test]
    fn relative_dates_resolve_into_the_past() {
        let threshold = parse_relative("1 day").unwrap();
        let now = get_timestamp();

        assert!(threshold < now);
        assert!(now - threshold >= Duration::days(1));
        assert!(now - threshold < Duration::days(2));
    }

    #[test]
    fn relative_dates_accept_ago_suffix() {
        let plain = parse_relative("2 weeks").unwrap();
        let suffixed = parse_relative("2 weeks ago").unwrap();

        assert!((suffixed - plain).abs() < Duration::seconds(2));
    }

    #[test]
    fn relative_date_garbage_is_an_error() {
        assert!(matches!(
            parse_relative("anytime"),
            Err(BackupError::TimestampParse { .. })
        ));
    }
}

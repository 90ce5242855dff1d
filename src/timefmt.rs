use chrono::{DateTime, NaiveDateTime, Timelike, Utc};

use crate::error::RecordError;

/// Format used by the tracker for instants in WIQL filters.
const WIQL_INSTANT_FORMAT: &str = "%Y-%m-%dT%H:%M:%S.000Z";

/// Parse a `Microsoft.VSTS.Common.StateChangeDate` value into a UTC instant.
///
/// The fractional-second suffix and a trailing `Z` are dropped and the rest is
/// read as a naive date-time in UTC. Values carrying an explicit offset
/// (`+02:00`) are converted instead.
pub fn parse_state_change_date(raw: &str) -> Result<DateTime<Utc>, RecordError> {
    let trimmed = raw.trim();
    let without_zulu = trimmed.strip_suffix('Z').unwrap_or(trimmed);
    let (seconds_part, fraction) = without_zulu
        .split_once('.')
        .unwrap_or((without_zulu, ""));

    if fraction.bytes().all(|b| b.is_ascii_digit()) {
        if let Ok(naive) = NaiveDateTime::parse_from_str(seconds_part, "%Y-%m-%dT%H:%M:%S") {
            return Ok(naive.and_utc());
        }
    }

    DateTime::parse_from_rfc3339(trimmed)
        .ok()
        .and_then(|dt| dt.with_timezone(&Utc).with_nanosecond(0))
        .ok_or_else(|| RecordError::BadTimestamp {
            raw: raw.to_string(),
        })
}

/// Format an instant the way WIQL date filters expect it.
pub fn format_wiql_instant(ts: DateTime<Utc>) -> String {
    ts.format(WIQL_INSTANT_FORMAT).to_string()
}

/// Format an inclusive upper bound for WIQL, keeping millisecond precision so
/// the last second of the window is not cut off.
pub fn format_wiql_upper_bound(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// Format a raw state change date for display, or return it untouched if unparseable.
pub fn format_display(raw: &str) -> String {
    match parse_state_change_date(raw) {
        Ok(ts) => ts.format("%m/%d/%Y %H:%M").to_string(),
        Err(_) => raw.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parses_fractional_zulu() {
        let ts = parse_state_change_date("2024-01-15T10:00:00.000Z").unwrap();
        assert_eq!(ts, Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 0).unwrap());
    }

    #[test]
    fn truncates_sub_second_precision() {
        let ts = parse_state_change_date("2024-01-31T23:59:59.987Z").unwrap();
        assert_eq!(ts, Utc.with_ymd_and_hms(2024, 1, 31, 23, 59, 59).unwrap());
    }

    #[test]
    fn parses_without_fraction_or_marker() {
        let ts = parse_state_change_date("2024-03-01T08:30:15").unwrap();
        assert_eq!(ts, Utc.with_ymd_and_hms(2024, 3, 1, 8, 30, 15).unwrap());
    }

    #[test]
    fn converts_explicit_offset() {
        let ts = parse_state_change_date("2024-03-01T10:30:15+02:00").unwrap();
        assert_eq!(ts, Utc.with_ymd_and_hms(2024, 3, 1, 8, 30, 15).unwrap());

        let ts = parse_state_change_date("2024-03-01T10:30:15.250-05:00").unwrap();
        assert_eq!(ts, Utc.with_ymd_and_hms(2024, 3, 1, 15, 30, 15).unwrap());
    }

    #[test]
    fn rejects_garbage() {
        let err = parse_state_change_date("yesterday-ish").unwrap_err();
        assert_eq!(
            err,
            RecordError::BadTimestamp {
                raw: "yesterday-ish".to_string()
            }
        );
        assert!(parse_state_change_date("").is_err());
    }

    #[test]
    fn wiql_instant_format() {
        let ts = Utc.with_ymd_and_hms(2025, 10, 5, 4, 0, 0).unwrap();
        assert_eq!(format_wiql_instant(ts), "2025-10-05T04:00:00.000Z");
    }

    #[test]
    fn wiql_upper_bound_keeps_millis() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 31, 23, 59, 59).unwrap()
            + chrono::Duration::microseconds(999_999);
        assert_eq!(format_wiql_upper_bound(ts), "2024-01-31T23:59:59.999Z");
    }

    #[test]
    fn display_falls_back_to_raw() {
        assert_eq!(format_display("2024-01-15T10:00:00.000Z"), "01/15/2024 10:00");
        assert_eq!(format_display("n/a"), "n/a");
    }
}

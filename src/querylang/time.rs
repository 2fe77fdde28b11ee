//! Calendar strings and relative durations.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};

const DATE_FORMATS: [&str; 3] = ["%m/%d/%Y", "%m-%d-%Y", "%Y-%m-%d"];
const TIME_SUFFIXES: [&str; 5] = [" %H:%M:%S", " %H:%M", " %I:%M:%S %p", " %I:%M %p", "T%H:%M:%S"];

/// Parses a calendar string to nanoseconds since the epoch.
///
/// Accepts RFC 3339 with an offset, or one of the fixed date formats with an
/// optional time of day, interpreted as UTC. Dates before 1970 are rejected.
pub fn parse_calendar(text: &str) -> Option<u64> {
    let text = text.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return non_negative(dt.timestamp_nanos_opt()?);
    }

    for date in DATE_FORMATS {
        for suffix in TIME_SUFFIXES {
            let format = format!("{}{}", date, suffix);
            if let Ok(naive) = NaiveDateTime::parse_from_str(text, &format) {
                return utc_nanos(naive);
            }
        }
        if let Ok(day) = NaiveDate::parse_from_str(text, date) {
            return utc_nanos(day.and_hms_opt(0, 0, 0)?);
        }
    }
    None
}

fn utc_nanos(naive: NaiveDateTime) -> Option<u64> {
    non_negative(Utc.from_utc_datetime(&naive).timestamp_nanos_opt()?)
}

fn non_negative(ns: i64) -> Option<u64> {
    u64::try_from(ns).ok()
}

/// Nanoseconds in one unit of a relative duration, e.g. `min` or `hours`.
pub fn duration_unit(word: &str) -> Option<u64> {
    let lower = word.to_lowercase();
    let singular = match lower.as_str() {
        "ms" | "us" | "µs" | "ns" | "s" => lower.as_str(),
        other => other.strip_suffix('s').unwrap_or(other),
    };
    let ns = match singular {
        "ns" => 1,
        "us" | "µs" => 1_000,
        "ms" => 1_000_000,
        "s" | "sec" | "second" => 1_000_000_000,
        "m" | "min" | "minute" => 60_000_000_000,
        "h" | "hr" | "hour" => 3_600_000_000_000,
        "d" | "day" => 86_400_000_000_000,
        _ => return None,
    };
    Some(ns)
}

/// Current time in nanoseconds since the epoch.
pub fn now_nanos() -> u64 {
    Utc::now().timestamp_nanos_opt().and_then(non_negative).unwrap_or(0)
}

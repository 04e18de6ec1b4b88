//! UTC timestamps without a calendar dependency.
//!
//! Events are ordered by Unix milliseconds; rows and payloads carry
//! ISO-8601 strings derived from the same clock.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current UTC time as Unix milliseconds.
pub fn now_unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Current UTC time as Unix seconds.
pub fn now_unix_secs() -> u64 {
    now_unix_millis() / 1000
}

/// Current UTC timestamp in ISO-8601 format with millisecond precision.
pub fn now_iso8601() -> String {
    millis_to_iso8601(now_unix_millis())
}

/// Convert Unix milliseconds to an ISO-8601 UTC string (`...T12:00:00.250Z`).
pub fn millis_to_iso8601(millis: u64) -> String {
    let secs = millis / 1000;
    let frac = millis % 1000;
    let days = (secs / 86_400) as i64;
    let rem = secs % 86_400;

    let (y, m, d) = days_to_civil(days);
    format!(
        "{y:04}-{m:02}-{d:02}T{:02}:{:02}:{:02}.{frac:03}Z",
        rem / 3600,
        (rem % 3600) / 60,
        rem % 60
    )
}

/// Days since the Unix epoch to a proleptic Gregorian (year, month, day).
fn days_to_civil(days: i64) -> (i64, u64, u64) {
    let shifted = days + 719_468;
    let era = shifted.div_euclid(146_097);
    let day_of_era = shifted.rem_euclid(146_097) as u64;
    let year_of_era =
        (day_of_era - day_of_era / 1460 + day_of_era / 36_524 - day_of_era / 146_096) / 365;
    let day_of_year = day_of_era - (365 * year_of_era + year_of_era / 4 - year_of_era / 100);
    let month_index = (5 * day_of_year + 2) / 153;
    let day = day_of_year - (153 * month_index + 2) / 5 + 1;
    let month = if month_index < 10 {
        month_index + 3
    } else {
        month_index - 9
    };
    let year = year_of_era as i64 + era * 400 + i64::from(month <= 2);
    (year, month, day)
}

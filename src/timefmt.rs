//! Timestamp formatting without a calendar dependency.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in milliseconds since the Unix epoch.
#[must_use]
pub fn now_epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

/// Format the current time as a simplified ISO 8601 string
/// (e.g., `"2026-02-11T12:00:00.000Z"`).
#[must_use]
pub fn now_iso8601() -> String {
    epoch_ms_to_iso(now_epoch_ms())
}

/// Convert milliseconds since the Unix epoch to an ISO 8601 string.
///
/// Uses the Howard Hinnant algorithm for civil date computation.
#[allow(
    clippy::similar_names,
    clippy::cast_possible_wrap,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
#[must_use]
pub fn epoch_ms_to_iso(millis: u64) -> String {
    let secs = millis / 1000;
    let ms_part = millis % 1000;

    let day_secs = secs % 86_400;
    let hours = day_secs / 3_600;
    let minutes = (day_secs % 3_600) / 60;
    let seconds = day_secs % 60;

    // Civil date from days since epoch, shifted to 0000-03-01
    let mut days = (secs / 86_400) as i64;
    days += 719_468;
    let era = if days >= 0 { days } else { days - 146_096 } / 146_097;
    let day_of_era = (days - era * 146_097) as u64; // [0, 146096]
    let year_of_era =
        (day_of_era - day_of_era / 1460 + day_of_era / 36524 - day_of_era / 146_096) / 365;
    let y = year_of_era as i64 + era * 400;
    let day_of_year = day_of_era - (365 * year_of_era + year_of_era / 4 - year_of_era / 100);
    let mp = (5 * day_of_year + 2) / 153;
    let d = day_of_year - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = if m <= 2 { y + 1 } else { y };

    format!("{y:04}-{m:02}-{d:02}T{hours:02}:{minutes:02}:{seconds:02}.{ms_part:03}Z")
}

/// Convert a CDP network timestamp (seconds since epoch, floating point) to
/// milliseconds since the epoch.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
#[must_use]
pub fn cdp_seconds_to_epoch_ms(ts: f64) -> u64 {
    if ts <= 0.0 { 0 } else { (ts * 1000.0) as u64 }
}

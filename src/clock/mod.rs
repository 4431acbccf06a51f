use chrono::{DateTime, SecondsFormat, TimeZone, Utc};

/// Current wall-clock time as milliseconds since the Unix epoch (UTC).
///
/// Every timestamp the monitor stores or compares is in this unit; the
/// quiescence check only ever subtracts two of these values.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Format a millisecond epoch timestamp as ISO-8601 UTC with millisecond
/// precision and a `Z` suffix, e.g. `2026-08-02T10:15:42.123Z`.
pub fn iso_utc(timestamp_ms: i64) -> String {
    let dt: DateTime<Utc> = match Utc.timestamp_millis_opt(timestamp_ms).single() {
        Some(dt) => dt,
        // Only reachable with a corrupt timestamp; clamp to the epoch.
        None => DateTime::<Utc>::UNIX_EPOCH,
    };
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

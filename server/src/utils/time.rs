//! Time utility functions

use chrono::{DateTime, Duration, DurationRound, TimeZone, Utc};

/// Convert microseconds since Unix epoch to DateTime<Utc>
pub fn micros_to_datetime(micros: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(micros).unwrap_or_else(|| {
        tracing::warn!(micros, "Invalid timestamp, using epoch");
        DateTime::UNIX_EPOCH
    })
}

/// Convert chrono DateTime to time OffsetDateTime (for ClickHouse row serialization)
pub fn chrono_to_time(dt: DateTime<Utc>) -> time::OffsetDateTime {
    time::OffsetDateTime::from_unix_timestamp_nanos(dt.timestamp_micros() as i128 * 1_000)
        .unwrap_or(time::OffsetDateTime::UNIX_EPOCH)
}

/// Drop sub-second precision
pub fn truncate_to_second(dt: DateTime<Utc>) -> DateTime<Utc> {
    dt.duration_trunc(Duration::seconds(1)).unwrap_or(dt)
}

/// Midnight UTC of the day containing `dt`
pub fn start_of_utc_day(dt: DateTime<Utc>) -> DateTime<Utc> {
    Utc.from_utc_datetime(&dt.date_naive().and_time(chrono::NaiveTime::MIN))
}

/// Parse ISO 8601 / RFC 3339 timestamp string to DateTime<Utc>
pub fn parse_iso_timestamp(ts: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(ts)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

use chrono::{DateTime, Local, NaiveDate, SecondsFormat, TimeZone, Utc};

/// This is the standard way of converting a date to a bucket directory name in timepet.
pub fn date_to_bucket_name(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

/// Converts epoch milliseconds into a UTC timestamp. Out-of-range values clamp to the epoch.
pub fn utc_from_millis(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or(DateTime::UNIX_EPOCH)
}

/// Local wall-clock time for a record id. Screenshot buckets follow the user's calendar day.
pub fn local_from_millis(millis: i64) -> DateTime<Local> {
    utc_from_millis(millis).with_timezone(&Local)
}

/// ISO-8601 string with millisecond precision and a `Z` suffix, e.g.
/// `2024-03-01T09:30:00.000Z`. Used for the redundant `timestamp` field of records.
pub fn iso_from_millis(millis: i64) -> String {
    utc_from_millis(millis).to_rfc3339_opts(SecondsFormat::Millis, true)
}

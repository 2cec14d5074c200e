//! Serde helpers for the loosely formatted timestamps pushed by the game server.
//!
//! The server emits naive ISO-8601 strings, but older builds and replayed
//! fixtures also carry offsets or epoch milliseconds. Anything that cannot be
//! understood decodes as `None` so a single bad field never drops a frame.

use serde::{Deserialize, Deserializer, Serializer};
use serde_json::Value;
use time::{
    OffsetDateTime, PrimitiveDateTime,
    format_description::well_known::{Iso8601, Rfc3339},
};
use tracing::debug;

/// Parse a textual server timestamp. Naive values are interpreted as UTC.
pub fn parse_timestamp(raw: &str) -> Option<OffsetDateTime> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    OffsetDateTime::parse(trimmed, &Rfc3339)
        .or_else(|_| OffsetDateTime::parse(trimmed, &Iso8601::DEFAULT))
        .or_else(|_| {
            PrimitiveDateTime::parse(trimmed, &Iso8601::DEFAULT).map(PrimitiveDateTime::assume_utc)
        })
        .ok()
}

/// Convert epoch milliseconds into a timestamp, rejecting out-of-range values.
pub fn from_epoch_millis(millis: f64) -> Option<OffsetDateTime> {
    if !millis.is_finite() {
        return None;
    }
    let nanos = (millis * 1_000_000.0) as i128;
    OffsetDateTime::from_unix_timestamp_nanos(nanos).ok()
}

fn from_value(value: Value) -> Option<OffsetDateTime> {
    match value {
        Value::Null => None,
        Value::String(text) => parse_timestamp(&text),
        Value::Number(number) => number.as_f64().and_then(from_epoch_millis),
        other => {
            debug!(value = %other, "ignoring timestamp of unexpected shape");
            None
        }
    }
}

/// `#[serde(with = "...")]` deserializer for `Option<OffsetDateTime>` fields.
pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<OffsetDateTime>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.and_then(from_value))
}

/// `#[serde(with = "...")]` serializer for `Option<OffsetDateTime>` fields.
pub fn serialize<S>(value: &Option<OffsetDateTime>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match value {
        Some(timestamp) => {
            let text = timestamp
                .format(&Rfc3339)
                .map_err(serde::ser::Error::custom)?;
            serializer.serialize_str(&text)
        }
        None => serializer.serialize_none(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn naive_iso_is_treated_as_utc() {
        let parsed = parse_timestamp("2024-03-01T10:15:30.250000").unwrap();
        assert_eq!(parsed, datetime!(2024-03-01 10:15:30.25 UTC));
    }

    #[test]
    fn offset_iso_is_preserved() {
        let parsed = parse_timestamp("2024-03-01T12:15:30+02:00").unwrap();
        assert_eq!(parsed, datetime!(2024-03-01 10:15:30 UTC));
    }

    #[test]
    fn epoch_millis_are_accepted() {
        let parsed = from_value(serde_json::json!(1_000)).unwrap();
        assert_eq!(parsed, datetime!(1970-01-01 00:00:01 UTC));
    }

    #[test]
    fn garbage_decodes_as_absent() {
        assert!(parse_timestamp("not a date").is_none());
        assert!(parse_timestamp("").is_none());
        assert!(from_value(serde_json::json!(true)).is_none());
    }
}

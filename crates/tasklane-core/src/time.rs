use crate::{TasklaneError, TasklaneResult};
use chrono::{DateTime, SecondsFormat, Utc};

/// Encode a timestamp as RFC 3339 UTC with fixed nanosecond precision.
///
/// The fixed width keeps lexicographic order equal to chronological order,
/// so stored values can be compared directly in SQL.
pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Parse any RFC 3339 / ISO-8601 timestamp with an offset into UTC.
pub fn parse_ts(raw: &str) -> TasklaneResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| TasklaneError::Validation(format!("invalid timestamp '{raw}': {e}")))
}

/// Serde adapter that writes timestamps through [`format_ts`].
pub mod nanos {
    use super::{format_ts, parse_ts};
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format_ts(*ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        parse_ts(&raw).map_err(serde::de::Error::custom)
    }

    /// Same as the parent module, for optional fields.
    pub mod option {
        use super::super::{format_ts, parse_ts};
        use chrono::{DateTime, Utc};
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            ts: &Option<DateTime<Utc>>,
            s: S,
        ) -> Result<S::Ok, S::Error> {
            match ts {
                Some(ts) => s.serialize_str(&format_ts(*ts)),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            d: D,
        ) -> Result<Option<DateTime<Utc>>, D::Error> {
            let raw = Option::<String>::deserialize(d)?;
            raw.map(|r| parse_ts(&r).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_format_is_fixed_width() {
        let a = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(format_ts(a), "2024-01-02T03:04:05.000000000Z");
    }

    #[test]
    fn test_lexicographic_order_matches_time_order() {
        let a = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let b = a + chrono::Duration::nanoseconds(1);
        let c = a + chrono::Duration::milliseconds(900);
        assert!(format_ts(a) < format_ts(b));
        assert!(format_ts(b) < format_ts(c));
    }

    #[test]
    fn test_parse_accepts_offsets_and_normalises() {
        let parsed = parse_ts("2024-01-02T05:04:05+02:00").unwrap();
        assert_eq!(format_ts(parsed), "2024-01-02T03:04:05.000000000Z");
        let round = parse_ts(&format_ts(parsed)).unwrap();
        assert_eq!(round, parsed);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            parse_ts("yesterday"),
            Err(TasklaneError::Validation(_))
        ));
    }
}

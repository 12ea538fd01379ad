//! Scalar encoding shared by every record store.

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};

use crate::core::{PersistError, Result, ScalarType, Value};

/// Reserved encoded form of `Value::Null`.
pub const NULL_SENTINEL: &str = "NULL";

const ESCAPE: char = '\\';

/// Turns native scalars into the strings stored in records and back.
pub trait ScalarCodec: Send + Sync {
    fn encode(&self, value: &Value) -> String;
    fn decode(&self, encoded: &str, scalar_type: ScalarType) -> Result<Value>;
}

/// Default codec. Text that collides with the null sentinel or begins with
/// the escape character is prefixed with `\`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ValueCodec;

impl ScalarCodec for ValueCodec {
    fn encode(&self, value: &Value) -> String {
        match value {
            Value::Null => NULL_SENTINEL.to_string(),
            Value::Integer(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Text(s) => {
                if s == NULL_SENTINEL || s.starts_with(ESCAPE) {
                    format!("{}{}", ESCAPE, s)
                } else {
                    s.clone()
                }
            }
            Value::Boolean(b) => b.to_string(),
            Value::Date(d) => d.format("%Y-%m-%d").to_string(),
            Value::Timestamp(t) => t.to_rfc3339_opts(SecondsFormat::Nanos, true),
        }
    }

    fn decode(&self, encoded: &str, scalar_type: ScalarType) -> Result<Value> {
        if encoded == NULL_SENTINEL {
            return Ok(Value::Null);
        }
        let invalid = |detail: String| {
            PersistError::Codec(format!(
                "cannot decode '{}' as {}: {}",
                encoded, scalar_type, detail
            ))
        };
        match scalar_type {
            ScalarType::Integer => encoded
                .parse::<i64>()
                .map(Value::Integer)
                .map_err(|e| invalid(e.to_string())),
            ScalarType::Float => encoded
                .parse::<f64>()
                .map(Value::Float)
                .map_err(|e| invalid(e.to_string())),
            ScalarType::Text => Ok(Value::Text(
                encoded.strip_prefix(ESCAPE).unwrap_or(encoded).to_string(),
            )),
            ScalarType::Boolean => match encoded {
                "true" => Ok(Value::Boolean(true)),
                "false" => Ok(Value::Boolean(false)),
                _ => Err(invalid("expected 'true' or 'false'".to_string())),
            },
            ScalarType::Date => NaiveDate::parse_from_str(encoded, "%Y-%m-%d")
                .map(Value::Date)
                .map_err(|e| invalid(e.to_string())),
            ScalarType::Timestamp => DateTime::parse_from_rfc3339(encoded)
                .map(|t| Value::Timestamp(t.with_timezone(&Utc)))
                .map_err(|e| invalid(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn round_trip(value: Value, scalar_type: ScalarType) -> Value {
        let codec = ValueCodec;
        codec.decode(&codec.encode(&value), scalar_type).unwrap()
    }

    #[test]
    fn test_null_sentinel_is_reserved() {
        let codec = ValueCodec;
        assert_eq!(codec.encode(&Value::Null), NULL_SENTINEL);
        assert_eq!(codec.encode(&Value::Text("NULL".into())), "\\NULL");
        assert_eq!(round_trip(Value::Text("NULL".into()), ScalarType::Text), Value::Text("NULL".into()));
        assert_eq!(round_trip(Value::Null, ScalarType::Integer), Value::Null);
    }

    #[test]
    fn test_escaped_text_round_trips() {
        for text in ["\\", "\\NULL", "\\\\x", "plain", ""] {
            assert_eq!(round_trip(Value::Text(text.into()), ScalarType::Text), Value::Text(text.into()));
        }
    }

    #[test]
    fn test_temporal_values_round_trip() {
        let date = NaiveDate::from_ymd_opt(2024, 2, 29).unwrap();
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap()
            + chrono::Duration::nanoseconds(123_456_789);

        assert_eq!(round_trip(Value::Date(date), ScalarType::Date), Value::Date(date));
        assert_eq!(round_trip(Value::Timestamp(ts), ScalarType::Timestamp), Value::Timestamp(ts));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let codec = ValueCodec;
        assert!(matches!(codec.decode("abc", ScalarType::Integer), Err(PersistError::Codec(_))));
        assert!(matches!(codec.decode("yes", ScalarType::Boolean), Err(PersistError::Codec(_))));
    }

    proptest! {
        #[test]
        fn prop_text_round_trips(text in ".*") {
            prop_assert_eq!(round_trip(Value::Text(text.clone()), ScalarType::Text), Value::Text(text));
        }

        #[test]
        fn prop_integer_round_trips(i in any::<i64>()) {
            prop_assert_eq!(round_trip(Value::Integer(i), ScalarType::Integer), Value::Integer(i));
        }

        #[test]
        fn prop_float_round_trips(f in any::<f64>()) {
            prop_assert_eq!(round_trip(Value::Float(f), ScalarType::Float), Value::Float(f));
        }
    }
}

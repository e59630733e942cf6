//! Line-oriented serialized record format.
//!
//! Each record is one JSON object on its own line. `PartitionKey`, `RowKey`
//! and `Timestamp` are reserved; every other key is a property accompanied by
//! a `<name>@type` discriminator so values survive with their exact type:
//!
//! ```text
//! {"PartitionKey":"p1","RowKey":"r1","Timestamp":"2024-01-01T00:00:00Z","Qty":5,"Qty@type":"Int32"}
//! ```
//!
//! Int64 values are written as decimal strings, DateTime as RFC 3339, Binary
//! as standard base64 and non-finite doubles as strings. Lines written
//! without discriminators are still accepted; their types are inferred from
//! the JSON value.
//!
//! Property names that are reserved or end in `@type` cannot be represented
//! and are rejected on both sides, as is a discriminator with no property.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Number, Value};
use uuid::Uuid;

use crate::core::record::is_reserved;
use crate::core::{
    check_property_name, PropertyKind, PropertyValue, Record, PARTITION_KEY, ROW_KEY, TIMESTAMP,
    TYPE_SUFFIX,
};
use crate::error::{BackupError, Result};

fn format_datetime(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn parse_datetime(key: &str, raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| BackupError::Serialization(format!("{}: invalid datetime '{}': {}", key, raw, e)))
}

fn encode_value(value: &PropertyValue) -> Value {
    match value {
        PropertyValue::String(s) => Value::String(s.clone()),
        PropertyValue::Int32(v) => Value::from(*v),
        PropertyValue::Int64(v) => Value::String(v.to_string()),
        PropertyValue::Double(v) => match Number::from_f64(*v) {
            Some(n) => Value::Number(n),
            None => Value::String(v.to_string()),
        },
        PropertyValue::Boolean(v) => Value::Bool(*v),
        PropertyValue::DateTime(v) => Value::String(format_datetime(v)),
        PropertyValue::Guid(v) => Value::String(v.hyphenated().to_string()),
        PropertyValue::Binary(v) => Value::String(STANDARD.encode(v)),
    }
}

/// Serialize one record as a single JSON line (no trailing newline).
///
/// Fails when a property name would collide with a key field or a
/// discriminator.
pub fn encode_record(record: &Record) -> Result<String> {
    let mut map = Map::new();
    map.insert(PARTITION_KEY.into(), Value::String(record.partition_key.clone()));
    map.insert(ROW_KEY.into(), Value::String(record.row_key.clone()));
    if let Some(ts) = &record.timestamp {
        map.insert(TIMESTAMP.into(), Value::String(format_datetime(ts)));
    }

    for (name, value) in &record.properties {
        check_property_name(name)?;
        map.insert(name.clone(), encode_value(value));
        map.insert(
            format!("{}{}", name, TYPE_SUFFIX),
            Value::String(value.kind().as_str().to_string()),
        );
    }

    Ok(Value::Object(map).to_string())
}

fn type_error(key: &str, kind: PropertyKind, value: &Value) -> BackupError {
    BackupError::Serialization(format!("{}: cannot read {} as {}", key, value, kind))
}

fn decode_typed(key: &str, kind: PropertyKind, value: &Value) -> Result<PropertyValue> {
    let decoded = match (kind, value) {
        (PropertyKind::String, Value::String(s)) => PropertyValue::String(s.clone()),
        (PropertyKind::Int32, Value::Number(n)) => n
            .as_i64()
            .and_then(|v| i32::try_from(v).ok())
            .map(PropertyValue::Int32)
            .ok_or_else(|| type_error(key, kind, value))?,
        (PropertyKind::Int64, Value::String(s)) => s
            .parse::<i64>()
            .map(PropertyValue::Int64)
            .map_err(|_| type_error(key, kind, value))?,
        (PropertyKind::Int64, Value::Number(n)) => n
            .as_i64()
            .map(PropertyValue::Int64)
            .ok_or_else(|| type_error(key, kind, value))?,
        (PropertyKind::Double, Value::Number(n)) => n
            .as_f64()
            .map(PropertyValue::Double)
            .ok_or_else(|| type_error(key, kind, value))?,
        (PropertyKind::Double, Value::String(s)) => s
            .parse::<f64>()
            .map(PropertyValue::Double)
            .map_err(|_| type_error(key, kind, value))?,
        (PropertyKind::Boolean, Value::Bool(b)) => PropertyValue::Boolean(*b),
        (PropertyKind::DateTime, Value::String(s)) => PropertyValue::DateTime(parse_datetime(key, s)?),
        (PropertyKind::Guid, Value::String(s)) => Uuid::parse_str(s)
            .map(PropertyValue::Guid)
            .map_err(|_| type_error(key, kind, value))?,
        (PropertyKind::Binary, Value::String(s)) => STANDARD
            .decode(s)
            .map(PropertyValue::Binary)
            .map_err(|_| type_error(key, kind, value))?,
        _ => return Err(type_error(key, kind, value)),
    };
    Ok(decoded)
}

/// Best-effort typing for lines written without discriminators.
fn infer_value(key: &str, value: &Value) -> Result<Option<PropertyValue>> {
    let inferred = match value {
        Value::Null => None,
        Value::String(s) => Some(PropertyValue::String(s.clone())),
        Value::Bool(b) => Some(PropertyValue::Boolean(*b)),
        Value::Number(n) => {
            if let Some(v) = n.as_i64() {
                Some(match i32::try_from(v) {
                    Ok(small) => PropertyValue::Int32(small),
                    Err(_) => PropertyValue::Int64(v),
                })
            } else {
                n.as_f64().map(PropertyValue::Double)
            }
        }
        Value::Array(_) | Value::Object(_) => {
            return Err(BackupError::Serialization(format!(
                "{}: nested values are not supported",
                key
            )))
        }
    };
    Ok(inferred)
}

fn required_string(map: &Map<String, Value>, key: &str) -> Result<String> {
    match map.get(key) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => Err(BackupError::Serialization(format!(
            "{} must be a string, got {}",
            key, other
        ))),
        None => Err(BackupError::Serialization(format!("missing {}", key))),
    }
}

/// Parse one serialized line back into a record.
pub fn decode_line(line: &str) -> Result<Record> {
    let value: Value = serde_json::from_str(line.trim())
        .map_err(|e| BackupError::Serialization(format!("malformed record line: {}", e)))?;
    let Value::Object(map) = value else {
        return Err(BackupError::Serialization(
            "record line is not a JSON object".into(),
        ));
    };

    let mut record = Record::new(
        required_string(&map, PARTITION_KEY)?,
        required_string(&map, ROW_KEY)?,
    );

    if let Some(ts) = map.get(TIMESTAMP) {
        match ts {
            Value::String(s) => record.timestamp = Some(parse_datetime(TIMESTAMP, s)?),
            Value::Null => {}
            other => {
                return Err(BackupError::Serialization(format!(
                    "Timestamp must be a string, got {}",
                    other
                )))
            }
        }
    }

    for (key, value) in &map {
        if is_reserved(key) {
            continue;
        }
        if let Some(base) = key.strip_suffix(TYPE_SUFFIX) {
            if is_reserved(base) || base.ends_with(TYPE_SUFFIX) || !map.contains_key(base) {
                return Err(BackupError::Serialization(format!(
                    "{}: discriminator without a property",
                    key
                )));
            }
            continue;
        }

        let discriminator = map.get(&format!("{}{}", key, TYPE_SUFFIX));
        let decoded = match discriminator {
            Some(Value::String(kind)) => {
                let kind: PropertyKind = kind.parse()?;
                Some(decode_typed(key, kind, value)?)
            }
            Some(other) => {
                return Err(BackupError::Serialization(format!(
                    "{}{} must be a string, got {}",
                    key, TYPE_SUFFIX, other
                )))
            }
            None => infer_value(key, value)?,
        };

        if let Some(decoded) = decoded {
            record.properties.insert(key.clone(), decoded);
        }
    }

    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn sample() -> Record {
        Record::new("customers", "c-001")
            .with_timestamp(Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap())
            .with("Name", "Ada Lovelace")
            .with("Visits", 42i32)
            .with("Balance", 9_007_199_254_740_993i64)
            .with("Score", 0.25f64)
            .with("Active", true)
            .with(
                "Joined",
                Utc.with_ymd_and_hms(1999, 12, 31, 23, 59, 59).unwrap(),
            )
            .with(
                "Id",
                Uuid::parse_str("7d444840-9dc0-11d1-b245-5ffdce74fad2").unwrap(),
            )
            .with("Avatar", vec![0u8, 1, 2, 254, 255])
    }

    fn encode(record: &Record) -> String {
        encode_record(record).unwrap()
    }

    #[test]
    fn test_roundtrip_preserves_types() {
        let record = sample();
        let line = encode(&record);
        assert!(!line.contains('\n'));
        assert_eq!(decode_line(&line).unwrap(), record);
    }

    #[test]
    fn test_int64_written_as_string() {
        let line = encode(&Record::new("p", "r").with("Big", 5i64));
        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["Big"], Value::String("5".into()));
        assert_eq!(value["Big@type"], Value::String("Int64".into()));
    }

    #[test]
    fn test_non_finite_doubles_survive() {
        let record = Record::new("p", "r")
            .with("Inf", f64::INFINITY)
            .with("NegInf", f64::NEG_INFINITY);
        let decoded = decode_line(&encode(&record)).unwrap();
        assert_eq!(decoded, record);

        let nan = decode_line(&encode(&Record::new("p", "r").with("X", f64::NAN))).unwrap();
        match nan.get("X") {
            Some(PropertyValue::Double(v)) => assert!(v.is_nan()),
            other => panic!("expected NaN double, got {:?}", other),
        }
    }

    #[test]
    fn test_legacy_line_types_inferred() {
        let line = r#"{"PartitionKey":"p","RowKey":"r","Name":"x","Small":7,"Large":5000000000,"Ratio":1.5,"Flag":false,"Gone":null}"#;
        let record = decode_line(line).unwrap();
        assert_eq!(record.timestamp, None);
        assert_eq!(record.get("Name"), Some(&PropertyValue::String("x".into())));
        assert_eq!(record.get("Small"), Some(&PropertyValue::Int32(7)));
        assert_eq!(record.get("Large"), Some(&PropertyValue::Int64(5_000_000_000)));
        assert_eq!(record.get("Ratio"), Some(&PropertyValue::Double(1.5)));
        assert_eq!(record.get("Flag"), Some(&PropertyValue::Boolean(false)));
        assert_eq!(record.get("Gone"), None);
    }

    #[test]
    fn test_bad_lines_rejected() {
        assert!(decode_line("not json").is_err());
        assert!(decode_line("[1,2]").is_err());
        assert!(decode_line(r#"{"RowKey":"r"}"#).is_err());
        assert!(decode_line(r#"{"PartitionKey":"p","RowKey":"r","A":"x","A@type":"Int32"}"#).is_err());
        assert!(decode_line(r#"{"PartitionKey":"p","RowKey":"r","A":1,"A@type":"Decimal"}"#).is_err());
    }

    #[test]
    fn test_colliding_names_not_encoded() {
        for name in ["PartitionKey", "RowKey", "Timestamp", "Qty@type"] {
            let record = Record::new("p1", "r1").with(name, "other");
            assert!(
                matches!(encode_record(&record), Err(BackupError::Serialization(_))),
                "{} should not encode",
                name
            );
        }
    }

    #[test]
    fn test_orphan_discriminators_rejected() {
        let orphan = r#"{"PartitionKey":"p","RowKey":"r","Qty@type":"String"}"#;
        assert!(matches!(decode_line(orphan), Err(BackupError::Serialization(_))));

        let reserved = r#"{"PartitionKey":"p","RowKey":"r","RowKey@type":"String"}"#;
        assert!(decode_line(reserved).is_err());

        let stacked = r#"{"PartitionKey":"p","RowKey":"r","A":"x","A@type":"String","A@type@type":"String"}"#;
        assert!(decode_line(stacked).is_err());

        let paired = r#"{"PartitionKey":"p","RowKey":"r","Qty":"5","Qty@type":"Int64"}"#;
        assert_eq!(
            decode_line(paired).unwrap().get("Qty"),
            Some(&PropertyValue::Int64(5))
        );
    }

    fn datetime() -> impl Strategy<Value = DateTime<Utc>> {
        // Years 1 through 9999
        (-62_135_596_800i64..253_402_300_799, 0u32..1_000_000_000)
            .prop_map(|(secs, nanos)| DateTime::from_timestamp(secs, nanos).unwrap())
    }

    fn property_name() -> impl Strategy<Value = String> {
        "[A-Za-z_][A-Za-z0-9_@é]{0,15}"
            .prop_filter("collides with a key field or discriminator", |name| {
                check_property_name(name).is_ok()
            })
    }

    fn property_value() -> impl Strategy<Value = PropertyValue> {
        prop_oneof![
            "\\PC{0,32}".prop_map(PropertyValue::String),
            any::<i32>().prop_map(PropertyValue::Int32),
            prop_oneof![Just(i64::MIN), Just(i64::MAX), any::<i64>()].prop_map(PropertyValue::Int64),
            prop_oneof![
                Just(f64::INFINITY),
                Just(f64::NEG_INFINITY),
                Just(f64::MIN_POSITIVE),
                Just(f64::MAX),
                any::<f64>().prop_filter("NaN never compares equal", |v| !v.is_nan()),
            ]
            .prop_map(PropertyValue::Double),
            any::<bool>().prop_map(PropertyValue::Boolean),
            datetime().prop_map(PropertyValue::DateTime),
            any::<[u8; 16]>().prop_map(|bytes| PropertyValue::Guid(Uuid::from_bytes(bytes))),
            prop_oneof![
                Just(Vec::new()),
                proptest::collection::vec(any::<u8>(), 0..4096),
            ]
            .prop_map(PropertyValue::Binary),
        ]
    }

    fn record() -> impl Strategy<Value = Record> {
        (
            "\\PC{0,24}",
            "\\PC{0,24}",
            proptest::option::of(datetime()),
            proptest::collection::btree_map(property_name(), property_value(), 0..8),
        )
            .prop_map(|(partition_key, row_key, timestamp, properties)| Record {
                partition_key,
                row_key,
                timestamp,
                properties,
            })
    }

    proptest! {
        #[test]
        fn prop_decode_inverts_encode(record in record()) {
            let line = encode_record(&record).unwrap();
            prop_assert!(!line.contains('\n'));
            prop_assert_eq!(decode_line(&line).unwrap(), record);
        }

        #[test]
        fn prop_colliding_names_never_encode(
            record in record(),
            name in prop_oneof![
                Just("PartitionKey".to_string()),
                Just("RowKey".to_string()),
                Just("Timestamp".to_string()),
                "[A-Za-z]{0,8}@type",
            ],
        ) {
            let record = record.with(name, "shadow");
            prop_assert!(encode_record(&record).is_err());
        }
    }
}

//! Coerce validated wire values (`serde_json::Value`) into typed PostgreSQL binds.

use crate::error::AppError;
use crate::schema::{ColumnDescriptor, LogicalType, TableDescriptor};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde_json::Value;
use sqlx::encode::{Encode, IsNull};
use sqlx::postgres::{PgTypeInfo, Postgres};
use sqlx::{Database, Type};

/// A value that can be bound to a PostgreSQL query. Each variant declares its own
/// wire type, and placeholders carry a cast to the column's native type.
#[derive(Clone, Debug, PartialEq)]
pub enum BindValue {
    Null,
    Bool(bool),
    I64(i64),
    F64(f64),
    Text(String),
    Uuid(uuid::Uuid),
    Json(Value),
    /// Always UTC.
    Timestamptz(DateTime<Utc>),
    /// UTC wall-clock time for `timestamp without time zone` columns.
    Timestamp(NaiveDateTime),
    Date(NaiveDate),
}

/// Largest integer an f64 represents exactly.
const F64_EXACT_INT: u64 = 1 << 53;

/// Coerce `value` for `column` of `table`, rejecting literals that would not
/// survive the trip without loss.
pub fn coerce(
    table: &TableDescriptor,
    column: &ColumnDescriptor,
    value: &Value,
) -> Result<BindValue, AppError> {
    let mismatch = || AppError::TypeMismatch {
        table: table.name.clone(),
        column: column.name.clone(),
        expected: column.logical_type.to_string(),
    };
    if value.is_null() {
        return Ok(BindValue::Null);
    }
    Ok(match column.logical_type {
        LogicalType::Document => BindValue::Json(value.clone()),
        LogicalType::Text => {
            let s = value.as_str().ok_or_else(mismatch)?;
            if column.native_type == "uuid" {
                BindValue::Uuid(uuid::Uuid::parse_str(s).map_err(|_| mismatch())?)
            } else {
                BindValue::Text(s.to_string())
            }
        }
        LogicalType::Integer | LogicalType::Serial => {
            BindValue::I64(value.as_i64().ok_or_else(mismatch)?)
        }
        LogicalType::Float => {
            let Value::Number(n) = value else {
                return Err(mismatch());
            };
            if column.native_type == "numeric" {
                // Exact decimal text; the `::numeric` cast parses it without an f64 detour.
                return Ok(BindValue::Text(n.to_string()));
            }
            if let Some(i) = n.as_i64() {
                if i.unsigned_abs() > F64_EXACT_INT {
                    return Err(mismatch());
                }
            }
            BindValue::F64(n.as_f64().ok_or_else(mismatch)?)
        }
        LogicalType::Boolean => BindValue::Bool(value.as_bool().ok_or_else(mismatch)?),
        LogicalType::Timestamp => {
            let ts = value.as_str().and_then(parse_timestamp).ok_or_else(mismatch)?;
            match column.native_type.as_str() {
                "timestamp" => BindValue::Timestamp(ts.naive_utc()),
                "date" => {
                    if ts.time() != NaiveTime::MIN {
                        return Err(mismatch());
                    }
                    BindValue::Date(ts.date_naive())
                }
                _ => BindValue::Timestamptz(ts),
            }
        }
    })
}

/// Parse RFC 3339, or a zone-less date/time taken as UTC, and normalize to UTC.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .map(|d| d.and_time(NaiveTime::MIN).and_utc())
}

impl<'q> Encode<'q, Postgres> for BindValue {
    fn encode_by_ref(
        &self,
        buf: &mut <Postgres as Database>::ArgumentBuffer<'q>,
    ) -> Result<IsNull, Box<dyn std::error::Error + Send + Sync>> {
        match self {
            BindValue::Null => Ok(IsNull::Yes),
            BindValue::Bool(b) => <bool as Encode<Postgres>>::encode_by_ref(b, buf),
            BindValue::I64(n) => <i64 as Encode<Postgres>>::encode_by_ref(n, buf),
            BindValue::F64(n) => <f64 as Encode<Postgres>>::encode_by_ref(n, buf),
            BindValue::Text(s) => <String as Encode<Postgres>>::encode_by_ref(s, buf),
            BindValue::Uuid(u) => <uuid::Uuid as Encode<Postgres>>::encode_by_ref(u, buf),
            BindValue::Json(v) => <Value as Encode<Postgres>>::encode_by_ref(v, buf),
            BindValue::Timestamptz(t) => <DateTime<Utc> as Encode<Postgres>>::encode_by_ref(t, buf),
            BindValue::Timestamp(t) => <NaiveDateTime as Encode<Postgres>>::encode_by_ref(t, buf),
            BindValue::Date(d) => <NaiveDate as Encode<Postgres>>::encode_by_ref(d, buf),
        }
    }

    fn produces(&self) -> Option<PgTypeInfo> {
        Some(match self {
            BindValue::Null | BindValue::Text(_) => <String as Type<Postgres>>::type_info(),
            BindValue::Bool(_) => <bool as Type<Postgres>>::type_info(),
            BindValue::I64(_) => <i64 as Type<Postgres>>::type_info(),
            BindValue::F64(_) => <f64 as Type<Postgres>>::type_info(),
            BindValue::Uuid(_) => <uuid::Uuid as Type<Postgres>>::type_info(),
            BindValue::Json(_) => <Value as Type<Postgres>>::type_info(),
            BindValue::Timestamptz(_) => <DateTime<Utc> as Type<Postgres>>::type_info(),
            BindValue::Timestamp(_) => <NaiveDateTime as Type<Postgres>>::type_info(),
            BindValue::Date(_) => <NaiveDate as Type<Postgres>>::type_info(),
        })
    }
}

impl Type<Postgres> for BindValue {
    fn type_info() -> PgTypeInfo {
        <String as Type<Postgres>>::type_info()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn col(name: &str, logical_type: LogicalType, native: &str) -> ColumnDescriptor {
        ColumnDescriptor {
            name: name.into(),
            logical_type,
            native_type: native.into(),
            native_schema: None,
            nullable: true,
            has_default: false,
        }
    }

    fn table(columns: Vec<ColumnDescriptor>) -> TableDescriptor {
        TableDescriptor {
            schema: "public".into(),
            name: "event_log".into(),
            columns,
            primary_key: vec![],
            foreign_keys: vec![],
            indexes: vec![],
        }
    }

    #[test]
    fn timestamps_are_normalized_to_utc() {
        let c = col("ts", LogicalType::Timestamp, "timestamptz");
        let t = table(vec![c.clone()]);
        let v = coerce(&t, &c, &json!("2024-04-10T14:00:00+02:00")).unwrap();
        let expected = DateTime::parse_from_rfc3339("2024-04-10T12:00:00Z").unwrap().with_timezone(&Utc);
        assert_eq!(v, BindValue::Timestamptz(expected));
    }

    #[test]
    fn naive_timestamp_column_gets_utc_wall_clock() {
        let c = col("ts", LogicalType::Timestamp, "timestamp");
        let t = table(vec![c.clone()]);
        let v = coerce(&t, &c, &json!("2024-04-10T14:00:00+02:00")).unwrap();
        let BindValue::Timestamp(naive) = v else { panic!("expected naive timestamp") };
        assert_eq!(naive.to_string(), "2024-04-10 12:00:00");
    }

    #[test]
    fn date_column_rejects_time_component() {
        let c = col("day", LogicalType::Timestamp, "date");
        let t = table(vec![c.clone()]);
        assert!(matches!(coerce(&t, &c, &json!("2024-04-10")), Ok(BindValue::Date(_))));
        assert!(matches!(
            coerce(&t, &c, &json!("2024-04-10T10:30:00Z")),
            Err(AppError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn integers_reject_fractions_and_strings() {
        let c = col("event_id", LogicalType::Integer, "int4");
        let t = table(vec![c.clone()]);
        assert_eq!(coerce(&t, &c, &json!(42)).unwrap(), BindValue::I64(42));
        assert!(coerce(&t, &c, &json!(4.5)).is_err());
        assert!(coerce(&t, &c, &json!("42")).is_err());
    }

    #[test]
    fn floats_reject_integers_beyond_exact_range() {
        let c = col("weight", LogicalType::Float, "float8");
        let t = table(vec![c.clone()]);
        assert_eq!(coerce(&t, &c, &json!(3)).unwrap(), BindValue::F64(3.0));
        assert!(coerce(&t, &c, &json!(i64::MAX)).is_err());
    }

    #[test]
    fn documents_accept_any_json() {
        let c = col("event_data", LogicalType::Document, "jsonb");
        let t = table(vec![c.clone()]);
        let doc = json!({"reps": [1, 2, 3], "note": "ok"});
        assert_eq!(coerce(&t, &c, &doc).unwrap(), BindValue::Json(doc));
    }

    #[test]
    fn uuid_text_columns_validate() {
        let c = col("device_id", LogicalType::Text, "uuid");
        let t = table(vec![c.clone()]);
        assert!(matches!(
            coerce(&t, &c, &json!("67e55044-10b1-426f-9247-bb680e5fe0c8")),
            Ok(BindValue::Uuid(_))
        ));
        let err = coerce(&t, &c, &json!("not-a-uuid")).unwrap_err();
        assert!(matches!(err, AppError::TypeMismatch { ref column, .. } if column == "device_id"));
    }

    #[test]
    fn null_binds_as_null() {
        let c = col("app_version", LogicalType::Text, "text");
        let t = table(vec![c.clone()]);
        assert_eq!(coerce(&t, &c, &Value::Null).unwrap(), BindValue::Null);
    }

    #[test]
    fn numeric_keeps_every_digit_of_the_wire_number() {
        let c = col("amount", LogicalType::Float, "numeric");
        let t = table(vec![c.clone()]);
        let v: Value = serde_json::from_str("1.23456789012345678901").unwrap();
        assert_eq!(coerce(&t, &c, &v).unwrap(), BindValue::Text("1.23456789012345678901".into()));
        let big: Value = serde_json::from_str("123456789012345678901234567890").unwrap();
        assert_eq!(
            coerce(&t, &c, &big).unwrap(),
            BindValue::Text("123456789012345678901234567890".into())
        );
        assert!(coerce(&t, &c, &json!("1.5")).is_err());
    }
}

//! Conversion between DuckDB values and wire values.

use bytes::Bytes;
use duckdb::arrow::datatypes::{DataType, TimeUnit as ArrowTimeUnit};
use duckdb::types::{TimeUnit, Value as DuckValue};
use shoal_protocol::{Value, ValueType};

use crate::error::ServerError;

/// Convert a value read from DuckDB into its wire representation.
pub fn from_duckdb(value: DuckValue) -> Value {
    match value {
        DuckValue::Null => Value::Null,
        DuckValue::Boolean(v) => Value::Boolean(v),
        DuckValue::TinyInt(v) => Value::Byte(v),
        DuckValue::SmallInt(v) => Value::Short(v),
        DuckValue::Int(v) => Value::Int(v),
        DuckValue::BigInt(v) => Value::Long(v),
        DuckValue::HugeInt(v) => Value::Decimal(v.to_string()),
        DuckValue::UTinyInt(v) => Value::Short(i16::from(v)),
        DuckValue::USmallInt(v) => Value::Int(i32::from(v)),
        DuckValue::UInt(v) => Value::Long(i64::from(v)),
        DuckValue::UBigInt(v) => match i64::try_from(v) {
            Ok(v) => Value::Long(v),
            Err(_) => Value::Decimal(v.to_string()),
        },
        DuckValue::Float(v) => Value::Float(v),
        DuckValue::Double(v) => Value::Double(v),
        DuckValue::Decimal(v) => Value::Decimal(v.to_string()),
        DuckValue::Timestamp(unit, v) => Value::Timestamp(to_micros(unit, v)),
        DuckValue::Text(v) => Value::String(v),
        DuckValue::Blob(v) => Value::Bytes(Bytes::from(v)),
        DuckValue::Date32(v) => Value::Date(v),
        DuckValue::Time64(unit, v) => Value::Time(to_micros(unit, v)),
        DuckValue::Enum(v) => Value::String(v),
        other => Value::String(format!("{other:?}")),
    }
}

/// Convert a wire parameter into a DuckDB bind value.
pub fn to_duckdb(value: &Value) -> Result<DuckValue, ServerError> {
    Ok(match value {
        Value::Null => DuckValue::Null,
        Value::Boolean(v) => DuckValue::Boolean(*v),
        Value::Byte(v) => DuckValue::TinyInt(*v),
        Value::Short(v) => DuckValue::SmallInt(*v),
        Value::Int(v) => DuckValue::Int(*v),
        Value::Long(v) => DuckValue::BigInt(*v),
        Value::Decimal(v) => DuckValue::Text(v.clone()),
        Value::Double(v) => DuckValue::Double(*v),
        Value::Float(v) => DuckValue::Float(*v),
        Value::Time(v) => DuckValue::Time64(TimeUnit::Microsecond, *v),
        Value::Date(v) => DuckValue::Date32(*v),
        Value::Timestamp(v) => DuckValue::Timestamp(TimeUnit::Microsecond, *v),
        Value::Bytes(v) => DuckValue::Blob(v.to_vec()),
        Value::String(v) => DuckValue::Text(v.clone()),
        Value::Lob { .. } => {
            return Err(ServerError::Unsupported(
                "LOB references cannot be bound as parameters".to_string(),
            ))
        }
    })
}

fn to_micros(unit: TimeUnit, value: i64) -> i64 {
    match unit {
        TimeUnit::Second => value.saturating_mul(1_000_000),
        TimeUnit::Millisecond => value.saturating_mul(1_000),
        TimeUnit::Microsecond => value,
        TimeUnit::Nanosecond => value / 1_000,
    }
}

/// Wire type, precision and scale for a DuckDB result column.
pub fn column_type(data_type: &DataType) -> (ValueType, i64, i32) {
    match data_type {
        DataType::Null => (ValueType::Null, 0, 0),
        DataType::Boolean => (ValueType::Boolean, 1, 0),
        DataType::Int8 => (ValueType::Byte, 3, 0),
        DataType::Int16 | DataType::UInt8 => (ValueType::Short, 5, 0),
        DataType::Int32 | DataType::UInt16 => (ValueType::Int, 10, 0),
        DataType::Int64 | DataType::UInt32 => (ValueType::Long, 19, 0),
        DataType::UInt64 => (ValueType::Decimal, 20, 0),
        DataType::Decimal128(precision, scale) | DataType::Decimal256(precision, scale) => {
            (ValueType::Decimal, i64::from(*precision), i32::from(*scale))
        }
        DataType::Float16 | DataType::Float32 => (ValueType::Float, 7, 0),
        DataType::Float64 => (ValueType::Double, 17, 0),
        DataType::Date32 | DataType::Date64 => (ValueType::Date, 10, 0),
        DataType::Time32(_) | DataType::Time64(_) => (ValueType::Time, 15, 6),
        DataType::Timestamp(unit, _) => {
            let scale = match unit {
                ArrowTimeUnit::Second => 0,
                ArrowTimeUnit::Millisecond => 3,
                ArrowTimeUnit::Microsecond | ArrowTimeUnit::Nanosecond => 6,
            };
            (ValueType::Timestamp, 26, scale)
        }
        DataType::Binary | DataType::LargeBinary | DataType::FixedSizeBinary(_) => {
            (ValueType::Bytes, i64::from(i32::MAX), 0)
        }
        _ => (ValueType::String, i64::from(i32::MAX), 0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integers_widen_without_loss() {
        assert_eq!(from_duckdb(DuckValue::UTinyInt(200)), Value::Short(200));
        assert_eq!(from_duckdb(DuckValue::UInt(u32::MAX)), Value::Long(i64::from(u32::MAX)));
        assert_eq!(
            from_duckdb(DuckValue::UBigInt(u64::MAX)),
            Value::Decimal(u64::MAX.to_string())
        );
    }

    #[test]
    fn temporal_values_normalize_to_micros() {
        assert_eq!(
            from_duckdb(DuckValue::Timestamp(TimeUnit::Millisecond, 1_500)),
            Value::Timestamp(1_500_000)
        );
        assert_eq!(
            from_duckdb(DuckValue::Time64(TimeUnit::Nanosecond, 5_000)),
            Value::Time(5)
        );
    }

    #[test]
    fn parameters_convert_back() -> anyhow::Result<()> {
        assert_eq!(to_duckdb(&Value::Int(7))?, DuckValue::Int(7));
        assert_eq!(
            to_duckdb(&Value::String("x".to_string()))?,
            DuckValue::Text("x".to_string())
        );
        let lob = Value::Lob {
            id: 1,
            hmac: Bytes::new(),
            length: 1,
        };
        assert!(to_duckdb(&lob).is_err());
        Ok(())
    }

    #[test]
    fn decimal_columns_keep_precision_and_scale() {
        let (kind, precision, scale) = column_type(&DataType::Decimal128(18, 3));
        assert_eq!(kind, ValueType::Decimal);
        assert_eq!(precision, 18);
        assert_eq!(scale, 3);
        assert_eq!(column_type(&DataType::Utf8).0, ValueType::String);
    }
}

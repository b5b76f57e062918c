//! Typed values: an `i32` type tag followed by the body.

use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Duration, NaiveDate, NaiveTime};

use crate::error::ProtocolError;
use crate::reader::PacketReader;
use crate::writer::PacketWriter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ValueType {
    Null = 0,
    Boolean = 1,
    Byte = 2,
    Short = 3,
    Int = 4,
    Long = 5,
    Decimal = 6,
    Double = 7,
    Float = 8,
    Time = 9,
    Date = 10,
    Timestamp = 11,
    Bytes = 12,
    String = 13,
    Lob = 15,
}

/// Type tag reported for parameters whose type the engine cannot tell up front.
pub const UNKNOWN_TYPE: i32 = -1;

impl TryFrom<i32> for ValueType {
    type Error = ProtocolError;

    fn try_from(tag: i32) -> Result<Self, ProtocolError> {
        Ok(match tag {
            0 => ValueType::Null,
            1 => ValueType::Boolean,
            2 => ValueType::Byte,
            3 => ValueType::Short,
            4 => ValueType::Int,
            5 => ValueType::Long,
            6 => ValueType::Decimal,
            7 => ValueType::Double,
            8 => ValueType::Float,
            9 => ValueType::Time,
            10 => ValueType::Date,
            11 => ValueType::Timestamp,
            12 => ValueType::Bytes,
            13 => ValueType::String,
            15 => ValueType::Lob,
            other => return Err(ProtocolError::UnknownValueType(other)),
        })
    }
}

/// A single SQL value as carried on the wire.
///
/// Temporal values are held in microseconds (time of day, timestamp since the
/// epoch) and days since the epoch (date). Protocol version 1 transmits
/// timestamps in milliseconds.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Boolean(bool),
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    Decimal(String),
    Double(f64),
    Float(f32),
    Time(i64),
    Date(i32),
    Timestamp(i64),
    Bytes(Bytes),
    String(String),
    Lob { id: i64, hmac: Bytes, length: i64 },
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Null => ValueType::Null,
            Value::Boolean(_) => ValueType::Boolean,
            Value::Byte(_) => ValueType::Byte,
            Value::Short(_) => ValueType::Short,
            Value::Int(_) => ValueType::Int,
            Value::Long(_) => ValueType::Long,
            Value::Decimal(_) => ValueType::Decimal,
            Value::Double(_) => ValueType::Double,
            Value::Float(_) => ValueType::Float,
            Value::Time(_) => ValueType::Time,
            Value::Date(_) => ValueType::Date,
            Value::Timestamp(_) => ValueType::Timestamp,
            Value::Bytes(_) => ValueType::Bytes,
            Value::String(_) => ValueType::String,
            Value::Lob { .. } => ValueType::Lob,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Integral view used by callers that only care about counts and keys.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Byte(v) => Some(i64::from(*v)),
            Value::Short(v) => Some(i64::from(*v)),
            Value::Int(v) => Some(i64::from(*v)),
            Value::Long(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(v) | Value::Decimal(v) => Some(v),
            _ => None,
        }
    }

    pub(crate) fn write(&self, out: &mut PacketWriter) {
        out.write_i32(self.value_type() as i32);
        match self {
            Value::Null => {}
            Value::Boolean(v) => {
                out.write_bool(*v);
            }
            Value::Byte(v) => {
                out.write_i8(*v);
            }
            Value::Short(v) => {
                out.write_i16(*v);
            }
            Value::Int(v) => {
                out.write_i32(*v);
            }
            Value::Long(v) | Value::Time(v) => {
                out.write_i64(*v);
            }
            Value::Decimal(v) | Value::String(v) => {
                out.write_str(v);
            }
            Value::Double(v) => {
                out.write_f64(*v);
            }
            Value::Float(v) => {
                out.write_f32(*v);
            }
            Value::Date(v) => {
                out.write_i32(*v);
            }
            Value::Timestamp(micros) => {
                if out.version() < 2 {
                    out.write_i64(micros.div_euclid(1_000));
                } else {
                    out.write_i64(*micros);
                }
            }
            Value::Bytes(v) => {
                out.write_bytes(Some(v.as_ref()));
            }
            Value::Lob { id, hmac, length } => {
                out.write_i64(*id).write_bytes(Some(hmac.as_ref())).write_i64(*length);
            }
        }
    }

    pub(crate) fn read(input: &mut PacketReader) -> Result<Value, ProtocolError> {
        let tag = ValueType::try_from(input.read_i32()?)?;
        Ok(match tag {
            ValueType::Null => Value::Null,
            ValueType::Boolean => Value::Boolean(input.read_bool()?),
            ValueType::Byte => Value::Byte(input.read_i8()?),
            ValueType::Short => Value::Short(input.read_i16()?),
            ValueType::Int => Value::Int(input.read_i32()?),
            ValueType::Long => Value::Long(input.read_i64()?),
            ValueType::Decimal => Value::Decimal(input.read_str()?),
            ValueType::Double => Value::Double(input.read_f64()?),
            ValueType::Float => Value::Float(input.read_f32()?),
            ValueType::Time => Value::Time(input.read_i64()?),
            ValueType::Date => Value::Date(input.read_i32()?),
            ValueType::Timestamp => {
                let raw = input.read_i64()?;
                if input.version() < 2 {
                    Value::Timestamp(raw.saturating_mul(1_000))
                } else {
                    Value::Timestamp(raw)
                }
            }
            ValueType::Bytes => Value::Bytes(input.read_bytes()?.unwrap_or_default()),
            ValueType::String => match input.read_string()? {
                Some(s) => Value::String(s),
                None => Value::Null,
            },
            ValueType::Lob => {
                let id = input.read_i64()?;
                let hmac = input.read_bytes()?.unwrap_or_default();
                let length = input.read_i64()?;
                Value::Lob { id, hmac, length }
            }
        })
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Boolean(v) => write!(f, "{v}"),
            Value::Byte(v) => write!(f, "{v}"),
            Value::Short(v) => write!(f, "{v}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Long(v) => write!(f, "{v}"),
            Value::Decimal(v) | Value::String(v) => write!(f, "{v}"),
            Value::Double(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Time(micros) => {
                let midnight = NaiveTime::MIN;
                let time = midnight + Duration::microseconds(*micros);
                write!(f, "{time}")
            }
            Value::Date(days) => match NaiveDate::from_yo_opt(1970, 1)
                .and_then(|epoch| epoch.checked_add_signed(Duration::days(i64::from(*days))))
            {
                Some(date) => write!(f, "{date}"),
                None => write!(f, "date({days})"),
            },
            Value::Timestamp(micros) => match DateTime::from_timestamp_micros(*micros) {
                Some(ts) => write!(f, "{}", ts.naive_utc()),
                None => write!(f, "timestamp({micros})"),
            },
            Value::Bytes(v) => {
                for byte in v.iter() {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
            Value::Lob { id, length, .. } => write!(f, "lob(id={id}, length={length})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(value: &Value, version: i32) -> anyhow::Result<Value> {
        let mut writer = PacketWriter::with_version(version);
        writer.write_value(value);
        let mut reader = PacketReader::new(writer.finish(), version);
        let decoded = reader.read_value()?;
        assert_eq!(reader.remaining(), 0);
        Ok(decoded)
    }

    #[test]
    fn timestamp_precision_depends_on_protocol_version() -> anyhow::Result<()> {
        let ts = Value::Timestamp(1_700_000_000_123_456);
        assert_eq!(round_trip(&ts, 2)?, ts);
        assert_eq!(
            round_trip(&ts, 1)?,
            Value::Timestamp(1_700_000_000_123_000)
        );
        Ok(())
    }

    #[test]
    fn lob_reference_keeps_hmac_and_length() -> anyhow::Result<()> {
        let lob = Value::Lob {
            id: 9,
            hmac: Bytes::from_static(&[1, 2, 3, 4]),
            length: 70_000,
        };
        assert_eq!(round_trip(&lob, 2)?, lob);
        Ok(())
    }

    #[test]
    fn unknown_tag_is_an_error() {
        let mut writer = PacketWriter::with_version(2);
        writer.write_i32(14);
        let mut reader = PacketReader::new(writer.finish(), 2);
        assert!(matches!(
            reader.read_value(),
            Err(ProtocolError::UnknownValueType(14))
        ));
    }

    #[test]
    fn display_renders_temporal_values() {
        assert_eq!(Value::Date(0).to_string(), "1970-01-01");
        assert_eq!(Value::Date(19_723).to_string(), "2024-01-01");
        assert_eq!(Value::Time(3_600_000_000).to_string(), "01:00:00");
        assert_eq!(Value::Timestamp(0).to_string(), "1970-01-01 00:00:00");
        assert_eq!(
            Value::Bytes(Bytes::from_static(&[0xde, 0xad])).to_string(),
            "dead"
        );
    }
}

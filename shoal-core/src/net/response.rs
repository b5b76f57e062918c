//! Response body builders shared by the opcode handlers.

use bytes::Bytes;
use shoal_protocol::{PacketWriter, Status, Value};

use crate::engine::{ColumnMeta, LocalResult};
use crate::error::ServerError;
use crate::storage::lob::LobStore;

/// Where oversized BLOBs in a row are parked before being sent as LOB references.
pub struct LobSink<'a> {
    pub store: &'a LobStore,
    pub owner: u64,
    pub inline_limit: usize,
}

impl LobSink<'_> {
    fn convert(&self, value: &Value) -> Value {
        match value {
            Value::Bytes(data) if data.len() > self.inline_limit => {
                self.store.store(self.owner, data.clone())
            }
            other => other.clone(),
        }
    }
}

pub fn ok(version: i32, packet_id: i32) -> PacketWriter {
    PacketWriter::response(version, packet_id, Status::Ok)
}

pub fn ok_empty(version: i32, packet_id: i32) -> Bytes {
    ok(version, packet_id).finish()
}

pub fn error(version: i32, packet_id: i32, err: &ServerError) -> Bytes {
    let mut out = PacketWriter::response(version, packet_id, Status::Error);
    out.write_i32(err.code())
        .write_str(&err.sql_state())
        .write_str(&err.to_string())
        .write_str(err.kind())
        .write_str(&format!("{err:?}"));
    out.finish()
}

pub fn write_columns(out: &mut PacketWriter, columns: &[ColumnMeta]) {
    for column in columns {
        out.write_str(&column.alias)
            .write_str(&column.schema_name)
            .write_str(&column.table_name)
            .write_str(&column.column_name)
            .write_i32(column.value_type)
            .write_i64(column.precision)
            .write_i32(column.scale)
            .write_i32(column.display_size)
            .write_bool(column.auto_increment)
            .write_i32(column.nullable);
    }
}

/// Column count, row count and column metadata.
pub fn write_result_header(out: &mut PacketWriter, result: &LocalResult) {
    out.write_i32(result.column_count() as i32)
        .write_i32(result.row_count());
    write_columns(out, result.columns());
}

/// Up to `count` rows, each prefixed with `true`, then a terminating `false`.
pub fn write_rows(out: &mut PacketWriter, result: &mut LocalResult, count: usize, lobs: &LobSink<'_>) -> usize {
    let rows = result.take_rows(count);
    for row in &rows {
        out.write_bool(true);
        for value in row {
            out.write_value(&lobs.convert(value));
        }
    }
    out.write_bool(false);
    rows.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use shoal_protocol::{PacketReader, PROTOCOL_VERSION_CURRENT};

    #[test]
    fn error_body_carries_code_state_message_and_kind() -> anyhow::Result<()> {
        let frame = error(PROTOCOL_VERSION_CURRENT, 9, &ServerError::SessionNotFound);
        let mut reader = PacketReader::new(frame, PROTOCOL_VERSION_CURRENT);
        assert_eq!(reader.read_i32()?, 9);
        assert_eq!(reader.read_i32()?, Status::Error as i32);
        assert_eq!(reader.read_i32()?, ServerError::SessionNotFound.code());
        assert_eq!(reader.read_str()?, ServerError::SessionNotFound.sql_state());
        assert_eq!(reader.read_str()?, "session not found");
        assert_eq!(reader.read_str()?, "SessionNotFound");
        Ok(())
    }

    #[test]
    fn large_blobs_become_lob_references() -> anyhow::Result<()> {
        let store = LobStore::new();
        let sink = LobSink {
            store: &store,
            owner: 4,
            inline_limit: 2,
        };
        let mut result = LocalResult::new(
            Vec::new(),
            vec![
                vec![Value::Bytes(Bytes::from_static(b"ab"))],
                vec![Value::Bytes(Bytes::from_static(b"abcdef"))],
            ],
            false,
        );
        let mut out = ok(PROTOCOL_VERSION_CURRENT, 1);
        assert_eq!(write_rows(&mut out, &mut result, 10, &sink), 2);
        let mut reader = PacketReader::new(out.finish(), PROTOCOL_VERSION_CURRENT);
        reader.read_i32()?;
        reader.read_i32()?;
        assert!(reader.read_bool()?);
        assert_eq!(reader.read_value()?, Value::Bytes(Bytes::from_static(b"ab")));
        assert!(reader.read_bool()?);
        assert!(matches!(reader.read_value()?, Value::Lob { length: 6, .. }));
        assert!(!reader.read_bool()?);
        assert_eq!(store.len(), 1);
        Ok(())
    }
}

use bytes::{BufMut, Bytes, BytesMut};

use crate::opcode::Opcode;
use crate::page::PageKey;
use crate::status::Status;
use crate::value::Value;

/// Builds one frame body.
#[derive(Debug)]
pub struct PacketWriter {
    buf: BytesMut,
    version: i32,
}

impl PacketWriter {
    pub fn with_version(version: i32) -> Self {
        Self {
            buf: BytesMut::with_capacity(64),
            version,
        }
    }

    /// Starts a request frame.
    pub fn request(version: i32, packet_id: i32, opcode: Opcode, session_id: i32) -> Self {
        let mut writer = Self::with_version(version);
        writer
            .write_i32(packet_id)
            .write_i32(opcode.code())
            .write_i32(session_id);
        writer
    }

    /// Starts a response frame.
    pub fn response(version: i32, packet_id: i32, status: Status) -> Self {
        let mut writer = Self::with_version(version);
        writer.write_i32(packet_id).write_i32(status as i32);
        writer
    }

    pub fn version(&self) -> i32 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn write_u8(&mut self, v: u8) -> &mut Self {
        self.buf.put_u8(v);
        self
    }

    pub fn write_bool(&mut self, v: bool) -> &mut Self {
        self.write_u8(u8::from(v))
    }

    pub fn write_i8(&mut self, v: i8) -> &mut Self {
        self.buf.put_i8(v);
        self
    }

    pub fn write_i16(&mut self, v: i16) -> &mut Self {
        self.buf.put_i16(v);
        self
    }

    pub fn write_i32(&mut self, v: i32) -> &mut Self {
        self.buf.put_i32(v);
        self
    }

    pub fn write_i64(&mut self, v: i64) -> &mut Self {
        self.buf.put_i64(v);
        self
    }

    pub fn write_f32(&mut self, v: f32) -> &mut Self {
        self.buf.put_f32(v);
        self
    }

    pub fn write_f64(&mut self, v: f64) -> &mut Self {
        self.buf.put_f64(v);
        self
    }

    pub fn write_bytes(&mut self, v: Option<&[u8]>) -> &mut Self {
        match v {
            Some(bytes) => {
                self.buf.put_i32(bytes.len() as i32);
                self.buf.extend_from_slice(bytes);
            }
            None => self.buf.put_i32(-1),
        }
        self
    }

    pub fn write_string(&mut self, v: Option<&str>) -> &mut Self {
        self.write_bytes(v.map(str::as_bytes))
    }

    pub fn write_str(&mut self, v: &str) -> &mut Self {
        self.write_string(Some(v))
    }

    pub fn write_value(&mut self, v: &Value) -> &mut Self {
        v.write(self);
        self
    }

    pub fn write_values(&mut self, values: &[Value]) -> &mut Self {
        self.write_i32(values.len() as i32);
        for value in values {
            self.write_value(value);
        }
        self
    }

    pub fn write_page_key(&mut self, key: &PageKey) -> &mut Self {
        key.write(self);
        self
    }

    pub fn write_page_keys(&mut self, keys: Option<&[PageKey]>) -> &mut Self {
        match keys {
            Some(keys) => {
                self.write_i32(keys.len() as i32);
                for key in keys {
                    self.write_page_key(key);
                }
            }
            None => {
                self.write_i32(0);
            }
        }
        self
    }

    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

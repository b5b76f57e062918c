use bytes::{Buf, Bytes};

use crate::error::ProtocolError;
use crate::page::PageKey;
use crate::value::Value;
use crate::PROTOCOL_VERSION_CURRENT;

/// Upper bound on slots reserved up front for a counted list.
const MAX_PREALLOCATED: usize = 1024;

/// Cursor over one frame body.
///
/// The reader carries the negotiated protocol version because value decoding
/// differs between versions.
#[derive(Debug, Clone)]
pub struct PacketReader {
    buf: Bytes,
    version: i32,
}

impl PacketReader {
    pub fn new(buf: Bytes, version: i32) -> Self {
        Self { buf, version }
    }

    /// Reader for frames decoded before a version has been negotiated.
    pub fn unversioned(buf: Bytes) -> Self {
        Self::new(buf, PROTOCOL_VERSION_CURRENT)
    }

    pub fn version(&self) -> i32 {
        self.version
    }

    pub fn set_version(&mut self, version: i32) {
        self.version = version;
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn ensure(&self, len: usize) -> Result<(), ProtocolError> {
        if self.buf.remaining() < len {
            return Err(ProtocolError::Truncated {
                needed: len - self.buf.remaining(),
            });
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8, ProtocolError> {
        self.ensure(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn read_bool(&mut self) -> Result<bool, ProtocolError> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_i8(&mut self) -> Result<i8, ProtocolError> {
        self.ensure(1)?;
        Ok(self.buf.get_i8())
    }

    pub fn read_i16(&mut self) -> Result<i16, ProtocolError> {
        self.ensure(2)?;
        Ok(self.buf.get_i16())
    }

    pub fn read_i32(&mut self) -> Result<i32, ProtocolError> {
        self.ensure(4)?;
        Ok(self.buf.get_i32())
    }

    pub fn read_i64(&mut self) -> Result<i64, ProtocolError> {
        self.ensure(8)?;
        Ok(self.buf.get_i64())
    }

    pub fn read_f32(&mut self) -> Result<f32, ProtocolError> {
        self.ensure(4)?;
        Ok(self.buf.get_f32())
    }

    pub fn read_f64(&mut self) -> Result<f64, ProtocolError> {
        self.ensure(8)?;
        Ok(self.buf.get_f64())
    }

    /// Length-prefixed bytes; a length of -1 is null.
    pub fn read_bytes(&mut self) -> Result<Option<Bytes>, ProtocolError> {
        let len = self.read_i32()?;
        if len == -1 {
            return Ok(None);
        }
        if len < 0 {
            return Err(ProtocolError::NegativeLength(len));
        }
        let len = len as usize;
        self.ensure(len)?;
        Ok(Some(self.buf.split_to(len)))
    }

    pub fn read_string(&mut self) -> Result<Option<String>, ProtocolError> {
        match self.read_bytes()? {
            Some(bytes) => Ok(Some(String::from_utf8(bytes.to_vec())?)),
            None => Ok(None),
        }
    }

    /// Reads a string, mapping null to the empty string.
    pub fn read_str(&mut self) -> Result<String, ProtocolError> {
        Ok(self.read_string()?.unwrap_or_default())
    }

    pub fn read_value(&mut self) -> Result<Value, ProtocolError> {
        Value::read(self)
    }

    pub fn read_values(&mut self) -> Result<Vec<Value>, ProtocolError> {
        let count = self.read_count()?;
        let mut values = Vec::with_capacity(self.capacity_hint(count));
        for _ in 0..count {
            values.push(self.read_value()?);
        }
        Ok(values)
    }

    pub fn read_page_key(&mut self) -> Result<PageKey, ProtocolError> {
        PageKey::read(self)
    }

    /// Page keys attached to queries and updates; an empty list is `None`.
    pub fn read_page_keys(&mut self) -> Result<Option<Vec<PageKey>>, ProtocolError> {
        let size = self.read_i32()?;
        if size <= 0 {
            return Ok(None);
        }
        let size = size as usize;
        self.ensure(size)?;
        let mut keys = Vec::with_capacity(self.capacity_hint(size));
        for _ in 0..size {
            keys.push(self.read_page_key()?);
        }
        Ok(Some(keys))
    }

    /// A non-negative element count.
    ///
    /// Every counted element occupies at least one byte, so a count larger than
    /// the rest of the frame is reported as truncation.
    pub fn read_count(&mut self) -> Result<usize, ProtocolError> {
        let count = self.read_i32()?;
        if count < 0 {
            return Err(ProtocolError::NegativeLength(count));
        }
        let count = count as usize;
        self.ensure(count)?;
        Ok(count)
    }

    /// Capacity to reserve for `count` elements read from this frame.
    pub fn capacity_hint(&self, count: usize) -> usize {
        count.min(self.remaining()).min(MAX_PREALLOCATED)
    }
}

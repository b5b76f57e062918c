//! Page addressing for distributed storage maps.

use bytes::Bytes;

use crate::error::ProtocolError;
use crate::reader::PacketReader;
use crate::writer::PacketWriter;

/// Identifies a leaf page by the first key it covers.
///
/// `first` marks the leftmost page of a map, whose range is open below.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageKey {
    pub key: Bytes,
    pub first: bool,
}

impl PageKey {
    pub fn new(key: impl Into<Bytes>, first: bool) -> Self {
        Self {
            key: key.into(),
            first,
        }
    }

    pub(crate) fn write(&self, out: &mut PacketWriter) {
        out.write_bytes(Some(self.key.as_ref())).write_bool(self.first);
    }

    pub(crate) fn read(input: &mut PacketReader) -> Result<Self, ProtocolError> {
        let key = input.read_bytes()?.unwrap_or_default();
        let first = input.read_bool()?;
        Ok(Self { key, first })
    }
}

/// A proposal to move a leaf page to a new set of replicas.
///
/// Competing movers are ordered by `index`; the mover with the highest index wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafPageMovePlan {
    pub index: i32,
    pub mover_host_id: String,
    pub page_key: PageKey,
    pub replication_endpoints: Vec<String>,
}

impl LeafPageMovePlan {
    pub fn new(mover_host_id: impl Into<String>, replication_endpoints: Vec<String>, page_key: PageKey) -> Self {
        Self {
            index: 0,
            mover_host_id: mover_host_id.into(),
            page_key,
            replication_endpoints,
        }
    }

    pub fn increment_index(&mut self) {
        self.index += 1;
    }

    pub fn serialize(&self, out: &mut PacketWriter) {
        out.write_i32(self.index)
            .write_str(&self.mover_host_id)
            .write_page_key(&self.page_key)
            .write_i32(self.replication_endpoints.len() as i32);
        for endpoint in &self.replication_endpoints {
            out.write_str(endpoint);
        }
    }

    pub fn deserialize(input: &mut PacketReader) -> Result<Self, ProtocolError> {
        let index = input.read_i32()?;
        let mover_host_id = input.read_str()?;
        let page_key = input.read_page_key()?;
        let count = input.read_count()?;
        let mut replication_endpoints = Vec::with_capacity(input.capacity_hint(count));
        for _ in 0..count {
            replication_endpoints.push(input.read_str()?);
        }
        Ok(Self {
            index,
            mover_host_id,
            page_key,
            replication_endpoints,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn move_plan_layout_is_index_mover_page_then_endpoints() -> anyhow::Result<()> {
        let mut plan = LeafPageMovePlan::new(
            "node-a",
            vec!["10.0.0.1:9210".to_string(), "10.0.0.2:9210".to_string()],
            PageKey::new(Bytes::from_static(b"k"), false),
        );
        plan.increment_index();

        let mut writer = PacketWriter::with_version(2);
        plan.serialize(&mut writer);
        let mut reader = PacketReader::new(writer.finish(), 2);
        assert_eq!(reader.read_i32()?, 1);
        assert_eq!(reader.read_str()?, "node-a");

        let mut writer = PacketWriter::with_version(2);
        plan.serialize(&mut writer);
        let mut reader = PacketReader::new(writer.finish(), 2);
        assert_eq!(LeafPageMovePlan::deserialize(&mut reader)?, plan);
        Ok(())
    }
}

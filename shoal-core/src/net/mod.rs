//! TCP front end: connections, packet dispatch and opcode handlers.

pub mod cache;
pub mod connection;
pub mod handler;
pub mod response;
pub mod server;

use bytes::Bytes;
use shoal_protocol::{Opcode, PacketReader, ProtocolError};

pub use connection::ConnectionContext;
pub use server::{ServerHandle, ShoalServer};

/// A decoded request frame; `payload` is positioned after the header.
pub struct Request {
    pub packet_id: i32,
    pub opcode: Opcode,
    pub session_id: i32,
    pub payload: PacketReader,
}

impl Request {
    pub fn decode(frame: Bytes, version: i32) -> Result<Self, ProtocolError> {
        let mut payload = PacketReader::new(frame, version);
        let packet_id = payload.read_i32()?;
        let opcode = Opcode::try_from(payload.read_i32()?)?;
        let session_id = payload.read_i32()?;
        Ok(Self {
            packet_id,
            opcode,
            session_id,
            payload,
        })
    }

    /// Requests handled ahead of the session queue.
    pub fn bypasses_queue(&self) -> bool {
        matches!(
            self.opcode,
            Opcode::SessionClose
                | Opcode::SessionCancelStatement
                | Opcode::CommandDistributedTransactionRollback
                | Opcode::CommandReplicationRollback
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shoal_protocol::{PacketWriter, PROTOCOL_VERSION_CURRENT};

    #[test]
    fn decodes_header_and_leaves_payload() -> anyhow::Result<()> {
        let mut writer = PacketWriter::request(PROTOCOL_VERSION_CURRENT, 7, Opcode::CommandUpdate, 3);
        writer.write_str("SELECT 1");
        let mut request = Request::decode(writer.finish(), PROTOCOL_VERSION_CURRENT)?;
        assert_eq!(request.packet_id, 7);
        assert_eq!(request.opcode, Opcode::CommandUpdate);
        assert_eq!(request.session_id, 3);
        assert_eq!(request.payload.read_str()?, "SELECT 1");
        assert!(!request.bypasses_queue());
        Ok(())
    }

    #[test]
    fn unknown_opcode_is_an_error() {
        let mut writer = PacketWriter::with_version(PROTOCOL_VERSION_CURRENT);
        writer.write_i32(1).write_i32(999).write_i32(1);
        assert!(matches!(
            Request::decode(writer.finish(), PROTOCOL_VERSION_CURRENT),
            Err(ProtocolError::UnknownOpcode(999))
        ));
    }
}

//! Wire protocol shared by the shoal server and client.
//!
//! Every frame is length prefixed. Requests carry `(packetId, opcode, sessionId)`
//! followed by an opcode-specific payload; responses carry `(packetId, status)`
//! followed by a body. All integers are big-endian.

pub mod codec;
pub mod error;
pub mod error_codes;
pub mod opcode;
pub mod page;
pub mod reader;
pub mod status;
pub mod value;
pub mod writer;

pub use codec::PacketCodec;
pub use error::ProtocolError;
pub use opcode::Opcode;
pub use page::{LeafPageMovePlan, PageKey};
pub use reader::PacketReader;
pub use status::Status;
pub use value::{Value, ValueType};
pub use writer::PacketWriter;

pub const PROTOCOL_VERSION_MIN: i32 = 1;
pub const PROTOCOL_VERSION_MAX: i32 = 2;
pub const PROTOCOL_VERSION_CURRENT: i32 = 2;

/// Batch entries that failed report this count.
pub const EXECUTE_FAILED: i32 = -3;

/// Select the protocol version for a client advertising `[min, max]`.
///
/// Returns `None` when the client's minimum falls outside the range the server speaks.
pub fn negotiate_version(min_client_version: i32, max_client_version: i32) -> Option<i32> {
    if !(PROTOCOL_VERSION_MIN..=PROTOCOL_VERSION_MAX).contains(&min_client_version) {
        return None;
    }
    if max_client_version >= PROTOCOL_VERSION_MAX {
        Some(PROTOCOL_VERSION_CURRENT)
    } else {
        Some(min_client_version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negotiation_rejects_out_of_range_minimum() {
        assert_eq!(negotiate_version(0, 2), None);
        assert_eq!(negotiate_version(PROTOCOL_VERSION_MAX + 1, 9), None);
    }

    #[test]
    fn negotiation_prefers_current_when_client_reaches_max() {
        assert_eq!(negotiate_version(1, 2), Some(PROTOCOL_VERSION_CURRENT));
        assert_eq!(negotiate_version(1, 7), Some(PROTOCOL_VERSION_CURRENT));
        assert_eq!(negotiate_version(2, 2), Some(PROTOCOL_VERSION_CURRENT));
    }

    #[test]
    fn negotiation_falls_back_to_client_minimum() {
        assert_eq!(negotiate_version(1, 1), Some(1));
    }
}

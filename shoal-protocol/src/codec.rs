//! Length-prefixed framing for `tokio_util::codec::Framed`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;

/// Upper bound for a single frame body.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

const HEADER_LEN: usize = 4;

/// Splits a byte stream into frame bodies and prefixes outgoing bodies with their length.
#[derive(Debug, Default, Clone, Copy)]
pub struct PacketCodec;

impl Decoder for PacketCodec {
    type Item = Bytes;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, ProtocolError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let len = i32::from_be_bytes([src[0], src[1], src[2], src[3]]);
        if len < 0 {
            return Err(ProtocolError::NegativeLength(len));
        }
        let len = len as usize;
        if len > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge(len));
        }
        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }
        src.advance(HEADER_LEN);
        Ok(Some(src.split_to(len).freeze()))
    }
}

impl Encoder<Bytes> for PacketCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        if item.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge(item.len()));
        }
        dst.reserve(HEADER_LEN + item.len());
        dst.put_i32(item.len() as i32);
        dst.extend_from_slice(&item);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_waits_for_complete_frame() -> anyhow::Result<()> {
        let mut codec = PacketCodec;
        let mut buf = BytesMut::new();
        buf.put_i32(5);
        buf.extend_from_slice(b"he");
        assert!(codec.decode(&mut buf)?.is_none());

        buf.extend_from_slice(b"llo");
        buf.put_i32(0);
        let first = codec.decode(&mut buf)?;
        assert_eq!(first.as_deref(), Some(&b"hello"[..]));
        let second = codec.decode(&mut buf)?;
        assert_eq!(second.as_deref(), Some(&b""[..]));
        assert!(buf.is_empty());
        Ok(())
    }

    #[test]
    fn decode_rejects_negative_and_oversized_lengths() {
        let mut codec = PacketCodec;
        let mut negative = BytesMut::new();
        negative.put_i32(-2);
        assert!(matches!(
            codec.decode(&mut negative),
            Err(ProtocolError::NegativeLength(-2))
        ));

        let mut huge = BytesMut::new();
        huge.put_i32((MAX_FRAME_SIZE + 1) as i32);
        assert!(matches!(
            codec.decode(&mut huge),
            Err(ProtocolError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn encode_prefixes_length() -> anyhow::Result<()> {
        let mut codec = PacketCodec;
        let mut out = BytesMut::new();
        codec.encode(Bytes::from_static(b"abc"), &mut out)?;
        assert_eq!(&out[..], &[0, 0, 0, 3, b'a', b'b', b'c']);
        Ok(())
    }
}

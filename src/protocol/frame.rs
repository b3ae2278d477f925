//! Binary frame layout.
//!
//! ```text
//! +-----------+--------+------------------+
//! | length    | type   | payload          |
//! | 4 bytes BE| 1 byte | length - 1 bytes |
//! +-----------+--------+------------------+
//! ```
//!
//! The length counts the type byte plus the payload. Frame handling is
//! unaware of message semantics; only the type tag is interpreted upstream.

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Frame header size: 4 bytes length + 1 byte type
pub const FRAME_HEADER_SIZE: usize = 5;
/// Maximum length field value (64 MiB)
pub const MAX_FRAME_LENGTH: usize = 64 * 1024 * 1024;

/// Framing failures
#[derive(Debug, Clone, thiserror::Error)]
pub enum FrameError {
    #[error("frame length {0} out of bounds")]
    InvalidLength(usize),

    #[error("connection closed mid-frame ({0} bytes pending)")]
    Truncated(usize),

    #[error("malformed {0} message")]
    Malformed(&'static str),

    #[error("unexpected message type 0x{0:02x}")]
    UnexpectedType(u8),
}

/// One wire frame: a message-type tag and an opaque payload.
#[derive(Debug, Clone)]
pub struct Frame {
    pub msg_type: u8,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(msg_type: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            msg_type,
            payload: payload.into(),
        }
    }

    /// Encode frame to bytes (header + payload)
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(FRAME_HEADER_SIZE + self.payload.len());
        dst.put_u32((self.payload.len() + 1) as u32);
        dst.put_u8(self.msg_type);
        dst.extend_from_slice(&self.payload);
    }

    /// Try to decode a frame, returning None if not enough data is buffered.
    pub fn decode(src: &mut BytesMut) -> Result<Option<Self>, FrameError> {
        if src.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if length < 1 || length > MAX_FRAME_LENGTH {
            return Err(FrameError::InvalidLength(length));
        }

        let total = 4 + length;
        if src.len() < total {
            return Ok(None);
        }

        src.advance(4);
        let msg_type = src.get_u8();
        let payload = src.split_to(length - 1).freeze();

        Ok(Some(Self { msg_type, payload }))
    }
}

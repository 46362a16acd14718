use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};

/// Frame header: big-endian payload length (4 bytes).
pub const HEADER_SIZE: usize = 4;

/// Maximum payload size: 8 MiB. Matches the child's receive buffer.
pub const MAX_MESSAGE_SIZE: usize = 8 * 1024 * 1024;

/// An opaque length-delimited message exchanged with the child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    payload: Bytes,
}

impl Message {
    /// Create a message from a payload.
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    /// The message payload.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Whether the payload is empty. Empty messages are not encodable.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// The total wire size of this message (header + payload).
    pub fn wire_size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Consume the message and return the payload.
    pub fn into_payload(self) -> Bytes {
        self.payload
    }
}

impl From<Vec<u8>> for Message {
    fn from(payload: Vec<u8>) -> Self {
        Self::new(payload)
    }
}

impl From<&'static [u8]> for Message {
    fn from(payload: &'static [u8]) -> Self {
        Self::new(payload)
    }
}

impl From<Bytes> for Message {
    fn from(payload: Bytes) -> Self {
        Self::new(payload)
    }
}

/// Encode a message into the wire format.
///
/// Wire format:
/// ```text
/// ┌──────────────┬─────────────────┐
/// │ Length       │ Payload          │
/// │ (4B BE)      │ (Length bytes)   │
/// └──────────────┴─────────────────┘
/// ```
pub fn encode_message(message: &Message, dst: &mut BytesMut) -> Result<()> {
    let len = message.len();
    if len == 0 || len > MAX_MESSAGE_SIZE {
        return Err(FrameError::InvalidLength {
            len,
            max: MAX_MESSAGE_SIZE,
        });
    }
    dst.reserve(HEADER_SIZE + len);
    dst.put_u32(len as u32);
    dst.put_slice(message.payload());
    Ok(())
}

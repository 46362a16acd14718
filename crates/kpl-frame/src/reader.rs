use std::io::{ErrorKind, Read};

use bytes::{Bytes, BytesMut};

use crate::codec::{Message, HEADER_SIZE, MAX_MESSAGE_SIZE};
use crate::error::{FrameError, Result};

/// Reads complete messages from any `Read` stream.
///
/// Short reads are looped over internally, so callers always get complete
/// messages. The receive buffer is reused across frames; payloads are copied
/// out into owned `Bytes` before being returned, so callers may retain them
/// freely.
pub struct FrameReader<T> {
    inner: T,
    recv_buf: BytesMut,
    max_message_size: usize,
}

impl<T: Read> FrameReader<T> {
    /// Create a new frame reader with the default 8 MiB message cap.
    pub fn new(inner: T) -> Self {
        Self::with_max_message_size(inner, MAX_MESSAGE_SIZE)
    }

    /// Create a new frame reader with an explicit message cap.
    pub fn with_max_message_size(inner: T, max_message_size: usize) -> Self {
        Self {
            inner,
            recv_buf: BytesMut::new(),
            max_message_size,
        }
    }

    /// Read the next complete message (blocking).
    ///
    /// Returns `Err(FrameError::Eof)` when the stream ends, whether at a
    /// frame boundary or mid-frame. A partial frame is never returned.
    pub fn read_message(&mut self) -> Result<Message> {
        let mut header = [0u8; HEADER_SIZE];
        fill(&mut self.inner, &mut header)?;

        let len = u32::from_be_bytes(header) as usize;
        if len == 0 || len > self.max_message_size {
            return Err(FrameError::InvalidLength {
                len,
                max: self.max_message_size,
            });
        }

        self.recv_buf.clear();
        self.recv_buf.resize(len, 0);
        fill(&mut self.inner, &mut self.recv_buf)?;

        Ok(Message::new(Bytes::copy_from_slice(&self.recv_buf)))
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Consume the reader and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Maximum accepted payload length.
    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }
}

/// Fill `buf` completely, looping over short reads.
fn fill<T: Read>(inner: &mut T, buf: &mut [u8]) -> Result<()> {
    let mut total = 0;
    while total < buf.len() {
        match inner.read(&mut buf[total..]) {
            Ok(0) => return Err(FrameError::Eof),
            Ok(n) => total += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(FrameError::Io(err)),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use bytes::{BufMut, BytesMut};

    use super::*;
    use crate::codec::encode_message;

    fn wire_for(payloads: &[&[u8]]) -> Vec<u8> {
        let mut wire = BytesMut::new();
        for payload in payloads {
            encode_message(&Message::new(payload.to_vec()), &mut wire).unwrap();
        }
        wire.to_vec()
    }

    #[test]
    fn read_single_message() {
        let mut reader = FrameReader::new(Cursor::new(wire_for(&[b"hello"])));
        let message = reader.read_message().unwrap();
        assert_eq!(message.payload().as_ref(), b"hello");
    }

    #[test]
    fn read_multiple_messages_in_order() {
        let mut reader = FrameReader::new(Cursor::new(wire_for(&[b"one", b"two", b"three"])));

        assert_eq!(reader.read_message().unwrap().payload().as_ref(), b"one");
        assert_eq!(reader.read_message().unwrap().payload().as_ref(), b"two");
        assert_eq!(reader.read_message().unwrap().payload().as_ref(), b"three");
    }

    #[test]
    fn eof_at_frame_boundary() {
        let mut reader = FrameReader::new(Cursor::new(Vec::<u8>::new()));
        let err = reader.read_message().unwrap_err();
        assert!(matches!(err, FrameError::Eof));
    }

    #[test]
    fn eof_mid_header() {
        let mut reader = FrameReader::new(Cursor::new(vec![0u8, 0]));
        let err = reader.read_message().unwrap_err();
        assert!(matches!(err, FrameError::Eof));
    }

    #[test]
    fn eof_mid_payload_yields_no_partial_message() {
        let mut wire = BytesMut::new();
        wire.put_u32(4);
        wire.put_slice(b"abc"); // one byte short of the announced length

        let mut reader = FrameReader::new(Cursor::new(wire.to_vec()));
        let err = reader.read_message().unwrap_err();
        assert!(matches!(err, FrameError::Eof));
    }

    #[test]
    fn zero_length_rejected() {
        let mut reader = FrameReader::new(Cursor::new(vec![0u8, 0, 0, 0]));
        let err = reader.read_message().unwrap_err();
        assert!(matches!(err, FrameError::InvalidLength { len: 0, .. }));
    }

    #[test]
    fn oversize_length_rejected_before_payload_read() {
        let mut wire = BytesMut::new();
        wire.put_u32(0x0100_0001); // 16 MiB + 1

        let mut reader = FrameReader::new(Cursor::new(wire.to_vec()));
        let err = reader.read_message().unwrap_err();
        assert!(matches!(
            err,
            FrameError::InvalidLength {
                len: 0x0100_0001,
                ..
            }
        ));
        assert!(err.to_string().contains("invalid message size"));
    }

    #[test]
    fn explicit_cap_applies() {
        let mut reader =
            FrameReader::with_max_message_size(Cursor::new(wire_for(&[b"toolong"])), 4);
        let err = reader.read_message().unwrap_err();
        assert!(matches!(err, FrameError::InvalidLength { len: 7, max: 4 }));
    }

    #[test]
    fn byte_by_byte_short_reads() {
        let reader = ByteByByteReader {
            bytes: wire_for(&[b"slow"]),
            pos: 0,
        };
        let mut reader = FrameReader::new(reader);
        let message = reader.read_message().unwrap();
        assert_eq!(message.payload().as_ref(), b"slow");
    }

    #[test]
    fn interrupted_read_retries() {
        let reader = InterruptedThenData {
            interrupted: false,
            bytes: wire_for(&[b"ok"]),
            pos: 0,
        };
        let mut reader = FrameReader::new(reader);
        let message = reader.read_message().unwrap();
        assert_eq!(message.payload().as_ref(), b"ok");
    }

    #[test]
    fn buffer_reuse_does_not_alias_payloads() {
        let mut reader = FrameReader::new(Cursor::new(wire_for(&[b"first", b"worse"])));

        let first = reader.read_message().unwrap();
        let second = reader.read_message().unwrap();

        // `first` must survive the buffer being rewritten by the next frame.
        assert_eq!(first.payload().as_ref(), b"first");
        assert_eq!(second.payload().as_ref(), b"worse");
    }

    #[test]
    fn io_error_propagates() {
        struct FailingReader;

        impl Read for FailingReader {
            fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
                Err(std::io::Error::from(ErrorKind::BrokenPipe))
            }
        }

        let mut reader = FrameReader::new(FailingReader);
        let err = reader.read_message().unwrap_err();
        assert!(matches!(err, FrameError::Io(e) if e.kind() == ErrorKind::BrokenPipe));
    }

    #[test]
    fn accessors_and_into_inner() {
        let mut reader = FrameReader::new(Cursor::new(Vec::<u8>::new()));
        assert_eq!(reader.max_message_size(), MAX_MESSAGE_SIZE);
        let _ = reader.get_ref();
        let _ = reader.read_message().unwrap_err();
        let _inner = reader.into_inner();
    }

    struct ByteByByteReader {
        bytes: Vec<u8>,
        pos: usize,
    }

    impl Read for ByteByByteReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.pos >= self.bytes.len() || buf.is_empty() {
                return Ok(0);
            }
            buf[0] = self.bytes[self.pos];
            self.pos += 1;
            Ok(1)
        }
    }

    struct InterruptedThenData {
        interrupted: bool,
        bytes: Vec<u8>,
        pos: usize,
    }

    impl Read for InterruptedThenData {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if !self.interrupted {
                self.interrupted = true;
                return Err(std::io::Error::from(ErrorKind::Interrupted));
            }
            if self.pos >= self.bytes.len() {
                return Ok(0);
            }
            let n = (self.bytes.len() - self.pos).min(buf.len());
            buf[..n].copy_from_slice(&self.bytes[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }
}

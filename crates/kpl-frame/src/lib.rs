//! Length-prefixed message framing for the producer child transport.
//!
//! Every message exchanged with the child is framed as:
//! - A 4-byte big-endian payload length
//! - The payload bytes
//!
//! Payloads are opaque to this crate. Lengths outside `(0, 8 MiB]` are
//! protocol violations, and a partial frame is never surfaced to callers.

pub mod codec;
pub mod error;
pub mod reader;
pub mod writer;

pub use codec::{encode_message, Message, HEADER_SIZE, MAX_MESSAGE_SIZE};
pub use error::{FrameError, Result};
pub use reader::FrameReader;
pub use writer::FrameWriter;

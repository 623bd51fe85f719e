//! Frame codec for commands on a byte stream.
//!
//! Each command is serialized with `bincode` and wrapped in a frame:
//!
//! ```text
//! +--------+--------+--------+--------+--------+
//! | Magic (4)                         | Ver (1)|
//! +--------+--------+--------+--------+--------+
//! | Payload Length (4)                | CRC32 (4) ...
//! +--------+--------+--------+--------+--------+
//! | Payload (bincode-encoded Command)            |
//! +--------+--------+--------+--------+--------+
//! ```

use crate::command::Command;
use crate::error::{Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Frame magic: "WLNK".
pub const FRAME_MAGIC: u32 = 0x574C_4E4B;

/// Current frame format version.
pub const FRAME_VERSION: u8 = 1;

/// Size of the frame header in bytes.
pub const FRAME_HEADER_SIZE: usize = 13;

/// Maximum payload size (16MB).
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Encodes commands into frames, reusing its buffer between calls.
#[derive(Debug)]
pub struct CommandEncoder {
    buffer: BytesMut,
}

impl CommandEncoder {
    /// Create a new encoder.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(8192)
    }

    /// Create an encoder with the given initial buffer capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self { buffer: BytesMut::with_capacity(capacity) }
    }

    /// Encode a single command into a frame.
    ///
    /// # Errors
    /// Returns an error if serialization fails or the payload exceeds [`MAX_PAYLOAD_SIZE`].
    pub fn encode(&mut self, command: &Command) -> Result<Bytes> {
        let payload = bincode::serialize(command)?;
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(Error::Protocol {
                message: format!(
                    "Payload size {} exceeds maximum {MAX_PAYLOAD_SIZE}",
                    payload.len()
                ),
            });
        }

        self.buffer.clear();
        self.buffer.reserve(FRAME_HEADER_SIZE + payload.len());
        self.buffer.put_u32(FRAME_MAGIC);
        self.buffer.put_u8(FRAME_VERSION);
        #[allow(clippy::cast_possible_truncation)]
        self.buffer.put_u32(payload.len() as u32);
        self.buffer.put_u32(crc32fast::hash(&payload));
        self.buffer.extend_from_slice(&payload);

        Ok(self.buffer.split().freeze())
    }
}

impl Default for CommandEncoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Streaming decoder: feed bytes as they arrive, pull complete commands out.
#[derive(Debug)]
pub struct CommandDecoder {
    buffer: BytesMut,
}

impl CommandDecoder {
    /// Create a new decoder.
    #[must_use]
    pub fn new() -> Self {
        Self { buffer: BytesMut::with_capacity(16384) }
    }

    /// Append received bytes to the decode buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Decode the next complete command, if one is buffered.
    ///
    /// # Errors
    /// Returns an error on bad magic, unsupported version, oversize frames, checksum
    /// mismatch or an undecodable payload. The stream cannot be resynchronized after
    /// an error; the transport must be dropped.
    pub fn next_command(&mut self) -> Result<Option<Command>> {
        if self.buffer.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let mut header = &self.buffer[..FRAME_HEADER_SIZE];
        let magic = header.get_u32();
        if magic != FRAME_MAGIC {
            return Err(Error::Protocol {
                message: format!("Invalid frame magic {magic:#010x}"),
            });
        }
        let version = header.get_u8();
        if version != FRAME_VERSION {
            return Err(Error::Protocol {
                message: format!("Unsupported frame version {version} (supported: {FRAME_VERSION})"),
            });
        }
        let length = header.get_u32() as usize;
        let checksum = header.get_u32();
        if length > MAX_PAYLOAD_SIZE {
            return Err(Error::Protocol {
                message: format!("Frame size {length} exceeds maximum {MAX_PAYLOAD_SIZE}"),
            });
        }

        if self.buffer.len() < FRAME_HEADER_SIZE + length {
            return Ok(None);
        }

        self.buffer.advance(FRAME_HEADER_SIZE);
        let payload = self.buffer.split_to(length);
        if crc32fast::hash(&payload) != checksum {
            return Err(Error::Protocol { message: "Frame checksum mismatch".to_string() });
        }

        let command = bincode::deserialize(&payload)?;
        Ok(Some(command))
    }

    /// Number of buffered, not yet decoded bytes.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

impl Default for CommandDecoder {
    fn default() -> Self {
        Self::new()
    }
}

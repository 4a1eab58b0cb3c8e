//! Wire format encoding and decoding for the 14-byte frame header.
//!
//! ```text
//! ┌───────┬────────────┬────────────┬──────┬──────────┬──────────┐
//! │ Magic │ Protocol   │ Encoding   │ Type │ Compress │ Size     │
//! │ 4 B   │ maj/min 2B │ maj/min 2B │ 1 B  │ 1 B      │ u32 LE   │
//! └───────┴────────────┴────────────┴──────┴──────────┴──────────┘
//! ```
//!
//! All multi-byte integers are Little Endian, regardless of host byte
//! order. Request and batch-request frames carry a 4-byte request id (or
//! request count) immediately after the header.

use bytes::{BufMut, BytesMut};

use crate::error::{Error, Result};

/// Header size in bytes (fixed, exactly 14).
pub const HEADER_SIZE: usize = 14;

/// Offset of the total-size field within the header.
pub const SIZE_OFFSET: usize = 10;

/// Protocol magic, first four bytes of every frame.
pub const MAGIC: [u8; 4] = *b"IceP";

/// Supported protocol version.
pub const PROTOCOL_MAJOR: u8 = 1;
/// Supported protocol version, minor part.
pub const PROTOCOL_MINOR: u8 = 0;
/// Supported encoding version.
pub const ENCODING_MAJOR: u8 = 1;
/// Supported encoding version, minor part.
pub const ENCODING_MINOR: u8 = 0;

/// Message kinds carried in byte 8 of the header.
///
/// The numeric values are a compatibility contract with the peer
/// implementation and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// A single two-way or one-way request.
    Request = 0,
    /// A batch of one-way requests.
    BatchRequest = 1,
    /// A reply to a two-way request.
    Reply = 2,
    /// The connection validation handshake.
    ValidateConnection = 3,
    /// Graceful connection closure.
    CloseConnection = 4,
}

impl MessageType {
    /// Classify a raw message-type byte.
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(MessageType::Request),
            1 => Ok(MessageType::BatchRequest),
            2 => Ok(MessageType::Reply),
            3 => Ok(MessageType::ValidateConnection),
            4 => Ok(MessageType::CloseConnection),
            _ => Err(Error::UnknownMessage),
        }
    }
}

/// Validated header fields of an inbound frame.
///
/// The message type is kept raw here: classification happens after the size
/// checks, so that a frame with an unknown type still fails with
/// `UnknownMessage` rather than an earlier, misleading error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Raw message-type byte.
    pub message_type: u8,
    /// Compression byte (0 or 1; 2 is rejected while parsing).
    pub compress: u8,
    /// Declared total frame size, header included.
    pub size: u32,
}

impl Header {
    /// Classify the raw message-type byte.
    pub fn kind(&self) -> Result<MessageType> {
        MessageType::from_u8(self.message_type)
    }
}

/// Append a frame header of the given kind to `buf`, followed by
/// `extra_len` zero bytes (the request-id or batch-count placeholder).
///
/// The size field is written as zero; callers patch it with
/// [`patch_size`] once the frame is complete.
pub fn write_header(buf: &mut BytesMut, kind: MessageType, extra_len: usize) {
    buf.reserve(HEADER_SIZE + extra_len);
    buf.put_slice(&MAGIC);
    buf.put_u8(PROTOCOL_MAJOR);
    buf.put_u8(PROTOCOL_MINOR);
    buf.put_u8(ENCODING_MAJOR);
    buf.put_u8(ENCODING_MINOR);
    buf.put_u8(kind as u8);
    buf.put_u8(0); // Compression is not supported on the wire.
    buf.put_u32_le(0);
    buf.put_bytes(0, extra_len);
}

/// Patch the total-size field at offset 10 with the buffer's length.
pub fn patch_size(buf: &mut [u8]) {
    let size = buf.len() as u32;
    patch_u32_at(buf, SIZE_OFFSET, size);
}

/// Overwrite four bytes at `offset` with `value`, little-endian.
pub fn patch_u32_at(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

/// Overwrite four bytes at `offset` with `value`, little-endian.
pub fn patch_i32_at(buf: &mut [u8], offset: usize, value: i32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

/// Read a little-endian i32 at `offset`.
pub fn read_i32_at(buf: &[u8], offset: usize) -> Result<i32> {
    let bytes: [u8; 4] = buf
        .get(offset..offset + 4)
        .and_then(|s| s.try_into().ok())
        .ok_or(Error::IllegalMessageSize)?;
    Ok(i32::from_le_bytes(bytes))
}

/// Parse and validate a frame header.
///
/// Checks run in a fixed order, each failing with its own error: magic,
/// protocol major version, encoding major version, compression byte,
/// size below the header size, size above `message_size_max`.
pub fn read_header(buf: &[u8], message_size_max: usize) -> Result<Header> {
    if buf.len() < HEADER_SIZE {
        return Err(Error::IllegalMessageSize);
    }
    if buf[0..4] != MAGIC {
        return Err(Error::BadMagic {
            bad_magic: [buf[0], buf[1], buf[2], buf[3]],
        });
    }
    if buf[4] != PROTOCOL_MAJOR {
        return Err(Error::UnsupportedProtocol {
            bad_major: buf[4],
            bad_minor: buf[5],
            major: PROTOCOL_MAJOR,
            minor: PROTOCOL_MINOR,
        });
    }
    if buf[6] != ENCODING_MAJOR {
        return Err(Error::UnsupportedEncoding {
            bad_major: buf[6],
            bad_minor: buf[7],
            major: ENCODING_MAJOR,
            minor: ENCODING_MINOR,
        });
    }
    let message_type = buf[8];
    let compress = buf[9];
    if compress == 2 {
        return Err(Error::FeatureNotSupported {
            feature: "compression".to_string(),
        });
    }
    let size = u32::from_le_bytes([buf[10], buf[11], buf[12], buf[13]]);
    if (size as usize) < HEADER_SIZE {
        return Err(Error::IllegalMessageSize);
    }
    if size as usize > message_size_max {
        return Err(Error::MemoryLimit);
    }
    Ok(Header {
        message_type,
        compress,
        size,
    })
}

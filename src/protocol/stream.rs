//! Marshalling streams for message bodies.
//!
//! [`OutputStream`] appends little-endian scalars, length-prefixed strings
//! and raw blobs into a growable buffer; [`InputStream`] reads them back
//! from a received frame. Strings are u32-LE length prefixed UTF-8.
//!
//! The output stream also supports truncation back to a remembered
//! position, which the dispatch path uses to rewrite a reply after a
//! failed invocation.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// Growable buffer for marshalling an outbound message body.
#[derive(Debug, Default)]
pub struct OutputStream {
    buf: BytesMut,
}

impl OutputStream {
    /// Create an empty output stream.
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
        }
    }

    /// Wrap an existing buffer, continuing at its end.
    pub fn with_buffer(buf: BytesMut) -> Self {
        Self { buf }
    }

    /// Current length in bytes.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Append a single byte.
    pub fn write_byte(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    /// Append a little-endian i32.
    pub fn write_i32(&mut self, value: i32) {
        self.buf.put_i32_le(value);
    }

    /// Append a little-endian u32.
    pub fn write_u32(&mut self, value: u32) {
        self.buf.put_u32_le(value);
    }

    /// Append a length-prefixed UTF-8 string.
    pub fn write_string(&mut self, value: &str) {
        self.buf.put_u32_le(value.len() as u32);
        self.buf.put_slice(value.as_bytes());
    }

    /// Append raw bytes.
    pub fn write_blob(&mut self, value: &[u8]) {
        self.buf.put_slice(value);
    }

    /// Overwrite the byte at `pos`.
    pub fn patch_byte(&mut self, pos: usize, value: u8) {
        self.buf[pos] = value;
    }

    /// Discard everything written after `pos`.
    pub fn truncate(&mut self, pos: usize) {
        self.buf.truncate(pos);
    }

    /// Access the underlying buffer, e.g. to patch header fields.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Consume the stream, yielding the buffer.
    pub fn into_buffer(self) -> BytesMut {
        self.buf
    }
}

/// Positioned reader over a received message.
#[derive(Debug)]
pub struct InputStream {
    buf: Bytes,
    pos: usize,
}

impl InputStream {
    /// Create a reader over `buf`, positioned at the start.
    pub fn new(buf: Bytes) -> Self {
        Self { buf, pos: 0 }
    }

    /// Create a reader positioned at `pos`.
    pub fn at(buf: Bytes, pos: usize) -> Self {
        Self { buf, pos }
    }

    /// Current read position.
    pub fn pos(&self) -> usize {
        self.pos
    }

    /// Move the read position.
    pub fn set_pos(&mut self, pos: usize) {
        self.pos = pos;
    }

    /// Bytes left to read.
    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    fn take(&mut self, n: usize) -> Result<&[u8]> {
        let end = self.pos.checked_add(n).ok_or_else(Self::out_of_bounds)?;
        if end > self.buf.len() {
            return Err(Self::out_of_bounds());
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn out_of_bounds() -> Error {
        Error::MarshalError {
            message: "read past end of message".to_string(),
        }
    }

    /// Read a single byte.
    pub fn read_byte(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    /// Read a little-endian i32.
    pub fn read_i32(&mut self) -> Result<i32> {
        let bytes: [u8; 4] = self.take(4)?.try_into().expect("slice length checked");
        Ok(i32::from_le_bytes(bytes))
    }

    /// Read a little-endian u32.
    pub fn read_u32(&mut self) -> Result<u32> {
        let bytes: [u8; 4] = self.take(4)?.try_into().expect("slice length checked");
        Ok(u32::from_le_bytes(bytes))
    }

    /// Read a length-prefixed UTF-8 string.
    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| Error::MarshalError {
            message: "string is not valid UTF-8".to_string(),
        })
    }

    /// Read `n` raw bytes.
    pub fn read_blob(&mut self, n: usize) -> Result<&[u8]> {
        self.take(n)
    }
}

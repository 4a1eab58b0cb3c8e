//! Wire protocol: frame header codec and marshalling streams.

mod header;
mod stream;

pub use header::{
    patch_i32_at, patch_size, patch_u32_at, read_header, read_i32_at, write_header, Header,
    MessageType, ENCODING_MAJOR, ENCODING_MINOR, HEADER_SIZE, MAGIC, PROTOCOL_MAJOR,
    PROTOCOL_MINOR, SIZE_OFFSET,
};
pub use stream::{InputStream, OutputStream};

//! Abstract byte transport consumed by the connection core.
//!
//! The core never opens sockets itself: it is handed a [`Transceiver`] and
//! drives it. TCP, TLS and in-memory transports all live behind this trait;
//! [`StreamTransceiver`] adapts any `AsyncRead + AsyncWrite` stream.

mod stream;

pub use stream::StreamTransceiver;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

/// A bidirectional byte transport.
///
/// The connection core reads from one task and writes from others; both
/// sides take `&self`, and implementations serialise their halves
/// internally. The core guarantees that at most one read and at most one
/// write are in flight at a time.
#[async_trait]
pub trait Transceiver: Send + Sync {
    /// Read exactly `buf.len()` bytes into `buf`, honouring the configured
    /// read timeout.
    async fn read(&self, buf: &mut [u8]) -> Result<()>;

    /// Write all of `buf`, honouring the configured write timeout.
    async fn write(&self, buf: &[u8]) -> Result<()>;

    /// Read exactly `buf.len()` bytes, failing with `Timeout` after
    /// `timeout` if given.
    async fn read_with_timeout(&self, buf: &mut [u8], timeout: Option<Duration>) -> Result<()>;

    /// Write all of `buf`, failing with `Timeout` after `timeout` if given.
    async fn write_with_timeout(&self, buf: &[u8], timeout: Option<Duration>) -> Result<()>;

    /// Set the timeouts applied by [`read`](Self::read) and
    /// [`write`](Self::write). `None` disables the respective timeout.
    fn set_timeouts(&self, read: Option<Duration>, write: Option<Duration>);

    /// Shut the transport down in both directions. A pending read or write
    /// unblocks with `ConnectionLost`.
    fn shutdown_read_write(&self);

    /// Release the transport's resources. Further operations fail.
    async fn close(&self);

    /// Human-readable description of the transport (peer address and the
    /// like), fixed for the lifetime of the transceiver.
    fn description(&self) -> String;

    /// Short transport type name, e.g. `"tcp"`.
    fn transport_type(&self) -> &str;
}

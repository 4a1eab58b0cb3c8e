//! Generic transceiver over any async byte stream.
//!
//! [`StreamTransceiver`] adapts a `tokio` stream (TCP socket, TLS stream,
//! in-memory duplex) to the [`Transceiver`] port. The read and write halves
//! live behind separate locks so the connection worker can read while
//! callers write, and a shutdown signal is raced against both directions so
//! a blocked read unblocks when the connection is closed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{Mutex, Notify};

use super::Transceiver;
use crate::error::{Error, Result};

/// Transceiver over an `AsyncRead + AsyncWrite` stream.
pub struct StreamTransceiver<S> {
    read_half: Mutex<ReadHalf<S>>,
    write_half: Mutex<WriteHalf<S>>,
    timeouts: StdMutex<(Option<Duration>, Option<Duration>)>,
    shutdown: AtomicBool,
    shutdown_notify: Notify,
    desc: String,
    kind: String,
}

impl<S> StreamTransceiver<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Wrap a stream. `desc` is the human-readable description reported by
    /// [`Transceiver::description`], `kind` the transport type name.
    pub fn new(stream: S, desc: impl Into<String>, kind: impl Into<String>) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            read_half: Mutex::new(read_half),
            write_half: Mutex::new(write_half),
            timeouts: StdMutex::new((None, None)),
            shutdown: AtomicBool::new(false),
            shutdown_notify: Notify::new(),
            desc: desc.into(),
            kind: kind.into(),
        }
    }

    fn shutdown_error(&self) -> Error {
        Error::ConnectionLost {
            message: "transport shut down".to_string(),
        }
    }

    fn read_timeout(&self) -> Option<Duration> {
        self.timeouts.lock().unwrap_or_else(|e| e.into_inner()).0
    }

    fn write_timeout(&self) -> Option<Duration> {
        self.timeouts.lock().unwrap_or_else(|e| e.into_inner()).1
    }

    async fn read_inner(&self, buf: &mut [u8]) -> Result<()> {
        let shutdown = self.shutdown_notify.notified();
        tokio::pin!(shutdown);
        shutdown.as_mut().enable();
        if self.shutdown.load(Ordering::Acquire) {
            return Err(self.shutdown_error());
        }
        let mut half = self.read_half.lock().await;
        tokio::select! {
            _ = &mut shutdown => Err(self.shutdown_error()),
            res = half.read_exact(buf) => match res {
                Ok(_) => Ok(()),
                Err(err) => Err(Error::lost(&err)),
            },
        }
    }

    async fn write_inner(&self, buf: &[u8]) -> Result<()> {
        let shutdown = self.shutdown_notify.notified();
        tokio::pin!(shutdown);
        shutdown.as_mut().enable();
        if self.shutdown.load(Ordering::Acquire) {
            return Err(self.shutdown_error());
        }
        let mut half = self.write_half.lock().await;
        tokio::select! {
            _ = &mut shutdown => Err(self.shutdown_error()),
            res = async {
                half.write_all(buf).await?;
                half.flush().await
            } => res.map_err(|err| Error::lost(&err)),
        }
    }

    async fn timed<T>(
        timeout: Option<Duration>,
        fut: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        match timeout {
            Some(duration) => tokio::time::timeout(duration, fut)
                .await
                .map_err(|_| Error::Timeout)?,
            None => fut.await,
        }
    }
}

#[async_trait]
impl<S> Transceiver for StreamTransceiver<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn read(&self, buf: &mut [u8]) -> Result<()> {
        Self::timed(self.read_timeout(), self.read_inner(buf)).await
    }

    async fn write(&self, buf: &[u8]) -> Result<()> {
        Self::timed(self.write_timeout(), self.write_inner(buf)).await
    }

    async fn read_with_timeout(&self, buf: &mut [u8], timeout: Option<Duration>) -> Result<()> {
        Self::timed(timeout, self.read_inner(buf)).await
    }

    async fn write_with_timeout(&self, buf: &[u8], timeout: Option<Duration>) -> Result<()> {
        Self::timed(timeout, self.write_inner(buf)).await
    }

    fn set_timeouts(&self, read: Option<Duration>, write: Option<Duration>) {
        *self.timeouts.lock().unwrap_or_else(|e| e.into_inner()) = (read, write);
    }

    fn shutdown_read_write(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.shutdown_notify.notify_waiters();
    }

    async fn close(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.shutdown_notify.notify_waiters();
        let mut half = self.write_half.lock().await;
        let _ = half.shutdown().await;
    }

    fn description(&self) -> String {
        self.desc.clone()
    }

    fn transport_type(&self) -> &str {
        &self.kind
    }
}

//! Server-side dispatch adapter.
//!
//! Decodes an inbound request, resolves a servant (directly or through the
//! adapter's servant locator), invokes it, and marshals the reply with its
//! dispatch-status byte. Exception mapping follows a strict table: a
//! location forward rewrites the reply with the forwarded proxy, a local
//! error rewrites it with the `LocalException` status, and anything else
//! becomes `UnknownException`. When the servant came from a locator,
//! `ServantLocator::finished` runs on every exit path before the reply is
//! rewritten.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::protocol::{InputStream, OutputStream};

/// Result byte carried at the start of every reply body.
///
/// The numeric values are part of the wire contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DispatchStatus {
    /// The invocation succeeded.
    Ok = 0,
    /// No servant is registered under the requested identity.
    ObjectNotExist = 1,
    /// The client should retry against the marshalled proxy.
    LocationForward = 2,
    /// The servant failed with a local error.
    LocalException = 3,
    /// The servant failed in a way the protocol cannot describe.
    UnknownException = 4,
}

impl DispatchStatus {
    /// Classify a raw status byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(DispatchStatus::Ok),
            1 => Some(DispatchStatus::ObjectNotExist),
            2 => Some(DispatchStatus::LocationForward),
            3 => Some(DispatchStatus::LocalException),
            4 => Some(DispatchStatus::UnknownException),
            _ => None,
        }
    }
}

/// Opaque per-locate state threaded from `locate` to `finished`.
pub type Cookie = Option<Box<dyn Any + Send>>;

/// Failure raised by a servant or locator during dispatch.
#[derive(Debug)]
pub enum DispatchError {
    /// Redirect the client to another proxy.
    LocationForward {
        /// Marshalled form of the proxy to retry against.
        proxy: String,
    },
    /// A local error; the reply carries the `LocalException` status.
    Local(Error),
    /// Any other failure; the reply carries the `UnknownException` status.
    Unhandled(String),
}

/// An invocable server-side object.
#[async_trait]
pub trait Servant: Send + Sync {
    /// Unmarshal parameters from `is`, perform `operation`, and marshal
    /// results into `os`. The returned status overwrites the provisional
    /// `Ok` byte already written to the reply.
    async fn dispatch(
        &self,
        is: &mut InputStream,
        os: &mut OutputStream,
        operation: &str,
    ) -> std::result::Result<DispatchStatus, DispatchError>;
}

/// The servant table a server-mode connection dispatches against.
pub trait ObjectAdapter: Send + Sync {
    /// Direct lookup in the adapter's servant map.
    fn identity_to_servant(&self, identity: &str) -> Option<Arc<dyn Servant>>;

    /// The adapter's servant locator, if any.
    fn servant_locator(&self) -> Option<Arc<dyn ServantLocator>>;
}

/// Fallback servant resolution, consulted when the direct lookup misses.
pub trait ServantLocator: Send + Sync {
    /// Locate a servant for `identity`. The returned cookie is passed back
    /// to [`finished`](Self::finished) unchanged.
    fn locate(
        &self,
        adapter: &dyn ObjectAdapter,
        identity: &str,
        operation: &str,
    ) -> std::result::Result<(Option<Arc<dyn Servant>>, Cookie), DispatchError>;

    /// Called exactly once after every dispatch whose servant this locator
    /// provided, on success and failure alike.
    fn finished(
        &self,
        adapter: &dyn ObjectAdapter,
        identity: &str,
        servant: &Arc<dyn Servant>,
        operation: &str,
        cookie: Cookie,
    );

    /// Release the locator's resources.
    fn deactivate(&self);
}

/// What a completed dispatch asks of the reply path.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// The reply in `os` is complete.
    Completed,
    /// The status byte says `LocalException`; the caller marshals the
    /// error's description after it.
    LocalException(Error),
    /// The status byte says `UnknownException`; the caller marshals the
    /// description after it.
    UnknownException(String),
}

/// Decode one request from `is` and produce its reply body in `os`.
///
/// `os` already carries the reply header and request id when a response is
/// expected; everything this function writes comes after.
///
/// A decode failure before the status position exists is returned as a hard
/// error: the frame is unusable and the connection must close.
pub async fn invoke(
    adapter: Option<&Arc<dyn ObjectAdapter>>,
    is: &mut InputStream,
    os: &mut OutputStream,
) -> Result<DispatchOutcome> {
    let identity = is.read_string()?;
    let operation = is.read_string()?;

    let status_pos = os.len();

    let mut servant = adapter.and_then(|a| a.identity_to_servant(&identity));
    let locator = if servant.is_none() {
        adapter.and_then(|a| a.servant_locator())
    } else {
        None
    };
    let mut located = false;
    let mut cookie: Cookie = None;

    let result: std::result::Result<(), DispatchError> = async {
        if servant.is_none() {
            if let (Some(locator), Some(adapter)) = (&locator, adapter) {
                let (found, found_cookie) = locator.locate(adapter.as_ref(), &identity, &operation)?;
                located = found.is_some();
                cookie = found_cookie;
                servant = found;
            }
        }

        match &servant {
            None => {
                os.write_byte(DispatchStatus::ObjectNotExist as u8);
                Ok(())
            }
            Some(servant) => {
                os.write_byte(DispatchStatus::Ok as u8);
                let status = servant.dispatch(is, os, &operation).await?;
                os.patch_byte(status_pos, status as u8);
                Ok(())
            }
        }
    }
    .await;

    if located {
        if let (Some(locator), Some(adapter), Some(servant)) = (&locator, adapter, &servant) {
            locator.finished(adapter.as_ref(), &identity, servant, &operation, cookie);
        }
    }

    match result {
        Ok(()) => Ok(DispatchOutcome::Completed),
        Err(DispatchError::LocationForward { proxy }) => {
            os.truncate(status_pos);
            os.write_byte(DispatchStatus::LocationForward as u8);
            os.write_string(&proxy);
            Ok(DispatchOutcome::Completed)
        }
        Err(DispatchError::Local(err)) => {
            os.truncate(status_pos);
            os.write_byte(DispatchStatus::LocalException as u8);
            Ok(DispatchOutcome::LocalException(err))
        }
        Err(DispatchError::Unhandled(message)) => {
            os.truncate(status_pos);
            os.write_byte(DispatchStatus::UnknownException as u8);
            Ok(DispatchOutcome::UnknownException(message))
        }
    }
}

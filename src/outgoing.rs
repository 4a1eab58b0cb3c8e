//! Pending outgoing calls and their correlation registry.
//!
//! An [`Outgoing`] is the caller-owned handle for one two-way invocation.
//! The connection holds a non-owning reference in its [`OutgoingRegistry`]
//! while the request is pending and completes the handle exactly once,
//! either with the reply frame or with the connection's fatal error. The
//! registry keeps a hint at the most recently touched entry so that replies
//! arriving in request order complete in O(1).

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, Mutex as StdMutex};

use bytes::Bytes;
use tokio::sync::Notify;

use crate::error::Error;

/// State of a pending outgoing invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutgoingState {
    /// Sent (or being sent), no completion yet.
    InProgress,
    /// Completed with a reply frame.
    Completed,
    /// Completed with a connection error.
    Failed,
}

#[derive(Debug)]
struct OutgoingInner {
    state: OutgoingState,
    reply: Option<Bytes>,
    error: Option<Error>,
}

/// Caller-owned handle for one two-way invocation.
#[derive(Debug)]
pub struct Outgoing {
    inner: StdMutex<OutgoingInner>,
    completed: Notify,
}

impl Outgoing {
    /// Create a handle in the in-progress state.
    pub fn new() -> Self {
        Self {
            inner: StdMutex::new(OutgoingInner {
                state: OutgoingState::InProgress,
                reply: None,
                error: None,
            }),
            completed: Notify::new(),
        }
    }

    fn locked(&self) -> std::sync::MutexGuard<'_, OutgoingInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current state.
    pub fn state(&self) -> OutgoingState {
        self.locked().state
    }

    /// Complete with a reply frame. Later completions are ignored.
    pub fn finished_reply(&self, reply: Bytes) {
        {
            let mut inner = self.locked();
            if inner.state != OutgoingState::InProgress {
                return;
            }
            inner.state = OutgoingState::Completed;
            inner.reply = Some(reply);
        }
        self.completed.notify_waiters();
    }

    /// Complete with an error. Later completions are ignored.
    pub fn finished_error(&self, error: Error) {
        {
            let mut inner = self.locked();
            if inner.state != OutgoingState::InProgress {
                return;
            }
            inner.state = OutgoingState::Failed;
            inner.error = Some(error);
        }
        self.completed.notify_waiters();
    }

    /// Take the reply frame, if the call completed successfully.
    pub fn take_reply(&self) -> Option<Bytes> {
        self.locked().reply.take()
    }

    /// The completion error, if the call failed.
    pub fn error(&self) -> Option<Error> {
        self.locked().error.clone()
    }

    /// Wait until the call leaves the in-progress state.
    pub async fn wait_completed(&self) {
        loop {
            let notified = self.completed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.state() != OutgoingState::InProgress {
                return;
            }
            notified.await;
        }
    }
}

impl Default for Outgoing {
    fn default() -> Self {
        Self::new()
    }
}

/// Ordered map from request id to pending outgoing call.
///
/// Ids are unique and strictly positive; 0 is reserved for one-way
/// invocations and never enters the registry.
#[derive(Debug, Default)]
pub struct OutgoingRegistry {
    requests: BTreeMap<i32, Arc<Outgoing>>,
    hint: Option<(i32, Arc<Outgoing>)>,
}

impl OutgoingRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a pending call under its request id and point the hint at it.
    pub fn insert(&mut self, request_id: i32, outgoing: Arc<Outgoing>) {
        debug_assert!(request_id > 0);
        self.requests.insert(request_id, outgoing.clone());
        self.hint = Some((request_id, outgoing));
    }

    /// Complete the call registered under `request_id` with `reply`.
    ///
    /// The hint is consulted before the map lookup and advanced to the next
    /// entry afterwards, so replies arriving in insertion order bypass the
    /// search. Returns `false` if no call is registered under the id.
    pub fn complete(&mut self, request_id: i32, reply: Bytes) -> bool {
        let outgoing = match self.hint.take() {
            Some((id, outgoing)) if id == request_id => {
                self.requests.remove(&request_id);
                outgoing
            }
            hint => {
                self.hint = hint;
                match self.requests.remove(&request_id) {
                    Some(outgoing) => outgoing,
                    None => return false,
                }
            }
        };
        outgoing.finished_reply(reply);
        self.hint = self
            .requests
            .range((Bound::Excluded(request_id), Bound::Unbounded))
            .next()
            .map(|(id, outgoing)| (*id, outgoing.clone()));
        true
    }

    /// Complete every pending call with a clone of `error` and clear the
    /// registry.
    pub fn fail_all(&mut self, error: &Error) {
        for (_, outgoing) in std::mem::take(&mut self.requests) {
            outgoing.finished_error(error.clone());
        }
        self.hint = None;
    }

    /// Whether no calls are pending.
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Number of pending calls.
    pub fn len(&self) -> usize {
        self.requests.len()
    }
}

//! The per-connection state machine.
//!
//! A [`Connection`] owns one [`Transceiver`] and drives all traffic over
//! it: the validation handshake, framed request/reply/batch messages,
//! request correlation, and graceful or forced shutdown.
//!
//! # Lifecycle
//!
//! ```text
//! NotValidated ──► Active ◄──► Holding (server)
//!       │             │            │
//!       └─────────────┴────────────┴──► Closing ──► Closed
//! ```
//!
//! # Concurrency
//!
//! Two monitors guard the connection. The *connection monitor* protects
//! lifecycle state, the dispatch counter, the batch buffer and the adapter;
//! the *send monitor* serialises transceiver writes and protects the
//! outgoing registry and the request-id counter. Lock order is always
//! connection → send.
//!
//! In the default mode a worker task owns the read side of the transceiver
//! and callers drive writes concurrently; in blocking-client mode every
//! request reads its own reply on the caller's task and no worker exists.
//!
//! # At-most-once
//!
//! A send failure before the frame reached the wire is raised to the
//! caller, whose retry layer may pick another connection. After the frame
//! is on the wire the failure is delivered through the pending call
//! instead: raising would invite a retry of an invocation the peer may
//! have already executed.

use std::fmt;
use std::sync::{Arc, Mutex as StdMutex, OnceLock};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use tokio::sync::{Mutex, MutexGuard, Notify};
use tokio::task::JoinHandle;
use tokio::time::timeout as timed;

use crate::config::ConnectionConfig;
use crate::dispatch::{self, DispatchOutcome, ObjectAdapter};
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::outgoing::{Outgoing, OutgoingRegistry, OutgoingState};
use crate::protocol::{self, InputStream, MessageType, OutputStream, HEADER_SIZE};
use crate::transport::Transceiver;

/// Connection lifecycle states, in transition order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum State {
    /// Created; the validation handshake has not completed.
    NotValidated,
    /// Validated and exchanging messages.
    Active,
    /// Server-only quiescent state: inbound dispatch is paused.
    Holding,
    /// Graceful shutdown initiated; draining.
    Closing,
    /// Terminal. The fatal error is set and the transceiver released.
    Closed,
}

/// Why a connection is being destroyed from the outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestructionReason {
    /// The object adapter serving this connection was deactivated.
    ObjectAdapterDeactivated,
    /// The owning communicator was destroyed.
    CommunicatorDestroyed,
}

struct ConnState {
    state: State,
    state_time: Instant,
    dispatch_count: i32,
    batch_stream: BytesMut,
    batch_request_num: i32,
    batch_stream_in_use: bool,
    adapter: Option<Arc<dyn ObjectAdapter>>,
    worker: Option<JoinHandle<()>>,
}

struct SendState {
    registry: OutgoingRegistry,
    next_request_id: i32,
}

/// One validated, framed, correlated RPC connection over a byte transport.
pub struct Connection {
    config: ConnectionConfig,
    endpoint: Endpoint,
    desc: String,
    transport: String,
    blocking: bool,
    transceiver: StdMutex<Option<Arc<dyn Transceiver>>>,
    exception: OnceLock<Error>,
    conn: Mutex<ConnState>,
    conn_notify: Notify,
    send: Mutex<SendState>,
}

impl Connection {
    /// Create a connection over a live transceiver.
    ///
    /// With an `adapter` the connection operates in server mode and takes
    /// the active role in validation. Blocking-client mode (from
    /// [`ConnectionConfig::blocking`]) validates inline before returning;
    /// every other mode spawns the worker task, which validates and
    /// activates the connection asynchronously.
    pub async fn new(
        config: ConnectionConfig,
        transceiver: Arc<dyn Transceiver>,
        endpoint: Endpoint,
        adapter: Option<Arc<dyn ObjectAdapter>>,
    ) -> Result<Arc<Self>> {
        let blocking = config.blocking && adapter.is_none();
        if blocking {
            transceiver.set_timeouts(endpoint.timeout(), endpoint.timeout());
        } else {
            transceiver.set_timeouts(None, endpoint.timeout());
        }

        let desc = transceiver.description();
        let transport = transceiver.transport_type().to_string();
        let connection = Arc::new(Self {
            config,
            endpoint,
            desc,
            transport,
            blocking,
            transceiver: StdMutex::new(Some(transceiver)),
            exception: OnceLock::new(),
            conn: Mutex::new(ConnState {
                state: State::NotValidated,
                state_time: Instant::now(),
                dispatch_count: 0,
                batch_stream: BytesMut::new(),
                batch_request_num: 0,
                batch_stream_in_use: false,
                adapter,
                worker: None,
            }),
            conn_notify: Notify::new(),
            send: Mutex::new(SendState {
                registry: OutgoingRegistry::new(),
                next_request_id: 1,
            }),
        });

        if connection.blocking {
            connection.validate().await?;
        } else {
            let worker = tokio::spawn(Arc::clone(&connection).run());
            connection.conn.lock().await.worker = Some(worker);
        }
        Ok(connection)
    }

    /// The endpoint this connection was created for.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// The per-connection timeout, taken from the endpoint.
    pub fn timeout(&self) -> Option<Duration> {
        self.endpoint.timeout()
    }

    /// Short transport type name, e.g. `"tcp"`.
    pub fn transport_type(&self) -> &str {
        &self.transport
    }

    /// The fatal error, once the connection has failed or closed.
    pub fn last_error(&self) -> Option<Error> {
        self.exception.get().cloned()
    }

    /// The object adapter inbound requests dispatch to.
    pub async fn adapter(&self) -> Option<Arc<dyn ObjectAdapter>> {
        self.conn.lock().await.adapter.clone()
    }

    /// Replace the object adapter.
    ///
    /// Waits until no dispatch is in flight: in-flight invocations borrow
    /// the adapter, so it may only be swapped between dispatches.
    pub async fn set_adapter(&self, adapter: Option<Arc<dyn ObjectAdapter>>) -> Result<()> {
        let mut st = self.conn.lock().await;
        while st.dispatch_count > 0 {
            st = self.wait_notified(st).await;
        }
        if let Some(err) = self.exception.get() {
            return Err(err.clone());
        }
        debug_assert!(st.state < State::Closing);
        st.adapter = adapter;
        Ok(())
    }

    /// Block until the validation handshake has completed, raising the
    /// fatal error if the connection failed first.
    pub async fn wait_for_validation(&self) -> Result<()> {
        let mut st = self.conn.lock().await;
        while st.state == State::NotValidated {
            st = self.wait_notified(st).await;
        }
        if st.state >= State::Closing {
            return Err(self.fatal_error());
        }
        Ok(())
    }

    /// Resume message processing.
    pub async fn activate(&self) {
        let mut st = self.conn.lock().await;
        self.set_state(&mut st, State::Active).await;
    }

    /// Pause server-side dispatch; existing dispatches drain.
    pub async fn hold(&self) {
        let mut st = self.conn.lock().await;
        self.set_state(&mut st, State::Holding).await;
    }

    /// Initiate graceful closure because the surrounding runtime is going
    /// away.
    pub async fn destroy(&self, reason: DestructionReason) {
        let err = match reason {
            DestructionReason::ObjectAdapterDeactivated => Error::ObjectAdapterDeactivated,
            DestructionReason::CommunicatorDestroyed => Error::CommunicatorDestroyed,
        };
        let mut st = self.conn.lock().await;
        self.set_state_with_error(&mut st, State::Closing, err).await;
    }

    /// Close the connection.
    ///
    /// `force` fails every pending request with `ForcedCloseConnection`
    /// immediately. A graceful close first waits until no requests are
    /// pending: failing them with `CloseConnection` would make the caller
    /// retry invocations the peer may have already executed.
    pub async fn close(&self, force: bool) {
        let mut st = self.conn.lock().await;
        if force {
            self.set_state_with_error(&mut st, State::Closed, Error::ForcedCloseConnection)
                .await;
        } else {
            loop {
                let empty = self.send.lock().await.registry.is_empty();
                if empty {
                    break;
                }
                st = self.wait_notified(st).await;
            }
            self.set_state_with_error(&mut st, State::Closing, Error::CloseConnection)
                .await;
        }
    }

    /// Whether closure has been initiated.
    ///
    /// Takes the full lock on purpose: a try-lock could report a closing
    /// connection as live to a caller about to reuse it.
    pub async fn is_destroyed(&self) -> bool {
        self.conn.lock().await.state >= State::Closing
    }

    /// Non-blocking completion check.
    ///
    /// Returns `false` if the connection monitor is contended, the
    /// transceiver is still held, a dispatch is in flight, or the worker
    /// has not exited.
    pub fn is_finished(&self) -> bool {
        let Ok(mut st) = self.conn.try_lock() else {
            return false;
        };
        if self.current_transceiver().is_some() || st.dispatch_count != 0 {
            return false;
        }
        if let Some(worker) = &st.worker {
            if !worker.is_finished() {
                return false;
            }
        }
        debug_assert_eq!(st.state, State::Closed);
        st.worker = None;
        true
    }

    /// Block until dispatch has paused and the connection is holding.
    pub async fn wait_until_holding(&self) {
        let mut st = self.conn.lock().await;
        while st.state < State::Holding || st.dispatch_count > 0 {
            st = self.wait_notified(st).await;
        }
    }

    /// Block until the connection has fully shut down: closure initiated,
    /// dispatches drained, transceiver released, worker exited.
    ///
    /// While waiting for the transceiver, a positive endpoint timeout sets
    /// a deadline from the last state transition; when it expires the
    /// connection is forced to `Closed` with `CloseTimeout` and the wait
    /// continues until the transceiver is actually released.
    pub async fn wait_until_finished(&self) {
        let mut st = self.conn.lock().await;
        while st.state < State::Closing || st.dispatch_count > 0 {
            st = self.wait_notified(st).await;
        }

        while self.current_transceiver().is_some() {
            if st.state != State::Closed {
                if let Some(duration) = self.endpoint.timeout() {
                    let deadline = st.state_time + duration;
                    let now = Instant::now();
                    if now < deadline {
                        let (guard, timed_out) =
                            self.wait_notified_timeout(st, deadline - now).await;
                        st = guard;
                        if timed_out {
                            self.set_state_with_error(&mut st, State::Closed, Error::CloseTimeout)
                                .await;
                        }
                    } else {
                        self.set_state_with_error(&mut st, State::Closed, Error::CloseTimeout)
                            .await;
                    }
                    continue;
                }
            }
            st = self.wait_notified(st).await;
        }

        debug_assert_eq!(st.state, State::Closed);
        let worker = st.worker.take();
        drop(st);
        if let Some(worker) = worker {
            let _ = worker.await;
        }
    }

    // ------------------------------------------------------------------
    // Send path
    // ------------------------------------------------------------------

    /// Send a framed request.
    ///
    /// `payload` must be a complete request frame; the request id (two-way
    /// only) and total size are patched in place under the send lock, so
    /// id order matches wire order. With an `outgoing` handle the request
    /// is two-way: in blocking mode the reply is read inline on this task,
    /// otherwise the call parks until the worker completes the handle or
    /// the connection timeout forces closure.
    pub async fn send_request(
        &self,
        payload: &mut BytesMut,
        outgoing: Option<&Arc<Outgoing>>,
    ) -> Result<()> {
        let mut request_sent = false;
        match self
            .send_request_inner(payload, outgoing, &mut request_sent)
            .await
        {
            Ok(()) => Ok(()),
            Err(err) => {
                {
                    let mut st = self.conn.lock().await;
                    self.set_state_with_error(&mut st, State::Closed, err).await;
                }
                let fatal = self.fatal_error();
                match (request_sent, outgoing) {
                    (true, Some(out)) => {
                        // The frame may have reached the peer; raising here
                        // would break at-most-once. Deliver through the
                        // pending call instead.
                        out.finished_error(fatal);
                        Ok(())
                    }
                    _ => Err(fatal),
                }
            }
        }
    }

    async fn send_request_inner(
        &self,
        payload: &mut BytesMut,
        outgoing: Option<&Arc<Outgoing>>,
        request_sent: &mut bool,
    ) -> Result<()> {
        if payload.len() < HEADER_SIZE + 4 {
            return Err(Error::IllegalMessageSize);
        }

        let mut send = self.send.lock().await;
        let tx = self.transceiver_or_fatal()?;

        let mut request_id = 0;
        if let Some(out) = outgoing {
            request_id = send.next_request_id;
            send.next_request_id = send.next_request_id.wrapping_add(1);
            if request_id <= 0 {
                send.next_request_id = 1;
                request_id = send.next_request_id;
                send.next_request_id += 1;
            }
            protocol::patch_i32_at(payload, HEADER_SIZE, request_id);
            if !self.blocking {
                send.registry.insert(request_id, Arc::clone(out));
            }
        }

        protocol::patch_size(payload);
        tracing::trace!(request_id, size = payload.len(), "sending request");
        tx.write(payload).await?;
        *request_sent = true;

        let Some(out) = outgoing else {
            return Ok(());
        };

        if self.blocking {
            // Re-use the request buffer for the reply.
            let (received_id, invoke_num) = self.read_and_parse(tx.as_ref(), payload).await?;
            if invoke_num > 0 {
                return Err(Error::UnknownMessage);
            }
            if received_id != request_id {
                return Err(Error::UnknownRequestId);
            }
            out.finished_reply(payload.split().freeze());
            return Ok(());
        }

        drop(send);
        match self.endpoint.timeout() {
            Some(duration) => {
                if timed(duration, out.wait_completed()).await.is_err()
                    && out.state() == OutgoingState::InProgress
                {
                    {
                        let mut st = self.conn.lock().await;
                        self.set_state_with_error(&mut st, State::Closed, Error::Timeout)
                            .await;
                    }
                    // The worker completes the call while tearing down.
                    out.wait_completed().await;
                }
            }
            None => out.wait_completed().await,
        }
        Ok(())
    }

    /// Send a reply frame and retire one dispatch.
    pub async fn send_response(&self, buf: &mut BytesMut) {
        let result: Result<()> = async {
            let _send = self.send.lock().await;
            let tx = self.transceiver_or_fatal()?;
            protocol::patch_size(buf);
            tracing::trace!(size = buf.len(), "sending reply");
            tx.write(buf).await
        }
        .await;

        if let Err(err) = result {
            let mut st = self.conn.lock().await;
            self.set_state_with_error(&mut st, State::Closed, err).await;
        }

        self.finish_dispatch().await;
    }

    /// Retire one dispatch that produced no reply.
    pub async fn send_no_response(&self) {
        self.finish_dispatch().await;
    }

    async fn finish_dispatch(&self) {
        let mut st = self.conn.lock().await;
        debug_assert!(st.state > State::NotValidated);
        debug_assert!(st.dispatch_count > 0);
        st.dispatch_count -= 1;
        if st.dispatch_count == 0 {
            self.conn_notify.notify_waiters();
        }
        if st.state == State::Closing && st.dispatch_count == 0 {
            if let Err(err) = self.initiate_shutdown().await {
                self.set_state_with_error(&mut st, State::Closed, err).await;
            }
        }
    }

    // ------------------------------------------------------------------
    // Batch requests
    // ------------------------------------------------------------------

    /// Hand the batch buffer to the caller for marshalling one request.
    ///
    /// Waits while another batch operation is in progress. The buffer
    /// belongs to the caller until [`finish_batch`](Self::finish_batch) or
    /// [`abort_batch`](Self::abort_batch).
    pub async fn prepare_batch(&self, buf: &mut BytesMut) -> Result<()> {
        let mut st = self.conn.lock().await;
        while st.batch_stream_in_use && self.exception.get().is_none() {
            st = self.wait_notified(st).await;
        }
        if let Some(err) = self.exception.get() {
            return Err(err.clone());
        }
        debug_assert!(st.state > State::NotValidated);
        debug_assert!(st.state < State::Closing);

        if st.batch_stream.is_empty() {
            protocol::write_header(&mut st.batch_stream, MessageType::BatchRequest, 4);
        }
        st.batch_stream_in_use = true;
        std::mem::swap(&mut st.batch_stream, buf);
        Ok(())
    }

    /// Take the batch buffer back and count the marshalled request.
    pub async fn finish_batch(&self, buf: &mut BytesMut) {
        let mut st = self.conn.lock().await;
        std::mem::swap(&mut st.batch_stream, buf);
        st.batch_request_num += 1;
        debug_assert!(st.batch_stream_in_use);
        st.batch_stream_in_use = false;
        self.conn_notify.notify_waiters();
    }

    /// Discard the batch: a partially marshalled request cannot be
    /// salvaged.
    pub async fn abort_batch(&self) {
        let mut st = self.conn.lock().await;
        st.batch_stream = BytesMut::new();
        st.batch_request_num = 0;
        debug_assert!(st.batch_stream_in_use);
        st.batch_stream_in_use = false;
        self.conn_notify.notify_waiters();
    }

    /// Send the accumulated batch as one batch-request frame.
    ///
    /// Batch requests are one-way, so failures propagate to the caller
    /// directly.
    pub async fn flush_batch(&self) -> Result<()> {
        let (mut batch, request_num) = {
            let mut st = self.conn.lock().await;
            while st.batch_stream_in_use && self.exception.get().is_none() {
                st = self.wait_notified(st).await;
            }
            if let Some(err) = self.exception.get() {
                st.batch_stream = BytesMut::new();
                st.batch_request_num = 0;
                return Err(err.clone());
            }
            if st.batch_stream.is_empty() {
                return Ok(()); // Nothing to do.
            }
            debug_assert!(st.state > State::NotValidated);
            debug_assert!(st.state < State::Closing);

            // Block new batch requests while flushing.
            st.batch_stream_in_use = true;
            (
                std::mem::take(&mut st.batch_stream),
                st.batch_request_num,
            )
        };

        let result: Result<()> = async {
            let _send = self.send.lock().await;
            let tx = self.transceiver_or_fatal()?;
            protocol::patch_i32_at(&mut batch, HEADER_SIZE, request_num);
            protocol::patch_size(&mut batch);
            tracing::trace!(requests = request_num, size = batch.len(), "sending batch request");
            tx.write(&batch).await
        }
        .await;

        let mut st = self.conn.lock().await;
        let failed = match result {
            Ok(()) => false,
            Err(err) => {
                self.set_state_with_error(&mut st, State::Closed, err).await;
                true
            }
        };
        st.batch_stream = BytesMut::new();
        st.batch_request_num = 0;
        st.batch_stream_in_use = false;
        self.conn_notify.notify_waiters();
        drop(st);

        if failed {
            return Err(self.fatal_error());
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Validation
    // ------------------------------------------------------------------

    async fn validate(&self) -> Result<()> {
        let server_role = {
            let st = self.conn.lock().await;
            debug_assert!(st.state == State::NotValidated || st.state == State::Closed);
            if st.state == State::Closed {
                return Err(self.fatal_error());
            }
            st.adapter.is_some()
        };

        let timeout = self
            .config
            .override_connect_timeout
            .or(self.endpoint.timeout());

        let result: Result<()> = async {
            let tx = self.transceiver_or_fatal()?;
            if server_role {
                // The server side has the active role in validation.
                let mut buf = BytesMut::new();
                protocol::write_header(&mut buf, MessageType::ValidateConnection, 0);
                protocol::patch_size(&mut buf);
                tracing::trace!("sending validate connection");
                let _send = self.send.lock().await;
                match tx.write_with_timeout(&buf, timeout).await {
                    Err(Error::Timeout) => Err(Error::ConnectTimeout),
                    other => other,
                }
            } else {
                let mut buf = [0u8; HEADER_SIZE];
                match tx.read_with_timeout(&mut buf, timeout).await {
                    Err(Error::Timeout) => return Err(Error::ConnectTimeout),
                    Err(err) => return Err(err),
                    Ok(()) => {}
                }
                let header = protocol::read_header(&buf, self.config.message_size_max)?;
                if header.message_type != MessageType::ValidateConnection as u8 {
                    return Err(Error::ConnectionNotValidated);
                }
                if header.size as usize != HEADER_SIZE {
                    return Err(Error::IllegalMessageSize);
                }
                tracing::trace!("received validate connection");
                Ok(())
            }
        }
        .await;

        if let Err(err) = result {
            let mut st = self.conn.lock().await;
            self.set_state_with_error(&mut st, State::Closed, err).await;
            return Err(self.fatal_error());
        }

        if server_role {
            self.hold().await;
        } else {
            self.activate().await;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Receive / parse
    // ------------------------------------------------------------------

    async fn read_and_parse(&self, tx: &dyn Transceiver, buf: &mut BytesMut) -> Result<(i32, i32)> {
        buf.resize(HEADER_SIZE, 0);
        tx.read(&mut buf[..]).await?;

        let header = protocol::read_header(buf, self.config.message_size_max)?;
        let size = header.size as usize;
        if size > buf.len() {
            buf.resize(size, 0);
            let (_, rest) = buf.split_at_mut(HEADER_SIZE);
            tx.read(rest).await?;
        }

        let mut request_id = 0;
        let mut invoke_num = 0;
        match header.kind()? {
            MessageType::CloseConnection => {
                tracing::trace!("received close connection");
                return Err(Error::CloseConnection);
            }
            MessageType::Reply => {
                request_id = protocol::read_i32_at(buf, HEADER_SIZE)?;
                tracing::trace!(request_id, "received reply");
            }
            MessageType::Request => {
                request_id = protocol::read_i32_at(buf, HEADER_SIZE)?;
                invoke_num = 1;
                tracing::trace!(request_id, "received request");
            }
            MessageType::BatchRequest => {
                invoke_num = protocol::read_i32_at(buf, HEADER_SIZE)?;
                if invoke_num < 0 {
                    return Err(Error::NegativeSize);
                }
                tracing::trace!(requests = invoke_num, "received batch request");
            }
            MessageType::ValidateConnection => {
                // Only expected during the handshake; late ones are noise.
                if self.config.warn_connections {
                    tracing::warn!(
                        "ignoring unexpected validate connection message:\n{}",
                        self.desc
                    );
                }
            }
        }
        Ok((request_id, invoke_num))
    }

    // ------------------------------------------------------------------
    // Worker loop
    // ------------------------------------------------------------------

    async fn run(self: Arc<Self>) {
        if self.validate().await.is_err() {
            // This task owns the read side, so it also releases the
            // transceiver on the failure path.
            {
                let _send = self.send.lock().await;
                if let Some(tx) = self.release_transceiver() {
                    tx.close().await;
                }
            }
            self.conn_notify.notify_waiters();
            return;
        }
        self.activate().await;

        let mut stream = BytesMut::with_capacity(HEADER_SIZE);
        let mut closed = false;
        while !closed {
            let mut request_id: i32 = 0;
            let mut invoke_num: i32 = 0;

            // No send lock for the read: this task is the only one that
            // releases the transceiver, so it cannot vanish underneath us.
            if let Some(tx) = self.current_transceiver() {
                match self.read_and_parse(tx.as_ref(), &mut stream).await {
                    Ok((id, num)) => {
                        request_id = id;
                        invoke_num = num;
                    }
                    Err(err) => {
                        let mut st = self.conn.lock().await;
                        self.set_state_with_error(&mut st, State::Closed, err).await;
                    }
                }
            }

            {
                let mut st = self.conn.lock().await;
                if st.state != State::Closed {
                    if invoke_num > 0 {
                        if st.state < State::Closing {
                            st.dispatch_count += invoke_num;
                        } else {
                            invoke_num = 0;
                            tracing::debug!(
                                "request received during closing; ignored, client will retry"
                            );
                        }
                    } else if request_id > 0 {
                        let mut send = self.send.lock().await;
                        let reply = stream.split().freeze();
                        if send.registry.complete(request_id, reply) {
                            drop(send);
                            // Wake a graceful close waiting on an empty
                            // registry.
                            self.conn_notify.notify_waiters();
                        } else {
                            drop(send);
                            self.set_state_with_error(
                                &mut st,
                                State::Closed,
                                Error::UnknownRequestId,
                            )
                            .await;
                        }
                    }
                }

                while st.state == State::Holding {
                    st = self.wait_notified(st).await;
                }

                if st.state == State::Closed {
                    {
                        let _send = self.send.lock().await;
                        if let Some(tx) = self.release_transceiver() {
                            tx.close().await;
                        }
                    }
                    closed = true;
                    self.conn_notify.notify_waiters();
                }

                if st.state >= State::Closing {
                    let mut send = self.send.lock().await;
                    if let Some(err) = self.exception.get() {
                        if !send.registry.is_empty() {
                            send.registry.fail_all(err);
                            drop(send);
                            // A graceful close may be waiting on the
                            // registry draining.
                            self.conn_notify.notify_waiters();
                        }
                    }
                }
            }

            // Invocations run outside the locks so that nested outbound
            // calls over other connections are possible.
            if invoke_num > 0 {
                let abandoned = self.invoke_all(&mut stream, request_id, invoke_num).await;
                if abandoned > 0 {
                    let mut st = self.conn.lock().await;
                    debug_assert!(st.dispatch_count >= abandoned);
                    st.dispatch_count -= abandoned;
                    if st.dispatch_count == 0 {
                        self.conn_notify.notify_waiters();
                    }
                }
            }
        }
    }

    /// Dispatch `invoke_num` invocations from the frame in `stream`.
    /// Returns how many were abandoned because the connection failed.
    async fn invoke_all(&self, stream: &mut BytesMut, request_id: i32, invoke_num: i32) -> i32 {
        let adapter = self.conn.lock().await.adapter.clone();
        let frame = stream.split().freeze();
        let mut is = InputStream::at(frame, HEADER_SIZE + 4);

        let mut remaining = invoke_num;
        while remaining > 0 {
            let response = request_id != 0;
            let mut os = OutputStream::new();
            if response {
                // No further invocations follow when a reply is expected.
                debug_assert_eq!(remaining, 1);
                protocol::write_header(os.buffer_mut(), MessageType::Reply, 0);
                os.write_i32(request_id);
            }

            match dispatch::invoke(adapter.as_ref(), &mut is, &mut os).await {
                Ok(outcome) => {
                    match outcome {
                        DispatchOutcome::Completed => {}
                        DispatchOutcome::LocalException(err) => os.write_string(&err.to_string()),
                        DispatchOutcome::UnknownException(message) => os.write_string(&message),
                    }
                    if response {
                        self.send_response(os.buffer_mut()).await;
                    } else {
                        self.send_no_response().await;
                    }
                }
                Err(err) => {
                    let mut st = self.conn.lock().await;
                    self.set_state_with_error(&mut st, State::Closed, err).await;
                    break;
                }
            }
            remaining -= 1;
        }
        remaining
    }

    // ------------------------------------------------------------------
    // State machine internals
    // ------------------------------------------------------------------

    fn store_exception(&self, st: &ConnState, err: Error) {
        if self.exception.get().is_some() {
            return;
        }
        if self.config.warn_connections
            && st.state > State::NotValidated
            && !err.is_expected_close(st.state)
        {
            tracing::warn!("connection exception: {}\n{}", err, self.desc);
        }
        let _ = self.exception.set(err);
    }

    async fn set_state_with_error(&self, st: &mut ConnState, state: State, err: Error) {
        debug_assert!(state == State::Closing || state == State::Closed);
        if st.state == state {
            return;
        }
        // The new state must be visible before any pending request sees
        // the error, or a retry could pick this connection again.
        self.store_exception(st, err);
        self.set_state(st, state).await;
    }

    async fn set_state(&self, st: &mut ConnState, target: State) {
        let mut target = target;
        loop {
            if st.state == target {
                return;
            }
            match target {
                State::NotValidated => {
                    debug_assert!(false, "cannot transition back to NotValidated");
                    return;
                }
                State::Active => {
                    if st.state != State::Holding && st.state != State::NotValidated {
                        return;
                    }
                }
                State::Holding => {
                    if st.state != State::Active && st.state != State::NotValidated {
                        return;
                    }
                }
                State::Closing => {
                    if st.state == State::Closed {
                        return;
                    }
                }
                State::Closed => {
                    // Shut down both directions; this unblocks a pending
                    // read, and the worker then closes the transceiver. In
                    // blocking mode there is no worker, so close here.
                    if let Some(tx) = self.current_transceiver() {
                        tx.shutdown_read_write();
                        if self.blocking {
                            let _send = self.send.lock().await;
                            tx.close().await;
                            self.release_transceiver();
                        }
                    }
                }
            }

            st.state = target;
            st.state_time = Instant::now();
            self.conn_notify.notify_waiters();

            if st.state != State::Closing || st.dispatch_count != 0 {
                return;
            }
            match self.initiate_shutdown().await {
                Ok(()) => {
                    if !self.blocking {
                        return;
                    }
                    // Nothing will read the peer's answer in blocking
                    // mode; finish closing now.
                    target = State::Closed;
                }
                Err(err) => {
                    self.store_exception(st, err);
                    target = State::Closed;
                }
            }
        }
    }

    async fn initiate_shutdown(&self) -> Result<()> {
        let _send = self.send.lock().await;
        let tx = self.transceiver_or_fatal()?;

        let mut buf = BytesMut::new();
        protocol::write_header(&mut buf, MessageType::CloseConnection, 0);
        protocol::patch_size(&mut buf);
        tracing::trace!("sending close connection");
        tx.write(&buf).await?;

        // The close-connection message is sufficient. The write side of
        // the socket stays open: half-closing it prevents some peers from
        // completing in-flight writes.
        Ok(())
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn current_transceiver(&self) -> Option<Arc<dyn Transceiver>> {
        self.transceiver
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn release_transceiver(&self) -> Option<Arc<dyn Transceiver>> {
        self.transceiver
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    fn transceiver_or_fatal(&self) -> Result<Arc<dyn Transceiver>> {
        self.current_transceiver().ok_or_else(|| self.fatal_error())
    }

    fn fatal_error(&self) -> Error {
        self.exception
            .get()
            .cloned()
            .unwrap_or(Error::ConnectionLost {
                message: "connection closed".to_string(),
            })
    }

    async fn wait_notified<'a>(
        &'a self,
        st: MutexGuard<'a, ConnState>,
    ) -> MutexGuard<'a, ConnState> {
        let notified = self.conn_notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        drop(st);
        notified.await;
        self.conn.lock().await
    }

    async fn wait_notified_timeout<'a>(
        &'a self,
        st: MutexGuard<'a, ConnState>,
        duration: Duration,
    ) -> (MutexGuard<'a, ConnState>, bool) {
        let notified = self.conn_notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        drop(st);
        let timed_out = timed(duration, notified).await.is_err();
        (self.conn.lock().await, timed_out)
    }

    #[cfg(test)]
    async fn force_next_request_id(&self, id: i32) {
        self.send.lock().await.next_request_id = id;
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.desc)
    }
}

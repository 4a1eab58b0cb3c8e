//! End-to-end tests driving both sides of a connection over in-memory
//! duplex pipes: the crate side runs a real [`Connection`], the peer side
//! speaks raw protocol bytes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use icep::connection::Connection;
use icep::dispatch::{DispatchError, DispatchStatus, ObjectAdapter, Servant, ServantLocator};
use icep::outgoing::{Outgoing, OutgoingState};
use icep::protocol::{self, InputStream, MessageType, OutputStream, HEADER_SIZE};
use icep::transport::{StreamTransceiver, Transceiver};
use icep::{ConnectionConfig, Endpoint, Error, Properties};

/// The exact handshake frame: magic, versions 1.0/1.0, validate, size 14.
const VALIDATE: [u8; HEADER_SIZE] = [b'I', b'c', b'e', b'P', 1, 0, 1, 0, 3, 0, 14, 0, 0, 0];

fn transceiver(stream: DuplexStream) -> Arc<dyn Transceiver> {
    Arc::new(StreamTransceiver::new(stream, "integration", "duplex"))
}

/// A complete request frame with an id placeholder and the given body.
fn request_frame(body: &[u8]) -> BytesMut {
    let mut buf = BytesMut::new();
    protocol::write_header(&mut buf, MessageType::Request, 4);
    buf.extend_from_slice(body);
    buf
}

/// A request frame carrying a marshalled identity, operation and params.
fn invocation_frame(identity: &str, operation: &str, params: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    protocol::write_header(&mut buf, MessageType::Request, 4);
    let mut os = OutputStream::with_buffer(buf);
    os.write_string(identity);
    os.write_string(operation);
    os.write_blob(params);
    let mut buf = os.into_buffer();
    protocol::patch_size(&mut buf);
    buf.to_vec()
}

fn reply_frame(request_id: i32, status: u8, body: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    protocol::write_header(&mut buf, MessageType::Reply, 0);
    let mut os = OutputStream::with_buffer(buf);
    os.write_i32(request_id);
    os.write_byte(status);
    os.write_blob(body);
    let mut buf = os.into_buffer();
    protocol::patch_size(&mut buf);
    buf.to_vec()
}

fn close_frame() -> Vec<u8> {
    let mut buf = BytesMut::new();
    protocol::write_header(&mut buf, MessageType::CloseConnection, 0);
    protocol::patch_size(&mut buf);
    buf.to_vec()
}

async fn client_connection(timeout: Option<Duration>) -> (Arc<Connection>, DuplexStream) {
    let (local, mut remote) = tokio::io::duplex(1 << 16);
    remote.write_all(&VALIDATE).await.unwrap();
    let connection = Connection::new(
        ConnectionConfig::default(),
        transceiver(local),
        Endpoint::new("peer:0", timeout),
        None,
    )
    .await
    .unwrap();
    connection.wait_for_validation().await.unwrap();
    (connection, remote)
}

// ----------------------------------------------------------------------
// Handshake
// ----------------------------------------------------------------------

#[tokio::test]
async fn test_handshake_success_client_side() {
    let (connection, mut remote) = client_connection(None).await;

    // The connection validated and is usable.
    assert!(!connection.is_destroyed().await);
    assert!(connection.last_error().is_none());

    // The passive side wrote nothing during the handshake.
    let mut probe = [0u8; 1];
    let read = tokio::time::timeout(Duration::from_millis(50), remote.read(&mut probe)).await;
    assert!(read.is_err(), "passive side wrote {probe:?} during validation");
}

#[tokio::test]
async fn test_handshake_bad_magic() {
    let (local, mut remote) = tokio::io::duplex(1 << 16);
    let mut frame = VALIDATE;
    frame[0..4].copy_from_slice(b"XYZW");
    remote.write_all(&frame).await.unwrap();

    let connection = Connection::new(
        ConnectionConfig::default(),
        transceiver(local),
        Endpoint::new("peer:0", None),
        None,
    )
    .await
    .unwrap();

    assert!(connection.wait_for_validation().await.is_err());
    assert_eq!(
        connection.last_error(),
        Some(Error::BadMagic {
            bad_magic: [b'X', b'Y', b'Z', b'W']
        })
    );
}

#[tokio::test]
async fn test_handshake_server_side_writes_validate_frame() {
    let (local, mut remote) = tokio::io::duplex(1 << 16);
    let adapter: Arc<dyn ObjectAdapter> = Arc::new(TestAdapter::default());
    let _connection = Connection::new(
        ConnectionConfig::default(),
        transceiver(local),
        Endpoint::new("client:0", None),
        Some(adapter),
    )
    .await
    .unwrap();

    let mut frame = [0u8; HEADER_SIZE];
    remote.read_exact(&mut frame).await.unwrap();
    assert_eq!(frame, VALIDATE);
}

#[tokio::test]
async fn test_handshake_slow_peer_is_connect_timeout() {
    let (local, _remote) = tokio::io::duplex(1 << 16);
    let mut properties = Properties::new();
    properties.set("Ice.Override.ConnectTimeout", "50");
    let connection = Connection::new(
        ConnectionConfig::from_properties(&properties),
        transceiver(local),
        Endpoint::new("peer:0", None),
        None,
    )
    .await
    .unwrap();

    assert!(connection.wait_for_validation().await.is_err());
    assert_eq!(connection.last_error(), Some(Error::ConnectTimeout));
}

// ----------------------------------------------------------------------
// Two-way request / reply
// ----------------------------------------------------------------------

#[tokio::test]
async fn test_two_way_request_reply() {
    let (connection, mut remote) = client_connection(None).await;

    let out = Arc::new(Outgoing::new());
    let sender = {
        let connection = Arc::clone(&connection);
        let out = Arc::clone(&out);
        tokio::spawn(async move {
            let mut payload = request_frame(&[0xAB; 42]);
            connection.send_request(&mut payload, Some(&out)).await
        })
    };

    // The frame on the wire: header, id 1, the 42-byte body.
    let mut frame = [0u8; HEADER_SIZE + 4 + 42];
    remote.read_exact(&mut frame).await.unwrap();
    let header = protocol::read_header(&frame, usize::MAX).unwrap();
    assert_eq!(header.kind().unwrap(), MessageType::Request);
    assert_eq!(header.size as usize, frame.len());
    assert_eq!(protocol::read_i32_at(&frame, HEADER_SIZE).unwrap(), 1);

    remote.write_all(&reply_frame(1, 0, &[])).await.unwrap();
    sender.await.unwrap().unwrap();

    assert_eq!(out.state(), OutgoingState::Completed);
    let reply = out.take_reply().unwrap();
    let mut is = InputStream::at(reply, HEADER_SIZE);
    assert_eq!(is.read_i32().unwrap(), 1);
    assert_eq!(is.read_byte().unwrap(), DispatchStatus::Ok as u8);
    assert_eq!(is.remaining(), 0);

    // The registry is empty again: a graceful close does not wait.
    connection.close(false).await;
    assert!(connection.is_destroyed().await);
}

#[tokio::test]
async fn test_writes_keep_send_order() {
    let (connection, mut remote) = client_connection(None).await;

    let mut senders = Vec::new();
    let outs: Vec<_> = (0..3).map(|_| Arc::new(Outgoing::new())).collect();
    for out in &outs {
        let connection = Arc::clone(&connection);
        let out = Arc::clone(out);
        senders.push(tokio::spawn(async move {
            let mut payload = request_frame(&[]);
            connection.send_request(&mut payload, Some(&out)).await
        }));
    }

    // Ids on the wire are unique, strictly positive and increasing:
    // assignment happens under the send lock, so id order is wire order.
    let mut seen = Vec::new();
    for _ in 0..3 {
        let mut frame = [0u8; HEADER_SIZE + 4];
        remote.read_exact(&mut frame).await.unwrap();
        let id = protocol::read_i32_at(&frame, HEADER_SIZE).unwrap();
        assert!(id > 0);
        remote.write_all(&reply_frame(id, 0, &[])).await.unwrap();
        seen.push(id);
    }
    let mut sorted = seen.clone();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(seen, sorted, "ids out of order or duplicated: {seen:?}");

    for sender in senders {
        sender.await.unwrap().unwrap();
    }
    for out in outs {
        assert_eq!(out.state(), OutgoingState::Completed);
    }
}

#[tokio::test]
async fn test_pending_request_times_out() {
    let (connection, _remote) = client_connection(Some(Duration::from_millis(100))).await;

    let out = Arc::new(Outgoing::new());
    let mut payload = request_frame(&[]);
    // The peer never answers.
    connection
        .send_request(&mut payload, Some(&out))
        .await
        .unwrap();

    assert_eq!(out.state(), OutgoingState::Failed);
    assert_eq!(out.error(), Some(Error::Timeout));
    assert_eq!(connection.last_error(), Some(Error::Timeout));
    assert!(connection.is_destroyed().await);
}

#[tokio::test]
async fn test_peer_close_fails_pending_request_with_close_connection() {
    let (connection, mut remote) = client_connection(None).await;

    let out = Arc::new(Outgoing::new());
    let sender = {
        let connection = Arc::clone(&connection);
        let out = Arc::clone(&out);
        tokio::spawn(async move {
            let mut payload = request_frame(&[]);
            connection.send_request(&mut payload, Some(&out)).await
        })
    };

    let mut frame = [0u8; HEADER_SIZE + 4];
    remote.read_exact(&mut frame).await.unwrap();
    remote.write_all(&close_frame()).await.unwrap();

    sender.await.unwrap().unwrap();
    assert_eq!(out.state(), OutgoingState::Failed);
    assert_eq!(out.error(), Some(Error::CloseConnection));
}

// ----------------------------------------------------------------------
// Batch requests and forced close
// ----------------------------------------------------------------------

#[tokio::test]
async fn test_forced_close_mid_batch() {
    let (connection, _remote) = client_connection(None).await;

    for i in 0..3u8 {
        let mut buf = BytesMut::new();
        connection.prepare_batch(&mut buf).await.unwrap();
        buf.extend_from_slice(&[i; 8]);
        connection.finish_batch(&mut buf).await;
    }

    connection.close(true).await;

    let err = connection.flush_batch().await.unwrap_err();
    assert_eq!(err, Error::ForcedCloseConnection);

    // The batch buffer was reset; a later prepare fails on the stored
    // error rather than finding stale data.
    let mut buf = BytesMut::new();
    let err = connection.prepare_batch(&mut buf).await.unwrap_err();
    assert_eq!(err, Error::ForcedCloseConnection);
}

#[tokio::test]
async fn test_batch_flush_writes_one_frame() {
    let (connection, mut remote) = client_connection(None).await;

    for body in [&b"first"[..], &b"second"[..]] {
        let mut buf = BytesMut::new();
        connection.prepare_batch(&mut buf).await.unwrap();
        buf.extend_from_slice(body);
        connection.finish_batch(&mut buf).await;
    }
    connection.flush_batch().await.unwrap();

    let total = HEADER_SIZE + 4 + 5 + 6;
    let mut frame = vec![0u8; total];
    remote.read_exact(&mut frame).await.unwrap();
    let header = protocol::read_header(&frame, usize::MAX).unwrap();
    assert_eq!(header.kind().unwrap(), MessageType::BatchRequest);
    assert_eq!(header.size as usize, total);
    assert_eq!(protocol::read_i32_at(&frame, HEADER_SIZE).unwrap(), 2);
    assert_eq!(&frame[HEADER_SIZE + 4..], b"firstsecond");
}

// ----------------------------------------------------------------------
// Server-side dispatch
// ----------------------------------------------------------------------

#[derive(Default)]
struct TestAdapter {
    servants: std::collections::HashMap<String, Arc<dyn Servant>>,
    locator: Option<Arc<dyn ServantLocator>>,
}

impl ObjectAdapter for TestAdapter {
    fn identity_to_servant(&self, identity: &str) -> Option<Arc<dyn Servant>> {
        self.servants.get(identity).cloned()
    }

    fn servant_locator(&self) -> Option<Arc<dyn ServantLocator>> {
        self.locator.clone()
    }
}

struct EchoServant {
    calls: AtomicUsize,
}

#[async_trait]
impl Servant for EchoServant {
    async fn dispatch(
        &self,
        is: &mut InputStream,
        os: &mut OutputStream,
        operation: &str,
    ) -> Result<DispatchStatus, DispatchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match operation {
            "echo" => {
                let blob = is
                    .read_blob(is.remaining())
                    .map_err(DispatchError::Local)?
                    .to_vec();
                os.write_blob(&blob);
                Ok(DispatchStatus::Ok)
            }
            "oneway-ping" => Ok(DispatchStatus::Ok),
            _ => Err(DispatchError::Local(Error::Unknown {
                message: format!("no such operation: {operation}"),
            })),
        }
    }
}

async fn server_connection(adapter: Arc<dyn ObjectAdapter>) -> (Arc<Connection>, DuplexStream) {
    let (local, mut remote) = tokio::io::duplex(1 << 16);
    let connection = Connection::new(
        ConnectionConfig::default(),
        transceiver(local),
        Endpoint::new("client:0", None),
        Some(adapter),
    )
    .await
    .unwrap();

    // The server has the active role: consume its validate frame.
    let mut frame = [0u8; HEADER_SIZE];
    remote.read_exact(&mut frame).await.unwrap();
    assert_eq!(frame, VALIDATE);
    connection.wait_for_validation().await.unwrap();
    (connection, remote)
}

#[tokio::test]
async fn test_dispatch_object_not_exist() {
    let adapter: Arc<dyn ObjectAdapter> = Arc::new(TestAdapter::default());
    let (_connection, mut remote) = server_connection(adapter).await;

    let mut request = invocation_frame("foo", "op", &[]);
    protocol::patch_i32_at(&mut request, HEADER_SIZE, 7);
    remote.write_all(&request).await.unwrap();

    // Reply: header, id, status = ObjectNotExist, and nothing more.
    let mut reply = [0u8; HEADER_SIZE + 4 + 1];
    remote.read_exact(&mut reply).await.unwrap();
    let header = protocol::read_header(&reply, usize::MAX).unwrap();
    assert_eq!(header.kind().unwrap(), MessageType::Reply);
    assert_eq!(header.size as usize, reply.len());
    assert_eq!(protocol::read_i32_at(&reply, HEADER_SIZE).unwrap(), 7);
    assert_eq!(reply[HEADER_SIZE + 4], DispatchStatus::ObjectNotExist as u8);
}

#[tokio::test]
async fn test_dispatch_echo_round_trip() {
    let servant = Arc::new(EchoServant {
        calls: AtomicUsize::new(0),
    });
    let mut adapter = TestAdapter::default();
    adapter
        .servants
        .insert("counter".to_string(), servant.clone());
    let adapter: Arc<dyn ObjectAdapter> = Arc::new(adapter);
    let (_connection, mut remote) = server_connection(adapter).await;

    let mut request = invocation_frame("counter", "echo", b"ping");
    protocol::patch_i32_at(&mut request, HEADER_SIZE, 1);
    remote.write_all(&request).await.unwrap();

    let mut reply = [0u8; HEADER_SIZE + 4 + 1 + 4];
    remote.read_exact(&mut reply).await.unwrap();
    assert_eq!(protocol::read_i32_at(&reply, HEADER_SIZE).unwrap(), 1);
    assert_eq!(reply[HEADER_SIZE + 4], DispatchStatus::Ok as u8);
    assert_eq!(&reply[HEADER_SIZE + 5..], b"ping");
    assert_eq!(servant.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_dispatch_one_way_sends_no_reply() {
    let servant = Arc::new(EchoServant {
        calls: AtomicUsize::new(0),
    });
    let mut adapter = TestAdapter::default();
    adapter
        .servants
        .insert("counter".to_string(), servant.clone());
    let adapter: Arc<dyn ObjectAdapter> = Arc::new(adapter);
    let (connection, mut remote) = server_connection(adapter).await;

    // Request id 0: one-way, no reply expected.
    let request = invocation_frame("counter", "oneway-ping", &[]);
    remote.write_all(&request).await.unwrap();

    // The dispatch drains without writing anything back.
    let mut probe = [0u8; 1];
    let read = tokio::time::timeout(Duration::from_millis(60), remote.read(&mut probe)).await;
    assert!(read.is_err(), "server replied to a one-way request");
    assert_eq!(servant.calls.load(Ordering::SeqCst), 1);
    assert!(!connection.is_destroyed().await);
}

#[tokio::test]
async fn test_dispatch_local_error_reports_in_reply() {
    let servant = Arc::new(EchoServant {
        calls: AtomicUsize::new(0),
    });
    let mut adapter = TestAdapter::default();
    adapter.servants.insert("counter".to_string(), servant);
    let adapter: Arc<dyn ObjectAdapter> = Arc::new(adapter);
    let (connection, mut remote) = server_connection(adapter).await;

    let mut request = invocation_frame("counter", "bogus", &[]);
    protocol::patch_i32_at(&mut request, HEADER_SIZE, 3);
    remote.write_all(&request).await.unwrap();

    let mut header_bytes = [0u8; HEADER_SIZE];
    remote.read_exact(&mut header_bytes).await.unwrap();
    let header = protocol::read_header(&header_bytes, usize::MAX).unwrap();
    let mut body = vec![0u8; header.size as usize - HEADER_SIZE];
    remote.read_exact(&mut body).await.unwrap();

    let mut is = InputStream::new(bytes::Bytes::from(body));
    assert_eq!(is.read_i32().unwrap(), 3);
    assert_eq!(is.read_byte().unwrap(), DispatchStatus::LocalException as u8);
    let detail = is.read_string().unwrap();
    assert!(detail.contains("no such operation"), "detail: {detail}");

    // A failed dispatch does not kill the connection.
    assert!(!connection.is_destroyed().await);
}

struct OneShotLocator {
    servant: Arc<dyn Servant>,
    finished: AtomicUsize,
}

impl ServantLocator for OneShotLocator {
    fn locate(
        &self,
        _adapter: &dyn ObjectAdapter,
        _identity: &str,
        _operation: &str,
    ) -> Result<(Option<Arc<dyn Servant>>, icep::dispatch::Cookie), DispatchError> {
        Ok((Some(self.servant.clone()), None))
    }

    fn finished(
        &self,
        _adapter: &dyn ObjectAdapter,
        _identity: &str,
        _servant: &Arc<dyn Servant>,
        _operation: &str,
        _cookie: icep::dispatch::Cookie,
    ) {
        self.finished.fetch_add(1, Ordering::SeqCst);
    }

    fn deactivate(&self) {}
}

#[tokio::test]
async fn test_dispatch_via_locator_calls_finished() {
    let locator = Arc::new(OneShotLocator {
        servant: Arc::new(EchoServant {
            calls: AtomicUsize::new(0),
        }),
        finished: AtomicUsize::new(0),
    });
    let adapter: Arc<dyn ObjectAdapter> = Arc::new(TestAdapter {
        servants: Default::default(),
        locator: Some(locator.clone()),
    });
    let (_connection, mut remote) = server_connection(adapter).await;

    let mut request = invocation_frame("located", "echo", b"x");
    protocol::patch_i32_at(&mut request, HEADER_SIZE, 5);
    remote.write_all(&request).await.unwrap();

    let mut reply = [0u8; HEADER_SIZE + 4 + 1 + 1];
    remote.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[HEADER_SIZE + 4], DispatchStatus::Ok as u8);
    assert_eq!(locator.finished.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_batch_request_dispatches_each_record() {
    let servant = Arc::new(EchoServant {
        calls: AtomicUsize::new(0),
    });
    let mut adapter = TestAdapter::default();
    adapter
        .servants
        .insert("counter".to_string(), servant.clone());
    let adapter: Arc<dyn ObjectAdapter> = Arc::new(adapter);
    let (connection, mut remote) = server_connection(adapter).await;

    // Two one-way records in a single batch-request frame.
    let mut buf = BytesMut::new();
    protocol::write_header(&mut buf, MessageType::BatchRequest, 4);
    let mut os = OutputStream::with_buffer(buf);
    for _ in 0..2 {
        os.write_string("counter");
        os.write_string("oneway-ping");
    }
    let mut frame = os.into_buffer();
    protocol::patch_i32_at(&mut frame, HEADER_SIZE, 2);
    protocol::patch_size(&mut frame);
    remote.write_all(&frame).await.unwrap();

    // Both records dispatch; nothing is written back.
    let mut probe = [0u8; 1];
    let read = tokio::time::timeout(Duration::from_millis(80), remote.read(&mut probe)).await;
    assert!(read.is_err(), "server replied to a batch request");
    assert_eq!(servant.calls.load(Ordering::SeqCst), 2);
    assert!(!connection.is_destroyed().await);
}

#[tokio::test]
async fn test_graceful_close_waits_for_peer() {
    let adapter: Arc<dyn ObjectAdapter> = Arc::new(TestAdapter::default());
    let (connection, mut remote) = server_connection(adapter).await;

    connection.close(false).await;

    // The server sent its close-connection frame.
    let mut frame = [0u8; HEADER_SIZE];
    remote.read_exact(&mut frame).await.unwrap();
    let header = protocol::read_header(&frame, usize::MAX).unwrap();
    assert_eq!(header.kind().unwrap(), MessageType::CloseConnection);

    // The peer answers in kind; only then does the connection finish.
    remote.write_all(&close_frame()).await.unwrap();
    connection.wait_until_finished().await;
    assert!(connection.is_finished());
}

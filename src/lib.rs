//! # icep
//!
//! The per-connection core of a binary RPC runtime.
//!
//! Once a bidirectional byte transport has been established, a
//! [`Connection`] turns raw bytes in one direction into framed, validated,
//! correlated RPC traffic in the other. It owns message framing, the
//! connection-level handshake, request correlation, request/reply/batch
//! dispatch, graceful and forced shutdown, and the concurrency gluing
//! these together — while preserving at-most-once invocation semantics.
//!
//! ## Architecture
//!
//! - **Protocol** (`protocol`): the fixed 14-byte frame header and the
//!   little-endian marshalling streams.
//! - **Transport** (`transport`): the [`Transceiver`] port the core
//!   drives; [`StreamTransceiver`] adapts any tokio byte stream.
//! - **Correlation** (`outgoing`): pending two-way calls parked in an
//!   ordered registry with a most-recently-used hint.
//! - **Connection** (`connection`): the lifecycle state machine, send
//!   path, worker loop and batch buffer.
//! - **Dispatch** (`dispatch`): the server-side adapter that resolves a
//!   servant and marshals the reply status.
//!
//! ## Example
//!
//! ```ignore
//! use icep::{Connection, ConnectionConfig, Endpoint, Outgoing, StreamTransceiver};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> icep::Result<()> {
//!     let socket = tokio::net::TcpStream::connect("127.0.0.1:4061").await.unwrap();
//!     let desc = format!("tcp -> {}", socket.peer_addr().unwrap());
//!     let transceiver = Arc::new(StreamTransceiver::new(socket, desc, "tcp"));
//!
//!     let connection = Connection::new(
//!         ConnectionConfig::default(),
//!         transceiver,
//!         Endpoint::new("127.0.0.1:4061", None),
//!         None,
//!     )
//!     .await?;
//!     connection.wait_for_validation().await?;
//!
//!     let outgoing = Arc::new(Outgoing::new());
//!     let mut frame = my_request_frame();
//!     connection.send_request(&mut frame, Some(&outgoing)).await?;
//!     let reply = outgoing.take_reply();
//!     connection.close(false).await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connection;
pub mod dispatch;
pub mod endpoint;
pub mod error;
pub mod outgoing;
pub mod protocol;
pub mod transport;

pub use config::{ConnectionConfig, Properties};
pub use connection::{Connection, DestructionReason, State};
pub use dispatch::{
    DispatchError, DispatchStatus, ObjectAdapter, Servant, ServantLocator,
};
pub use endpoint::Endpoint;
pub use error::{Error, Result};
pub use outgoing::{Outgoing, OutgoingState};
pub use transport::{StreamTransceiver, Transceiver};

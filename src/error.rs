//! Error types for icep.

use thiserror::Error;

use crate::connection::State;

/// Main error type for all connection-level failures.
///
/// The variants fall into four kinds: protocol violations detected while
/// parsing inbound frames, resource limits, lifecycle terminations, and
/// timing failures. A connection stores the first fatal error it sees and
/// delivers clones of it to every pending request, so the type is `Clone`;
/// I/O failures are carried as their OS error text rather than as
/// `std::io::Error`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    /// The first four bytes of a frame did not match the protocol magic.
    #[error("bad magic: {bad_magic:?}")]
    BadMagic {
        /// The four bytes observed on the wire.
        bad_magic: [u8; 4],
    },

    /// The peer speaks an unsupported major protocol version.
    #[error("unsupported protocol version {bad_major}.{bad_minor} (expected {major}.{minor})")]
    UnsupportedProtocol {
        /// Major version observed on the wire.
        bad_major: u8,
        /// Minor version observed on the wire.
        bad_minor: u8,
        /// Major version this side supports.
        major: u8,
        /// Minor version this side supports.
        minor: u8,
    },

    /// The peer uses an unsupported major encoding version.
    #[error("unsupported encoding version {bad_major}.{bad_minor} (expected {major}.{minor})")]
    UnsupportedEncoding {
        /// Major version observed on the wire.
        bad_major: u8,
        /// Minor version observed on the wire.
        bad_minor: u8,
        /// Major version this side supports.
        major: u8,
        /// Minor version this side supports.
        minor: u8,
    },

    /// A frame declared a size smaller than the header, or a size that does
    /// not match what the message kind requires.
    #[error("illegal message size")]
    IllegalMessageSize,

    /// A batch request declared a negative request count.
    #[error("negative size")]
    NegativeSize,

    /// A frame carried an unknown message type.
    #[error("unknown message type")]
    UnknownMessage,

    /// A reply carried a request id with no pending request.
    #[error("unknown request id")]
    UnknownRequestId,

    /// The handshake did not produce a validate-connection message.
    #[error("connection not validated")]
    ConnectionNotValidated,

    /// The peer asked for a feature this implementation rejects.
    #[error("feature not supported: {feature}")]
    FeatureNotSupported {
        /// Name of the rejected feature.
        feature: String,
    },

    /// A frame declared a size above the connection's message size limit.
    #[error("memory limit exceeded")]
    MemoryLimit,

    /// Failed to decode a marshalled value from a message body.
    #[error("marshal error: {message}")]
    MarshalError {
        /// What failed to decode.
        message: String,
    },

    /// The peer closed the connection gracefully.
    #[error("connection closed by peer")]
    CloseConnection,

    /// The connection was forcefully closed locally.
    #[error("connection forcefully closed")]
    ForcedCloseConnection,

    /// The owning communicator was destroyed.
    #[error("communicator destroyed")]
    CommunicatorDestroyed,

    /// The object adapter serving this connection was deactivated.
    #[error("object adapter deactivated")]
    ObjectAdapterDeactivated,

    /// The transport failed or reached end-of-stream unexpectedly.
    #[error("connection lost: {message}")]
    ConnectionLost {
        /// OS error text, or a description of the failure.
        message: String,
    },

    /// The validation handshake did not complete within the connect timeout.
    #[error("connect timeout")]
    ConnectTimeout,

    /// A request did not complete within the connection timeout.
    #[error("timeout")]
    Timeout,

    /// Graceful closure did not complete within the connection timeout.
    #[error("close timeout")]
    CloseTimeout,

    /// A dispatch failed in a way the protocol cannot describe.
    #[error("unknown error: {message}")]
    Unknown {
        /// Description of the failure.
        message: String,
    },
}

impl Error {
    /// Build a `ConnectionLost` from an I/O error.
    pub fn lost(err: &std::io::Error) -> Self {
        Error::ConnectionLost {
            message: err.to_string(),
        }
    }

    /// Whether this error is an expected termination that should not be
    /// logged as a connection warning: peer-initiated close, forced local
    /// close, communicator destruction, adapter deactivation, and a lost
    /// connection while already closing.
    pub(crate) fn is_expected_close(&self, state: State) -> bool {
        match self {
            Error::CloseConnection
            | Error::ForcedCloseConnection
            | Error::CommunicatorDestroyed
            | Error::ObjectAdapterDeactivated => true,
            Error::ConnectionLost { .. } => state == State::Closing,
            _ => false,
        }
    }
}

/// Result type alias using the connection error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_carries_observed_bytes() {
        let err = Error::BadMagic {
            bad_magic: [b'X', b'Y', b'Z', b'W'],
        };
        assert!(err.to_string().contains("88"));
    }

    #[test]
    fn test_expected_close_suppression() {
        assert!(Error::CloseConnection.is_expected_close(State::Active));
        assert!(Error::ForcedCloseConnection.is_expected_close(State::Active));
        assert!(Error::CommunicatorDestroyed.is_expected_close(State::Closing));
        assert!(Error::ObjectAdapterDeactivated.is_expected_close(State::Active));

        // ConnectionLost is only expected while closing.
        let lost = Error::ConnectionLost {
            message: "reset".into(),
        };
        assert!(lost.is_expected_close(State::Closing));
        assert!(!lost.is_expected_close(State::Active));

        assert!(!Error::Timeout.is_expected_close(State::Closing));
    }

    #[test]
    fn test_lost_keeps_os_error_text() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "peer reset");
        let err = Error::lost(&io);
        assert_eq!(
            err,
            Error::ConnectionLost {
                message: "peer reset".into()
            }
        );
    }
}

//! Immutable endpoint descriptor.

use std::fmt;
use std::time::Duration;

/// Where a connection points and how long its operations may take.
///
/// The descriptor is immutable for the lifetime of the connection. The
/// timeout governs the validation handshake, parked two-way requests and
/// the closure deadline; `None` disables it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    address: String,
    timeout: Option<Duration>,
}

impl Endpoint {
    /// Create an endpoint descriptor.
    pub fn new(address: impl Into<String>, timeout: Option<Duration>) -> Self {
        Self {
            address: address.into(),
            timeout,
        }
    }

    /// The peer address.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// The per-connection timeout, if any.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_accessors() {
        let endpoint = Endpoint::new("10.0.0.1:4061", Some(Duration::from_millis(500)));
        assert_eq!(endpoint.address(), "10.0.0.1:4061");
        assert_eq!(endpoint.timeout(), Some(Duration::from_millis(500)));
        assert_eq!(endpoint.to_string(), "10.0.0.1:4061");
    }
}

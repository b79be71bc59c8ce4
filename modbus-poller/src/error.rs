//! Error types for validation, connection, operation, discovery and polling.
//!
//! ```text
//! Error
//! ├── Validation  - malformed caller input, rejected before any I/O
//! ├── Conn        - dialing a session failed or timed out
//! ├── Op          - a read/write could not be served
//! ├── Scan        - discovery could not start
//! ├── Poll        - poll range rejected, manual poll busy or failed
//! └── Unavailable - no transport capability in this environment
//! ```

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::identity::DeviceKey;

/// Caller input outside the accepted domain.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{field} must be within [{min}, {max}], got {value}")]
    OutOfRange {
        field: &'static str,
        value: i64,
        min: i64,
        max: i64,
    },

    #[error("invalid host {0:?}")]
    InvalidHost(String),

    #[error("invalid device key {0:?}")]
    InvalidKey(String),

    #[error("range starting at {address} with length {length} exceeds the address space")]
    AddressOverflow { address: u16, length: u16 },
}

impl ValidationError {
    pub fn out_of_range(field: &'static str, value: i64, min: i64, max: i64) -> Self {
        Self::OutOfRange {
            field,
            value,
            min,
            max,
        }
    }
}

/// Failure to establish a session.
#[derive(Debug, Error)]
pub enum ConnError {
    #[error("connection to {key} timed out after {after:?}")]
    Timeout { key: DeviceKey, after: Duration },

    #[error("connection to {key} failed: {source}")]
    Refused {
        key: DeviceKey,
        #[source]
        source: io::Error,
    },
}

impl ConnError {
    pub fn key(&self) -> &DeviceKey {
        match self {
            Self::Timeout { key, .. } | Self::Refused { key, .. } => key,
        }
    }
}

/// Failure reported by a transport session.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The device answered with a Modbus exception.
    #[error("device exception: {0}")]
    Exception(tokio_modbus::Exception),

    #[error("client error: {0}")]
    Client(#[from] tokio_modbus::Error),

    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("response does not match the request")]
    UnexpectedResponse,
}

impl TransportError {
    /// Whether the failure says something about the link rather than the request.
    ///
    /// An exception is a well-formed answer, so the session is still healthy.
    pub fn is_link_failure(&self) -> bool {
        !matches!(self, Self::Exception(_))
    }
}

/// Failure of a read or write against a pooled session.
#[derive(Debug, Error)]
pub enum OpError {
    #[error("{0} is not connected")]
    NotConnected(DeviceKey),

    #[error("request to {key} failed: {source}")]
    Transport {
        key: DeviceKey,
        #[source]
        source: TransportError,
    },
}

/// Failure to start a discovery scan.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("failed to enumerate network interfaces: {0}")]
    Interfaces(#[source] io::Error),
}

/// Failure to start a poll task or a manual poll.
#[derive(Debug, Error)]
pub enum PollError {
    #[error("invalid poll range: {0}")]
    Validation(#[from] ValidationError),

    #[error("a poll of {0} is already in progress")]
    InProgress(String),

    #[error(transparent)]
    Op(#[from] OpError),
}

/// Any error surfaced by the operation layer.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid input: {0}")]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Conn(#[from] ConnError),

    #[error(transparent)]
    Op(#[from] OpError),

    #[error(transparent)]
    Scan(#[from] ScanError),

    #[error(transparent)]
    Poll(#[from] PollError),

    #[error("Modbus transport is unavailable in this environment")]
    Unavailable,
}

/// Convenience type alias for operation-layer results.
pub type Result<T, E = Error> = std::result::Result<T, E>;

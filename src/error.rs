//! Error types for tcp-pubsub.

use std::io;

use thiserror::Error;

/// Main error type for all publisher/subscriber operations.
///
/// None of these are fatal to the process. Publisher-side I/O errors close
/// only the offending session, subscriber-side I/O errors drive the
/// reconnection loop, and only [`Publisher::start`](crate::Publisher::start)
/// reports errors back to the caller.
#[derive(Debug, Error)]
pub enum PubSubError {
    /// The publisher address could not be parsed as an IP address.
    #[error("Error parsing address \"{address}\": {source}")]
    AddressParse {
        address: String,
        #[source]
        source: std::net::AddrParseError,
    },

    /// Opening or binding the listening socket failed.
    #[error("Error binding acceptor to {endpoint}: {source}")]
    Bind {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    /// Switching the bound socket to listening mode failed.
    #[error("Error listening on {endpoint}: {source}")]
    Listen {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    /// Name resolution failed or produced no endpoints.
    #[error("Failed to resolve {target}: {source}")]
    Resolve {
        target: String,
        #[source]
        source: io::Error,
    },

    /// Connecting to a resolved endpoint failed.
    #[error("Failed connecting to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    /// Socket read failed.
    #[error("Read error: {0}")]
    Read(#[source] io::Error),

    /// Socket write failed.
    #[error("Write error: {0}")]
    Write(#[source] io::Error),

    /// Protocol violation (header too short, unexpected frame type, ...).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Peer closed the connection.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The operation was aborted by `cancel()`.
    #[error("Operation canceled")]
    Canceled,

    /// Tried to send on a publisher that is not running.
    #[error("Publisher is not running")]
    NotRunning,

    /// The worker runtime could not be created.
    #[error("Failed to start executor: {0}")]
    Runtime(#[source] io::Error),
}

impl PubSubError {
    /// Whether this error came from an explicit cancellation.
    pub fn is_canceled(&self) -> bool {
        matches!(self, PubSubError::Canceled)
    }
}

/// Result type alias using PubSubError.
pub type Result<T> = std::result::Result<T, PubSubError>;

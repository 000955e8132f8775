//! Error taxonomy for the server façade and its drivers.
//!
//! `StartError`, `StopError` and `SendError` are returned to callers.
//! `HandshakeError` never is: drivers publish it as a diagnostic event and
//! keep serving.

use std::net::SocketAddr;

use thiserror::Error;

use crate::config::ConfigError;
use crate::network::connection::ConnectionId;

/// Errors from `NetworkServer::start`.
#[derive(Debug, Error)]
pub enum StartError {
    /// The server is already running.
    #[error("server is already running")]
    AlreadyRunning,

    /// The configuration cannot be used for this server.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Failed to bind the listening resource.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address we tried to bind.
        addr: SocketAddr,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// TLS identity could not be loaded or built.
    #[error("tls setup failed: {0}")]
    Tls(String),
}

impl From<ConfigError> for StartError {
    fn from(err: ConfigError) -> Self {
        StartError::InvalidConfig(err.to_string())
    }
}

/// Errors from `NetworkServer::stop`.
#[derive(Debug, Error)]
pub enum StopError {
    /// The listening resource failed while the server was running.
    /// Cleanup has still been performed.
    #[error("transport faulted while running: {0}")]
    TransportFault(String),
}

/// Errors from `NetworkServer::send` and friends. All are recoverable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    /// No such connection in the registry.
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),

    /// The server is not running.
    #[error("server is not running")]
    NotRunning,

    /// The outbound queue is full and the overflow policy refused the buffer.
    #[error("outbound queue full for connection {0}")]
    QueueFull(ConnectionId),

    /// The buffer exceeds the transport's payload limit.
    #[error("payload of {size} bytes exceeds limit of {max}")]
    PayloadTooLarge {
        /// Buffer size.
        size: usize,
        /// Effective limit.
        max: usize,
    },

    /// The connection's transport link is gone.
    #[error("transport error: {0}")]
    Transport(String),
}

/// Why a peer's connection attempt was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    /// `max_connections` reached.
    #[error("connection limit reached")]
    CapacityReached,

    /// The handshake did not complete in time.
    #[error("handshake timed out")]
    Timeout,

    /// Malformed or unexpected handshake traffic.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Peer speaks a protocol version we don't.
    #[error("incompatible protocol version {theirs} (expected {ours})")]
    IncompatibleProtocol {
        /// Version the peer offered.
        theirs: u8,
        /// Version we speak.
        ours: u8,
    },

    /// TLS negotiation failed.
    #[error("tls error: {0}")]
    Tls(String),
}

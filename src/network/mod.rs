//! Networking layer.
//!
//! Transport drivers feed the connection registry; the registry publishes
//! lifecycle and packet events on the event channel; `NetworkServer` ties
//! one driver, one registry and one channel together.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub mod connection;
pub mod error;
pub mod events;
pub mod outbound;
pub mod registry;
pub mod server;
pub mod transport;

pub use connection::{ConnectionId, ConnectionState, ConnectionView, PeerIdentity};
pub use error::{HandshakeError, SendError, StartError, StopError};
pub use events::{
    Diagnostic, DisconnectReason, DispatchMode, EventChannel, EventKind, NetworkEvent,
    SubscriptionHandle,
};
pub use outbound::OverflowPolicy;
pub use registry::{ConnectionRegistry, RegistryLimits};
pub use server::{NetworkServer, ServerState};
pub use transport::{driver_for, DriverContext, DriverState, TransportDriver};

/// Which transport driver backs a server instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NetworkType {
    /// RakNet-style sessions over UDP.
    #[serde(rename = "raknet")]
    RakNetLike,
    /// Encrypted datagrams (QUIC over TLS 1.3).
    #[serde(rename = "secure_datagram")]
    SecureDatagram,
    /// WebSocket over TCP.
    #[serde(rename = "websocket")]
    WebSocket,
    /// No transport; a server of this type cannot start.
    #[serde(rename = "unknown")]
    Unknown,
}

impl fmt::Display for NetworkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NetworkType::RakNetLike => "raknet",
            NetworkType::SecureDatagram => "secure_datagram",
            NetworkType::WebSocket => "websocket",
            NetworkType::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

impl FromStr for NetworkType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "raknet" | "rak_net" => Ok(NetworkType::RakNetLike),
            "secure_datagram" | "secure" | "quic" | "dtls" => Ok(NetworkType::SecureDatagram),
            "websocket" | "ws" => Ok(NetworkType::WebSocket),
            "unknown" => Ok(NetworkType::Unknown),
            other => Err(format!("unknown network type: {other}")),
        }
    }
}

//! # Multinet Server
//!
//! Multi-transport game network server: one event-driven API over a
//! RakNet-style UDP transport, QUIC datagrams and WebSockets.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      MULTINET SERVER                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  config.rs          - ServerConfig, TLS identity source      │
//! │                                                              │
//! │  network/                                                    │
//! │  ├── server.rs      - NetworkServer façade, idle sweeper     │
//! │  ├── registry.rs    - Connection registry (shared state)     │
//! │  ├── connection.rs  - Connection record, ids, snapshots      │
//! │  ├── outbound.rs    - Bounded per-connection send queue      │
//! │  ├── events.rs      - Typed events, publish/subscribe        │
//! │  ├── error.rs       - Start/stop/send/handshake errors       │
//! │  └── transport/     - One driver per NetworkType             │
//! │      ├── raknet/    - UDP sessions, MOTD, 0xFE packets       │
//! │      ├── secure/    - QUIC datagrams over TLS 1.3            │
//! │      └── websocket.rs - WebSocket over TCP                   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```no_run
//! use multinet::{NetworkServer, NetworkType, ServerConfig};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let server = NetworkServer::new(NetworkType::WebSocket);
//! server.events().on_game_packet(|id, payload| {
//!     println!("{id}: {} bytes", payload.len());
//!     Ok(())
//! });
//!
//! let config = ServerConfig {
//!     network_type: NetworkType::WebSocket,
//!     bind_addr: "127.0.0.1:0".parse()?,
//!     ..ServerConfig::default()
//! };
//! let addr = server.start(config).await?;
//! println!("listening on {addr}");
//! server.stop().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod config;
pub mod network;

// Re-export commonly used types
pub use config::{ConfigError, ServerConfig, TlsConfig};
pub use network::{
    ConnectionId, ConnectionState, ConnectionView, Diagnostic, DisconnectReason, DispatchMode,
    EventChannel, EventKind, HandshakeError, NetworkEvent, NetworkServer, NetworkType,
    OverflowPolicy, SendError, ServerState, StartError, StopError, SubscriptionHandle,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

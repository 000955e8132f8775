//! RakNet-like Driver
//!
//! Sessions over one UDP socket. A peer discovers the server with an
//! unconnected ping (answered with the MOTD), opens a session with an
//! open-connection request and then exchanges sequenced frames stamped with
//! the session token it was given. See `codec` for the byte layout.
//!
//! Frames are never fragmented: a game payload must fit in one datagram of
//! at most `MAX_MTU` bytes. Delivery is unreliable; stale and duplicate
//! frames are dropped.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::time::{interval_at, Instant};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::network::connection::{ConnectionId, ConnectionView, PeerIdentity};
use crate::network::error::{HandshakeError, SendError, StartError, StopError};
use crate::network::events::{Diagnostic, DisconnectReason};
use crate::network::registry::ConnectionHandle;
use crate::network::transport::{
    is_transient, DriverContext, DriverLifecycle, DriverState, RunHandle, TransportDriver,
};
use crate::network::NetworkType;

pub mod codec;

use codec::{Datagram, Frame, FrameBody, OfflinePacket, FRAME_HEADER_LEN, MAX_MTU, MIN_MTU};

/// Receive buffer; anything longer than this is truncated by the kernel.
const RECV_BUFFER: usize = 2048;

/// RakNet-like transport driver.
#[derive(Debug)]
pub struct RakNetDriver {
    lifecycle: Arc<DriverLifecycle>,
    server_guid: u64,
}

impl Default for RakNetDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl RakNetDriver {
    /// New idle driver with a random server GUID.
    pub fn new() -> Self {
        Self {
            lifecycle: Arc::new(DriverLifecycle::new(NetworkType::RakNetLike)),
            server_guid: Uuid::new_v4().as_u64_pair().0,
        }
    }

    /// GUID advertised in pongs and replies.
    pub fn server_guid(&self) -> u64 {
        self.server_guid
    }
}

#[async_trait]
impl TransportDriver for RakNetDriver {
    fn network_type(&self) -> NetworkType {
        NetworkType::RakNetLike
    }

    fn state(&self) -> DriverState {
        self.lifecycle.state()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.lifecycle.local_addr()
    }

    fn payload_limit(&self) -> usize {
        MAX_MTU as usize - FRAME_HEADER_LEN
    }

    async fn start(&self, ctx: DriverContext) -> Result<SocketAddr, StartError> {
        let run = self.lifecycle.begin_start(ctx)?;
        let bind_addr = run.ctx.config.bind_addr;

        let bound = match UdpSocket::bind(bind_addr).await {
            Ok(socket) => socket.local_addr().map(|addr| (socket, addr)),
            Err(e) => Err(e),
        };
        let (socket, local_addr) = match bound {
            Ok(bound) => bound,
            Err(source) => {
                self.lifecycle.abort_start();
                return Err(StartError::Bind {
                    addr: bind_addr,
                    source,
                });
            }
        };

        self.lifecycle.bound(local_addr);
        let endpoint = Arc::new(Endpoint {
            socket,
            run: run.clone(),
            lifecycle: self.lifecycle.clone(),
            server_guid: self.server_guid,
            started: Instant::now(),
        });
        self.lifecycle.listening();
        run.tasks.spawn(recv_loop(endpoint));

        info!(guid = self.server_guid, "RakNet server listening on {}", local_addr);
        Ok(local_addr)
    }

    async fn stop(&self) -> Result<(), StopError> {
        self.lifecycle.stop().await
    }

    async fn send(&self, id: ConnectionId, payload: Bytes) -> Result<(), SendError> {
        self.lifecycle.send(id, payload).await
    }

    fn connections(&self) -> Vec<ConnectionView> {
        self.lifecycle.connections()
    }
}

/// What the socket tasks share for one run.
struct Endpoint {
    socket: UdpSocket,
    run: RunHandle,
    lifecycle: Arc<DriverLifecycle>,
    server_guid: u64,
    started: Instant,
}

enum FrameCheck {
    Accept,
    BadToken,
    Stale,
}

impl Endpoint {
    /// Milliseconds since the socket was bound.
    fn clock(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    async fn send_raw(&self, bytes: &[u8], addr: SocketAddr) -> std::io::Result<()> {
        #[cfg(feature = "debug-tracing")]
        trace!(peer = %addr, bytes = %hex::encode(bytes), "datagram out");
        self.socket.send_to(bytes, addr).await.map(|_| ())
    }

    async fn send_offline(&self, packet: OfflinePacket, addr: SocketAddr) {
        if let Err(e) = self.send_raw(&packet.to_bytes(), addr).await {
            debug!("Failed to answer {}: {}", addr, e);
        }
    }

    /// Send a frame, stamping it with the connection's next sequence
    /// number. Returns the number used.
    async fn send_frame(
        &self,
        id: ConnectionId,
        session_token: u64,
        addr: SocketAddr,
        body: FrameBody,
        fallback_sequence: u32,
    ) -> std::io::Result<u32> {
        let sequence = self
            .run
            .ctx
            .registry
            .with_connection(id, |conn| conn.next_send_sequence())
            .unwrap_or(fallback_sequence);
        let frame = Frame {
            sequence,
            session_token,
            body,
        };
        self.send_raw(&frame.to_bytes(), addr).await?;
        Ok(sequence)
    }

    async fn handle_datagram(self: &Arc<Self>, data: Bytes, addr: SocketAddr) {
        let registry = &self.run.ctx.registry;
        match codec::decode(data) {
            Ok(Datagram::Offline(OfflinePacket::UnconnectedPing { time })) => {
                let pong = OfflinePacket::UnconnectedPong {
                    time,
                    server_guid: self.server_guid,
                    motd: self.run.ctx.config.motd.clone(),
                };
                self.send_offline(pong, addr).await;
            }
            Ok(Datagram::Offline(OfflinePacket::OpenConnectionRequest { protocol, mtu })) => {
                self.open_connection(protocol, mtu, addr).await;
            }
            Ok(Datagram::Offline(other)) => {
                debug!("Ignoring server-bound {:?} from {}", other, addr);
            }
            Ok(Datagram::Frame(frame)) => self.handle_frame(frame, addr).await,
            Err(e) => {
                debug!("Malformed datagram from {}: {}", addr, e);
                registry.diagnostic(Diagnostic::MalformedPacket {
                    remote_addr: addr,
                    connection_id: registry.lookup_addr(&addr),
                    reason: e.to_string(),
                });
            }
        }
    }

    async fn open_connection(self: &Arc<Self>, protocol: u8, mtu: u16, addr: SocketAddr) {
        let registry = &self.run.ctx.registry;

        if protocol != codec::PROTOCOL_VERSION {
            let refusal = OfflinePacket::IncompatibleProtocol {
                protocol: codec::PROTOCOL_VERSION,
                server_guid: self.server_guid,
            };
            self.send_offline(refusal, addr).await;
            registry.diagnostic(Diagnostic::HandshakeRejected {
                remote_addr: addr,
                error: HandshakeError::IncompatibleProtocol {
                    theirs: protocol,
                    ours: codec::PROTOCOL_VERSION,
                },
            });
            return;
        }
        if mtu < MIN_MTU {
            registry.diagnostic(Diagnostic::HandshakeRejected {
                remote_addr: addr,
                error: HandshakeError::Protocol(format!("mtu {mtu} below minimum {MIN_MTU}")),
            });
            return;
        }
        let mtu = mtu.min(MAX_MTU);

        // A repeated request means our reply was lost; answer it again.
        if let Some(id) = registry.lookup_addr(&addr) {
            let token = registry
                .with_connection(id, |conn| conn.peer.session_token)
                .flatten();
            if let Some(session_token) = token {
                let reply = OfflinePacket::OpenConnectionReply {
                    server_guid: self.server_guid,
                    session_token,
                    mtu,
                };
                self.send_offline(reply, addr).await;
            }
            return;
        }

        let reservation = match registry.reserve() {
            Ok(reservation) => reservation,
            Err(error) => {
                warn!("Connection limit reached, rejecting {}", addr);
                let refusal = OfflinePacket::NoFreeIncomingConnections {
                    server_guid: self.server_guid,
                };
                self.send_offline(refusal, addr).await;
                registry.diagnostic(Diagnostic::HandshakeRejected {
                    remote_addr: addr,
                    error,
                });
                return;
            }
        };

        let session_token = Uuid::new_v4().as_u64_pair().1;
        let handle = reservation.commit(
            PeerIdentity::with_token(addr, session_token),
            self.run.cancel.child_token(),
        );
        let reply = OfflinePacket::OpenConnectionReply {
            server_guid: self.server_guid,
            session_token,
            mtu,
        };
        self.send_offline(reply, addr).await;

        self.run
            .tasks
            .spawn(write_loop(self.clone(), handle, addr, session_token));
    }

    async fn handle_frame(&self, frame: Frame, addr: SocketAddr) {
        let registry = &self.run.ctx.registry;
        let Some(id) = registry.lookup_addr(&addr) else {
            debug!("Frame from unknown peer {}", addr);
            return;
        };

        let check = registry.with_connection(id, |conn| {
            if conn.peer.session_token != Some(frame.session_token) {
                FrameCheck::BadToken
            } else if !conn.accept_sequence(frame.sequence) {
                FrameCheck::Stale
            } else {
                conn.touch();
                FrameCheck::Accept
            }
        });

        match check {
            None => return,
            Some(FrameCheck::BadToken) => {
                registry.diagnostic(Diagnostic::MalformedPacket {
                    remote_addr: addr,
                    connection_id: Some(id),
                    reason: "session token mismatch".to_string(),
                });
                return;
            }
            Some(FrameCheck::Stale) => {
                trace!(connection = %id, sequence = frame.sequence, "stale frame dropped");
                return;
            }
            Some(FrameCheck::Accept) => {}
        }

        match frame.body {
            FrameBody::Game(payload) => {
                let max = registry.limits().max_payload_size;
                if payload.len() > max {
                    registry.diagnostic(Diagnostic::MalformedPacket {
                        remote_addr: addr,
                        connection_id: Some(id),
                        reason: format!("payload of {} bytes exceeds limit of {max}", payload.len()),
                    });
                    return;
                }
                registry.deliver(id, payload);
            }
            FrameBody::ConnectedPing { time } => {
                let pong = FrameBody::ConnectedPong { time };
                if self
                    .send_frame(id, frame.session_token, addr, pong, 0)
                    .await
                    .is_err()
                {
                    registry.mark_suspect(id);
                }
            }
            FrameBody::ConnectedPong { .. } => {}
            FrameBody::Disconnect => {
                registry.close(id, DisconnectReason::PeerClosed);
            }
        }
    }
}

async fn recv_loop(endpoint: Arc<Endpoint>) {
    let mut buf = vec![0u8; RECV_BUFFER];
    let cancel = endpoint.run.cancel.clone();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("RakNet receive loop cancelled");
                break;
            }
            received = endpoint.socket.recv_from(&mut buf) => {
                match received {
                    Ok((len, addr)) => {
                        #[cfg(feature = "debug-tracing")]
                        trace!(peer = %addr, bytes = %hex::encode(&buf[..len]), "datagram in");
                        let data = Bytes::copy_from_slice(&buf[..len]);
                        endpoint.handle_datagram(data, addr).await;
                    }
                    Err(e) if is_transient(&e) => {
                        debug!("Receive error: {}", e);
                    }
                    Err(e) => {
                        endpoint.lifecycle.fault(format!("receive failed: {e}"));
                        break;
                    }
                }
            }
        }
    }
}

/// Drains one connection's queue and keeps the peer alive. On exit the
/// peer is told the session is over.
async fn write_loop(
    endpoint: Arc<Endpoint>,
    handle: ConnectionHandle,
    addr: SocketAddr,
    session_token: u64,
) {
    let registry = endpoint.run.ctx.registry.clone();
    let keepalive: Duration = endpoint.run.ctx.config.keepalive_interval;
    let mut ping = interval_at(Instant::now() + keepalive, keepalive);
    let mut last_sequence = 0u32;

    loop {
        tokio::select! {
            _ = handle.cancel.cancelled() => break,
            payload = handle.queue.pop() => {
                let Some(payload) = payload else { break };
                let body = FrameBody::Game(payload);
                match endpoint.send_frame(handle.id, session_token, addr, body, last_sequence.wrapping_add(1)).await {
                    Ok(sequence) => {
                        last_sequence = sequence;
                        registry.record_sent(handle.id);
                    }
                    Err(e) => {
                        debug!(connection = %handle.id, "Write error: {}", e);
                        registry.mark_suspect(handle.id);
                    }
                }
            }
            _ = ping.tick() => {
                let body = FrameBody::ConnectedPing { time: endpoint.clock() };
                match endpoint.send_frame(handle.id, session_token, addr, body, last_sequence.wrapping_add(1)).await {
                    Ok(sequence) => last_sequence = sequence,
                    Err(_) => registry.mark_suspect(handle.id),
                }
            }
        }
    }

    // The record may already be gone; continue from our own last number.
    let _ = endpoint
        .send_frame(
            handle.id,
            session_token,
            addr,
            FrameBody::Disconnect,
            last_sequence.wrapping_add(1),
        )
        .await;
    registry.close(handle.id, DisconnectReason::ServerShutdown);
}

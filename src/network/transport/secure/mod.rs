//! Secure Datagram Driver
//!
//! Encrypted datagrams over QUIC (TLS 1.3). Each QUIC connection is one
//! registered connection. Payloads travel as QUIC datagrams when they fit
//! the path's datagram limit, otherwise on a fresh unidirectional stream
//! carrying `[u32 length][payload]`. Peers may use either form.
//!
//! Liveness is quinn's business here: its keep-alive and idle timeout run
//! with the configured intervals, and an idle QUIC connection ends with
//! `DisconnectReason::Timeout`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use quinn::{ClosedStream, ConnectionError, Incoming, SendDatagramError, VarInt, WriteError};
use tokio::time::{interval_at, timeout, Instant};
use tracing::{debug, info, instrument, warn};

use crate::network::connection::{ConnectionId, ConnectionView, PeerIdentity};
use crate::network::error::{HandshakeError, SendError, StartError, StopError};
use crate::network::events::{Diagnostic, DisconnectReason};
use crate::network::registry::{ConnectionHandle, ConnectionRegistry, Reservation};
use crate::network::transport::{
    DriverContext, DriverLifecycle, DriverState, RunHandle, TransportDriver,
};
use crate::network::NetworkType;

pub mod tls;

/// Largest payload carried on a uni stream.
const MAX_STREAM_PAYLOAD: usize = 16 << 20;

/// How long `stop` waits for peers to acknowledge the close.
const DRAIN_GRACE: Duration = Duration::from_secs(1);

/// Errors writing one payload.
#[derive(Debug, thiserror::Error)]
enum PayloadWriteError {
    #[error("datagram: {0}")]
    Datagram(#[from] SendDatagramError),
    #[error("open stream: {0}")]
    Open(#[from] ConnectionError),
    #[error("write: {0}")]
    Write(#[from] WriteError),
    #[error("finish: {0}")]
    Finish(#[from] ClosedStream),
}

/// QUIC transport driver.
#[derive(Debug)]
pub struct SecureDatagramDriver {
    lifecycle: Arc<DriverLifecycle>,
    endpoint: Mutex<Option<quinn::Endpoint>>,
}

impl Default for SecureDatagramDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl SecureDatagramDriver {
    /// New idle driver.
    pub fn new() -> Self {
        Self {
            lifecycle: Arc::new(DriverLifecycle::new(NetworkType::SecureDatagram)),
            endpoint: Mutex::new(None),
        }
    }
}

#[async_trait]
impl TransportDriver for SecureDatagramDriver {
    fn network_type(&self) -> NetworkType {
        NetworkType::SecureDatagram
    }

    fn state(&self) -> DriverState {
        self.lifecycle.state()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.lifecycle.local_addr()
    }

    fn payload_limit(&self) -> usize {
        MAX_STREAM_PAYLOAD
    }

    async fn start(&self, ctx: DriverContext) -> Result<SocketAddr, StartError> {
        let run = self.lifecycle.begin_start(ctx)?;
        let bind_addr = run.ctx.config.bind_addr;

        let server_config = match tls::build_server_config(&run.ctx.config) {
            Ok(server_config) => server_config,
            Err(err) => {
                self.lifecycle.abort_start();
                return Err(err);
            }
        };

        let bound = quinn::Endpoint::server(server_config, bind_addr)
            .and_then(|endpoint| endpoint.local_addr().map(|addr| (endpoint, addr)));
        let (endpoint, local_addr) = match bound {
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
        *self.endpoint.lock() = Some(endpoint.clone());
        self.lifecycle.listening();
        run.tasks
            .spawn(accept_loop(self.lifecycle.clone(), endpoint, run.clone()));

        info!("QUIC server listening on {}", local_addr);
        Ok(local_addr)
    }

    async fn stop(&self) -> Result<(), StopError> {
        let endpoint = self.endpoint.lock().take();
        let result = self.lifecycle.stop().await;

        if let Some(endpoint) = endpoint {
            endpoint.close(VarInt::from_u32(0), b"server shutdown");
            if timeout(DRAIN_GRACE, endpoint.wait_idle()).await.is_err() {
                debug!("QUIC endpoint still draining after {:?}", DRAIN_GRACE);
            }
        }
        result
    }

    async fn send(&self, id: ConnectionId, payload: Bytes) -> Result<(), SendError> {
        self.lifecycle.send(id, payload).await
    }

    fn connections(&self) -> Vec<ConnectionView> {
        self.lifecycle.connections()
    }
}

async fn accept_loop(lifecycle: Arc<DriverLifecycle>, endpoint: quinn::Endpoint, run: RunHandle) {
    loop {
        tokio::select! {
            _ = run.cancel.cancelled() => {
                debug!("QUIC accept loop cancelled");
                break;
            }
            incoming = endpoint.accept() => {
                let Some(incoming) = incoming else {
                    lifecycle.fault("endpoint closed unexpectedly".to_string());
                    break;
                };
                let addr = incoming.remote_address();
                match run.ctx.registry.reserve() {
                    Ok(reservation) => {
                        run.tasks.spawn(serve_connection(run.clone(), incoming, reservation));
                    }
                    Err(error) => {
                        warn!("Connection limit reached, refusing {}", addr);
                        incoming.refuse();
                        run.ctx.registry.diagnostic(Diagnostic::HandshakeRejected {
                            remote_addr: addr,
                            error,
                        });
                    }
                }
            }
        }
    }
}

fn handshake_error(err: &ConnectionError) -> HandshakeError {
    match err {
        ConnectionError::TimedOut => HandshakeError::Timeout,
        ConnectionError::TransportError(e) => HandshakeError::Tls(e.to_string()),
        other => HandshakeError::Protocol(other.to_string()),
    }
}

fn map_close_reason(err: &ConnectionError) -> DisconnectReason {
    match err {
        ConnectionError::TimedOut => DisconnectReason::Timeout,
        ConnectionError::ApplicationClosed(_) => DisconnectReason::PeerClosed,
        ConnectionError::LocallyClosed => DisconnectReason::ServerShutdown,
        _ => DisconnectReason::ProtocolError,
    }
}

fn is_connection_closed(err: &ConnectionError) -> bool {
    matches!(
        err,
        ConnectionError::LocallyClosed
            | ConnectionError::ApplicationClosed(_)
            | ConnectionError::TimedOut
            | ConnectionError::ConnectionClosed(_)
    )
}

#[instrument(skip_all, fields(peer = %incoming.remote_address()))]
async fn serve_connection(run: RunHandle, incoming: Incoming, reservation: Reservation) {
    let registry = run.ctx.registry.clone();
    let addr = incoming.remote_address();

    let connecting = match incoming.accept() {
        Ok(connecting) => connecting,
        Err(e) => {
            registry.diagnostic(Diagnostic::HandshakeRejected {
                remote_addr: addr,
                error: handshake_error(&e),
            });
            return;
        }
    };
    let handshake = tokio::select! {
        _ = run.cancel.cancelled() => {
            debug!("Handshake with {} abandoned on shutdown", addr);
            return;
        }
        handshake = timeout(run.ctx.config.handshake_timeout, connecting) => handshake,
    };
    let connection = match handshake {
        Ok(Ok(connection)) => connection,
        Ok(Err(e)) => {
            debug!("QUIC handshake failed for {}: {}", addr, e);
            registry.diagnostic(Diagnostic::HandshakeRejected {
                remote_addr: addr,
                error: handshake_error(&e),
            });
            return;
        }
        Err(_) => {
            registry.diagnostic(Diagnostic::HandshakeRejected {
                remote_addr: addr,
                error: HandshakeError::Timeout,
            });
            return;
        }
    };

    if run.cancel.is_cancelled() {
        connection.close(VarInt::from_u32(0), b"shutdown");
        return;
    }
    let handle = reservation.commit(PeerIdentity::from_addr(addr), run.cancel.child_token());
    let keepalive = run.ctx.config.keepalive_interval;

    let writer = run.tasks.spawn(write_loop(
        registry.clone(),
        handle.clone(),
        connection.clone(),
        keepalive,
    ));
    let streams = run.tasks.spawn(read_uni_streams(
        registry.clone(),
        handle.clone(),
        connection.clone(),
    ));

    let reason = tokio::select! {
        _ = handle.cancel.cancelled() => DisconnectReason::ServerShutdown,
        reason = read_datagrams(&registry, &handle, &connection) => reason,
    };
    registry.close(handle.id, reason);
    connection.close(VarInt::from_u32(0), b"closed");

    let _ = writer.await;
    let _ = streams.await;
}

async fn read_datagrams(
    registry: &ConnectionRegistry,
    handle: &ConnectionHandle,
    connection: &quinn::Connection,
) -> DisconnectReason {
    loop {
        match connection.read_datagram().await {
            Ok(payload) => {
                registry.deliver(handle.id, payload);
            }
            Err(e) => {
                if !is_connection_closed(&e) {
                    debug!(connection = %handle.id, "QUIC connection error: {}", e);
                }
                return map_close_reason(&e);
            }
        }
    }
}

async fn read_uni_streams(
    registry: Arc<ConnectionRegistry>,
    handle: ConnectionHandle,
    connection: quinn::Connection,
) {
    let addr = connection.remote_address();
    loop {
        let mut recv = match connection.accept_uni().await {
            Ok(recv) => recv,
            Err(_) => break,
        };

        let mut len_buf = [0u8; 4];
        if let Err(e) = recv.read_exact(&mut len_buf).await {
            debug!(connection = %handle.id, "Stream read error: {}", e);
            continue;
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        let max = registry.limits().max_payload_size;
        if len > max {
            let _ = recv.stop(VarInt::from_u32(1));
            registry.diagnostic(Diagnostic::MalformedPacket {
                remote_addr: addr,
                connection_id: Some(handle.id),
                reason: format!("stream payload of {len} bytes exceeds limit of {max}"),
            });
            continue;
        }

        let mut buf = vec![0u8; len];
        if let Err(e) = recv.read_exact(&mut buf).await {
            debug!(connection = %handle.id, "Stream read error: {}", e);
            continue;
        }
        registry.deliver(handle.id, Bytes::from(buf));
    }
}

async fn write_payload(connection: &quinn::Connection, payload: Bytes) -> Result<(), PayloadWriteError> {
    let fits_datagram = connection
        .max_datagram_size()
        .is_some_and(|max| payload.len() <= max);
    if fits_datagram {
        connection.send_datagram(payload)?;
        return Ok(());
    }

    let mut send = connection.open_uni().await?;
    send.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    send.write_all(&payload).await?;
    send.finish()?;
    Ok(())
}

async fn write_loop(
    registry: Arc<ConnectionRegistry>,
    handle: ConnectionHandle,
    connection: quinn::Connection,
    keepalive: Duration,
) {
    let mut alive = interval_at(Instant::now() + keepalive, keepalive);

    loop {
        tokio::select! {
            _ = handle.cancel.cancelled() => break,
            payload = handle.queue.pop() => {
                let Some(payload) = payload else { break };
                match write_payload(&connection, payload).await {
                    Ok(()) => registry.record_sent(handle.id),
                    Err(e) => {
                        debug!(connection = %handle.id, "QUIC write error: {}", e);
                        registry.mark_suspect(handle.id);
                    }
                }
            }
            _ = alive.tick() => {
                // quinn's idle timer decides; keep the registry sweeper in step.
                if connection.close_reason().is_none() {
                    registry.touch(handle.id);
                }
            }
        }
    }
}

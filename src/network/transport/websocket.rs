//! WebSocket Driver
//!
//! WebSocket over TCP. Binary and text frames both carry payloads; outbound
//! payloads are sent as binary frames. Capacity is claimed before the HTTP
//! upgrade, so an over-capacity client gets `503 Service Unavailable`
//! instead of a socket that is closed right after the upgrade.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{interval_at, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{accept_async_with_config, accept_hdr_async_with_config, WebSocketStream};
use tracing::{debug, info, instrument, warn};

use crate::config::ServerConfig;
use crate::network::connection::{ConnectionId, ConnectionView, PeerIdentity};
use crate::network::error::{HandshakeError, SendError, StartError, StopError};
use crate::network::events::{Diagnostic, DisconnectReason};
use crate::network::registry::{ConnectionHandle, ConnectionRegistry, Reservation};
use crate::network::transport::{
    is_transient, DriverContext, DriverLifecycle, DriverState, RunHandle, TransportDriver,
};
use crate::network::NetworkType;

/// Largest message tungstenite will assemble by default.
const WS_PAYLOAD_LIMIT: usize = 16 << 20;

/// Grace period for the closing handshake on our side.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsStream = SplitStream<WebSocketStream<TcpStream>>;

/// WebSocket transport driver.
#[derive(Debug)]
pub struct WebSocketDriver {
    lifecycle: Arc<DriverLifecycle>,
}

impl Default for WebSocketDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl WebSocketDriver {
    /// New idle driver.
    pub fn new() -> Self {
        Self {
            lifecycle: Arc::new(DriverLifecycle::new(NetworkType::WebSocket)),
        }
    }
}

#[async_trait]
impl TransportDriver for WebSocketDriver {
    fn network_type(&self) -> NetworkType {
        NetworkType::WebSocket
    }

    fn state(&self) -> DriverState {
        self.lifecycle.state()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.lifecycle.local_addr()
    }

    fn payload_limit(&self) -> usize {
        WS_PAYLOAD_LIMIT
    }

    async fn start(&self, ctx: DriverContext) -> Result<SocketAddr, StartError> {
        let run = self.lifecycle.begin_start(ctx)?;
        let bind_addr = run.ctx.config.bind_addr;

        let listener = match TcpListener::bind(bind_addr).await {
            Ok(listener) => listener,
            Err(source) => {
                self.lifecycle.abort_start();
                return Err(StartError::Bind {
                    addr: bind_addr,
                    source,
                });
            }
        };
        let local_addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(source) => {
                self.lifecycle.abort_start();
                return Err(StartError::Bind {
                    addr: bind_addr,
                    source,
                });
            }
        };

        self.lifecycle.bound(local_addr);
        self.lifecycle.listening();
        run.tasks
            .spawn(accept_loop(self.lifecycle.clone(), listener, run.clone()));

        info!("WebSocket server listening on {}", local_addr);
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

fn ws_config(config: &ServerConfig) -> WebSocketConfig {
    let limit = config.max_payload_size.min(WS_PAYLOAD_LIMIT);
    let mut ws = WebSocketConfig::default();
    ws.max_message_size = Some(limit);
    ws.max_frame_size = Some(limit);
    ws
}

async fn accept_loop(lifecycle: Arc<DriverLifecycle>, listener: TcpListener, run: RunHandle) {
    loop {
        tokio::select! {
            _ = run.cancel.cancelled() => {
                debug!("WebSocket accept loop cancelled");
                break;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, addr)) => {
                        let _ = stream.set_nodelay(true);
                        match run.ctx.registry.reserve() {
                            Ok(reservation) => {
                                debug!("New connection from {}", addr);
                                run.tasks.spawn(serve_connection(run.clone(), stream, addr, reservation));
                            }
                            Err(error) => {
                                warn!("Connection limit reached, rejecting {}", addr);
                                run.ctx.registry.diagnostic(Diagnostic::HandshakeRejected {
                                    remote_addr: addr,
                                    error,
                                });
                                run.tasks.spawn(reject_connection(run.ctx.config.clone(), run.cancel.clone(), stream));
                            }
                        }
                    }
                    Err(e) if is_transient(&e) => {
                        warn!("Accept error: {}", e);
                    }
                    Err(e) => {
                        lifecycle.fault(format!("accept failed: {e}"));
                        break;
                    }
                }
            }
        }
    }
}

/// Complete the HTTP exchange with a 503 so the client sees why.
async fn reject_connection(config: Arc<ServerConfig>, cancel: CancellationToken, stream: TcpStream) {
    let refuse = |_: &Request, _: Response| -> Result<Response, ErrorResponse> {
        let mut response = ErrorResponse::new(Some("server is at capacity".to_string()));
        *response.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
        Err(response)
    };

    let refusal = timeout(
        config.handshake_timeout,
        accept_hdr_async_with_config(stream, refuse, Some(ws_config(&config))),
    );
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = refusal => {}
    }
}

#[instrument(skip_all, fields(peer = %addr))]
async fn serve_connection(run: RunHandle, stream: TcpStream, addr: SocketAddr, reservation: Reservation) {
    let registry = run.ctx.registry.clone();
    let config = run.ctx.config.clone();

    let handshake = timeout(
        config.handshake_timeout,
        accept_async_with_config(stream, Some(ws_config(&config))),
    );
    let outcome = tokio::select! {
        _ = run.cancel.cancelled() => {
            debug!("Handshake with {} abandoned on shutdown", addr);
            return;
        }
        outcome = handshake => outcome,
    };
    let ws = match outcome {
        Ok(Ok(ws)) => ws,
        Ok(Err(e)) => {
            debug!("WebSocket handshake failed for {}: {}", addr, e);
            registry.diagnostic(Diagnostic::HandshakeRejected {
                remote_addr: addr,
                error: HandshakeError::Protocol(e.to_string()),
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
        return;
    }
    let handle = reservation.commit(PeerIdentity::from_addr(addr), run.cancel.child_token());
    let (sink, stream) = ws.split();

    let writer = run.tasks.spawn(write_loop(
        registry.clone(),
        handle.clone(),
        sink,
        config.keepalive_interval,
    ));

    let reason = read_loop(&registry, &handle, stream).await;
    registry.close(handle.id, reason);
    let _ = writer.await;
}

async fn read_loop(
    registry: &ConnectionRegistry,
    handle: &ConnectionHandle,
    mut stream: WsStream,
) -> DisconnectReason {
    loop {
        tokio::select! {
            _ = handle.cancel.cancelled() => return DisconnectReason::ServerShutdown,
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        registry.deliver(handle.id, Bytes::from(data));
                    }
                    Some(Ok(Message::Text(text))) => {
                        registry.deliver(handle.id, Bytes::from(text.into_bytes()));
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {
                        registry.touch(handle.id);
                    }
                    Some(Ok(Message::Close(_))) | None => return DisconnectReason::PeerClosed,
                    Some(Err(e)) => {
                        debug!(connection = %handle.id, "WebSocket read error: {}", e);
                        return disconnect_reason(&e);
                    }
                }
            }
        }
    }
}

fn disconnect_reason(err: &tungstenite::Error) -> DisconnectReason {
    use tungstenite::error::ProtocolError;
    match err {
        tungstenite::Error::ConnectionClosed
        | tungstenite::Error::AlreadyClosed
        | tungstenite::Error::Io(_)
        | tungstenite::Error::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
            DisconnectReason::PeerClosed
        }
        _ => DisconnectReason::ProtocolError,
    }
}

async fn write_loop(
    registry: Arc<ConnectionRegistry>,
    handle: ConnectionHandle,
    mut sink: WsSink,
    keepalive: Duration,
) {
    let mut ping = interval_at(Instant::now() + keepalive, keepalive);

    loop {
        tokio::select! {
            _ = handle.cancel.cancelled() => break,
            payload = handle.queue.pop() => {
                let Some(payload) = payload else { break };
                match sink.send(Message::Binary(payload.to_vec())).await {
                    Ok(()) => registry.record_sent(handle.id),
                    Err(e) => {
                        debug!(connection = %handle.id, "WebSocket write error: {}", e);
                        registry.mark_suspect(handle.id);
                    }
                }
            }
            _ = ping.tick() => {
                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    registry.mark_suspect(handle.id);
                }
            }
        }
    }

    let _ = timeout(CLOSE_GRACE, sink.close()).await;
}

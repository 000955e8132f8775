//! Transport Drivers
//!
//! One driver per `NetworkType`. A driver owns the listening resource, runs
//! the transport handshake, registers peers in the registry and moves
//! payloads between the wire and the registry's queues and events.
//!
//! ```text
//!   Idle ──start──▶ Bound ──▶ Listening ──stop──▶ Closing ──▶ Closed
//!    ▲                │                                          │
//!    └── bind fails ──┘                  start again ◀───────────┘
//! ```

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::network::connection::{ConnectionId, ConnectionView};
use crate::network::error::{SendError, StartError, StopError};
use crate::network::events::{Diagnostic, DisconnectReason};
use crate::network::registry::ConnectionRegistry;
use crate::network::NetworkType;

pub mod raknet;
pub mod secure;
pub mod websocket;

pub use raknet::RakNetDriver;
pub use secure::SecureDatagramDriver;
pub use websocket::WebSocketDriver;

/// Driver lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    /// Not started, or a start attempt failed.
    Idle,
    /// Listening resource bound; accept loop not yet running.
    Bound,
    /// Accepting peers.
    Listening,
    /// Stop in progress.
    Closing,
    /// Stopped, or failed while running. May be started again.
    Closed,
}

/// Everything a driver needs from the server while running.
#[derive(Debug, Clone)]
pub struct DriverContext {
    /// Shared connection registry.
    pub registry: Arc<ConnectionRegistry>,
    /// Validated configuration.
    pub config: Arc<ServerConfig>,
}

/// A transport driver.
#[async_trait]
pub trait TransportDriver: Send + Sync + fmt::Debug {
    /// Transport this driver implements.
    fn network_type(&self) -> NetworkType;

    /// Current lifecycle state.
    fn state(&self) -> DriverState;

    /// Bound address while running.
    fn local_addr(&self) -> Option<SocketAddr>;

    /// Largest payload one `send` can carry on this transport.
    fn payload_limit(&self) -> usize;

    /// Bind, then start accepting peers. Returns the bound address.
    async fn start(&self, ctx: DriverContext) -> Result<SocketAddr, StartError>;

    /// Stop accepting, close every connection with `ServerShutdown` and
    /// release the listening resource.
    async fn stop(&self) -> Result<(), StopError>;

    /// Queue a payload for one connection.
    async fn send(&self, id: ConnectionId, payload: Bytes) -> Result<(), SendError>;

    /// Connections registered through this driver.
    fn connections(&self) -> Vec<ConnectionView>;
}

/// Driver for a network type. `Unknown` has none.
pub fn driver_for(network_type: NetworkType) -> Option<Arc<dyn TransportDriver>> {
    match network_type {
        NetworkType::RakNetLike => Some(Arc::new(RakNetDriver::new())),
        NetworkType::SecureDatagram => Some(Arc::new(SecureDatagramDriver::new())),
        NetworkType::WebSocket => Some(Arc::new(WebSocketDriver::new())),
        NetworkType::Unknown => None,
    }
}

/// Socket errors that only affect one peer or one receive call.
pub(crate) fn is_transient(err: &std::io::Error) -> bool {
    use std::io::ErrorKind::*;
    matches!(
        err.kind(),
        ConnectionAborted | ConnectionReset | ConnectionRefused | Interrupted | WouldBlock | TimedOut
    )
}

/// Tokens handed to a driver's tasks for one run.
#[derive(Debug, Clone)]
pub(crate) struct RunHandle {
    pub cancel: CancellationToken,
    pub tasks: TaskTracker,
    pub ctx: DriverContext,
}

#[derive(Debug)]
struct LifecycleInner {
    state: DriverState,
    local_addr: Option<SocketAddr>,
    run: Option<RunHandle>,
    fault: Option<String>,
}

/// State machine and task bookkeeping shared by every driver.
#[derive(Debug)]
pub(crate) struct DriverLifecycle {
    network_type: NetworkType,
    inner: Mutex<LifecycleInner>,
}

impl DriverLifecycle {
    pub fn new(network_type: NetworkType) -> Self {
        Self {
            network_type,
            inner: Mutex::new(LifecycleInner {
                state: DriverState::Idle,
                local_addr: None,
                run: None,
                fault: None,
            }),
        }
    }

    pub fn state(&self) -> DriverState {
        self.inner.lock().state
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.lock().local_addr
    }

    /// Claim the driver for a new run.
    pub fn begin_start(&self, ctx: DriverContext) -> Result<RunHandle, StartError> {
        let mut inner = self.inner.lock();
        let restartable = match inner.state {
            DriverState::Idle => true,
            DriverState::Closed => inner.run.is_none(),
            _ => false,
        };
        if !restartable {
            return Err(StartError::AlreadyRunning);
        }

        let run = RunHandle {
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
            ctx,
        };
        inner.state = DriverState::Idle;
        inner.fault = None;
        inner.run = Some(run.clone());
        Ok(run)
    }

    pub fn bound(&self, addr: SocketAddr) {
        let mut inner = self.inner.lock();
        inner.state = DriverState::Bound;
        inner.local_addr = Some(addr);
        info!(transport = %self.network_type, %addr, "bound");
    }

    pub fn listening(&self) {
        self.inner.lock().state = DriverState::Listening;
    }

    /// Roll back a start that failed before listening.
    pub fn abort_start(&self) {
        let mut inner = self.inner.lock();
        if let Some(run) = inner.run.take() {
            run.cancel.cancel();
        }
        inner.state = DriverState::Idle;
        inner.local_addr = None;
    }

    /// The listening resource failed. Connections are cancelled and the
    /// fault is kept for `stop` to report.
    pub fn fault(&self, message: String) {
        let run = {
            let mut inner = self.inner.lock();
            if matches!(inner.state, DriverState::Closing | DriverState::Closed) {
                return;
            }
            inner.state = DriverState::Closed;
            inner.fault = Some(message.clone());
            inner.run.clone()
        };

        error!(transport = %self.network_type, error = %message, "transport fault");
        if let Some(run) = run {
            run.cancel.cancel();
            run.ctx.registry.diagnostic(Diagnostic::TransportFault {
                network_type: self.network_type,
                message,
            });
        }
    }

    /// Current run, if the driver is accepting.
    pub fn running(&self) -> Option<RunHandle> {
        let inner = self.inner.lock();
        match inner.state {
            DriverState::Listening => inner.run.clone(),
            _ => None,
        }
    }

    /// Cancel every task of the current run and wait for them, bounded by
    /// `shutdown_timeout`. Leftover connections are closed here.
    pub async fn stop(&self) -> Result<(), StopError> {
        let run = {
            let mut inner = self.inner.lock();
            match (inner.state, inner.run.clone()) {
                (DriverState::Closing, _) | (_, None) => return Ok(()),
                (_, Some(run)) => {
                    inner.state = DriverState::Closing;
                    run
                }
            }
        };

        run.cancel.cancel();
        run.tasks.close();
        let timeout = run.ctx.config.shutdown_timeout;
        if tokio::time::timeout(timeout, run.tasks.wait()).await.is_err() {
            warn!(
                transport = %self.network_type,
                pending = run.tasks.len(),
                "tasks still running after shutdown timeout"
            );
        }
        run.ctx.registry.drain(DisconnectReason::ServerShutdown);

        let fault = {
            let mut inner = self.inner.lock();
            inner.state = DriverState::Closed;
            inner.local_addr = None;
            inner.run = None;
            inner.fault.take()
        };
        info!(transport = %self.network_type, "stopped");

        match fault {
            Some(message) => Err(StopError::TransportFault(message)),
            None => Ok(()),
        }
    }

    pub async fn send(&self, id: ConnectionId, payload: Bytes) -> Result<(), SendError> {
        let run = self.running().ok_or(SendError::NotRunning)?;
        run.ctx.registry.enqueue(id, payload).await
    }

    pub fn connections(&self) -> Vec<ConnectionView> {
        self.inner
            .lock()
            .run
            .as_ref()
            .map(|run| run.ctx.registry.snapshot())
            .unwrap_or_default()
    }
}

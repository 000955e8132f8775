//! Network Server
//!
//! The façade game code talks to. One server owns one transport driver,
//! one connection registry and one event channel; the transport is fixed
//! when the server is constructed.
//!
//! Lifecycle: `Idle → Running → Stopped`, and `Stopped` may be started
//! again. Connection ids keep counting across restarts.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, instrument};

use crate::config::ServerConfig;
use crate::network::connection::{ConnectionId, ConnectionView};
use crate::network::error::{SendError, StartError, StopError};
use crate::network::events::{DisconnectReason, EventChannel};
use crate::network::registry::{ConnectionRegistry, RegistryLimits};
use crate::network::transport::{driver_for, DriverContext, DriverState, TransportDriver};
use crate::network::NetworkType;

/// Server lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Never started.
    Idle,
    /// Accepting peers.
    Running,
    /// Stopped; may be started again.
    Stopped,
}

/// Multi-transport game network server.
pub struct NetworkServer {
    /// Transport this server speaks.
    network_type: NetworkType,
    /// Driver, absent for `NetworkType::Unknown`.
    driver: Option<Arc<dyn TransportDriver>>,
    /// Live connections.
    registry: Arc<ConnectionRegistry>,
    /// Event bus shared with the registry.
    events: EventChannel,
    /// Lifecycle state.
    state: Mutex<ServerState>,
    /// Idle sweeper of the current run.
    sweeper: Mutex<Option<JoinHandle<()>>>,
    /// Serializes `start` and `stop`.
    transition: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for NetworkServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkServer")
            .field("network_type", &self.network_type)
            .field("state", &self.state())
            .field("connections", &self.registry.len())
            .finish()
    }
}

impl NetworkServer {
    /// Create a server for `network_type` with its own event channel.
    pub fn new(network_type: NetworkType) -> Self {
        Self::with_channel(network_type, EventChannel::default())
    }

    /// Create a server publishing on an existing event channel.
    pub fn with_channel(network_type: NetworkType, events: EventChannel) -> Self {
        Self::build(network_type, driver_for(network_type), events)
    }

    /// Create a server around a custom driver.
    pub fn with_driver(driver: Arc<dyn TransportDriver>, events: EventChannel) -> Self {
        Self::build(driver.network_type(), Some(driver), events)
    }

    fn build(
        network_type: NetworkType,
        driver: Option<Arc<dyn TransportDriver>>,
        events: EventChannel,
    ) -> Self {
        Self {
            network_type,
            driver,
            registry: Arc::new(ConnectionRegistry::new(events.clone())),
            events,
            state: Mutex::new(ServerState::Idle),
            sweeper: Mutex::new(None),
            transition: tokio::sync::Mutex::new(()),
        }
    }

    /// Validate `config`, bind the transport and start serving.
    ///
    /// Returns the bound address, so port 0 may be used.
    #[instrument(skip_all, fields(transport = %self.network_type, bind = %config.bind_addr))]
    pub async fn start(&self, config: ServerConfig) -> Result<SocketAddr, StartError> {
        let _transition = self.transition.lock().await;
        if self.is_running() {
            return Err(StartError::AlreadyRunning);
        }

        if config.network_type != self.network_type {
            return Err(StartError::InvalidConfig(format!(
                "config is for {} but this server speaks {}",
                config.network_type, self.network_type
            )));
        }
        config.validate()?;
        let driver = self.driver.clone().ok_or_else(|| {
            StartError::InvalidConfig(format!("no transport driver for {}", self.network_type))
        })?;

        self.registry
            .configure(RegistryLimits::from_config(&config, driver.payload_limit()));
        let idle_timeout = config.idle_timeout;
        let ctx = DriverContext {
            registry: self.registry.clone(),
            config: Arc::new(config),
        };
        let local_addr = driver.start(ctx).await?;

        let sweeper = tokio::spawn(run_idle_sweeper(self.registry.clone(), idle_timeout));
        *self.sweeper.lock() = Some(sweeper);
        *self.state.lock() = ServerState::Running;

        info!("Network server listening on {}", local_addr);
        Ok(local_addr)
    }

    /// Stop serving: every connection is closed with `ServerShutdown` and
    /// queued events are delivered before this returns.
    ///
    /// Stopping a server that isn't running does nothing.
    #[instrument(skip_all, fields(transport = %self.network_type))]
    pub async fn stop(&self) -> Result<(), StopError> {
        let _transition = self.transition.lock().await;
        if !self.is_running() {
            info!("Stop requested but server is not running");
            return Ok(());
        }

        let result = match &self.driver {
            Some(driver) => driver.stop().await,
            None => Ok(()),
        };

        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.abort();
        }
        let leftover = self.registry.drain(DisconnectReason::ServerShutdown);
        if leftover > 0 {
            debug!(leftover, "closed connections left behind by the driver");
        }
        self.events.flush().await;
        *self.state.lock() = ServerState::Stopped;

        info!("Network server stopped");
        result
    }

    fn running_driver(&self) -> Result<&Arc<dyn TransportDriver>, SendError> {
        match (&self.driver, self.is_running()) {
            (Some(driver), true) => Ok(driver),
            _ => Err(SendError::NotRunning),
        }
    }

    /// Queue `payload` for immediate delivery to one connection.
    pub async fn send(&self, id: ConnectionId, payload: impl Into<Bytes>) -> Result<(), SendError> {
        self.running_driver()?.send(id, payload.into()).await
    }

    /// Park `payload` until the next `flush`. Fails with `QueueFull` once
    /// `outbound_queue_capacity` payloads are parked, unless the policy is
    /// `DropOldest`.
    pub fn queue(&self, id: ConnectionId, payload: impl Into<Bytes>) -> Result<(), SendError> {
        self.running_driver()?;
        self.registry.queue_batched(id, payload.into())
    }

    /// Hand every parked payload to its connection's writer.
    /// Returns how many payloads were released.
    pub async fn flush(&self) -> usize {
        if !self.is_running() {
            return 0;
        }
        self.registry.flush_batches().await
    }

    /// Send `payload` to every connection. Returns how many accepted it.
    pub async fn broadcast(&self, payload: impl Into<Bytes>) -> usize {
        let Ok(driver) = self.running_driver() else {
            return 0;
        };
        let payload = payload.into();

        let mut delivered = 0;
        for id in self.registry.ids() {
            match driver.send(id, payload.clone()).await {
                Ok(()) => delivered += 1,
                Err(e) => debug!(connection = %id, "broadcast skipped: {}", e),
            }
        }
        delivered
    }

    /// Close one connection from the server side (`DisconnectReason::Kicked`).
    pub fn disconnect(&self, id: ConnectionId) -> Result<(), SendError> {
        self.running_driver()?;
        if self.registry.close(id, DisconnectReason::Kicked) {
            Ok(())
        } else {
            Err(SendError::UnknownConnection(id))
        }
    }

    /// Snapshot of every live connection.
    pub fn connections(&self) -> Vec<ConnectionView> {
        match &self.driver {
            Some(driver) if self.is_running() => driver.connections(),
            _ => self.registry.snapshot(),
        }
    }

    /// Snapshot of one connection.
    pub fn connection(&self, id: ConnectionId) -> Option<ConnectionView> {
        self.registry.get(id)
    }

    /// Event channel for subscriptions.
    pub fn events(&self) -> &EventChannel {
        &self.events
    }

    /// Bound address while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.driver.as_ref().and_then(|driver| driver.local_addr())
    }

    /// Transport this server speaks.
    pub fn network_type(&self) -> NetworkType {
        self.network_type
    }

    /// Lifecycle state.
    pub fn state(&self) -> ServerState {
        *self.state.lock()
    }

    /// Whether the server is running.
    pub fn is_running(&self) -> bool {
        self.state() == ServerState::Running
    }

    /// Driver state, if there is a driver.
    pub fn driver_state(&self) -> Option<DriverState> {
        self.driver.as_ref().map(|driver| driver.state())
    }
}

/// How often the sweeper looks for idle connections.
fn sweep_interval(idle_timeout: Duration) -> Duration {
    (idle_timeout / 4).clamp(Duration::from_millis(50), Duration::from_secs(5))
}

/// Close connections that have been silent longer than `idle_timeout`.
async fn run_idle_sweeper(registry: Arc<ConnectionRegistry>, idle_timeout: Duration) {
    let mut interval = interval(sweep_interval(idle_timeout));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        interval.tick().await;

        for id in registry.idle_connections(idle_timeout) {
            if registry.close(id, DisconnectReason::Timeout) {
                info!("Removed idle connection {}", id);
            }
        }
    }
}

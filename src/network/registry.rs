//! Connection Registry
//!
//! The only shared mutable state in the server: every live connection,
//! keyed by id and indexed by remote address. Drivers write to it, the
//! façade and the idle sweeper read from it.
//!
//! Locking rules:
//! - The table lock is held only for map access, never across I/O or event
//!   dispatch.
//! - Each connection has a reentrant event gate. Every event for that
//!   connection is published while holding its gate, so events for one id
//!   reach subscribers in the order they were observed, and a handler may
//!   call back into the registry for the same connection.
//! - `Disconnect` is published while the connection is `Closing` and still
//!   present; removal follows immediately after.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::network::connection::{
    Connection, ConnectionId, ConnectionState, ConnectionView, IdGenerator, PeerIdentity,
};
use crate::network::error::{HandshakeError, SendError};
use crate::network::events::{Diagnostic, DisconnectReason, EventChannel, NetworkEvent};
use crate::network::outbound::{OutboundQueue, OverflowPolicy, PushError};

/// Limits applied to new registrations and sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryLimits {
    /// Registered plus reserved connections never exceed this.
    pub max_connections: usize,
    /// Largest payload accepted by `enqueue`.
    pub max_payload_size: usize,
    /// Outbound queue capacity per connection.
    pub queue_capacity: usize,
    /// Outbound queue overflow policy.
    pub overflow_policy: OverflowPolicy,
}

impl RegistryLimits {
    /// Limits from a server config, capped by what the transport can carry.
    pub fn from_config(config: &ServerConfig, transport_payload_limit: usize) -> Self {
        Self {
            max_connections: config.max_connections,
            max_payload_size: config.max_payload_size.min(transport_payload_limit),
            queue_capacity: config.outbound_queue_capacity,
            overflow_policy: config.overflow_policy,
        }
    }
}

impl Default for RegistryLimits {
    fn default() -> Self {
        Self::from_config(&ServerConfig::default(), usize::MAX)
    }
}

struct ConnectionSlot {
    connection: Mutex<Connection>,
    gate: ReentrantMutex<()>,
    queue: Arc<OutboundQueue>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct Table {
    connections: BTreeMap<ConnectionId, Arc<ConnectionSlot>>,
    by_addr: HashMap<SocketAddr, ConnectionId>,
    reserved: usize,
}

/// What a driver's connection tasks hold on to.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    /// Registered id.
    pub id: ConnectionId,
    /// Outbound queue drained by the writer task.
    pub queue: Arc<OutboundQueue>,
    /// Cancelled when the connection is closed from any side.
    pub cancel: CancellationToken,
}

/// Connection table plus the event channel it publishes on.
pub struct ConnectionRegistry {
    table: RwLock<Table>,
    limits: RwLock<RegistryLimits>,
    ids: IdGenerator,
    events: EventChannel,
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("connections", &self.len())
            .field("limits", &*self.limits.read())
            .finish()
    }
}

impl ConnectionRegistry {
    /// Empty registry publishing on `events`. Ids start at 1.
    pub fn new(events: EventChannel) -> Self {
        Self {
            table: RwLock::new(Table::default()),
            limits: RwLock::new(RegistryLimits::default()),
            ids: IdGenerator::new(1),
            events,
        }
    }

    /// Replace the limits. Existing connections keep their queues.
    pub fn configure(&self, limits: RegistryLimits) {
        *self.limits.write() = limits;
    }

    /// Current limits.
    pub fn limits(&self) -> RegistryLimits {
        *self.limits.read()
    }

    /// The event channel this registry publishes on.
    pub fn events(&self) -> &EventChannel {
        &self.events
    }

    /// Claim a slot ahead of a handshake.
    ///
    /// The slot counts against `max_connections` until the reservation is
    /// committed or dropped.
    pub fn reserve(self: &Arc<Self>) -> Result<Reservation, HandshakeError> {
        let max = self.limits.read().max_connections;
        let mut table = self.table.write();
        if table.connections.len() + table.reserved >= max {
            return Err(HandshakeError::CapacityReached);
        }
        table.reserved += 1;
        Ok(Reservation {
            registry: Arc::clone(self),
            committed: false,
        })
    }

    fn insert(&self, peer: PeerIdentity, cancel: CancellationToken) -> ConnectionHandle {
        let limits = self.limits();
        let id = self.ids.next();
        let queue = Arc::new(OutboundQueue::new(
            limits.queue_capacity,
            limits.overflow_policy,
        ));
        let slot = Arc::new(ConnectionSlot {
            connection: Mutex::new(Connection::new(id, peer)),
            gate: ReentrantMutex::new(()),
            queue: queue.clone(),
            cancel: cancel.clone(),
        });

        // Held from insertion through `Connect`, so nothing can publish for
        // this id before its `Connect`.
        let gate = slot.gate.lock();
        {
            let mut table = self.table.write();
            table.reserved = table.reserved.saturating_sub(1);
            table.connections.insert(id, slot.clone());
            table.by_addr.insert(peer.addr, id);
        }

        info!(connection = %id, peer = %peer.addr, "connection registered");
        self.events.publish(NetworkEvent::Connect {
            connection_id: id,
            remote_addr: peer.addr,
        });
        drop(gate);

        ConnectionHandle { id, queue, cancel }
    }

    fn release(&self) {
        let mut table = self.table.write();
        table.reserved = table.reserved.saturating_sub(1);
    }

    fn slot(&self, id: ConnectionId) -> Option<Arc<ConnectionSlot>> {
        self.table.read().connections.get(&id).cloned()
    }

    /// Close a connection: publish `Disconnect`, then remove it.
    ///
    /// Returns false if the connection is unknown or already closing, so
    /// concurrent closes publish exactly one `Disconnect`.
    pub fn close(&self, id: ConnectionId, reason: DisconnectReason) -> bool {
        let Some(slot) = self.slot(id) else {
            return false;
        };

        let addr = {
            let _gate = slot.gate.lock();
            let addr = {
                let mut conn = slot.connection.lock();
                if !conn.is_live() {
                    return false;
                }
                conn.state = ConnectionState::Closing;
                conn.peer.addr
            };

            slot.cancel.cancel();
            slot.queue.close();
            self.events.publish(NetworkEvent::Disconnect {
                connection_id: id,
                reason,
            });
            addr
        };

        let mut table = self.table.write();
        table.connections.remove(&id);
        if table.by_addr.get(&addr) == Some(&id) {
            table.by_addr.remove(&addr);
        }
        drop(table);

        info!(connection = %id, peer = %addr, ?reason, "connection closed");
        true
    }

    /// Publish an inbound payload for a live connection.
    pub fn deliver(&self, id: ConnectionId, payload: Bytes) -> bool {
        let Some(slot) = self.slot(id) else {
            return false;
        };

        let _gate = slot.gate.lock();
        {
            let mut conn = slot.connection.lock();
            if !conn.is_live() {
                return false;
            }
            conn.record_received();
        }
        self.events.publish(NetworkEvent::GamePacket {
            connection_id: id,
            payload,
        });
        true
    }

    /// Publish a diagnostic.
    pub fn diagnostic(&self, diagnostic: Diagnostic) {
        debug!(?diagnostic, "diagnostic");
        self.events.publish(NetworkEvent::Diagnostic(diagnostic));
    }

    /// Run `f` against a connection's record.
    pub fn with_connection<R>(
        &self,
        id: ConnectionId,
        f: impl FnOnce(&mut Connection) -> R,
    ) -> Option<R> {
        let slot = self.slot(id)?;
        let mut conn = slot.connection.lock();
        Some(f(&mut conn))
    }

    /// Record inbound traffic that carries no payload.
    pub fn touch(&self, id: ConnectionId) {
        self.with_connection(id, Connection::touch);
    }

    /// Record a successful write. Clears `Suspect`.
    pub fn record_sent(&self, id: ConnectionId) {
        self.with_connection(id, |conn| {
            conn.record_sent();
            if conn.state == ConnectionState::Suspect {
                conn.state = ConnectionState::Open;
            }
        });
    }

    /// Record a failed write. Removal is left to the idle sweeper.
    pub fn mark_suspect(&self, id: ConnectionId) {
        self.with_connection(id, |conn| {
            if conn.state == ConnectionState::Open {
                warn!(connection = %id, "write failed, connection suspect");
                conn.state = ConnectionState::Suspect;
            }
        });
    }

    fn check_payload(&self, payload: &Bytes) -> Result<(), SendError> {
        let max = self.limits.read().max_payload_size;
        if payload.len() > max {
            return Err(SendError::PayloadTooLarge {
                size: payload.len(),
                max,
            });
        }
        Ok(())
    }

    /// Push a payload onto a connection's outbound queue.
    ///
    /// Only the queue is locked while pushing; sends to different
    /// connections never wait on each other.
    pub async fn enqueue(&self, id: ConnectionId, payload: Bytes) -> Result<(), SendError> {
        self.check_payload(&payload)?;
        let queue = self
            .slot(id)
            .map(|slot| slot.queue.clone())
            .ok_or(SendError::UnknownConnection(id))?;

        queue.push(payload).await.map_err(|err| match err {
            PushError::Full => SendError::QueueFull(id),
            PushError::Closed => SendError::Transport(format!("connection {id} is closing")),
        })
    }

    /// Park a payload until `flush_batches`.
    ///
    /// The batch is bounded like the outbound queue. Because this call
    /// never waits, `Block` behaves like `DropNewest` here.
    pub fn queue_batched(&self, id: ConnectionId, payload: Bytes) -> Result<(), SendError> {
        self.check_payload(&payload)?;
        let limits = self.limits();
        self.with_connection(id, |conn| {
            conn.push_batch(payload, limits.queue_capacity, limits.overflow_policy)
        })
        .ok_or(SendError::UnknownConnection(id))?
        .map_err(|_| SendError::QueueFull(id))
    }

    /// Move every parked payload onto its outbound queue.
    ///
    /// Returns how many payloads were queued. Failures are logged per
    /// connection and don't stop the flush.
    pub async fn flush_batches(&self) -> usize {
        let pending: Vec<(ConnectionId, Arc<OutboundQueue>, Vec<Bytes>)> = {
            let table = self.table.read();
            table
                .connections
                .iter()
                .filter_map(|(id, slot)| {
                    let batch = slot.connection.lock().take_batch();
                    (!batch.is_empty()).then(|| (*id, slot.queue.clone(), batch))
                })
                .collect()
        };

        let mut queued = 0;
        for (id, queue, batch) in pending {
            for payload in batch {
                match queue.push(payload).await {
                    Ok(()) => queued += 1,
                    Err(err) => {
                        warn!(connection = %id, ?err, "batched payload dropped");
                        if err == PushError::Closed {
                            break;
                        }
                    }
                }
            }
        }
        queued
    }

    /// Connections silent for longer than `timeout`.
    pub fn idle_connections(&self, timeout: Duration) -> Vec<ConnectionId> {
        let now = Instant::now();
        let table = self.table.read();
        table
            .connections
            .iter()
            .filter(|(_, slot)| {
                let conn = slot.connection.lock();
                conn.is_live() && conn.idle_for(now) > timeout
            })
            .map(|(id, _)| *id)
            .collect()
    }

    /// Close every connection. Returns how many were closed here.
    pub fn drain(&self, reason: DisconnectReason) -> usize {
        self.ids()
            .into_iter()
            .filter(|id| self.close(*id, reason))
            .count()
    }

    /// Registered ids in ascending order.
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.table.read().connections.keys().copied().collect()
    }

    /// Point-in-time copy of every connection, ordered by id.
    pub fn snapshot(&self) -> Vec<ConnectionView> {
        let table = self.table.read();
        table
            .connections
            .values()
            .map(|slot| slot.connection.lock().view())
            .collect()
    }

    /// Snapshot of one connection.
    pub fn get(&self, id: ConnectionId) -> Option<ConnectionView> {
        self.with_connection(id, |conn| conn.view())
    }

    /// Connection registered for a remote address.
    pub fn lookup_addr(&self, addr: &SocketAddr) -> Option<ConnectionId> {
        self.table.read().by_addr.get(addr).copied()
    }

    /// Whether an id is registered.
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.table.read().connections.contains_key(&id)
    }

    /// Registered connections.
    pub fn len(&self) -> usize {
        self.table.read().connections.len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A claimed but not yet registered slot.
///
/// Dropping it without `commit` gives the slot back.
#[derive(Debug)]
pub struct Reservation {
    registry: Arc<ConnectionRegistry>,
    committed: bool,
}

impl Reservation {
    /// Register the peer and publish `Connect`.
    pub fn commit(mut self, peer: PeerIdentity, cancel: CancellationToken) -> ConnectionHandle {
        self.committed = true;
        self.registry.insert(peer, cancel)
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.committed {
            self.registry.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::events::{DispatchMode, EventKind};
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    fn registry(max_connections: usize) -> (Arc<ConnectionRegistry>, Arc<Mutex<Vec<NetworkEvent>>>) {
        let events = EventChannel::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for kind in [EventKind::Connect, EventKind::GamePacket, EventKind::Disconnect] {
            let seen = seen.clone();
            events.subscribe(kind, move |event| {
                seen.lock().push(event.clone());
                Ok(())
            });
        }

        let registry = Arc::new(ConnectionRegistry::new(events));
        registry.configure(RegistryLimits {
            max_connections,
            ..RegistryLimits::default()
        });
        (registry, seen)
    }

    fn peer(port: u16) -> PeerIdentity {
        PeerIdentity::from_addr(SocketAddr::from(([127, 0, 0, 1], port)))
    }

    fn connect(registry: &Arc<ConnectionRegistry>, port: u16) -> ConnectionHandle {
        registry
            .reserve()
            .unwrap()
            .commit(peer(port), CancellationToken::new())
    }

    #[test]
    fn test_commit_publishes_connect() {
        let (registry, seen) = registry(4);
        let handle = connect(&registry, 4000);

        assert_eq!(handle.id, ConnectionId::new(1));
        assert_eq!(registry.lookup_addr(&peer(4000).addr), Some(handle.id));
        assert_eq!(
            seen.lock().as_slice(),
            &[NetworkEvent::Connect {
                connection_id: handle.id,
                remote_addr: peer(4000).addr,
            }]
        );
    }

    #[test]
    fn test_reservations_count_against_capacity() {
        let (registry, _) = registry(2);
        let first = registry.reserve().unwrap();
        let _second = registry.reserve().unwrap();
        assert_eq!(
            registry.reserve().unwrap_err(),
            HandshakeError::CapacityReached
        );

        drop(first);
        let third = registry.reserve().unwrap();
        third.commit(peer(1), CancellationToken::new());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_close_is_exactly_once() {
        let (registry, seen) = registry(4);
        let handle = connect(&registry, 4000);

        assert!(registry.close(handle.id, DisconnectReason::PeerClosed));
        assert!(!registry.close(handle.id, DisconnectReason::Timeout));
        assert!(handle.cancel.is_cancelled());
        assert!(handle.queue.is_closed());
        assert!(registry.is_empty());
        assert_eq!(registry.lookup_addr(&peer(4000).addr), None);

        let disconnects = seen
            .lock()
            .iter()
            .filter(|e| e.kind() == EventKind::Disconnect)
            .count();
        assert_eq!(disconnects, 1);
    }

    #[test]
    fn test_disconnect_handler_sees_closing_connection() {
        let (registry, _) = registry(4);
        let observed = Arc::new(Mutex::new(None));
        {
            let weak = Arc::downgrade(&registry);
            let observed = observed.clone();
            registry.events().on_disconnect(move |id, _| {
                let registry = weak.upgrade().expect("registry alive");
                // Re-entrant close on the same connection must not deadlock.
                let closed_again = registry.close(id, DisconnectReason::Kicked);
                *observed.lock() = Some((closed_again, registry.get(id).map(|view| view.state)));
                Ok(())
            });
        }

        let handle = connect(&registry, 4000);
        registry.close(handle.id, DisconnectReason::Kicked);
        assert_eq!(
            *observed.lock(),
            Some((false, Some(ConnectionState::Closing)))
        );
        assert!(registry.get(handle.id).is_none());
    }

    #[test]
    fn test_no_packets_after_disconnect() {
        let (registry, seen) = registry(4);
        let handle = connect(&registry, 4000);

        assert!(registry.deliver(handle.id, Bytes::from_static(b"hi")));
        registry.close(handle.id, DisconnectReason::PeerClosed);
        assert!(!registry.deliver(handle.id, Bytes::from_static(b"late")));

        let kinds: Vec<_> = seen.lock().iter().map(|e| e.kind()).collect();
        assert_eq!(
            kinds,
            vec![EventKind::Connect, EventKind::GamePacket, EventKind::Disconnect]
        );
        assert_eq!(registry.get(handle.id), None);
    }

    #[test]
    fn test_ids_are_never_reused() {
        let (registry, _) = registry(4);
        let first = connect(&registry, 1).id;
        registry.drain(DisconnectReason::ServerShutdown);
        let second = connect(&registry, 1).id;
        assert!(second > first);
    }

    #[test]
    fn test_suspect_cleared_by_successful_write() {
        let (registry, _) = registry(4);
        let id = connect(&registry, 4000).id;

        registry.mark_suspect(id);
        assert_eq!(registry.get(id).unwrap().state, ConnectionState::Suspect);
        registry.record_sent(id);
        let view = registry.get(id).unwrap();
        assert_eq!(view.state, ConnectionState::Open);
        assert_eq!(view.packets_sent, 1);
    }

    #[test]
    fn test_idle_connections() {
        let (registry, _) = registry(4);
        let id = connect(&registry, 4000).id;

        assert!(registry.idle_connections(Duration::from_secs(60)).is_empty());
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(registry.idle_connections(Duration::from_millis(5)), vec![id]);
    }

    #[tokio::test]
    async fn test_enqueue_checks_id_and_size() {
        let (registry, _) = registry(4);
        registry.configure(RegistryLimits {
            max_payload_size: 4,
            ..registry.limits()
        });
        let handle = connect(&registry, 4000);

        assert_eq!(
            registry
                .enqueue(ConnectionId::new(99), Bytes::from_static(b"x"))
                .await,
            Err(SendError::UnknownConnection(ConnectionId::new(99)))
        );
        assert_eq!(
            registry
                .enqueue(handle.id, Bytes::from_static(b"too big"))
                .await,
            Err(SendError::PayloadTooLarge { size: 7, max: 4 })
        );

        registry
            .enqueue(handle.id, Bytes::from_static(b"ok"))
            .await
            .unwrap();
        assert_eq!(handle.queue.try_pop(), Some(Bytes::from_static(b"ok")));
    }

    #[tokio::test]
    async fn test_blocked_send_does_not_stall_other_connections() {
        let (registry, _) = registry(4);
        registry.configure(RegistryLimits {
            queue_capacity: 1,
            overflow_policy: OverflowPolicy::Block {
                timeout: Duration::from_secs(10),
            },
            ..registry.limits()
        });
        let slow = connect(&registry, 1);
        let fast = connect(&registry, 2);

        registry
            .enqueue(slow.id, Bytes::from_static(b"1"))
            .await
            .unwrap();
        let blocked = {
            let registry = registry.clone();
            let id = slow.id;
            tokio::spawn(async move { registry.enqueue(id, Bytes::from_static(b"2")).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());

        tokio::time::timeout(
            Duration::from_millis(500),
            registry.enqueue(fast.id, Bytes::from_static(b"x")),
        )
        .await
        .expect("send to another connection must not wait")
        .unwrap();

        registry.close(slow.id, DisconnectReason::PeerClosed);
        assert!(matches!(
            blocked.await.unwrap(),
            Err(SendError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_batched_payloads_wait_for_flush() {
        let (registry, _) = registry(4);
        let handle = connect(&registry, 4000);

        registry
            .queue_batched(handle.id, Bytes::from_static(b"a"))
            .unwrap();
        registry
            .queue_batched(handle.id, Bytes::from_static(b"b"))
            .unwrap();
        assert!(handle.queue.is_empty());

        assert_eq!(registry.flush_batches().await, 2);
        assert_eq!(handle.queue.try_pop(), Some(Bytes::from_static(b"a")));
        assert_eq!(handle.queue.try_pop(), Some(Bytes::from_static(b"b")));
        assert_eq!(registry.flush_batches().await, 0);
    }

    #[tokio::test]
    async fn test_worker_handler_can_close_its_connection() {
        let events = EventChannel::new(DispatchMode::Worker { queue_capacity: 1 });
        let registry = Arc::new(ConnectionRegistry::new(events.clone()));
        let (closed_tx, closed_rx) = std::sync::mpsc::channel();
        {
            let weak = Arc::downgrade(&registry);
            events.on_game_packet(move |id, _| {
                std::thread::sleep(Duration::from_millis(50));
                if let Some(registry) = weak.upgrade() {
                    registry.close(id, DisconnectReason::Kicked);
                }
                Ok(())
            });
            events.on_disconnect(move |id, reason| {
                let _ = closed_tx.send((id, reason));
                Ok(())
            });
        }
        let handle = connect(&registry, 4000);

        let (done_tx, done_rx) = std::sync::mpsc::channel();
        {
            let registry = registry.clone();
            let id = handle.id;
            std::thread::spawn(move || {
                for byte in 0..4u8 {
                    registry.deliver(id, Bytes::from(vec![byte]));
                }
                let _ = done_tx.send(());
            });
        }

        assert!(done_rx.recv_timeout(Duration::from_secs(3)).is_ok());
        events.flush().await;
        assert_eq!(
            closed_rx.recv_timeout(Duration::from_secs(3)),
            Ok((handle.id, DisconnectReason::Kicked))
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn test_connect_precedes_concurrent_close() {
        let (registry, seen) = registry(usize::MAX);
        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let closer = {
            let registry = registry.clone();
            let stop = stop.clone();
            std::thread::spawn(move || {
                while !stop.load(std::sync::atomic::Ordering::Relaxed) {
                    for id in registry.ids() {
                        registry.close(id, DisconnectReason::Kicked);
                    }
                }
            })
        };
        for port in 0..500 {
            connect(&registry, port);
        }
        stop.store(true, std::sync::atomic::Ordering::Relaxed);
        closer.join().unwrap();

        let mut announced = BTreeSet::new();
        for event in seen.lock().iter() {
            match event {
                NetworkEvent::Connect { connection_id, .. } => {
                    announced.insert(*connection_id);
                }
                NetworkEvent::Disconnect { connection_id, .. } => {
                    assert!(announced.contains(connection_id), "{connection_id} closed before connect");
                }
                _ => {}
            }
        }
        assert_eq!(announced.len(), 500);
    }

    #[test]
    fn test_batch_respects_queue_capacity() {
        let (registry, _) = registry(4);
        registry.configure(RegistryLimits {
            queue_capacity: 1,
            overflow_policy: OverflowPolicy::DropNewest,
            ..registry.limits()
        });
        let handle = connect(&registry, 4000);

        registry
            .queue_batched(handle.id, Bytes::from_static(b"a"))
            .unwrap();
        let refused = (0..1000)
            .filter(|_| {
                registry.queue_batched(handle.id, Bytes::from(vec![0u8; 1024]))
                    == Err(SendError::QueueFull(handle.id))
            })
            .count();
        assert_eq!(refused, 1000);

        registry.configure(RegistryLimits {
            overflow_policy: OverflowPolicy::DropOldest,
            ..registry.limits()
        });
        registry
            .queue_batched(handle.id, Bytes::from_static(b"b"))
            .unwrap();
        let parked = registry.with_connection(handle.id, |conn| conn.take_batch());
        assert_eq!(parked, Some(vec![Bytes::from_static(b"b")]));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Connect,
        Disconnect(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![Just(Op::Connect), any::<usize>().prop_map(Op::Disconnect)]
    }

    proptest! {
        #[test]
        fn prop_snapshot_matches_live_set(ops in proptest::collection::vec(op(), 0..64)) {
            let (registry, seen) = registry(usize::MAX);
            let mut live = BTreeSet::new();
            let mut inserted = BTreeSet::new();
            let mut port = 1u16;

            for op in ops {
                match op {
                    Op::Connect => {
                        let id = connect(&registry, port).id;
                        port = port.wrapping_add(1);
                        live.insert(id);
                        inserted.insert(id);
                    }
                    Op::Disconnect(pick) => {
                        if live.is_empty() {
                            continue;
                        }
                        let id = *live.iter().nth(pick % live.len()).unwrap();
                        prop_assert!(registry.close(id, DisconnectReason::PeerClosed));
                        live.remove(&id);
                    }
                }

                let snapshot: BTreeSet<_> = registry.snapshot().iter().map(|v| v.id).collect();
                prop_assert_eq!(&snapshot, &live);
            }

            let mut disconnected = BTreeSet::new();
            for event in seen.lock().iter() {
                if let NetworkEvent::Disconnect { connection_id, .. } = event {
                    prop_assert!(inserted.contains(connection_id));
                    prop_assert!(disconnected.insert(*connection_id));
                }
            }
        }
    }
}

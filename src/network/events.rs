//! Event Channel
//!
//! In-process publish/subscribe bus between transport drivers and game
//! code. Events are a closed enum, so consumers match them exhaustively.
//!
//! Dispatch is synchronous by default: handlers run on the publishing
//! context, in subscription order. `DispatchMode::Worker` moves delivery to
//! one dedicated thread fed by a FIFO queue. `publish` never blocks in
//! either mode: in worker mode at most `queue_capacity` game packets wait
//! for the thread and further packets are dropped and counted, while
//! connect, disconnect and diagnostic events are always queued. Handlers
//! may therefore publish, or call back into the registry, from the
//! dispatch thread. A handler's error or panic is logged here and never
//! reaches the driver.

use std::any::Any;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Condvar, Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use crate::network::connection::ConnectionId;
use crate::network::error::HandshakeError;
use crate::network::NetworkType;

/// Why a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    /// No traffic within the idle timeout.
    Timeout,
    /// The peer closed the session.
    PeerClosed,
    /// The server is stopping.
    ServerShutdown,
    /// The peer violated the transport protocol.
    ProtocolError,
    /// Disconnected on request via `NetworkServer::disconnect`.
    Kicked,
}

/// Out-of-band notices that never affect a registered connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    /// A connection attempt was refused before registration.
    HandshakeRejected {
        /// Who tried to connect.
        remote_addr: SocketAddr,
        /// Why they were refused.
        error: HandshakeError,
    },
    /// A packet could not be decoded and was dropped.
    MalformedPacket {
        /// Sender.
        remote_addr: SocketAddr,
        /// Owning connection, when the sender is registered.
        connection_id: Option<ConnectionId>,
        /// Decoder message.
        reason: String,
    },
    /// The listening resource failed; the driver has shut down.
    TransportFault {
        /// Transport that failed.
        network_type: NetworkType,
        /// Error message.
        message: String,
    },
}

/// Events published by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkEvent {
    /// A peer completed its handshake and was registered.
    Connect {
        /// New connection.
        connection_id: ConnectionId,
        /// Peer address.
        remote_addr: SocketAddr,
    },
    /// A payload arrived from a registered peer.
    GamePacket {
        /// Sending connection.
        connection_id: ConnectionId,
        /// Payload with transport framing removed.
        payload: Bytes,
    },
    /// A registered peer is gone. Last event for this id.
    Disconnect {
        /// Closed connection.
        connection_id: ConnectionId,
        /// Why it closed.
        reason: DisconnectReason,
    },
    /// Something worth knowing that isn't tied to a live connection.
    Diagnostic(Diagnostic),
}

impl NetworkEvent {
    /// Discriminant used for subscriptions.
    pub fn kind(&self) -> EventKind {
        match self {
            NetworkEvent::Connect { .. } => EventKind::Connect,
            NetworkEvent::GamePacket { .. } => EventKind::GamePacket,
            NetworkEvent::Disconnect { .. } => EventKind::Disconnect,
            NetworkEvent::Diagnostic(_) => EventKind::Diagnostic,
        }
    }

    /// Connection the event belongs to, if any.
    pub fn connection_id(&self) -> Option<ConnectionId> {
        match self {
            NetworkEvent::Connect { connection_id, .. }
            | NetworkEvent::GamePacket { connection_id, .. }
            | NetworkEvent::Disconnect { connection_id, .. } => Some(*connection_id),
            NetworkEvent::Diagnostic(Diagnostic::MalformedPacket { connection_id, .. }) => {
                *connection_id
            }
            NetworkEvent::Diagnostic(_) => None,
        }
    }
}

/// Event discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// `NetworkEvent::Connect`.
    Connect,
    /// `NetworkEvent::GamePacket`.
    GamePacket,
    /// `NetworkEvent::Disconnect`.
    Disconnect,
    /// `NetworkEvent::Diagnostic`.
    Diagnostic,
}

/// Result returned by event handlers.
pub type HandlerResult = anyhow::Result<()>;

type Handler = dyn Fn(&NetworkEvent) -> HandlerResult + Send + Sync;

/// Token returned by `subscribe`; pass it to `unsubscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    id: u64,
    kind: EventKind,
}

impl SubscriptionHandle {
    /// Event kind this subscription listens to.
    pub fn kind(&self) -> EventKind {
        self.kind
    }
}

/// Where handlers run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchMode {
    /// On the publishing context.
    #[default]
    Inline,
    /// On a dedicated dispatch thread.
    Worker {
        /// Game packets that may wait for the dispatch thread.
        queue_capacity: usize,
    },
}

/// Counters for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChannelStats {
    /// Events handed to `publish`.
    pub published: u64,
    /// Handler invocations that returned an error or panicked.
    pub handler_failures: u64,
    /// Game packets dropped because the dispatch queue was full.
    pub dropped_packets: u64,
    /// Live subscriptions.
    pub subscribers: usize,
}

struct Subscriber {
    handle: SubscriptionHandle,
    handler: Arc<Handler>,
}

/// Subscriber table shared with the dispatch thread.
#[derive(Default)]
struct Dispatch {
    subscribers: RwLock<Vec<Subscriber>>,
    failures: AtomicU64,
}

impl Dispatch {
    fn deliver(&self, event: &NetworkEvent) {
        let kind = event.kind();
        let handlers: Vec<Arc<Handler>> = self
            .subscribers
            .read()
            .iter()
            .filter(|s| s.handle.kind == kind)
            .map(|s| s.handler.clone())
            .collect();

        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    warn!(?kind, error = %err, "event handler failed");
                }
                Err(panic) => {
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    error!(?kind, panic = %panic_message(&panic), "event handler panicked");
                }
            }
        }
    }
}

fn panic_message(panic: &Box<dyn Any + Send>) -> &str {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "non-string panic payload"
    }
}

enum Job {
    Deliver(NetworkEvent),
    Flush(oneshot::Sender<()>),
}

#[derive(Default)]
struct Pending {
    jobs: VecDeque<Job>,
    packets: usize,
    closed: bool,
}

/// FIFO between publishers and the dispatch thread. Pushing never waits.
struct WorkQueue {
    pending: Mutex<Pending>,
    ready: Condvar,
    packet_capacity: usize,
    dropped: AtomicU64,
}

impl WorkQueue {
    fn new(packet_capacity: usize) -> Self {
        Self {
            pending: Mutex::new(Pending::default()),
            ready: Condvar::new(),
            packet_capacity: packet_capacity.max(1),
            dropped: AtomicU64::new(0),
        }
    }

    /// Queue a job. Returns false if it was dropped.
    fn push(&self, job: Job) -> bool {
        let mut pending = self.pending.lock();
        if pending.closed {
            return false;
        }
        if let Job::Deliver(event) = &job {
            if event.kind() == EventKind::GamePacket {
                if pending.packets >= self.packet_capacity {
                    drop(pending);
                    let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    if dropped.is_power_of_two() {
                        warn!(dropped, "event queue full, game packet dropped");
                    }
                    return false;
                }
                pending.packets += 1;
            }
        }
        pending.jobs.push_back(job);
        drop(pending);
        self.ready.notify_one();
        true
    }

    /// Next job, or `None` once closed and empty.
    fn pop(&self) -> Option<Job> {
        let mut pending = self.pending.lock();
        loop {
            if let Some(job) = pending.jobs.pop_front() {
                if let Job::Deliver(event) = &job {
                    if event.kind() == EventKind::GamePacket {
                        pending.packets -= 1;
                    }
                }
                return Some(job);
            }
            if pending.closed {
                return None;
            }
            self.ready.wait(&mut pending);
        }
    }

    fn close(&self) {
        self.pending.lock().closed = true;
        self.ready.notify_all();
    }
}

fn run_dispatch_worker(dispatch: Arc<Dispatch>, queue: Arc<WorkQueue>) {
    while let Some(job) = queue.pop() {
        match job {
            Job::Deliver(event) => dispatch.deliver(&event),
            Job::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("event dispatch worker exiting");
}

struct ChannelInner {
    dispatch: Arc<Dispatch>,
    worker: Option<Arc<WorkQueue>>,
    next_handle: AtomicU64,
    published: AtomicU64,
}

impl Drop for ChannelInner {
    fn drop(&mut self) {
        if let Some(worker) = &self.worker {
            worker.close();
        }
    }
}

/// Cloneable handle to one event bus.
#[derive(Clone)]
pub struct EventChannel {
    inner: Arc<ChannelInner>,
}

impl std::fmt::Debug for EventChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventChannel")
            .field("mode", &self.mode())
            .field("stats", &self.stats())
            .finish()
    }
}

impl Default for EventChannel {
    fn default() -> Self {
        Self::new(DispatchMode::Inline)
    }
}

impl EventChannel {
    /// Create a channel with the given dispatch mode.
    pub fn new(mode: DispatchMode) -> Self {
        let dispatch = Arc::new(Dispatch::default());

        let worker = match mode {
            DispatchMode::Inline => None,
            DispatchMode::Worker { queue_capacity } => {
                let queue = Arc::new(WorkQueue::new(queue_capacity));
                let worker_dispatch = dispatch.clone();
                let worker_queue = queue.clone();
                let spawned = std::thread::Builder::new()
                    .name("net-events".into())
                    .spawn(move || run_dispatch_worker(worker_dispatch, worker_queue));
                match spawned {
                    Ok(_) => Some(queue),
                    Err(err) => {
                        error!(error = %err, "failed to spawn event worker, dispatching inline");
                        None
                    }
                }
            }
        };

        Self {
            inner: Arc::new(ChannelInner {
                dispatch,
                worker,
                next_handle: AtomicU64::new(1),
                published: AtomicU64::new(0),
            }),
        }
    }

    /// Effective dispatch mode.
    pub fn mode(&self) -> &'static str {
        if self.inner.worker.is_some() {
            "worker"
        } else {
            "inline"
        }
    }

    /// Register a handler for one event kind.
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionHandle
    where
        F: Fn(&NetworkEvent) -> HandlerResult + Send + Sync + 'static,
    {
        let handle = SubscriptionHandle {
            id: self.inner.next_handle.fetch_add(1, Ordering::Relaxed),
            kind,
        };
        self.inner.dispatch.subscribers.write().push(Subscriber {
            handle,
            handler: Arc::new(handler),
        });
        handle
    }

    /// Remove a subscription. Returns false if it was already gone.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        let mut subscribers = self.inner.dispatch.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|s| s.handle != handle);
        subscribers.len() != before
    }

    /// Handler for `Connect`.
    pub fn on_connect<F>(&self, handler: F) -> SubscriptionHandle
    where
        F: Fn(ConnectionId, SocketAddr) -> HandlerResult + Send + Sync + 'static,
    {
        self.subscribe(EventKind::Connect, move |event| match event {
            NetworkEvent::Connect {
                connection_id,
                remote_addr,
            } => handler(*connection_id, *remote_addr),
            _ => Ok(()),
        })
    }

    /// Handler for `GamePacket`.
    pub fn on_game_packet<F>(&self, handler: F) -> SubscriptionHandle
    where
        F: Fn(ConnectionId, &Bytes) -> HandlerResult + Send + Sync + 'static,
    {
        self.subscribe(EventKind::GamePacket, move |event| match event {
            NetworkEvent::GamePacket {
                connection_id,
                payload,
            } => handler(*connection_id, payload),
            _ => Ok(()),
        })
    }

    /// Handler for `Disconnect`.
    pub fn on_disconnect<F>(&self, handler: F) -> SubscriptionHandle
    where
        F: Fn(ConnectionId, DisconnectReason) -> HandlerResult + Send + Sync + 'static,
    {
        self.subscribe(EventKind::Disconnect, move |event| match event {
            NetworkEvent::Disconnect {
                connection_id,
                reason,
            } => handler(*connection_id, *reason),
            _ => Ok(()),
        })
    }

    /// Handler for `Diagnostic`.
    pub fn on_diagnostic<F>(&self, handler: F) -> SubscriptionHandle
    where
        F: Fn(&Diagnostic) -> HandlerResult + Send + Sync + 'static,
    {
        self.subscribe(EventKind::Diagnostic, move |event| match event {
            NetworkEvent::Diagnostic(diagnostic) => handler(diagnostic),
            _ => Ok(()),
        })
    }

    /// Publish an event to every subscriber of its kind.
    pub fn publish(&self, event: NetworkEvent) {
        self.inner.published.fetch_add(1, Ordering::Relaxed);

        match &self.inner.worker {
            None => self.inner.dispatch.deliver(&event),
            Some(worker) => {
                worker.push(Job::Deliver(event));
            }
        }
    }

    /// Wait until everything published so far has been delivered.
    pub async fn flush(&self) {
        let Some(worker) = &self.inner.worker else {
            return;
        };

        let (done_tx, done_rx) = oneshot::channel();
        if worker.push(Job::Flush(done_tx)) {
            let _ = done_rx.await;
        }
    }

    /// Current counters.
    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            published: self.inner.published.load(Ordering::Relaxed),
            handler_failures: self.inner.dispatch.failures.load(Ordering::Relaxed),
            dropped_packets: self
                .inner
                .worker
                .as_ref()
                .map_or(0, |worker| worker.dropped.load(Ordering::Relaxed)),
            subscribers: self.inner.dispatch.subscribers.read().len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:5000".parse().unwrap()
    }

    fn packet(id: u64, byte: u8) -> NetworkEvent {
        NetworkEvent::GamePacket {
            connection_id: ConnectionId::new(id),
            payload: Bytes::from(vec![byte]),
        }
    }

    #[test]
    fn test_inline_fan_out_by_kind() {
        let channel = EventChannel::default();
        let packets = Arc::new(Mutex::new(Vec::new()));
        let disconnects = Arc::new(Mutex::new(Vec::new()));

        for _ in 0..2 {
            let packets = packets.clone();
            channel.on_game_packet(move |id, payload| {
                packets.lock().push((id, payload.clone()));
                Ok(())
            });
        }
        {
            let disconnects = disconnects.clone();
            channel.on_disconnect(move |id, reason| {
                disconnects.lock().push((id, reason));
                Ok(())
            });
        }

        channel.publish(packet(1, 0xAA));
        channel.publish(NetworkEvent::Disconnect {
            connection_id: ConnectionId::new(1),
            reason: DisconnectReason::PeerClosed,
        });

        assert_eq!(packets.lock().len(), 2);
        assert_eq!(
            disconnects.lock().as_slice(),
            &[(ConnectionId::new(1), DisconnectReason::PeerClosed)]
        );
        assert_eq!(channel.stats().published, 2);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let channel = EventChannel::default();
        let count = Arc::new(AtomicU64::new(0));
        let handle = {
            let count = count.clone();
            channel.on_connect(move |_, _| {
                count.fetch_add(1, Ordering::Relaxed);
                Ok(())
            })
        };

        let connect = NetworkEvent::Connect {
            connection_id: ConnectionId::new(3),
            remote_addr: addr(),
        };
        channel.publish(connect.clone());
        assert!(channel.unsubscribe(handle));
        assert!(!channel.unsubscribe(handle));
        channel.publish(connect);

        assert_eq!(count.load(Ordering::Relaxed), 1);
        assert_eq!(channel.stats().subscribers, 0);
    }

    #[test]
    fn test_failing_and_panicking_handlers_are_contained() {
        let channel = EventChannel::default();
        let reached = Arc::new(AtomicU64::new(0));

        channel.on_game_packet(|_, _| anyhow::bail!("consumer bug"));
        channel.on_game_packet(|_, _| panic!("consumer panic"));
        {
            let reached = reached.clone();
            channel.on_game_packet(move |_, _| {
                reached.fetch_add(1, Ordering::Relaxed);
                Ok(())
            });
        }

        channel.publish(packet(1, 1));

        assert_eq!(reached.load(Ordering::Relaxed), 1);
        assert_eq!(channel.stats().handler_failures, 2);
    }

    #[test]
    fn test_event_connection_id() {
        assert_eq!(packet(4, 0).connection_id(), Some(ConnectionId::new(4)));
        let diag = NetworkEvent::Diagnostic(Diagnostic::HandshakeRejected {
            remote_addr: addr(),
            error: HandshakeError::CapacityReached,
        });
        assert_eq!(diag.connection_id(), None);
        assert_eq!(diag.kind(), EventKind::Diagnostic);
    }

    #[tokio::test]
    async fn test_worker_preserves_order_and_flushes() {
        let channel = EventChannel::new(DispatchMode::Worker { queue_capacity: 64 });
        assert_eq!(channel.mode(), "worker");

        let seen = Arc::new(Mutex::new(Vec::new()));
        let publisher_thread = std::thread::current().id();
        let off_thread = Arc::new(AtomicU64::new(0));
        {
            let seen = seen.clone();
            let off_thread = off_thread.clone();
            channel.on_game_packet(move |_, payload| {
                if std::thread::current().id() != publisher_thread {
                    off_thread.fetch_add(1, Ordering::Relaxed);
                }
                seen.lock().push(payload[0]);
                Ok(())
            });
        }

        for byte in 0..32u8 {
            channel.publish(packet(1, byte));
        }
        channel.flush().await;

        let seen = seen.lock().clone();
        assert_eq!(seen, (0..32u8).collect::<Vec<_>>());
        assert_eq!(off_thread.load(Ordering::Relaxed), 32);
    }

    #[tokio::test]
    async fn test_worker_drops_packets_but_never_blocks() {
        let channel = EventChannel::new(DispatchMode::Worker { queue_capacity: 1 });
        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let release_rx = Mutex::new(release_rx);
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            channel.on_game_packet(move |_, payload| {
                if payload[0] == 0 {
                    let _ = entered_tx.send(());
                    let _ = release_rx.lock().recv();
                }
                seen.lock().push(payload[0]);
                Ok(())
            });
        }
        let disconnects = Arc::new(AtomicU64::new(0));
        {
            let disconnects = disconnects.clone();
            channel.on_disconnect(move |_, _| {
                disconnects.fetch_add(1, Ordering::Relaxed);
                Ok(())
            });
        }

        channel.publish(packet(1, 0));
        entered_rx.recv().unwrap();

        // The dispatch thread is busy: one packet fits, the next is dropped,
        // lifecycle events are always kept.
        channel.publish(packet(1, 1));
        channel.publish(packet(1, 2));
        channel.publish(NetworkEvent::Disconnect {
            connection_id: ConnectionId::new(1),
            reason: DisconnectReason::PeerClosed,
        });

        release_tx.send(()).unwrap();
        channel.flush().await;

        assert_eq!(seen.lock().as_slice(), &[0, 1]);
        assert_eq!(disconnects.load(Ordering::Relaxed), 1);
        assert_eq!(channel.stats().dropped_packets, 1);
        assert_eq!(channel.stats().published, 4);
    }
}

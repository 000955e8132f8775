//! Connection State
//!
//! One remote peer's session as seen by the registry: who it is, when it
//! was last heard from, and the sequencing state the driver needs.
//! Consumers only ever see `ConnectionView` snapshots.

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::network::outbound::{OverflowPolicy, PushError};

/// Unique connection identifier. Never reused within a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Wrap a raw id.
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Raw id.
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Monotonic id source shared by everything that mints connection ids.
#[derive(Debug, Clone)]
pub struct IdGenerator {
    counter: Arc<AtomicU64>,
}

impl IdGenerator {
    /// Generator whose first id is `start`.
    pub fn new(start: u64) -> Self {
        Self {
            counter: Arc::new(AtomicU64::new(start)),
        }
    }

    /// Next id.
    #[inline]
    pub fn next(&self) -> ConnectionId {
        ConnectionId(self.counter.fetch_add(1, Ordering::Relaxed))
    }
}

/// Transport-level identity of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerIdentity {
    /// Remote socket address.
    pub addr: SocketAddr,
    /// Session token, for transports that issue one.
    pub session_token: Option<u64>,
}

impl PeerIdentity {
    /// Identity for transports without session tokens.
    pub fn from_addr(addr: SocketAddr) -> Self {
        Self {
            addr,
            session_token: None,
        }
    }

    /// Identity carrying a session token.
    pub fn with_token(addr: SocketAddr, token: u64) -> Self {
        Self {
            addr,
            session_token: Some(token),
        }
    }
}

/// Connection state. A closed connection is simply absent from the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Healthy.
    Open,
    /// The last write failed; the idle timeout decides its fate.
    Suspect,
    /// `Disconnect` has been published; removal is imminent.
    Closing,
}

/// Registry-owned record for one peer.
#[derive(Debug)]
pub struct Connection {
    /// Connection id.
    pub id: ConnectionId,
    /// Peer identity.
    pub peer: PeerIdentity,
    /// Current state.
    pub state: ConnectionState,
    connected_at: DateTime<Utc>,
    last_activity: Instant,
    last_activity_at: DateTime<Utc>,
    send_sequence: u32,
    recv_sequence: Option<u32>,
    packets_received: u64,
    packets_sent: u64,
    /// Buffers queued with `NetworkServer::queue`, released by `flush`.
    batch: VecDeque<Bytes>,
}

impl Connection {
    /// Fresh, open connection.
    pub fn new(id: ConnectionId, peer: PeerIdentity) -> Self {
        let now = Utc::now();
        Self {
            id,
            peer,
            state: ConnectionState::Open,
            connected_at: now,
            last_activity: Instant::now(),
            last_activity_at: now,
            send_sequence: 0,
            recv_sequence: None,
            packets_received: 0,
            packets_sent: 0,
            batch: VecDeque::new(),
        }
    }

    /// Record inbound traffic of any kind.
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
        self.last_activity_at = Utc::now();
    }

    /// Record an inbound packet that will be published.
    pub fn record_received(&mut self) {
        self.packets_received += 1;
        self.touch();
    }

    /// Record an outbound packet that hit the wire.
    pub fn record_sent(&mut self) {
        self.packets_sent += 1;
    }

    /// Allocate the next outbound sequence number.
    pub fn next_send_sequence(&mut self) -> u32 {
        let seq = self.send_sequence;
        self.send_sequence = self.send_sequence.wrapping_add(1);
        seq
    }

    /// Accept an inbound sequence number if it is newer than the last one.
    ///
    /// Stale and duplicate numbers are rejected. Comparison is wrap-aware.
    pub fn accept_sequence(&mut self, seq: u32) -> bool {
        match self.recv_sequence {
            Some(last) if !sequence_greater_than(seq, last) => false,
            _ => {
                self.recv_sequence = Some(seq);
                true
            }
        }
    }

    /// Time since the peer was last heard from.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    /// Whether `close` may still run for this connection.
    pub fn is_live(&self) -> bool {
        self.state != ConnectionState::Closing
    }

    /// Park a buffer until the next flush.
    ///
    /// At most `capacity` buffers are parked. When full, `DropOldest`
    /// evicts the oldest one; the other policies refuse the new buffer,
    /// since a batched send has nothing to wait for.
    pub fn push_batch(
        &mut self,
        payload: Bytes,
        capacity: usize,
        policy: OverflowPolicy,
    ) -> Result<(), PushError> {
        if self.batch.len() >= capacity.max(1) {
            match policy {
                OverflowPolicy::DropOldest => {
                    self.batch.pop_front();
                }
                OverflowPolicy::DropNewest | OverflowPolicy::Block { .. } => {
                    return Err(PushError::Full);
                }
            }
        }
        self.batch.push_back(payload);
        Ok(())
    }

    /// Take every parked buffer, oldest first.
    pub fn take_batch(&mut self) -> Vec<Bytes> {
        std::mem::take(&mut self.batch).into()
    }

    /// Read-only snapshot for consumers.
    pub fn view(&self) -> ConnectionView {
        ConnectionView {
            id: self.id,
            remote_addr: self.peer.addr,
            session_token: self.peer.session_token,
            connected_since: self.connected_at,
            last_activity: self.last_activity_at,
            state: self.state,
            packets_received: self.packets_received,
            packets_sent: self.packets_sent,
        }
    }
}

/// `a` is newer than `b` in 32-bit wrapping sequence space.
#[inline]
pub fn sequence_greater_than(a: u32, b: u32) -> bool {
    a != b && a.wrapping_sub(b) < (1 << 31)
}

/// Point-in-time copy of a connection, safe to hold indefinitely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionView {
    /// Connection id.
    pub id: ConnectionId,
    /// Remote address.
    pub remote_addr: SocketAddr,
    /// Session token, if the transport issues one.
    pub session_token: Option<u64>,
    /// When the connection was registered.
    pub connected_since: DateTime<Utc>,
    /// When the peer was last heard from.
    pub last_activity: DateTime<Utc>,
    /// State at snapshot time.
    pub state: ConnectionState,
    /// Inbound packets published so far.
    pub packets_received: u64,
    /// Outbound packets written so far.
    pub packets_sent: u64,
}

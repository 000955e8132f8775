//! Shared helpers for the socket-level tests.

#![allow(dead_code)]

use std::time::Duration;

use bytes::Bytes;
use multinet::{
    ConnectionId, Diagnostic, DisconnectReason, EventChannel, EventKind, NetworkEvent,
    NetworkType, ServerConfig,
};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

/// How long a test waits for any single event.
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Config bound to an ephemeral loopback port.
pub fn local_config(network_type: NetworkType) -> ServerConfig {
    ServerConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        network_type,
        ..ServerConfig::default()
    }
}

/// Every event published on a channel, in order.
pub struct EventLog {
    rx: UnboundedReceiver<NetworkEvent>,
}

impl EventLog {
    /// Subscribe to all event kinds.
    pub fn record(events: &EventChannel) -> Self {
        let (tx, rx) = unbounded_channel();
        for kind in [
            EventKind::Connect,
            EventKind::GamePacket,
            EventKind::Disconnect,
            EventKind::Diagnostic,
        ] {
            let tx = tx.clone();
            events.subscribe(kind, move |event| {
                let _ = tx.send(event.clone());
                Ok(())
            });
        }
        Self { rx }
    }

    /// Next event matching `pred`; earlier non-matching events are skipped.
    pub async fn next_matching<F>(&mut self, what: &str, mut pred: F) -> NetworkEvent
    where
        F: FnMut(&NetworkEvent) -> bool,
    {
        let wait = async {
            while let Some(event) = self.rx.recv().await {
                if pred(&event) {
                    return Some(event);
                }
            }
            None
        };
        match tokio::time::timeout(EVENT_TIMEOUT, wait).await {
            Ok(Some(event)) => event,
            _ => panic!("timed out waiting for {what}"),
        }
    }

    pub async fn connect(&mut self) -> ConnectionId {
        match self
            .next_matching("connect", |e| matches!(e, NetworkEvent::Connect { .. }))
            .await
        {
            NetworkEvent::Connect { connection_id, .. } => connection_id,
            _ => unreachable!(),
        }
    }

    pub async fn packet(&mut self) -> (ConnectionId, Bytes) {
        match self
            .next_matching("game packet", |e| matches!(e, NetworkEvent::GamePacket { .. }))
            .await
        {
            NetworkEvent::GamePacket {
                connection_id,
                payload,
            } => (connection_id, payload),
            _ => unreachable!(),
        }
    }

    pub async fn disconnect(&mut self) -> (ConnectionId, DisconnectReason) {
        match self
            .next_matching("disconnect", |e| matches!(e, NetworkEvent::Disconnect { .. }))
            .await
        {
            NetworkEvent::Disconnect {
                connection_id,
                reason,
            } => (connection_id, reason),
            _ => unreachable!(),
        }
    }

    pub async fn diagnostic(&mut self) -> Diagnostic {
        match self
            .next_matching("diagnostic", |e| matches!(e, NetworkEvent::Diagnostic(_)))
            .await
        {
            NetworkEvent::Diagnostic(diagnostic) => diagnostic,
            _ => unreachable!(),
        }
    }

    /// Events already received, without waiting.
    pub fn drain(&mut self) -> Vec<NetworkEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }
}

//! RakNet-like transport driven by a raw UDP client.

mod common;

use std::net::SocketAddr;

use bytes::Bytes;
use multinet::network::transport::raknet::codec::{
    self, Datagram, Frame, FrameBody, OfflinePacket, MAX_MTU, PROTOCOL_VERSION,
};
use multinet::{
    Diagnostic, DisconnectReason, HandshakeError, NetworkServer, NetworkType, SendError,
    ServerConfig,
};
use tokio::net::UdpSocket;

use common::{local_config, EventLog, EVENT_TIMEOUT};

struct Client {
    socket: UdpSocket,
    server: SocketAddr,
    token: u64,
    sequence: u32,
}

impl Client {
    async fn bind(server: SocketAddr) -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        Self {
            socket,
            server,
            token: 0,
            sequence: 0,
        }
    }

    async fn send_offline(&self, packet: OfflinePacket) {
        self.socket
            .send_to(&packet.to_bytes(), self.server)
            .await
            .unwrap();
    }

    async fn recv(&self) -> Datagram {
        let mut buf = vec![0u8; 2048];
        let (len, _) = tokio::time::timeout(EVENT_TIMEOUT, self.socket.recv_from(&mut buf))
            .await
            .expect("timed out waiting for datagram")
            .unwrap();
        codec::decode(Bytes::copy_from_slice(&buf[..len])).unwrap()
    }

    /// Next frame that is not a keepalive.
    async fn recv_frame(&self) -> Frame {
        loop {
            match self.recv().await {
                Datagram::Frame(Frame {
                    body: FrameBody::ConnectedPing { .. },
                    ..
                }) => continue,
                Datagram::Frame(frame) => return frame,
                other => panic!("expected frame, got {other:?}"),
            }
        }
    }

    async fn open(&mut self) -> OfflinePacket {
        self.send_offline(OfflinePacket::OpenConnectionRequest {
            protocol: PROTOCOL_VERSION,
            mtu: MAX_MTU,
        })
        .await;
        let reply = match self.recv().await {
            Datagram::Offline(packet) => packet,
            other => panic!("expected offline reply, got {other:?}"),
        };
        if let OfflinePacket::OpenConnectionReply { session_token, .. } = reply {
            self.token = session_token;
        }
        reply
    }

    async fn send_body(&mut self, body: FrameBody) {
        let frame = Frame {
            sequence: self.sequence,
            session_token: self.token,
            body,
        };
        self.sequence += 1;
        self.socket
            .send_to(&frame.to_bytes(), self.server)
            .await
            .unwrap();
    }
}

async fn start(config: ServerConfig) -> (NetworkServer, EventLog, SocketAddr) {
    let server = NetworkServer::new(NetworkType::RakNetLike);
    let log = EventLog::record(server.events());
    let addr = server.start(config).await.unwrap();
    (server, log, addr)
}

#[tokio::test]
async fn test_unconnected_ping_returns_motd() {
    let config = ServerConfig {
        motd: "Arena;2;16".to_string(),
        ..local_config(NetworkType::RakNetLike)
    };
    let (server, _log, addr) = start(config).await;

    let client = Client::bind(addr).await;
    client
        .send_offline(OfflinePacket::UnconnectedPing { time: 1234 })
        .await;

    match client.recv().await {
        Datagram::Offline(OfflinePacket::UnconnectedPong { time, motd, .. }) => {
            assert_eq!(time, 1234);
            assert_eq!(motd, "Arena;2;16");
        }
        other => panic!("expected pong, got {other:?}"),
    }
    // Discovery does not create a session.
    assert!(server.connections().is_empty());

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_session_lifecycle() {
    let (server, mut log, addr) = start(local_config(NetworkType::RakNetLike)).await;

    let mut client = Client::bind(addr).await;
    match client.open().await {
        OfflinePacket::OpenConnectionReply { mtu, .. } => assert_eq!(mtu, MAX_MTU),
        other => panic!("expected reply, got {other:?}"),
    }
    let id = log.connect().await;
    assert_eq!(
        server.connection(id).unwrap().remote_addr,
        client.socket.local_addr().unwrap()
    );

    client
        .send_body(FrameBody::Game(Bytes::from_static(b"hello")))
        .await;
    assert_eq!(log.packet().await, (id, Bytes::from_static(b"hello")));

    server.send(id, &b"hi"[..]).await.unwrap();
    let frame = client.recv_frame().await;
    assert_eq!(frame.session_token, client.token);
    assert_eq!(frame.body, FrameBody::Game(Bytes::from_static(b"hi")));

    client.send_body(FrameBody::Disconnect).await;
    assert_eq!(log.disconnect().await, (id, DisconnectReason::PeerClosed));
    assert!(server.connections().is_empty());

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_stale_frames_are_dropped() {
    let (server, mut log, addr) = start(local_config(NetworkType::RakNetLike)).await;

    let mut client = Client::bind(addr).await;
    client.open().await;
    let id = log.connect().await;

    client.sequence = 10;
    client
        .send_body(FrameBody::Game(Bytes::from_static(b"new")))
        .await;
    client.sequence = 3;
    client
        .send_body(FrameBody::Game(Bytes::from_static(b"old")))
        .await;
    client.sequence = 11;
    client
        .send_body(FrameBody::Game(Bytes::from_static(b"newer")))
        .await;

    assert_eq!(log.packet().await.1.as_ref(), b"new");
    assert_eq!(log.packet().await.1.as_ref(), b"newer");
    assert_eq!(server.connection(id).unwrap().packets_received, 2);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_incompatible_protocol_is_refused() {
    let (server, mut log, addr) = start(local_config(NetworkType::RakNetLike)).await;

    let client = Client::bind(addr).await;
    client
        .send_offline(OfflinePacket::OpenConnectionRequest {
            protocol: PROTOCOL_VERSION + 1,
            mtu: MAX_MTU,
        })
        .await;

    match client.recv().await {
        Datagram::Offline(OfflinePacket::IncompatibleProtocol { protocol, .. }) => {
            assert_eq!(protocol, PROTOCOL_VERSION)
        }
        other => panic!("expected refusal, got {other:?}"),
    }
    match log.diagnostic().await {
        Diagnostic::HandshakeRejected { error, .. } => assert_eq!(
            error,
            HandshakeError::IncompatibleProtocol {
                theirs: PROTOCOL_VERSION + 1,
                ours: PROTOCOL_VERSION,
            }
        ),
        other => panic!("unexpected diagnostic {other:?}"),
    }
    assert!(server.connections().is_empty());

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_full_server_refuses_new_sessions() {
    let config = ServerConfig {
        max_connections: 1,
        ..local_config(NetworkType::RakNetLike)
    };
    let (server, mut log, addr) = start(config).await;

    let mut first = Client::bind(addr).await;
    assert!(matches!(
        first.open().await,
        OfflinePacket::OpenConnectionReply { .. }
    ));
    log.connect().await;

    let mut second = Client::bind(addr).await;
    assert!(matches!(
        second.open().await,
        OfflinePacket::NoFreeIncomingConnections { .. }
    ));
    assert!(matches!(
        log.diagnostic().await,
        Diagnostic::HandshakeRejected {
            error: HandshakeError::CapacityReached,
            ..
        }
    ));
    assert_eq!(server.connections().len(), 1);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_wrong_session_token_is_reported() {
    let (server, mut log, addr) = start(local_config(NetworkType::RakNetLike)).await;

    let mut client = Client::bind(addr).await;
    client.open().await;
    let id = log.connect().await;

    client.token = client.token.wrapping_add(1);
    client
        .send_body(FrameBody::Game(Bytes::from_static(b"spoof")))
        .await;

    match log.diagnostic().await {
        Diagnostic::MalformedPacket { connection_id, .. } => assert_eq!(connection_id, Some(id)),
        other => panic!("unexpected diagnostic {other:?}"),
    }
    assert_eq!(server.connection(id).unwrap().packets_received, 0);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_oversized_send_is_rejected() {
    let (server, mut log, addr) = start(local_config(NetworkType::RakNetLike)).await;

    let mut client = Client::bind(addr).await;
    client.open().await;
    let id = log.connect().await;

    let result = server.send(id, vec![0u8; MAX_MTU as usize]).await;
    assert!(matches!(result, Err(SendError::PayloadTooLarge { .. })));

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_stop_notifies_peer() {
    let (server, mut log, addr) = start(local_config(NetworkType::RakNetLike)).await;

    let mut client = Client::bind(addr).await;
    client.open().await;
    let id = log.connect().await;

    server.stop().await.unwrap();
    assert_eq!(log.disconnect().await, (id, DisconnectReason::ServerShutdown));
    let frame = client.recv_frame().await;
    assert_eq!(frame.body, FrameBody::Disconnect);
}

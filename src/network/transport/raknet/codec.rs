//! Wire format for the RakNet-like transport.
//!
//! All integers are big-endian.
//!
//! Offline packets (no session yet):
//! ```text
//! 0x01 UnconnectedPing           [u64 time][MAGIC]
//! 0x1C UnconnectedPong           [u64 time][u64 server guid][MAGIC][u16 len][motd]
//! 0x05 OpenConnectionRequest     [MAGIC][u8 protocol][u16 mtu]
//! 0x06 OpenConnectionReply       [MAGIC][u64 server guid][u64 session token][u16 mtu]
//! 0x19 IncompatibleProtocol      [u8 protocol][MAGIC][u64 server guid]
//! 0x14 NoFreeIncomingConnections [MAGIC][u64 server guid]
//! ```
//!
//! Connected frames:
//! ```text
//! 0x84 [u32 sequence][u64 session token][u8 inner id][body]
//!      0x00 ConnectedPing          [u64 time]
//!      0x03 ConnectedPong          [u64 time]
//!      0x15 DisconnectNotification
//!      0xFE GamePacket             [payload...]
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Offline message marker.
pub const MAGIC: [u8; 16] = [
    0x00, 0xff, 0xff, 0x00, 0xfe, 0xfe, 0xfe, 0xfe, 0xfd, 0xfd, 0xfd, 0xfd, 0x12, 0x34, 0x56, 0x78,
];

/// Protocol version spoken by this server.
pub const PROTOCOL_VERSION: u8 = 11;

/// Smallest MTU a client may propose.
pub const MIN_MTU: u16 = 576;

/// Largest MTU the server agrees to.
pub const MAX_MTU: u16 = 1400;

/// Bytes a connected frame adds around a game payload.
pub const FRAME_HEADER_LEN: usize = 1 + 4 + 8 + 1;

/// Longest MOTD that keeps an unconnected pong within `MIN_MTU`.
pub const MAX_MOTD_LEN: usize = MIN_MTU as usize - (1 + 8 + 8 + 16 + 2);

/// Longest prefix of `motd` within `MAX_MOTD_LEN` bytes that ends on a
/// character boundary.
pub fn truncate_motd(motd: &str) -> &str {
    if motd.len() <= MAX_MOTD_LEN {
        return motd;
    }
    let mut end = MAX_MOTD_LEN;
    while !motd.is_char_boundary(end) {
        end -= 1;
    }
    &motd[..end]
}

/// Packet ids.
#[allow(missing_docs)]
pub mod id {
    pub const UNCONNECTED_PING: u8 = 0x01;
    pub const OPEN_CONNECTION_REQUEST: u8 = 0x05;
    pub const OPEN_CONNECTION_REPLY: u8 = 0x06;
    pub const NO_FREE_INCOMING_CONNECTIONS: u8 = 0x14;
    pub const INCOMPATIBLE_PROTOCOL: u8 = 0x19;
    pub const UNCONNECTED_PONG: u8 = 0x1C;
    pub const FRAME: u8 = 0x84;

    pub const CONNECTED_PING: u8 = 0x00;
    pub const CONNECTED_PONG: u8 = 0x03;
    pub const DISCONNECT_NOTIFICATION: u8 = 0x15;
    pub const GAME_PACKET: u8 = 0xFE;
}

/// Decode failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// Zero-length datagram.
    #[error("empty datagram")]
    Empty,
    /// Unrecognised packet id.
    #[error("unknown packet id 0x{0:02x}")]
    UnknownId(u8),
    /// Datagram ends early.
    #[error("truncated packet: needed {needed} bytes, {remaining} left")]
    Truncated {
        /// Bytes the field needs.
        needed: usize,
        /// Bytes left in the datagram.
        remaining: usize,
    },
    /// Offline magic does not match.
    #[error("bad offline magic")]
    BadMagic,
    /// MOTD is not valid UTF-8.
    #[error("motd is not valid utf-8")]
    InvalidMotd,
}

/// Packets exchanged before a session exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OfflinePacket {
    /// Server discovery probe.
    UnconnectedPing {
        /// Client clock, echoed back.
        time: u64,
    },
    /// Discovery answer.
    UnconnectedPong {
        /// Echoed client clock.
        time: u64,
        /// Server GUID.
        server_guid: u64,
        /// Message of the day.
        motd: String,
    },
    /// Session request.
    OpenConnectionRequest {
        /// Client protocol version.
        protocol: u8,
        /// Proposed MTU.
        mtu: u16,
    },
    /// Session granted.
    OpenConnectionReply {
        /// Server GUID.
        server_guid: u64,
        /// Token the client puts in every frame.
        session_token: u64,
        /// Agreed MTU.
        mtu: u16,
    },
    /// Session refused: protocol mismatch.
    IncompatibleProtocol {
        /// Version the server speaks.
        protocol: u8,
        /// Server GUID.
        server_guid: u64,
    },
    /// Session refused: server full.
    NoFreeIncomingConnections {
        /// Server GUID.
        server_guid: u64,
    },
}

/// Body of a connected frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameBody {
    /// Keepalive probe.
    ConnectedPing {
        /// Sender clock.
        time: u64,
    },
    /// Keepalive answer.
    ConnectedPong {
        /// Echoed clock.
        time: u64,
    },
    /// Orderly session end.
    Disconnect,
    /// Application payload.
    Game(Bytes),
}

/// A sequenced frame inside a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Per-direction sequence number.
    pub sequence: u32,
    /// Session token from the open-connection reply.
    pub session_token: u64,
    /// Contents.
    pub body: FrameBody,
}

/// Any datagram the server may receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Datagram {
    /// Pre-session packet.
    Offline(OfflinePacket),
    /// In-session frame.
    Frame(Frame),
}

fn need(buf: &Bytes, needed: usize) -> Result<(), CodecError> {
    if buf.remaining() < needed {
        return Err(CodecError::Truncated {
            needed,
            remaining: buf.remaining(),
        });
    }
    Ok(())
}

fn get_u8(buf: &mut Bytes) -> Result<u8, CodecError> {
    need(buf, 1)?;
    Ok(buf.get_u8())
}

fn get_u16(buf: &mut Bytes) -> Result<u16, CodecError> {
    need(buf, 2)?;
    Ok(buf.get_u16())
}

fn get_u32(buf: &mut Bytes) -> Result<u32, CodecError> {
    need(buf, 4)?;
    Ok(buf.get_u32())
}

fn get_u64(buf: &mut Bytes) -> Result<u64, CodecError> {
    need(buf, 8)?;
    Ok(buf.get_u64())
}

fn get_magic(buf: &mut Bytes) -> Result<(), CodecError> {
    need(buf, MAGIC.len())?;
    let magic = buf.split_to(MAGIC.len());
    if magic.as_ref() != MAGIC {
        return Err(CodecError::BadMagic);
    }
    Ok(())
}

/// Decode one datagram.
pub fn decode(mut buf: Bytes) -> Result<Datagram, CodecError> {
    if buf.is_empty() {
        return Err(CodecError::Empty);
    }

    let packet_id = buf.get_u8();
    let packet = match packet_id {
        id::UNCONNECTED_PING => {
            let time = get_u64(&mut buf)?;
            get_magic(&mut buf)?;
            OfflinePacket::UnconnectedPing { time }
        }
        id::UNCONNECTED_PONG => {
            let time = get_u64(&mut buf)?;
            let server_guid = get_u64(&mut buf)?;
            get_magic(&mut buf)?;
            let len = get_u16(&mut buf)? as usize;
            need(&buf, len)?;
            let motd = String::from_utf8(buf.split_to(len).to_vec())
                .map_err(|_| CodecError::InvalidMotd)?;
            OfflinePacket::UnconnectedPong {
                time,
                server_guid,
                motd,
            }
        }
        id::OPEN_CONNECTION_REQUEST => {
            get_magic(&mut buf)?;
            let protocol = get_u8(&mut buf)?;
            let mtu = get_u16(&mut buf)?;
            OfflinePacket::OpenConnectionRequest { protocol, mtu }
        }
        id::OPEN_CONNECTION_REPLY => {
            get_magic(&mut buf)?;
            OfflinePacket::OpenConnectionReply {
                server_guid: get_u64(&mut buf)?,
                session_token: get_u64(&mut buf)?,
                mtu: get_u16(&mut buf)?,
            }
        }
        id::INCOMPATIBLE_PROTOCOL => {
            let protocol = get_u8(&mut buf)?;
            get_magic(&mut buf)?;
            OfflinePacket::IncompatibleProtocol {
                protocol,
                server_guid: get_u64(&mut buf)?,
            }
        }
        id::NO_FREE_INCOMING_CONNECTIONS => {
            get_magic(&mut buf)?;
            OfflinePacket::NoFreeIncomingConnections {
                server_guid: get_u64(&mut buf)?,
            }
        }
        id::FRAME => return decode_frame(buf).map(Datagram::Frame),
        other => return Err(CodecError::UnknownId(other)),
    };
    Ok(Datagram::Offline(packet))
}

fn decode_frame(mut buf: Bytes) -> Result<Frame, CodecError> {
    let sequence = get_u32(&mut buf)?;
    let session_token = get_u64(&mut buf)?;
    let body = match get_u8(&mut buf)? {
        id::CONNECTED_PING => FrameBody::ConnectedPing {
            time: get_u64(&mut buf)?,
        },
        id::CONNECTED_PONG => FrameBody::ConnectedPong {
            time: get_u64(&mut buf)?,
        },
        id::DISCONNECT_NOTIFICATION => FrameBody::Disconnect,
        id::GAME_PACKET => FrameBody::Game(buf),
        other => return Err(CodecError::UnknownId(other)),
    };
    Ok(Frame {
        sequence,
        session_token,
        body,
    })
}

impl OfflinePacket {
    /// Append the encoded packet to `out`.
    pub fn encode(&self, out: &mut BytesMut) {
        match self {
            OfflinePacket::UnconnectedPing { time } => {
                out.put_u8(id::UNCONNECTED_PING);
                out.put_u64(*time);
                out.put_slice(&MAGIC);
            }
            OfflinePacket::UnconnectedPong {
                time,
                server_guid,
                motd,
            } => {
                let motd = truncate_motd(motd).as_bytes();
                out.put_u8(id::UNCONNECTED_PONG);
                out.put_u64(*time);
                out.put_u64(*server_guid);
                out.put_slice(&MAGIC);
                out.put_u16(motd.len() as u16);
                out.put_slice(motd);
            }
            OfflinePacket::OpenConnectionRequest { protocol, mtu } => {
                out.put_u8(id::OPEN_CONNECTION_REQUEST);
                out.put_slice(&MAGIC);
                out.put_u8(*protocol);
                out.put_u16(*mtu);
            }
            OfflinePacket::OpenConnectionReply {
                server_guid,
                session_token,
                mtu,
            } => {
                out.put_u8(id::OPEN_CONNECTION_REPLY);
                out.put_slice(&MAGIC);
                out.put_u64(*server_guid);
                out.put_u64(*session_token);
                out.put_u16(*mtu);
            }
            OfflinePacket::IncompatibleProtocol {
                protocol,
                server_guid,
            } => {
                out.put_u8(id::INCOMPATIBLE_PROTOCOL);
                out.put_u8(*protocol);
                out.put_slice(&MAGIC);
                out.put_u64(*server_guid);
            }
            OfflinePacket::NoFreeIncomingConnections { server_guid } => {
                out.put_u8(id::NO_FREE_INCOMING_CONNECTIONS);
                out.put_slice(&MAGIC);
                out.put_u64(*server_guid);
            }
        }
    }

    /// Encode into a fresh buffer.
    pub fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(64);
        self.encode(&mut out);
        out.freeze()
    }
}

impl Frame {
    /// Append the encoded frame to `out`.
    pub fn encode(&self, out: &mut BytesMut) {
        out.put_u8(id::FRAME);
        out.put_u32(self.sequence);
        out.put_u64(self.session_token);
        match &self.body {
            FrameBody::ConnectedPing { time } => {
                out.put_u8(id::CONNECTED_PING);
                out.put_u64(*time);
            }
            FrameBody::ConnectedPong { time } => {
                out.put_u8(id::CONNECTED_PONG);
                out.put_u64(*time);
            }
            FrameBody::Disconnect => out.put_u8(id::DISCONNECT_NOTIFICATION),
            FrameBody::Game(payload) => {
                out.put_u8(id::GAME_PACKET);
                out.put_slice(payload);
            }
        }
    }

    /// Encode into a fresh buffer.
    pub fn to_bytes(&self) -> Bytes {
        let extra = match &self.body {
            FrameBody::Game(payload) => payload.len(),
            _ => 8,
        };
        let mut out = BytesMut::with_capacity(FRAME_HEADER_LEN + extra);
        self.encode(&mut out);
        out.freeze()
    }
}

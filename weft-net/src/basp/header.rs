//! BASP wire codec.
//!
//! Everything on the wire is little-endian. A connection starts with an
//! 8-byte preamble (magic + protocol version); after that, frames are
//! `{op: u8, sender: u64, receiver: u64, payload_len: u32}` followed by
//! `payload_len` opaque bytes. When the ordering layer is negotiated, a
//! 16-bit sequence number sits immediately after the frame header.

use bytes::{BufMut, BytesMut};
use weft_core::{ActorId, NetError, NodeId};

/// Protocol magic, `wEFT` in ASCII.
pub const MAGIC: u32 = 0x5446_4577;

/// Protocol version spoken by this implementation.
pub const VERSION: u32 = 1;

/// Size of the connection preamble: magic + version.
pub const PREAMBLE_SIZE: usize = 8;

/// Size of a frame header: op + sender + receiver + payload length.
pub const HEADER_SIZE: usize = 1 + 8 + 8 + 4;

/// Size of the optional ordering preamble after the frame header.
pub const SEQUENCE_SIZE: usize = 2;

/// Largest accepted frame payload; larger lengths are a protocol error.
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Handshake capability bit: the sender offers the 16-bit ordering layer.
pub const FLAG_ORDERING: u32 = 1;

/// Frame operation codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    /// Node id and capability exchange; first frame on every connection.
    Handshake = 0,
    /// An actor message with opaque payload.
    Message = 1,
    /// Keep-alive; no payload.
    Heartbeat = 2,
    /// Ask for the actor published at a path.
    ResolveRequest = 3,
    /// Answer to a resolve request.
    ResolveResponse = 4,
    /// Start monitoring a local actor on behalf of the peer.
    Monitor = 5,
    /// A monitored actor terminated.
    Down = 6,
}

impl OpCode {
    fn from_u8(op: u8) -> Result<Self, FrameError> {
        match op {
            0 => Ok(OpCode::Handshake),
            1 => Ok(OpCode::Message),
            2 => Ok(OpCode::Heartbeat),
            3 => Ok(OpCode::ResolveRequest),
            4 => Ok(OpCode::ResolveResponse),
            5 => Ok(OpCode::Monitor),
            6 => Ok(OpCode::Down),
            op => Err(FrameError::UnknownOpCode { op }),
        }
    }
}

/// Errors produced while decoding BASP bytes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// The operation byte is not a known opcode.
    #[error("unknown opcode: {op:#04x}")]
    UnknownOpCode {
        /// The raw byte.
        op: u8,
    },

    /// Fewer bytes than the structure needs.
    #[error("truncated frame: need {needed} bytes, have {have}")]
    Truncated {
        /// Minimum bytes required.
        needed: usize,
        /// Bytes available.
        have: usize,
    },

    /// The preamble's magic is not ours.
    #[error("bad magic: {found:#010x}")]
    BadMagic {
        /// What arrived instead.
        found: u32,
    },

    /// The peer speaks a different protocol version.
    #[error("version mismatch: local {local}, remote {remote}")]
    VersionMismatch {
        /// Our version.
        local: u32,
        /// The peer's version.
        remote: u32,
    },

    /// A declared payload length above [`MAX_PAYLOAD_SIZE`].
    #[error("payload too large: {len} bytes")]
    PayloadTooLarge {
        /// The declared length.
        len: u32,
    },

    /// A payload field that must be UTF-8 was not.
    #[error("malformed {field}")]
    MalformedField {
        /// Which field.
        field: &'static str,
    },
}

impl From<FrameError> for NetError {
    fn from(err: FrameError) -> Self {
        NetError::protocol(err)
    }
}

/// A decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Operation code.
    pub op: OpCode,
    /// Sending actor ([`ActorId::INVALID`] when not meaningful).
    pub sender: ActorId,
    /// Receiving actor ([`ActorId::INVALID`] when not meaningful).
    pub receiver: ActorId,
    /// Length of the payload following the header (and sequence number, if
    /// negotiated).
    pub payload_len: u32,
}

impl FrameHeader {
    /// Append the encoded header to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.op as u8);
        buf.put_u64_le(self.sender.0);
        buf.put_u64_le(self.receiver.0);
        buf.put_u32_le(self.payload_len);
    }

    /// Decode a header from exactly [`HEADER_SIZE`] leading bytes.
    pub fn decode(buf: &[u8]) -> Result<Self, FrameError> {
        if buf.len() < HEADER_SIZE {
            return Err(FrameError::Truncated {
                needed: HEADER_SIZE,
                have: buf.len(),
            });
        }
        let op = OpCode::from_u8(buf[0])?;
        let sender = ActorId(u64_le(&buf[1..9]));
        let receiver = ActorId(u64_le(&buf[9..17]));
        let payload_len = u32_le(&buf[17..21]);
        if payload_len as usize > MAX_PAYLOAD_SIZE {
            return Err(FrameError::PayloadTooLarge { len: payload_len });
        }
        Ok(FrameHeader {
            op,
            sender,
            receiver,
            payload_len,
        })
    }
}

/// Append the connection preamble to `buf`.
pub fn encode_preamble(buf: &mut BytesMut) {
    buf.put_u32_le(MAGIC);
    buf.put_u32_le(VERSION);
}

/// Validate a connection preamble.
pub fn decode_preamble(buf: &[u8]) -> Result<(), FrameError> {
    if buf.len() < PREAMBLE_SIZE {
        return Err(FrameError::Truncated {
            needed: PREAMBLE_SIZE,
            have: buf.len(),
        });
    }
    let magic = u32_le(&buf[0..4]);
    if magic != MAGIC {
        return Err(FrameError::BadMagic { found: magic });
    }
    let version = u32_le(&buf[4..8]);
    if version != VERSION {
        return Err(FrameError::VersionMismatch {
            local: VERSION,
            remote: version,
        });
    }
    Ok(())
}

/// Append a handshake payload: capability flags plus the node origin.
pub fn encode_handshake(buf: &mut BytesMut, flags: u32, node: &NodeId) {
    buf.put_u32_le(flags);
    buf.extend_from_slice(node.as_str().as_bytes());
}

/// Decode a handshake payload.
pub fn decode_handshake(buf: &[u8]) -> Result<(u32, NodeId), FrameError> {
    if buf.len() < 4 {
        return Err(FrameError::Truncated {
            needed: 4,
            have: buf.len(),
        });
    }
    let flags = u32_le(&buf[0..4]);
    let origin = std::str::from_utf8(&buf[4..]).map_err(|_| FrameError::MalformedField {
        field: "handshake node id",
    })?;
    Ok((flags, NodeId::from_origin(origin)))
}

/// Append a resolve-request payload: request id plus path bytes.
pub fn encode_resolve_request(buf: &mut BytesMut, request_id: u64, path: &str) {
    buf.put_u64_le(request_id);
    buf.extend_from_slice(path.as_bytes());
}

/// Decode a resolve-request payload.
pub fn decode_resolve_request(buf: &[u8]) -> Result<(u64, &str), FrameError> {
    if buf.len() < 8 {
        return Err(FrameError::Truncated {
            needed: 8,
            have: buf.len(),
        });
    }
    let request_id = u64_le(&buf[0..8]);
    let path = std::str::from_utf8(&buf[8..]).map_err(|_| FrameError::MalformedField {
        field: "resolve path",
    })?;
    Ok((request_id, path))
}

/// Append a resolve-response payload: request id, actor id
/// ([`ActorId::INVALID`] when the path is unknown), and interface names.
pub fn encode_resolve_response(
    buf: &mut BytesMut,
    request_id: u64,
    actor: ActorId,
    interfaces: &[String],
) {
    buf.put_u64_le(request_id);
    buf.put_u64_le(actor.0);
    buf.put_u32_le(interfaces.len() as u32);
    for interface in interfaces {
        buf.put_u16_le(interface.len() as u16);
        buf.extend_from_slice(interface.as_bytes());
    }
}

/// Decode a resolve-response payload.
pub fn decode_resolve_response(buf: &[u8]) -> Result<(u64, ActorId, Vec<String>), FrameError> {
    if buf.len() < 20 {
        return Err(FrameError::Truncated {
            needed: 20,
            have: buf.len(),
        });
    }
    let request_id = u64_le(&buf[0..8]);
    let actor = ActorId(u64_le(&buf[8..16]));
    let count = u32_le(&buf[16..20]) as usize;
    let mut interfaces = Vec::with_capacity(count.min(64));
    let mut offset = 20;
    for _ in 0..count {
        if buf.len() < offset + 2 {
            return Err(FrameError::Truncated {
                needed: offset + 2,
                have: buf.len(),
            });
        }
        let len = u16::from_le_bytes([buf[offset], buf[offset + 1]]) as usize;
        offset += 2;
        if buf.len() < offset + len {
            return Err(FrameError::Truncated {
                needed: offset + len,
                have: buf.len(),
            });
        }
        let name =
            std::str::from_utf8(&buf[offset..offset + len]).map_err(|_| {
                FrameError::MalformedField {
                    field: "interface name",
                }
            })?;
        interfaces.push(name.to_string());
        offset += len;
    }
    Ok((request_id, actor, interfaces))
}

fn u32_le(buf: &[u8]) -> u32 {
    u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]])
}

fn u64_le(buf: &[u8]) -> u64 {
    u64::from_le_bytes([
        buf[0], buf[1], buf[2], buf[3], buf[4], buf[5], buf[6], buf[7],
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let header = FrameHeader {
            op: OpCode::Message,
            sender: ActorId(7),
            receiver: ActorId(9),
            payload_len: 1234,
        };
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), HEADER_SIZE);
        assert_eq!(FrameHeader::decode(&buf).expect("decode"), header);
    }

    #[test]
    fn header_layout_is_little_endian() {
        let header = FrameHeader {
            op: OpCode::Heartbeat,
            sender: ActorId(0x0102_0304),
            receiver: ActorId::INVALID,
            payload_len: 0x0a0b,
        };
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(buf[0], 2);
        assert_eq!(&buf[1..5], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&buf[17..19], &[0x0b, 0x0a]);
    }

    #[test]
    fn unknown_opcode_is_rejected() {
        let mut buf = BytesMut::new();
        FrameHeader {
            op: OpCode::Down,
            sender: ActorId::INVALID,
            receiver: ActorId::INVALID,
            payload_len: 0,
        }
        .encode(&mut buf);
        buf[0] = 0x7f;
        assert_eq!(
            FrameHeader::decode(&buf),
            Err(FrameError::UnknownOpCode { op: 0x7f })
        );
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(OpCode::Message as u8);
        buf.put_u64_le(0);
        buf.put_u64_le(0);
        buf.put_u32_le(u32::MAX);
        assert!(matches!(
            FrameHeader::decode(&buf),
            Err(FrameError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn preamble_validates_magic_and_version() {
        let mut buf = BytesMut::new();
        encode_preamble(&mut buf);
        assert!(decode_preamble(&buf).is_ok());

        let mut bad_magic = buf.clone();
        bad_magic[0] ^= 0xff;
        assert!(matches!(
            decode_preamble(&bad_magic),
            Err(FrameError::BadMagic { .. })
        ));

        let mut bad_version = buf.clone();
        bad_version[4] = 99;
        assert_eq!(
            decode_preamble(&bad_version),
            Err(FrameError::VersionMismatch {
                local: VERSION,
                remote: 99
            })
        );
    }

    #[test]
    fn handshake_roundtrip() {
        let node = NodeId::from_origin("tcp://peer:4001");
        let mut buf = BytesMut::new();
        encode_handshake(&mut buf, FLAG_ORDERING, &node);
        let (flags, decoded) = decode_handshake(&buf).expect("decode");
        assert_eq!(flags, FLAG_ORDERING);
        assert_eq!(decoded, node);
    }

    #[test]
    fn resolve_roundtrips() {
        let mut buf = BytesMut::new();
        encode_resolve_request(&mut buf, 42, "srv/worker");
        let (id, path) = decode_resolve_request(&buf).expect("decode");
        assert_eq!((id, path), (42, "srv/worker"));

        let mut buf = BytesMut::new();
        let interfaces = vec!["calculator".to_string(), "counter".to_string()];
        encode_resolve_response(&mut buf, 42, ActorId(7), &interfaces);
        let (id, actor, decoded) = decode_resolve_response(&buf).expect("decode");
        assert_eq!(id, 42);
        assert_eq!(actor, ActorId(7));
        assert_eq!(decoded, interfaces);
    }
}

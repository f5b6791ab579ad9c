//! Packet-level protocol shared by owner and peers.
//!
//! Every frame carries a `(type, subtype)` pair and an opaque payload; the
//! framing itself lives in [`crate::codec`]. This module owns the reserved
//! packet table.
//!
//! | type | subtype | direction    | meaning                               |
//! |------|---------|--------------|---------------------------------------|
//! | 0x00 | 0x00    | peer → owner | liveness probe (owner replies 01/00)  |
//! | 0x00 | 0x01    | peer → owner | session handshake, payload = key      |
//! | 0x01 | 0x00    | owner → peer | liveness / handshake acknowledgement  |
//! | 0x01 | 0x05    | owner → peer | node added                            |
//! | 0x01 | 0x06    | owner → peer | node edited                           |
//! | 0x01 | 0x07    | owner → peer | node deleted                          |
//!
//! ## Design rules
//!
//! 1. The framing layer never looks inside a payload.
//! 2. There is no version field: both ends must agree on this table.
//! 3. Node delta payloads are provisional (see [`node_delta`]).

use bytes::Bytes;

// ---------------------------------------------------------------------------
// Packet kind
// ---------------------------------------------------------------------------

/// The `(type, subtype)` pair a handler is keyed by.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct PacketKind {
    pub ptype: u8,
    pub subtype: u8,
}

impl PacketKind {
    pub const fn new(ptype: u8, subtype: u8) -> Self {
        Self { ptype, subtype }
    }

    /// Combined 16-bit key: type in the high byte, subtype in the low byte.
    pub const fn key(self) -> u16 {
        ((self.ptype as u16) << 8) | self.subtype as u16
    }
}

impl std::fmt::Display for PacketKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:02x}/0x{:02x}", self.ptype, self.subtype)
    }
}

/// Reserved packet kinds.
pub mod kinds {
    use super::PacketKind;

    pub const PING: PacketKind = PacketKind::new(0x00, 0x00);
    pub const HANDSHAKE: PacketKind = PacketKind::new(0x00, 0x01);

    pub const ACK: PacketKind = PacketKind::new(0x01, 0x00);
    pub const NODE_ADDED: PacketKind = PacketKind::new(0x01, 0x05);
    pub const NODE_EDITED: PacketKind = PacketKind::new(0x01, 0x06);
    pub const NODE_DELETED: PacketKind = PacketKind::new(0x01, 0x07);
}

// ---------------------------------------------------------------------------
// Packet
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub kind: PacketKind,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(kind: PacketKind, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    pub fn from_parts(ptype: u8, subtype: u8, payload: impl Into<Bytes>) -> Self {
        Self::new(PacketKind::new(ptype, subtype), payload)
    }

    pub fn handshake(session_key: impl Into<Bytes>) -> Self {
        Self::new(kinds::HANDSHAKE, session_key)
    }

    /// Length field value for this packet: type + subtype + payload.
    pub fn body_len(&self) -> usize {
        2 + self.payload.len()
    }
}

// ---------------------------------------------------------------------------
// Node delta payloads
// ---------------------------------------------------------------------------

/// Provisional payload layout for the node added / edited / deleted packets:
///
/// ```text
/// <node id> GROUP <prop> PAIR <value> RECORD <prop> PAIR <value> ...
/// ```
///
/// The encoding is not final and nothing parses it yet; it exists so the
/// owner can announce nodes with at least their identifier.
pub mod node_delta {
    use crate::types::InstanceId;
    use bytes::{BufMut, Bytes, BytesMut};

    /// Separates the node identifier from the first property.
    pub const GROUP_SEPARATOR: u8 = 0x1D;
    /// Separates a property name from its value.
    pub const PAIR_SEPARATOR: u8 = 0x1E;
    /// Separates one property/value pair from the next.
    pub const RECORD_SEPARATOR: u8 = 0x1F;

    pub fn encode(id: InstanceId, properties: &[(&str, &[u8])]) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_slice(id.0.to_string().as_bytes());
        for (i, (prop, value)) in properties.iter().enumerate() {
            buf.put_u8(if i == 0 {
                GROUP_SEPARATOR
            } else {
                RECORD_SEPARATOR
            });
            buf.put_slice(prop.as_bytes());
            buf.put_u8(PAIR_SEPARATOR);
            buf.put_slice(value);
        }
        buf.freeze()
    }
}

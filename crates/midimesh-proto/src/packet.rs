//! The MidiMesh data-packet codec.
//!
//! Every datagram starts with a fixed 20-byte big-endian header, optionally
//! followed by a forwarding-context block, then the raw MIDI payload. Node
//! addresses travel as 32-bit hash folds of the full 128-bit identifiers
//! (see [`crate::node::node_hash`]).

use thiserror::Error;

use crate::context::WireContext;
use crate::node::{node_hash, NodeId};

/// First two header bytes, ASCII `MI`.
pub const PACKET_MAGIC: [u8; 2] = [0x4D, 0x49];
/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 0x01;
/// Fixed header size in bytes.
pub const HEADER_LEN: usize = 20;

/// Header flag bits.
pub mod flags {
    /// Payload is a System Exclusive message.
    pub const SYSEX: u8 = 1 << 0;
    /// Packet travels on the reliable path.
    pub const RELIABLE: u8 = 1 << 1;
    /// Continuation of a fragmented message.
    pub const FRAGMENT_CONTINUATION: u8 = 1 << 2;
    /// A forwarding-context block precedes the payload.
    pub const HAS_CONTEXT: u8 = 1 << 3;
}

/// Errors from parsing a datagram.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PacketError {
    /// Datagram shorter than the fixed header.
    #[error("datagram too short: {0} bytes (header is {HEADER_LEN})")]
    TooShort(usize),
    /// First two bytes are not the packet magic.
    #[error("bad packet magic")]
    BadMagic,
    /// Version byte is not one this build understands.
    #[error("unsupported protocol version {0:#04x}")]
    UnsupportedVersion(u8),
    /// Context flag set but the context block is incomplete.
    #[error("truncated forwarding context")]
    TruncatedContext,
}

/// A parsed or to-be-sent mesh data packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshPacket {
    /// Flag bits, see [`flags`].
    pub flags: u8,
    /// Hash fold of the sending node.
    pub source_hash: u32,
    /// Hash fold of the destination node.
    pub dest_hash: u32,
    /// Transport sequence number, wraps at 16 bits.
    pub sequence: u16,
    /// Microseconds since a node-local epoch; diagnostic only, wraps.
    pub timestamp_us: u32,
    /// Device id within the destination node.
    pub device_id: u16,
    /// Forwarding context, present when [`flags::HAS_CONTEXT`] is set.
    pub context: Option<WireContext>,
    /// Raw MIDI bytes.
    pub payload: Vec<u8>,
}

impl MeshPacket {
    /// Build a data packet.
    ///
    /// A SysEx payload (first byte `0xF0`) automatically raises the SysEx
    /// and Reliable flags.
    pub fn data(
        source: &NodeId,
        dest: &NodeId,
        device_id: u16,
        payload: Vec<u8>,
        sequence: u16,
        timestamp_us: u32,
    ) -> Self {
        let mut packet_flags = 0;
        if payload.first() == Some(&0xF0) {
            packet_flags |= flags::SYSEX | flags::RELIABLE;
        }
        MeshPacket {
            flags: packet_flags,
            source_hash: node_hash(source),
            dest_hash: node_hash(dest),
            sequence,
            timestamp_us,
            device_id,
            context: None,
            payload,
        }
    }

    /// Whether the SysEx flag is set.
    pub fn is_sysex(&self) -> bool {
        self.flags & flags::SYSEX != 0
    }

    /// Whether the Reliable flag is set.
    pub fn is_reliable(&self) -> bool {
        self.flags & flags::RELIABLE != 0
    }

    /// Whether a forwarding-context block is carried.
    pub fn has_context(&self) -> bool {
        self.flags & flags::HAS_CONTEXT != 0
    }

    /// Attach a forwarding context, raising the flag.
    pub fn set_context(&mut self, context: WireContext) {
        self.flags |= flags::HAS_CONTEXT;
        self.context = Some(context);
    }

    /// Remove any forwarding context, clearing the flag.
    pub fn clear_context(&mut self) {
        self.flags &= !flags::HAS_CONTEXT;
        self.context = None;
    }

    /// Total encoded size in bytes.
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN
            + self.context.as_ref().map_or(0, WireContext::encoded_len)
            + self.payload.len()
    }

    /// Append the wire encoding to `buf`.
    pub fn serialize(&self, buf: &mut Vec<u8>) {
        encode_frame(
            buf,
            self.flags,
            self.source_hash,
            self.dest_hash,
            self.sequence,
            self.timestamp_us,
            self.device_id,
            self.context.as_ref(),
            &self.payload,
        );
    }

    /// The wire encoding as a fresh vector.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.serialize(&mut buf);
        buf
    }

    /// Parse a datagram.
    ///
    /// The payload length is whatever remains of the datagram after the
    /// header and the optional context block.
    pub fn parse(bytes: &[u8]) -> Result<Self, PacketError> {
        if bytes.len() < HEADER_LEN {
            return Err(PacketError::TooShort(bytes.len()));
        }
        if bytes[0..2] != PACKET_MAGIC {
            return Err(PacketError::BadMagic);
        }
        if bytes[2] != PROTOCOL_VERSION {
            return Err(PacketError::UnsupportedVersion(bytes[2]));
        }
        let packet_flags = bytes[3];
        let source_hash = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let dest_hash = u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
        let sequence = u16::from_be_bytes([bytes[12], bytes[13]]);
        let timestamp_us = u32::from_be_bytes([bytes[14], bytes[15], bytes[16], bytes[17]]);
        let device_id = u16::from_be_bytes([bytes[18], bytes[19]]);

        let mut offset = HEADER_LEN;
        let context = if packet_flags & flags::HAS_CONTEXT != 0 {
            let (context, consumed) = WireContext::decode(&bytes[offset..])
                .ok_or(PacketError::TruncatedContext)?;
            offset += consumed;
            Some(context)
        } else {
            None
        };

        Ok(MeshPacket {
            flags: packet_flags,
            source_hash,
            dest_hash,
            sequence,
            timestamp_us,
            device_id,
            context,
            payload: bytes[offset..].to_vec(),
        })
    }

    /// Non-panicking parse variant for use on receive paths.
    pub fn try_parse(bytes: &[u8]) -> Option<Self> {
        Self::parse(bytes).ok()
    }
}

/// Encode a frame directly from borrowed parts.
///
/// This is the same encoding as [`MeshPacket::serialize`] without requiring
/// an owned packet, so the real-time send path can reuse one scratch buffer.
#[allow(clippy::too_many_arguments)]
pub fn encode_frame(
    buf: &mut Vec<u8>,
    packet_flags: u8,
    source_hash: u32,
    dest_hash: u32,
    sequence: u16,
    timestamp_us: u32,
    device_id: u16,
    context: Option<&WireContext>,
    payload: &[u8],
) {
    let context_len = context.map_or(0, WireContext::encoded_len);
    buf.reserve(HEADER_LEN + context_len + payload.len());
    buf.extend_from_slice(&PACKET_MAGIC);
    buf.push(PROTOCOL_VERSION);
    buf.push(if context.is_some() {
        packet_flags | flags::HAS_CONTEXT
    } else {
        packet_flags
    });
    buf.extend_from_slice(&source_hash.to_be_bytes());
    buf.extend_from_slice(&dest_hash.to_be_bytes());
    buf.extend_from_slice(&sequence.to_be_bytes());
    buf.extend_from_slice(&timestamp_us.to_be_bytes());
    buf.extend_from_slice(&device_id.to_be_bytes());
    if let Some(context) = context {
        context.encode(buf);
    }
    buf.extend_from_slice(payload);
}

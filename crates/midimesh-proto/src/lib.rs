#![warn(missing_docs)]

//! Wire protocol and MIDI message primitives for the MidiMesh transport.

/// Per-message transport-path classification.
pub mod classify;
/// Forwarding context carried across nodes for loop prevention.
pub mod context;
/// Fragment and acknowledgement framing for the reliable path.
pub mod frame;
/// Node and device identifiers and the wire hash fold.
pub mod node;
/// The mesh data-packet codec.
pub mod packet;

pub use classify::{channel_of, classify, message_kind, MessageClass, MessageKind};
pub use context::{ContextError, ForwardingContext, WireContext, MAX_HOPS};
pub use frame::{fragment, FrameError, Reassembler, ReliableFrame, MAX_FRAGMENT_DATA};
pub use node::{node_hash, DeviceKey, NodeId};
pub use packet::{encode_frame, MeshPacket, PacketError, HEADER_LEN, PACKET_MAGIC, PROTOCOL_VERSION};

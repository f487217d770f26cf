//! The routing worker: a single-owner actor for all mutable routing state.
//!
//! One dedicated thread owns the local-port map, the per-device receive
//! queues and the routing counters. Every other thread interacts purely by
//! submitting commands to its queue; reads come back through reply slots.
//! There are no locks on any of the worker-owned structures.

mod worker;

use std::sync::Arc;

use crossbeam_channel::Sender;
use thiserror::Error;

use midimesh_proto::{ForwardingContext, MeshPacket, NodeId};

use crate::port::MeshPort;
use crate::registry::HashRegistry;
use crate::rules::RouteManager;

pub use worker::RoutingWorker;

/// Outbound network capability injected into the worker.
///
/// The mesh boundary implements this over the transports, resolving the
/// destination address from discovery metadata.
pub trait NetworkTransport: Send + Sync {
    /// Best-effort unicast to the packet's destination node.
    fn send_best_effort(&self, packet: &MeshPacket) -> Result<(), TransportSendError>;
    /// Acknowledged delivery for SysEx and other bulk packets.
    fn send_reliable(&self, packet: &MeshPacket) -> Result<(), TransportSendError>;
}

/// Errors surfaced by [`NetworkTransport`] implementations.
#[derive(Debug, Error)]
pub enum TransportSendError {
    /// No address known for the destination node.
    #[error("no route to node {0:#010x}")]
    NoRoute(u32),
    /// The underlying transport failed.
    #[error("transport failure: {0}")]
    Failed(String),
}

/// Counters owned by the routing worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterStats {
    /// Messages delivered to local ports.
    pub local_messages_sent: u64,
    /// Messages received from local sources.
    pub local_messages_received: u64,
    /// Packets handed to the network transport.
    pub network_messages_sent: u64,
    /// Packets and payloads received from the network.
    pub network_messages_received: u64,
    /// Failed dispatches (missing port, no transport, send failure).
    pub routing_errors: u64,
    /// Rule-matched messages delivered somewhere.
    pub messages_forwarded: u64,
    /// Rule-matched messages dropped by filters.
    pub messages_dropped: u64,
    /// Messages rejected by hop cap or visited-device check.
    pub loops_detected: u64,
}

/// Commands accepted by the routing worker, processed strictly FIFO.
pub enum RouterCommand {
    /// The hot path: route a message from a source device through the rules.
    Forward {
        /// Owning node of the source device.
        source: NodeId,
        /// Source device id.
        device_id: u16,
        /// Raw MIDI bytes.
        payload: Vec<u8>,
        /// Context carried over from a previous hop, if any.
        context: Option<ForwardingContext>,
    },
    /// Rule-bypass delivery straight to a destination device.
    DirectSend {
        /// Owning node of the destination.
        dest: NodeId,
        /// Destination device id.
        device_id: u16,
        /// Raw MIDI bytes.
        payload: Vec<u8>,
    },
    /// A validated packet for this node arrived from the network.
    NetworkPacket {
        /// The parsed packet.
        packet: MeshPacket,
    },
    /// Hand a port to the worker; ownership transfers.
    RegisterPort {
        /// Local device id the port serves.
        device_id: u16,
        /// The port itself.
        port: Box<dyn MeshPort>,
    },
    /// Remove and drop a port.
    UnregisterPort {
        /// Local device id.
        device_id: u16,
    },
    /// Append a payload to a device's received queue.
    QueueReceived {
        /// Local device id.
        device_id: u16,
        /// Raw MIDI bytes.
        payload: Vec<u8>,
    },
    /// Drain a device's received queue through a reply slot.
    DrainReceived {
        /// Local device id.
        device_id: u16,
        /// Receives the drained messages.
        reply: Sender<Vec<Vec<u8>>>,
    },
    /// Snapshot the counters through a reply slot.
    GetStatistics {
        /// Receives the snapshot.
        reply: Sender<RouterStats>,
    },
    /// Zero all counters.
    ResetStatistics,
    /// Configure the rule store.
    SetRouteManager(Arc<RouteManager>),
    /// Configure the network transport.
    SetTransport(Arc<dyn NetworkTransport>),
    /// Configure the hash registry used for context decoding.
    SetHashRegistry(Arc<HashRegistry>),
    /// Set this node's identifier.
    SetNodeId(NodeId),
    /// Stop the worker loop.
    Shutdown,
}

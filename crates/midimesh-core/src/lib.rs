//! The MidiMesh routing core.
//!
//! Peer nodes advertise their locally-attached MIDI devices, form a mesh,
//! and forward messages between any source and destination device according
//! to user-defined rules. This crate holds the registries, the rule store,
//! the port abstraction and the routing worker; the wire codec lives in
//! `midimesh-proto` and the transports in `midimesh-net`.
//!
//! Nothing here is a process-wide singleton: every component is constructed
//! by its owner and injected by reference.

/// Midir-backed hardware seam.
pub mod backend_midir;
/// Mesh boundary adapters: registry write-through and transport wiring.
pub mod boundary;
/// Runtime configuration persistence.
pub mod config;
/// Startup attachment of hardware ports.
pub mod hardware;
/// Port capability and its local/virtual realizations.
pub mod port;
/// Device, routing-table and hash registries.
pub mod registry;
/// The routing worker actor.
pub mod router;
/// Forwarding-rule store with persistence.
pub mod rules;

pub use boundary::{MeshBoundary, RemoteDevice};
pub use config::MeshConfig;
pub use hardware::{attach_hardware, detach_hardware, HardwareAttachment};
pub use port::{LocalPort, MeshPort, PortError, PortStats, ReceiveBuffer, VirtualPort};
pub use registry::{
    DeviceDirection, DeviceRecord, DeviceRegistry, HashRegistry, RouteEntry, RoutingTable,
};
pub use router::{NetworkTransport, RouterStats, RoutingWorker, TransportSendError};
pub use rules::{ForwardingRule, RouteManager, RuleError, RuleStatistics, RuleStoreStatistics};

//! Thread-safe registries backing routing decisions.
//!
//! The device registry carries display metadata, the routing table answers
//! "local or which peer" for dispatch, and the hash registry maps wire
//! hashes back to full node identifiers. They are maintained in lock-step
//! by the mesh boundary but kept separate; each serializes on its own
//! internal lock and never takes another component's.

mod devices;
mod hash;
mod routes;

pub use devices::{DeviceDirection, DeviceRecord, DeviceRegistry};
pub use hash::HashRegistry;
pub use routes::{RouteEntry, RoutingTable};

//! Transports for the MidiMesh core.
//!
//! Two classes of traffic share one UDP socket: latency-first real-time
//! frames drained from the lock-free ring, and reliable frames (fragments
//! and acknowledgements) managed by the ACK/retry layer. The reorder buffer
//! restores per-stream sequence order on the receiving side.

pub mod reliable;
pub mod reorder;
pub mod udp;

use std::net::SocketAddr;

pub use reliable::{ReliableConfig, ReliableStats, ReliableTransport};
pub use reorder::{ReorderBuffer, ReorderConfig, ReorderEvent, ReorderStats, ReorderTimer};
pub use udp::{RealtimeUdpTransport, RtDestination, UdpConfig, UdpStats};

/// Non-blocking datagram send capability.
///
/// Implemented by the UDP transport; tests substitute in-memory loopbacks.
pub trait DatagramSender: Send + Sync {
    /// Send one datagram, best-effort.
    fn send_datagram(&self, bytes: &[u8], addr: SocketAddr) -> std::io::Result<()>;
}

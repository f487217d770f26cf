//! The port capability: a uniform face over local MIDI hardware and
//! remote-device proxies.
//!
//! Every port can send bytes and buffer received bytes for a consumer to
//! drain; the routing worker neither knows nor cares which realization it
//! holds. Receive buffers are bounded at 1000 messages with drop-oldest
//! overflow, matching the rest of the system's queue policy.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

use crate::registry::DeviceDirection;

/// Bound on buffered received messages per port.
pub const RECEIVE_BUFFER_CAP: usize = 1000;

/// Errors from port sends.
#[derive(Debug, Error)]
pub enum PortError {
    /// The hardware endpoint rejected the bytes.
    #[error("hardware send failed: {0}")]
    Hardware(String),
    /// The network proxy could not hand off the bytes.
    #[error("network send failed: {0}")]
    Network(String),
    /// The port has no send capability (pure input).
    #[error("port is not an output")]
    NotAnOutput,
}

/// Sent/received counters for one port.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortStats {
    /// Messages pushed out through this port.
    pub sent: u64,
    /// Messages buffered from this port's receive path.
    pub received: u64,
    /// Messages evicted from a full receive buffer.
    pub overflowed: u64,
}

/// Capability set of a routable MIDI endpoint.
pub trait MeshPort: Send {
    /// Port name for diagnostics.
    fn name(&self) -> &str;
    /// Whether the endpoint produces MIDI data.
    fn is_input(&self) -> bool;
    /// Whether the endpoint consumes MIDI data.
    fn is_output(&self) -> bool;
    /// Deliver bytes to the endpoint.
    fn send(&mut self, bytes: &[u8]) -> Result<(), PortError>;
    /// Take every message received since the last drain.
    fn drain_received(&mut self) -> Vec<Vec<u8>>;
    /// Counter snapshot.
    fn stats(&self) -> PortStats;
}

/// Hardware output sink behind the backend seam.
pub trait OutputSink: Send {
    /// Push raw bytes to the hardware.
    fn send(&mut self, bytes: &[u8]) -> anyhow::Result<()>;
}

/// Bounded receive buffer shared between a port and the callback feeding it.
///
/// The feeding side is a hardware callback or the network receive path; the
/// draining side is whoever consumes the port.
#[derive(Clone, Default)]
pub struct ReceiveBuffer {
    inner: Arc<Mutex<ReceiveInner>>,
}

#[derive(Default)]
struct ReceiveInner {
    queue: VecDeque<Vec<u8>>,
    received: u64,
    overflowed: u64,
}

impl ReceiveBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message, evicting the oldest when full.
    pub fn push(&self, bytes: Vec<u8>) {
        let mut inner = self.inner.lock();
        if inner.queue.len() >= RECEIVE_BUFFER_CAP {
            inner.queue.pop_front();
            inner.overflowed += 1;
        }
        inner.queue.push_back(bytes);
        inner.received += 1;
    }

    /// Take everything buffered, oldest first.
    pub fn drain(&self) -> Vec<Vec<u8>> {
        self.inner.lock().queue.drain(..).collect()
    }

    /// Buffered message count.
    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Whether nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().queue.is_empty()
    }

    fn counters(&self) -> (u64, u64) {
        let inner = self.inner.lock();
        (inner.received, inner.overflowed)
    }
}

/// A locally attached MIDI endpoint.
pub struct LocalPort {
    name: String,
    direction: DeviceDirection,
    sink: Option<Box<dyn OutputSink>>,
    receive: ReceiveBuffer,
    sent: u64,
}

impl LocalPort {
    /// An input port; arriving messages land in `receive`.
    pub fn input(name: impl Into<String>, receive: ReceiveBuffer) -> Self {
        LocalPort {
            name: name.into(),
            direction: DeviceDirection::Input,
            sink: None,
            receive,
            sent: 0,
        }
    }

    /// An output port delivering to a hardware sink.
    pub fn output(name: impl Into<String>, sink: Box<dyn OutputSink>) -> Self {
        LocalPort {
            name: name.into(),
            direction: DeviceDirection::Output,
            sink: Some(sink),
            receive: ReceiveBuffer::new(),
            sent: 0,
        }
    }

    /// Handle for the path feeding this port's receive buffer.
    pub fn receive_buffer(&self) -> ReceiveBuffer {
        self.receive.clone()
    }
}

impl MeshPort for LocalPort {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_input(&self) -> bool {
        self.direction == DeviceDirection::Input
    }

    fn is_output(&self) -> bool {
        self.direction == DeviceDirection::Output
    }

    fn send(&mut self, bytes: &[u8]) -> Result<(), PortError> {
        let Some(sink) = self.sink.as_mut() else {
            return Err(PortError::NotAnOutput);
        };
        sink.send(bytes)
            .map_err(|err| PortError::Hardware(err.to_string()))?;
        self.sent += 1;
        Ok(())
    }

    fn drain_received(&mut self) -> Vec<Vec<u8>> {
        self.receive.drain()
    }

    fn stats(&self) -> PortStats {
        let (received, overflowed) = self.receive.counters();
        PortStats {
            sent: self.sent,
            received,
            overflowed,
        }
    }
}

/// Network hand-off used by virtual ports; wired to the reliable transport
/// by the mesh boundary.
pub type RemoteSender = Arc<dyn Fn(&[u8]) -> Result<(), PortError> + Send + Sync>;

/// Proxy for a device attached to a remote node.
///
/// Sends travel the reliable path to the owning node; the network receive
/// path appends into the local buffer so consumers see the same interface
/// as for hardware.
pub struct VirtualPort {
    name: String,
    direction: DeviceDirection,
    sender: RemoteSender,
    receive: ReceiveBuffer,
    sent: u64,
}

impl VirtualPort {
    /// Build a proxy port for a remote device.
    pub fn new(
        name: impl Into<String>,
        direction: DeviceDirection,
        sender: RemoteSender,
    ) -> Self {
        VirtualPort {
            name: name.into(),
            direction,
            sender,
            receive: ReceiveBuffer::new(),
            sent: 0,
        }
    }

    /// Handle for the network receive path of this device.
    pub fn receive_buffer(&self) -> ReceiveBuffer {
        self.receive.clone()
    }
}

impl MeshPort for VirtualPort {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_input(&self) -> bool {
        self.direction == DeviceDirection::Input
    }

    fn is_output(&self) -> bool {
        self.direction == DeviceDirection::Output
    }

    fn send(&mut self, bytes: &[u8]) -> Result<(), PortError> {
        (self.sender)(bytes)?;
        self.sent += 1;
        Ok(())
    }

    fn drain_received(&mut self) -> Vec<Vec<u8>> {
        self.receive.drain()
    }

    fn stats(&self) -> PortStats {
        let (received, overflowed) = self.receive.counters();
        PortStats {
            sent: self.sent,
            received,
            overflowed,
        }
    }
}

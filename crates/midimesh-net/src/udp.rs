//! The real-time UDP transport worker.
//!
//! A dedicated thread at elevated priority drains the lock-free ring,
//! serializes each entry as a mesh frame and sends it best-effort, then
//! polls the socket for inbound datagrams. Inbound reliable frames are
//! dispatched to the ACK/retry layer; everything else is parsed as a mesh
//! packet and surfaced through the receive callback. The loop never touches
//! an application lock; when idle it sleeps for about a millisecond.

use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::Context;
use arc_swap::ArcSwap;
use parking_lot::Mutex;

use midimesh_proto::frame::ReliableFrame;
use midimesh_proto::{encode_frame, node_hash, MeshPacket, NodeId};
use midimesh_rt::RtRingBuffer;

use crate::DatagramSender;

/// Receive callback for parsed mesh packets.
pub type PacketCallback = Arc<dyn Fn(MeshPacket, SocketAddr) + Send + Sync>;
/// Receive callback for raw reliable frames sharing the socket.
pub type FrameCallback = Arc<dyn Fn(&[u8], SocketAddr) + Send + Sync>;
/// Out-of-band error reporting.
pub type ErrorCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Transport tuning knobs.
#[derive(Debug, Clone)]
pub struct UdpConfig {
    /// UDP port to bind; 0 lets the OS pick.
    pub bind_port: u16,
    /// Ring entries drained per loop iteration.
    pub drain_batch: usize,
    /// Sleep applied when neither path had work.
    pub idle_sleep: Duration,
    /// SCHED_FIFO priority requested for the worker.
    pub realtime_priority: i32,
}

impl Default for UdpConfig {
    fn default() -> Self {
        UdpConfig {
            bind_port: 0,
            drain_batch: 32,
            idle_sleep: Duration::from_millis(1),
            realtime_priority: 70,
        }
    }
}

/// Where real-time frames from one local source device are unicast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtDestination {
    /// Hash fold of the destination node.
    pub dest_hash: u32,
    /// Socket address of that node's transport.
    pub addr: SocketAddr,
}

/// Counter snapshot published by the transport.
#[derive(Debug, Clone, Copy, Default)]
pub struct UdpStats {
    /// Frames sent.
    pub frames_sent: u64,
    /// Mesh packets received and parsed.
    pub frames_received: u64,
    /// Failed datagram sends.
    pub send_errors: u64,
    /// Failed socket reads.
    pub receive_errors: u64,
    /// Datagrams that failed packet parsing.
    pub invalid_packets: u64,
    /// Ring entries with no real-time destination bound.
    pub unroutable: u64,
}

#[derive(Default)]
struct UdpStatsInner {
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    send_errors: AtomicU64,
    receive_errors: AtomicU64,
    invalid_packets: AtomicU64,
    unroutable: AtomicU64,
}

impl UdpStatsInner {
    fn snapshot(&self) -> UdpStats {
        UdpStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            receive_errors: self.receive_errors.load(Ordering::Relaxed),
            invalid_packets: self.invalid_packets.load(Ordering::Relaxed),
            unroutable: self.unroutable.load(Ordering::Relaxed),
        }
    }
}

type RouteMap = HashMap<u16, Vec<RtDestination>>;

/// Best-effort UDP transport with a dedicated real-time worker.
pub struct RealtimeUdpTransport {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    config: UdpConfig,
    source_hash: u32,
    ring: Arc<RtRingBuffer>,
    routes_master: Mutex<RouteMap>,
    routes: Arc<ArcSwap<RouteMap>>,
    stats: Arc<UdpStatsInner>,
    running: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    on_packet: Mutex<Option<PacketCallback>>,
    on_frame: Mutex<Option<FrameCallback>>,
    on_error: Mutex<Option<ErrorCallback>>,
}

impl RealtimeUdpTransport {
    /// Bind the socket and prepare the transport. The worker is not started
    /// until [`start`](Self::start) so callbacks can be wired first.
    pub fn bind(
        config: UdpConfig,
        local_node: &NodeId,
        ring: Arc<RtRingBuffer>,
    ) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", config.bind_port))
            .with_context(|| format!("failed to bind UDP port {}", config.bind_port))?;
        socket
            .set_nonblocking(true)
            .context("failed to switch UDP socket to non-blocking")?;
        let local_addr = socket.local_addr().context("no local address")?;
        Ok(RealtimeUdpTransport {
            socket: Arc::new(socket),
            local_addr,
            source_hash: node_hash(local_node),
            config,
            ring,
            routes_master: Mutex::new(HashMap::new()),
            routes: Arc::new(ArcSwap::from_pointee(HashMap::new())),
            stats: Arc::new(UdpStatsInner::default()),
            running: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
            on_packet: Mutex::new(None),
            on_frame: Mutex::new(None),
            on_error: Mutex::new(None),
        })
    }

    /// Address the socket actually bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Register the parsed-packet receive callback. Final wiring step; call
    /// before [`start`](Self::start).
    pub fn set_packet_callback(&self, callback: PacketCallback) {
        *self.on_packet.lock() = Some(callback);
    }

    /// Register the reliable-frame callback.
    pub fn set_frame_callback(&self, callback: FrameCallback) {
        *self.on_frame.lock() = Some(callback);
    }

    /// Register the out-of-band error callback.
    pub fn set_error_callback(&self, callback: ErrorCallback) {
        *self.on_error.lock() = Some(callback);
    }

    /// Bind the real-time stream of a local source device to destinations.
    pub fn set_rt_routes(&self, device_id: u16, destinations: Vec<RtDestination>) {
        let mut master = self.routes_master.lock();
        if destinations.is_empty() {
            master.remove(&device_id);
        } else {
            master.insert(device_id, destinations);
        }
        self.routes.store(Arc::new(master.clone()));
    }

    /// Drop every real-time binding (peer teardown).
    pub fn clear_rt_routes(&self) {
        let mut master = self.routes_master.lock();
        master.clear();
        self.routes.store(Arc::new(master.clone()));
    }

    /// Counter snapshot.
    pub fn stats(&self) -> UdpStats {
        self.stats.snapshot()
    }

    /// Whether the worker is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Start the real-time worker thread.
    pub fn start(&self) -> anyhow::Result<()> {
        let mut worker_slot = self.worker.lock();
        if worker_slot.is_some() {
            return Ok(());
        }
        self.running.store(true, Ordering::Release);

        let socket = Arc::clone(&self.socket);
        let ring = Arc::clone(&self.ring);
        let routes = Arc::clone(&self.routes);
        let stats = Arc::clone(&self.stats);
        let running = Arc::clone(&self.running);
        let config = self.config.clone();
        let source_hash = self.source_hash;
        let on_packet = self.on_packet.lock().clone();
        let on_frame = self.on_frame.lock().clone();
        let on_error = self.on_error.lock().clone();

        let worker = std::thread::Builder::new()
            .name("midimesh-udp".into())
            .spawn(move || {
                if let Err(err) = midimesh_rt::promote_to_realtime(config.realtime_priority) {
                    tracing::warn!(?err, "running UDP worker at normal priority");
                }
                if let Err(err) = midimesh_rt::lock_memory() {
                    tracing::warn!(?err, "running UDP worker without locked memory");
                }
                run_loop(
                    &socket,
                    &ring,
                    &routes,
                    &stats,
                    &running,
                    &config,
                    source_hash,
                    on_packet.as_ref(),
                    on_frame.as_ref(),
                    on_error.as_ref(),
                );
            })
            .context("failed to spawn UDP worker thread")?;
        *worker_slot = Some(worker);
        Ok(())
    }

    /// Stop the worker and join it. The loop re-checks its flag at least
    /// once per idle sleep, so the join is prompt.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                tracing::error!("UDP worker thread panicked");
            }
        }
    }

    /// Send an addressed mesh packet straight out of the socket,
    /// best-effort. Used by the routing worker's network dispatch.
    pub fn send_packet(&self, packet: &MeshPacket, addr: SocketAddr) -> io::Result<()> {
        let bytes = packet.to_bytes();
        match self.socket.send_to(&bytes, addr) {
            Ok(_) => {
                self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(err) => {
                self.stats.send_errors.fetch_add(1, Ordering::Relaxed);
                Err(err)
            }
        }
    }
}

impl DatagramSender for RealtimeUdpTransport {
    fn send_datagram(&self, bytes: &[u8], addr: SocketAddr) -> io::Result<()> {
        match self.socket.send_to(bytes, addr) {
            Ok(_) => Ok(()),
            Err(err) => {
                self.stats.send_errors.fetch_add(1, Ordering::Relaxed);
                Err(err)
            }
        }
    }
}

impl Drop for RealtimeUdpTransport {
    fn drop(&mut self) {
        self.stop();
    }
}

#[allow(clippy::too_many_arguments)]
fn run_loop(
    socket: &UdpSocket,
    ring: &RtRingBuffer,
    routes: &ArcSwap<RouteMap>,
    stats: &UdpStatsInner,
    running: &AtomicBool,
    config: &UdpConfig,
    source_hash: u32,
    on_packet: Option<&PacketCallback>,
    on_frame: Option<&FrameCallback>,
    on_error: Option<&ErrorCallback>,
) {
    let mut scratch: Vec<u8> = Vec::with_capacity(64);
    let mut recv_buf = [0u8; 2048];
    let mut sequence: u16 = 0;

    while running.load(Ordering::Acquire) {
        let mut worked = false;

        let bound = routes.load();
        for _ in 0..config.drain_batch {
            let Some(entry) = ring.pop() else { break };
            worked = true;
            let Some(destinations) = bound.get(&entry.device_id) else {
                stats.unroutable.fetch_add(1, Ordering::Relaxed);
                continue;
            };
            for destination in destinations {
                scratch.clear();
                encode_frame(
                    &mut scratch,
                    0,
                    source_hash,
                    destination.dest_hash,
                    sequence,
                    entry.timestamp_us,
                    entry.device_id,
                    None,
                    entry.bytes(),
                );
                sequence = sequence.wrapping_add(1);
                match socket.send_to(&scratch, destination.addr) {
                    Ok(_) => {
                        stats.frames_sent.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(err) => {
                        stats.send_errors.fetch_add(1, Ordering::Relaxed);
                        if err.kind() != io::ErrorKind::WouldBlock {
                            if let Some(cb) = on_error {
                                cb(&format!("realtime send failed: {err}"));
                            }
                        }
                    }
                }
            }
        }

        loop {
            match socket.recv_from(&mut recv_buf) {
                Ok((len, from)) => {
                    worked = true;
                    let bytes = &recv_buf[..len];
                    if ReliableFrame::is_reliable_frame(bytes) {
                        if let Some(cb) = on_frame {
                            cb(bytes, from);
                        }
                    } else {
                        match MeshPacket::parse(bytes) {
                            Ok(packet) => {
                                stats.frames_received.fetch_add(1, Ordering::Relaxed);
                                if let Some(cb) = on_packet {
                                    cb(packet, from);
                                }
                            }
                            Err(err) => {
                                stats.invalid_packets.fetch_add(1, Ordering::Relaxed);
                                tracing::trace!(%err, %from, "dropping invalid datagram");
                            }
                        }
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    stats.receive_errors.fetch_add(1, Ordering::Relaxed);
                    if let Some(cb) = on_error {
                        cb(&format!("receive failed: {err}"));
                    }
                    break;
                }
            }
        }

        if !worked {
            std::thread::sleep(config.idle_sleep);
        }
    }
}

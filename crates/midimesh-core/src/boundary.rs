//! Mesh boundary adapters.
//!
//! Everything the external collaborators (discovery, handshake, management
//! surface, hardware callbacks) touch goes through here: registry
//! write-through for announcements and disconnects, and the transport
//! wiring. The router and the transports reference each other only through
//! callbacks registered as the final wiring step, so neither owns the
//! other; both are owned by the boundary.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use midimesh_net::{
    DatagramSender, RealtimeUdpTransport, ReliableStats, ReliableTransport, ReorderBuffer,
    ReorderEvent, ReorderTimer, RtDestination, UdpStats,
};
use midimesh_proto::{classify, node_hash, MeshPacket, MessageClass, NodeId};
use midimesh_rt::{RingStats, RtEntry, RtRingBuffer};

use crate::config::MeshConfig;
use crate::port::{MeshPort, PortError, RemoteSender, VirtualPort};
use crate::registry::{DeviceDirection, DeviceRegistry, HashRegistry, RoutingTable};
use crate::router::{NetworkTransport, RouterStats, RoutingWorker, TransportSendError};
use crate::rules::RouteManager;

/// A device carried in a peer's announcement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteDevice {
    /// Device id within the owning node.
    pub device_id: u16,
    /// Human-readable name.
    pub name: String,
    /// Input or output.
    pub direction: DeviceDirection,
    /// Manufacturer, when known.
    pub manufacturer: Option<String>,
}

/// Combined counter snapshot across the whole node.
#[derive(Debug, Clone, Copy, Default)]
pub struct MeshStatistics {
    /// Routing-worker counters.
    pub router: RouterStats,
    /// UDP transport counters.
    pub udp: UdpStats,
    /// Reliable-transport counters.
    pub reliable: ReliableStats,
    /// Real-time ring counters.
    pub ring: RingStats,
}

type ReorderLanes = Mutex<HashMap<u32, Arc<ReorderBuffer<MeshPacket>>>>;

/// One mesh node's assembled core: registries, rule store, transports and
/// the routing worker, wired together.
pub struct MeshBoundary {
    node: NodeId,
    config: MeshConfig,
    devices: Arc<DeviceRegistry>,
    routes: Arc<RoutingTable>,
    hashes: Arc<HashRegistry>,
    rules: Arc<RouteManager>,
    router: Arc<RoutingWorker>,
    ring: Arc<RtRingBuffer>,
    udp: Arc<RealtimeUdpTransport>,
    reliable: Arc<ReliableTransport>,
    peers: Arc<Mutex<HashMap<u32, SocketAddr>>>,
    reorder_timer: Mutex<Option<ReorderTimer>>,
}

impl MeshBoundary {
    /// Build and start a node: bind the socket, spawn the workers, and wire
    /// the receive callbacks as the final step.
    pub fn start(config: MeshConfig) -> anyhow::Result<Self> {
        let node = NodeId::generate();
        Self::start_with_node(node, config)
    }

    /// As [`start`](Self::start) with a caller-chosen node id (tests, or a
    /// process restoring a persisted identity).
    pub fn start_with_node(node: NodeId, config: MeshConfig) -> anyhow::Result<Self> {
        let devices = Arc::new(DeviceRegistry::new());
        let routes = Arc::new(RoutingTable::new());
        let hashes = Arc::new(HashRegistry::new());
        let rules = Arc::new(RouteManager::new(Arc::clone(&devices)));

        let ring = Arc::new(RtRingBuffer::new(config.ring_capacity));
        let udp = Arc::new(RealtimeUdpTransport::bind(
            config.udp_config(),
            &node,
            Arc::clone(&ring),
        )?);
        let reliable = Arc::new(ReliableTransport::new(
            Arc::clone(&udp) as Arc<dyn DatagramSender>,
            config.reliable_config(),
        ));

        let router = Arc::new(RoutingWorker::spawn(node));
        router.set_route_manager(Arc::clone(&rules));
        router.set_hash_registry(Arc::clone(&hashes));

        let peers: Arc<Mutex<HashMap<u32, SocketAddr>>> = Arc::default();
        router.set_transport(Arc::new(MeshTransport {
            udp: Arc::clone(&udp),
            reliable: Arc::clone(&reliable),
            peers: Arc::clone(&peers),
        }));

        let boundary = MeshBoundary {
            node,
            config,
            devices,
            routes,
            hashes,
            rules,
            router,
            ring,
            udp,
            reliable,
            peers,
            reorder_timer: Mutex::new(None),
        };
        boundary.wire_receive_paths();

        if let Some(path) = boundary.config.rules_path.clone() {
            if path.exists() {
                match boundary.rules.load_from_file(&path) {
                    Ok(count) => tracing::info!(count, "restored forwarding rules"),
                    Err(err) => tracing::warn!(%err, "could not restore forwarding rules"),
                }
            }
        }

        boundary.udp.start()?;
        boundary.reliable.start();
        Ok(boundary)
    }

    /// Final wiring step: receive callbacks into the router, breaking the
    /// router/transport reference cycle.
    fn wire_receive_paths(&self) {
        // Real-time datagrams go straight to the worker.
        let router = Arc::clone(&self.router);
        self.udp
            .set_packet_callback(Arc::new(move |packet, _from| {
                router.on_network_packet(packet);
            }));

        // Reliable frames feed the ACK/retry layer.
        let reliable = Arc::clone(&self.reliable);
        self.udp.set_frame_callback(Arc::new(move |bytes, from| {
            reliable.handle_frame(bytes, from);
        }));

        // Reassembled reliable messages are whole mesh packets; order them
        // per source node before they reach the worker.
        let router = Arc::clone(&self.router);
        if self.config.ordered_delivery {
            let lanes: Arc<ReorderLanes> = Arc::default();
            let reorder_config = self.config.reorder_config();

            let push_lanes = Arc::clone(&lanes);
            let push_router = Arc::clone(&router);
            self.reliable
                .set_message_callback(Arc::new(move |bytes, from| {
                    let Some(packet) = MeshPacket::try_parse(&bytes) else {
                        tracing::warn!(%from, "reassembled message is not a mesh packet");
                        return;
                    };
                    let lane = {
                        let mut lanes = push_lanes.lock();
                        Arc::clone(lanes.entry(packet.source_hash).or_insert_with(|| {
                            Arc::new(ReorderBuffer::new(
                                reorder_config.clone(),
                                packet.sequence,
                            ))
                        }))
                    };
                    let sequence = packet.sequence;
                    route_events(&push_router, lane.push(sequence, packet));
                }));

            let timer_router = Arc::clone(&self.router);
            let timer_lanes = Arc::clone(&lanes);
            let timer = ReorderTimer::spawn(Duration::from_millis(100), move || {
                let lanes: Vec<Arc<ReorderBuffer<MeshPacket>>> =
                    timer_lanes.lock().values().cloned().collect();
                for lane in lanes {
                    route_events(&timer_router, lane.poll_timeouts());
                }
            });
            *self.reorder_timer.lock() = Some(timer);
        } else {
            self.reliable
                .set_message_callback(Arc::new(move |bytes, from| {
                    match MeshPacket::try_parse(&bytes) {
                        Some(packet) => {
                            router.on_network_packet(packet);
                        }
                        None => {
                            tracing::warn!(%from, "reassembled message is not a mesh packet");
                        }
                    }
                }));
        }
    }

    /// This node's identifier.
    pub fn node_id(&self) -> NodeId {
        self.node
    }

    /// The UDP address peers should send to.
    pub fn local_addr(&self) -> SocketAddr {
        self.udp.local_addr()
    }

    /// The rule store (management CRUD surface).
    pub fn rules(&self) -> &Arc<RouteManager> {
        &self.rules
    }

    /// The routing worker handle.
    pub fn router(&self) -> &Arc<RoutingWorker> {
        &self.router
    }

    /// The device registry.
    pub fn devices(&self) -> &Arc<DeviceRegistry> {
        &self.devices
    }

    /// The routing table.
    pub fn routing_table(&self) -> &Arc<RoutingTable> {
        &self.routes
    }

    /// The hash registry.
    pub fn hash_registry(&self) -> &Arc<HashRegistry> {
        &self.hashes
    }

    /// The ring the hardware input callbacks feed.
    pub fn ring(&self) -> &Arc<RtRingBuffer> {
        &self.ring
    }

    /// Announce a locally attached device into both stores.
    pub fn announce_local_device(
        &self,
        device_id: u16,
        name: impl Into<String>,
        direction: DeviceDirection,
        manufacturer: Option<String>,
    ) {
        let name = name.into();
        self.devices
            .add_local(device_id, name.clone(), direction, manufacturer);
        self.routes.add_local(device_id, name, direction);
    }

    /// Remove a local device from both stores and drop its port.
    pub fn withdraw_local_device(&self, device_id: u16) {
        let key = midimesh_proto::DeviceKey::local(device_id);
        self.devices.remove(&key);
        self.routes.remove(&key);
        self.router.unregister_port(device_id);
        self.udp.set_rt_routes(device_id, Vec::new());
    }

    /// Hand a port for a local device to the routing worker.
    pub fn register_local_port(&self, device_id: u16, port: Box<dyn MeshPort>) {
        self.router.register_port(device_id, port);
    }

    /// Handshake completion: register the peer and its devices.
    ///
    /// The device list replaces anything previously announced by this peer,
    /// so a reconnect never leaves stale routes behind.
    pub fn connect_peer(&self, peer: NodeId, addr: SocketAddr, announced: Vec<RemoteDevice>) {
        let hash = self.hashes.register(peer);
        self.peers.lock().insert(hash, addr);

        self.devices.remove_all_for_owner(&peer);
        let mut entries = Vec::with_capacity(announced.len());
        for device in announced {
            self.devices.add_remote(
                peer,
                device.device_id,
                device.name.clone(),
                device.direction,
                device.manufacturer,
            );
            entries.push(crate::registry::RouteEntry {
                key: midimesh_proto::DeviceKey::remote(peer, device.device_id),
                name: device.name,
                direction: device.direction,
            });
        }
        self.routes.replace_for_owner(&peer, entries);
    }

    /// Peer teardown: purge devices, routes, address and hash mapping.
    pub fn disconnect_peer(&self, peer: NodeId) {
        let hash = node_hash(&peer);
        self.peers.lock().remove(&hash);
        self.devices.remove_all_for_owner(&peer);
        self.routes.remove_all_for_owner(&peer);
        self.hashes.unregister(&peer);
    }

    /// Bind a local input device's real-time stream to a connected peer.
    pub fn bind_realtime_stream(&self, device_id: u16, peer: NodeId) -> anyhow::Result<()> {
        let hash = node_hash(&peer);
        let Some(addr) = self.peers.lock().get(&hash).copied() else {
            anyhow::bail!("peer {peer} is not connected");
        };
        self.udp.set_rt_routes(
            device_id,
            vec![RtDestination {
                dest_hash: hash,
                addr,
            }],
        );
        Ok(())
    }

    /// Remove a device's real-time stream binding.
    pub fn unbind_realtime_stream(&self, device_id: u16) {
        self.udp.set_rt_routes(device_id, Vec::new());
    }

    /// Callback for a hardware input device, suitable for the midir seam.
    ///
    /// Real-time-class messages go into the lock-free ring and nowhere
    /// else; bulk messages are handed to the routing worker, which may
    /// allocate.
    pub fn input_callback_for(&self, device_id: u16) -> impl FnMut(&[u8]) + Send + 'static {
        let ring = Arc::clone(&self.ring);
        let router = Arc::clone(&self.router);
        move |bytes: &[u8]| match classify(bytes) {
            MessageClass::RealTime => {
                if let Some(entry) = RtEntry::new(device_id, bytes, 0) {
                    ring.push(entry);
                }
            }
            MessageClass::NonRealTime => {
                router.forward(NodeId::LOCAL, device_id, bytes.to_vec(), None);
            }
        }
    }

    /// Ad-hoc send to any device, bypassing the rules.
    pub fn send_to_device(&self, dest: midimesh_proto::DeviceKey, bytes: Vec<u8>) {
        self.router.direct_send(dest.owner, dest.device_id, bytes);
    }

    /// Drain messages queued for a local device.
    pub fn receive_from_device(&self, device_id: u16) -> Vec<Vec<u8>> {
        self.router.drain_received(device_id)
    }

    /// Build a proxy port for a registered remote device.
    ///
    /// Sends route through the worker so all outbound packets share one
    /// sequence owner.
    pub fn virtual_port_for(&self, key: midimesh_proto::DeviceKey) -> Option<VirtualPort> {
        let record = self.devices.get(&key)?;
        let router = Arc::clone(&self.router);
        let sender: RemoteSender = Arc::new(move |bytes: &[u8]| {
            if router.direct_send(key.owner, key.device_id, bytes.to_vec()) {
                Ok(())
            } else {
                Err(PortError::Network("routing worker is gone".into()))
            }
        });
        Some(VirtualPort::new(record.name, record.direction, sender))
    }

    /// Persist the current rules to the configured path.
    pub fn save_rules(&self) -> bool {
        let Some(path) = self.config.rules_path.clone() else {
            return false;
        };
        match self.rules.save_to_file(&path) {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(%err, "failed to save forwarding rules");
                false
            }
        }
    }

    /// Counter snapshot across router, transports and ring.
    pub fn statistics(&self) -> MeshStatistics {
        MeshStatistics {
            router: self.router.statistics(),
            udp: self.udp.stats(),
            reliable: self.reliable.stats(),
            ring: self.ring.stats(),
        }
    }

    /// Orderly shutdown: timer, transports, then the worker.
    pub fn shutdown(&self) {
        if let Some(mut timer) = self.reorder_timer.lock().take() {
            timer.stop();
        }
        self.udp.stop();
        self.reliable.stop();
        self.router.shutdown();
    }
}

impl Drop for MeshBoundary {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn route_events(router: &Arc<RoutingWorker>, events: Vec<ReorderEvent<MeshPacket>>) {
    for event in events {
        match event {
            ReorderEvent::Delivered(_, packet) => {
                router.on_network_packet(packet);
            }
            ReorderEvent::Gap(sequence) => {
                tracing::debug!(sequence, "reliable stream gap skipped");
            }
            ReorderEvent::Duplicate(sequence) => {
                tracing::trace!(sequence, "duplicate reliable packet");
            }
        }
    }
}

/// Outbound transport as the routing worker sees it: resolves the
/// destination address from the peer book filled in by the handshake.
struct MeshTransport {
    udp: Arc<RealtimeUdpTransport>,
    reliable: Arc<ReliableTransport>,
    peers: Arc<Mutex<HashMap<u32, SocketAddr>>>,
}

impl MeshTransport {
    fn addr_for(&self, dest_hash: u32) -> Result<SocketAddr, TransportSendError> {
        self.peers
            .lock()
            .get(&dest_hash)
            .copied()
            .ok_or(TransportSendError::NoRoute(dest_hash))
    }
}

impl NetworkTransport for MeshTransport {
    fn send_best_effort(&self, packet: &MeshPacket) -> Result<(), TransportSendError> {
        let addr = self.addr_for(packet.dest_hash)?;
        self.udp
            .send_packet(packet, addr)
            .map_err(|err| TransportSendError::Failed(err.to_string()))
    }

    fn send_reliable(&self, packet: &MeshPacket) -> Result<(), TransportSendError> {
        let addr = self.addr_for(packet.dest_hash)?;
        let dest_hash = packet.dest_hash;
        self.reliable.send_reliable(
            &packet.to_bytes(),
            addr,
            Box::new(|| {}),
            Box::new(move |reason| {
                tracing::warn!(
                    dest = format_args!("{dest_hash:#010x}"),
                    reason,
                    "reliable delivery failed"
                );
            }),
        );
        Ok(())
    }
}

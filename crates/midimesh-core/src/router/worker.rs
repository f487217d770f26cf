use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use midimesh_proto::{
    channel_of, message_kind, node_hash, DeviceKey, ForwardingContext, MeshPacket, NodeId,
};

use crate::port::MeshPort;
use crate::registry::HashRegistry;
use crate::rules::RouteManager;

use super::{NetworkTransport, RouterCommand, RouterStats};

/// Worker pop timeout; shutdown latency is bounded by it.
const POP_TIMEOUT: Duration = Duration::from_millis(100);
/// How long shutdown waits for the worker to drain.
const JOIN_TIMEOUT: Duration = Duration::from_secs(2);
/// Per-device received-queue bound, drop-oldest beyond it.
const RECEIVE_QUEUE_CAP: usize = 1000;
/// Reply-slot wait for query commands.
const REPLY_TIMEOUT: Duration = Duration::from_secs(1);

/// Handle to the routing worker thread.
///
/// Cloneable command submission lives behind `&self`; the thread itself is
/// owned here and joined on [`shutdown`](Self::shutdown) or drop.
pub struct RoutingWorker {
    tx: Sender<RouterCommand>,
    running: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl RoutingWorker {
    /// Spawn the worker for a node.
    pub fn spawn(node: NodeId) -> Self {
        let (tx, rx) = unbounded::<RouterCommand>();
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let thread = std::thread::Builder::new()
            .name("midimesh-router".into())
            .spawn(move || {
                let mut state = WorkerState::new(node);
                while flag.load(Ordering::Acquire) {
                    match rx.recv_timeout(POP_TIMEOUT) {
                        Ok(RouterCommand::Shutdown) => break,
                        Ok(command) => state.dispatch(command),
                        Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            })
            .ok();
        RoutingWorker {
            tx,
            running,
            thread: Mutex::new(thread),
        }
    }

    /// Submit a raw command; returns false once the worker is gone.
    pub fn submit(&self, command: RouterCommand) -> bool {
        self.tx.send(command).is_ok()
    }

    /// Route a message from a source device through the rules.
    pub fn forward(
        &self,
        source: NodeId,
        device_id: u16,
        payload: Vec<u8>,
        context: Option<ForwardingContext>,
    ) -> bool {
        self.submit(RouterCommand::Forward {
            source,
            device_id,
            payload,
            context,
        })
    }

    /// Rule-bypass delivery to a destination device.
    pub fn direct_send(&self, dest: NodeId, device_id: u16, payload: Vec<u8>) -> bool {
        self.submit(RouterCommand::DirectSend {
            dest,
            device_id,
            payload,
        })
    }

    /// Entry point for validated inbound packets addressed to this node.
    pub fn on_network_packet(&self, packet: MeshPacket) -> bool {
        self.submit(RouterCommand::NetworkPacket { packet })
    }

    /// Hand a port to the worker.
    pub fn register_port(&self, device_id: u16, port: Box<dyn MeshPort>) -> bool {
        self.submit(RouterCommand::RegisterPort { device_id, port })
    }

    /// Remove and drop a port.
    pub fn unregister_port(&self, device_id: u16) -> bool {
        self.submit(RouterCommand::UnregisterPort { device_id })
    }

    /// Append to a device's received queue.
    pub fn queue_received(&self, device_id: u16, payload: Vec<u8>) -> bool {
        self.submit(RouterCommand::QueueReceived { device_id, payload })
    }

    /// Drain a device's received queue; empty when the worker is gone.
    pub fn drain_received(&self, device_id: u16) -> Vec<Vec<u8>> {
        let (reply, rx) = bounded(1);
        if !self.submit(RouterCommand::DrainReceived { device_id, reply }) {
            return Vec::new();
        }
        rx.recv_timeout(REPLY_TIMEOUT).unwrap_or_default()
    }

    /// Snapshot the worker's counters.
    pub fn statistics(&self) -> RouterStats {
        let (reply, rx) = bounded(1);
        if !self.submit(RouterCommand::GetStatistics { reply }) {
            return RouterStats::default();
        }
        rx.recv_timeout(REPLY_TIMEOUT).unwrap_or_default()
    }

    /// Zero the worker's counters.
    pub fn reset_statistics(&self) -> bool {
        self.submit(RouterCommand::ResetStatistics)
    }

    /// Configure the rule store.
    pub fn set_route_manager(&self, manager: Arc<RouteManager>) -> bool {
        self.submit(RouterCommand::SetRouteManager(manager))
    }

    /// Configure the network transport.
    pub fn set_transport(&self, transport: Arc<dyn NetworkTransport>) -> bool {
        self.submit(RouterCommand::SetTransport(transport))
    }

    /// Configure the hash registry used for context decoding.
    pub fn set_hash_registry(&self, registry: Arc<HashRegistry>) -> bool {
        self.submit(RouterCommand::SetHashRegistry(registry))
    }

    /// Set this node's identifier.
    pub fn set_node_id(&self, node: NodeId) -> bool {
        self.submit(RouterCommand::SetNodeId(node))
    }

    /// Signal shutdown and wait for the worker to drain, bounded by two
    /// seconds.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        let _ = self.tx.send(RouterCommand::Shutdown);
        if let Some(thread) = self.thread.lock().take() {
            let deadline = Instant::now() + JOIN_TIMEOUT;
            while !thread.is_finished() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(10));
            }
            if thread.is_finished() {
                let _ = thread.join();
            } else {
                tracing::error!("routing worker did not stop within the join timeout");
            }
        }
    }
}

impl Drop for RoutingWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// State exclusively owned by the worker thread.
struct WorkerState {
    node: NodeId,
    ports: HashMap<u16, Box<dyn MeshPort>>,
    received: HashMap<u16, VecDeque<Vec<u8>>>,
    stats: RouterStats,
    route_manager: Option<Arc<RouteManager>>,
    transport: Option<Arc<dyn NetworkTransport>>,
    hash_registry: Option<Arc<HashRegistry>>,
    sequence: u16,
    epoch: Instant,
}

impl WorkerState {
    fn new(node: NodeId) -> Self {
        WorkerState {
            node,
            ports: HashMap::new(),
            received: HashMap::new(),
            stats: RouterStats::default(),
            route_manager: None,
            transport: None,
            hash_registry: None,
            sequence: 0,
            epoch: Instant::now(),
        }
    }

    fn dispatch(&mut self, command: RouterCommand) {
        match command {
            RouterCommand::Forward {
                source,
                device_id,
                payload,
                context,
            } => self.forward(source, device_id, &payload, context),
            RouterCommand::DirectSend {
                dest,
                device_id,
                payload,
            } => self.direct_send(dest, device_id, &payload),
            RouterCommand::NetworkPacket { packet } => self.network_packet(packet),
            RouterCommand::RegisterPort { device_id, port } => {
                self.ports.insert(device_id, port);
            }
            RouterCommand::UnregisterPort { device_id } => {
                self.ports.remove(&device_id);
            }
            RouterCommand::QueueReceived { device_id, payload } => {
                self.queue_received(device_id, payload, true);
            }
            RouterCommand::DrainReceived { device_id, reply } => {
                let drained = self
                    .received
                    .get_mut(&device_id)
                    .map(|queue| queue.drain(..).collect())
                    .unwrap_or_default();
                let _ = reply.send(drained);
            }
            RouterCommand::GetStatistics { reply } => {
                let _ = reply.send(self.stats);
            }
            RouterCommand::ResetStatistics => self.stats = RouterStats::default(),
            RouterCommand::SetRouteManager(manager) => self.route_manager = Some(manager),
            RouterCommand::SetTransport(transport) => self.transport = Some(transport),
            RouterCommand::SetHashRegistry(registry) => self.hash_registry = Some(registry),
            RouterCommand::SetNodeId(node) => self.node = node,
            RouterCommand::Shutdown => {}
        }
    }

    /// The forward algorithm: loop check, rule lookup, filter match,
    /// destination dispatch.
    fn forward(
        &mut self,
        source: NodeId,
        device_id: u16,
        payload: &[u8],
        context: Option<ForwardingContext>,
    ) {
        if source.is_local() {
            self.stats.local_messages_received += 1;
        }

        let mut context = context.unwrap_or_default();
        let source_key = DeviceKey {
            owner: source,
            device_id,
        };
        if context.at_hop_limit() || context.has_visited(&source_key) {
            self.stats.loops_detected += 1;
            tracing::debug!(
                source = %source_key,
                hops = context.hop_count,
                "loop prevented, message not forwarded"
            );
            return;
        }
        context.visit(source_key);

        let Some(manager) = self.route_manager.clone() else {
            return;
        };
        let rules = manager.destinations(source, device_id);
        let channel = channel_of(payload);
        let kind = message_kind(payload);

        for rule in rules {
            let matched = match kind {
                Some(kind) => rule.channel_matches(channel) && rule.kind_matches(kind),
                None => false,
            };
            if !matched {
                manager.update_statistics(&rule.rule_id, false);
                self.stats.messages_dropped += 1;
                continue;
            }
            if self.dispatch_to(&rule.destination, payload, &context) {
                manager.update_statistics(&rule.rule_id, true);
                self.stats.messages_forwarded += 1;
            }
        }
    }

    /// Deliver to a destination device: local port call or network packet.
    /// Returns whether the delivery succeeded.
    fn dispatch_to(&mut self, dest: &DeviceKey, payload: &[u8], context: &ForwardingContext) -> bool {
        if dest.is_local() || dest.owner == self.node {
            let Some(port) = self.ports.get_mut(&dest.device_id) else {
                self.stats.routing_errors += 1;
                tracing::warn!(device = dest.device_id, "no local port for destination");
                return false;
            };
            match port.send(payload) {
                Ok(()) => {
                    self.stats.local_messages_sent += 1;
                    true
                }
                Err(err) => {
                    self.stats.routing_errors += 1;
                    tracing::warn!(device = dest.device_id, %err, "local port send failed");
                    false
                }
            }
        } else {
            let Some(transport) = self.transport.clone() else {
                self.stats.routing_errors += 1;
                tracing::warn!("network destination but no transport configured");
                return false;
            };
            let sequence = self.next_sequence();
            let mut packet = MeshPacket::data(
                &self.node,
                &dest.owner,
                dest.device_id,
                payload.to_vec(),
                sequence,
                self.elapsed_micros(),
            );
            packet.set_context(context.to_wire(&self.node));
            let result = if packet.is_sysex() {
                transport.send_reliable(&packet)
            } else {
                transport.send_best_effort(&packet)
            };
            match result {
                Ok(()) => {
                    self.stats.network_messages_sent += 1;
                    true
                }
                Err(err) => {
                    self.stats.routing_errors += 1;
                    tracing::warn!(dest = %dest, %err, "network dispatch failed");
                    false
                }
            }
        }
    }

    /// Rule-bypass delivery with a fresh context.
    fn direct_send(&mut self, dest: NodeId, device_id: u16, payload: &[u8]) {
        let owner = if dest == self.node { NodeId::LOCAL } else { dest };
        let key = DeviceKey { owner, device_id };
        self.dispatch_to(&key, payload, &ForwardingContext::default());
    }

    /// A packet addressed to this node arrived: deliver to the addressed
    /// device, then run the forward algorithm so chained rules can pick the
    /// stream up.
    fn network_packet(&mut self, packet: MeshPacket) {
        self.stats.network_messages_received += 1;

        let registry = self.hash_registry.clone();
        let my_hash = node_hash(&self.node);
        let resolve = |hash: u32| {
            if hash == my_hash {
                Some(NodeId::LOCAL)
            } else {
                registry.as_ref().and_then(|registry| registry.lookup(hash))
            }
        };

        let Some(source) = resolve(packet.source_hash) else {
            self.stats.routing_errors += 1;
            tracing::warn!(
                hash = format_args!("{:#010x}", packet.source_hash),
                "dropping packet from unknown source node"
            );
            return;
        };

        // Context decode is best-effort: an unresolvable hash costs the
        // context, not the message.
        let context = match &packet.context {
            Some(wire) => match ForwardingContext::from_wire(wire, resolve) {
                Ok(context) => Some(context),
                Err(err) => {
                    tracing::warn!(%err, "forwarding context dropped");
                    None
                }
            },
            None => None,
        };

        // A packet that already passed through this stream is neither
        // delivered nor re-emitted.
        let stream_key = DeviceKey {
            owner: source,
            device_id: packet.device_id,
        };
        if let Some(context) = &context {
            if context.at_hop_limit() || context.has_visited(&stream_key) {
                self.stats.loops_detected += 1;
                tracing::debug!(
                    source = %stream_key,
                    hops = context.hop_count,
                    "looping packet rejected at reception"
                );
                return;
            }
        }

        // Local delivery to the addressed device: outputs are actuated,
        // inputs and proxies buffer for their consumers.
        let addressed_is_output = self
            .ports
            .get(&packet.device_id)
            .map(|port| port.is_output());
        match addressed_is_output {
            Some(true) => {
                if let Some(port) = self.ports.get_mut(&packet.device_id) {
                    match port.send(&packet.payload) {
                        Ok(()) => self.stats.local_messages_sent += 1,
                        Err(err) => {
                            self.stats.routing_errors += 1;
                            tracing::warn!(device = packet.device_id, %err, "delivery failed");
                        }
                    }
                }
            }
            Some(false) => {
                // Already counted at packet entry.
                self.queue_received(packet.device_id, packet.payload.clone(), false);
            }
            None => {}
        }

        // Chained forwarding under the receiver's own rules.
        self.forward(source, packet.device_id, &packet.payload, context);
    }

    fn queue_received(&mut self, device_id: u16, payload: Vec<u8>, count: bool) {
        let queue = self.received.entry(device_id).or_default();
        if queue.len() >= RECEIVE_QUEUE_CAP {
            queue.pop_front();
            tracing::debug!(device = device_id, "received queue overflow, oldest dropped");
        }
        queue.push_back(payload);
        if count {
            self.stats.network_messages_received += 1;
        }
    }

    fn next_sequence(&mut self) -> u16 {
        let sequence = self.sequence;
        self.sequence = self.sequence.wrapping_add(1);
        sequence
    }

    fn elapsed_micros(&self) -> u32 {
        self.epoch.elapsed().as_micros() as u32
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use midimesh_proto::MessageKind;

    use crate::port::{LocalPort, OutputSink, PortError, ReceiveBuffer};
    use crate::registry::{DeviceDirection, DeviceRegistry};
    use crate::rules::ForwardingRule;
    use crate::router::TransportSendError;

    use super::*;

    struct RecordingSink(Arc<StdMutex<Vec<Vec<u8>>>>);

    impl OutputSink for RecordingSink {
        fn send(&mut self, bytes: &[u8]) -> anyhow::Result<()> {
            self.0.lock().unwrap().push(bytes.to_vec());
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingTransport {
        packets: StdMutex<Vec<MeshPacket>>,
        reliable: StdMutex<Vec<MeshPacket>>,
    }

    impl NetworkTransport for RecordingTransport {
        fn send_best_effort(&self, packet: &MeshPacket) -> Result<(), TransportSendError> {
            self.packets.lock().unwrap().push(packet.clone());
            Ok(())
        }

        fn send_reliable(&self, packet: &MeshPacket) -> Result<(), TransportSendError> {
            self.reliable.lock().unwrap().push(packet.clone());
            Ok(())
        }
    }

    fn world() -> (Arc<DeviceRegistry>, Arc<RouteManager>, NodeId) {
        let devices = Arc::new(DeviceRegistry::new());
        let peer = NodeId::generate();
        devices.add_local(1, "Keys", DeviceDirection::Input, None);
        devices.add_local(7, "Synth", DeviceDirection::Output, None);
        devices.add_remote(peer, 5, "Peer Synth", DeviceDirection::Output, None);
        let manager = Arc::new(RouteManager::new(Arc::clone(&devices)));
        (devices, manager, peer)
    }

    fn output_port(sink: &Arc<StdMutex<Vec<Vec<u8>>>>) -> Box<dyn MeshPort> {
        Box::new(LocalPort::output("Synth", Box::new(RecordingSink(Arc::clone(sink)))))
    }

    #[test]
    fn local_note_on_reaches_the_local_port() {
        let (_devices, manager, _) = world();
        manager
            .add(ForwardingRule::new(DeviceKey::local(1), DeviceKey::local(7)))
            .unwrap();

        let worker = RoutingWorker::spawn(NodeId::generate());
        worker.set_route_manager(Arc::clone(&manager));
        let delivered: Arc<StdMutex<Vec<Vec<u8>>>> = Arc::default();
        worker.register_port(7, output_port(&delivered));

        worker.forward(NodeId::LOCAL, 1, vec![0x90, 0x3C, 0x64], None);

        let stats = worker.statistics();
        assert_eq!(stats.messages_forwarded, 1);
        assert_eq!(stats.local_messages_sent, 1);
        assert_eq!(stats.local_messages_received, 1);
        assert_eq!(delivered.lock().unwrap().as_slice(), &[vec![0x90, 0x3C, 0x64]]);
        worker.shutdown();
    }

    #[test]
    fn channel_filter_drops_without_delivery() {
        let (_devices, manager, _) = world();
        let mut rule = ForwardingRule::new(DeviceKey::local(1), DeviceKey::local(7));
        rule.rule_id = "r1".into();
        rule.channel_filter = 2;
        manager.add(rule).unwrap();

        let worker = RoutingWorker::spawn(NodeId::generate());
        worker.set_route_manager(Arc::clone(&manager));
        let delivered: Arc<StdMutex<Vec<Vec<u8>>>> = Arc::default();
        worker.register_port(7, output_port(&delivered));

        // Status 0x90 is channel 1; the rule wants channel 2.
        worker.forward(NodeId::LOCAL, 1, vec![0x90, 0x3C, 0x64], None);

        let stats = worker.statistics();
        assert_eq!(stats.messages_dropped, 1);
        assert_eq!(stats.messages_forwarded, 0);
        assert!(delivered.lock().unwrap().is_empty());
        assert_eq!(manager.get("r1").unwrap().statistics.messages_dropped, 1);
        worker.shutdown();
    }

    #[test]
    fn message_type_filter_is_honored() {
        let (_devices, manager, _) = world();
        let mut rule = ForwardingRule::new(DeviceKey::local(1), DeviceKey::local(7));
        rule.rule_id = "notes-only".into();
        rule.message_type_filter = MessageKind::NoteOn.bit() | MessageKind::NoteOff.bit();
        manager.add(rule).unwrap();

        let worker = RoutingWorker::spawn(NodeId::generate());
        worker.set_route_manager(Arc::clone(&manager));
        let delivered: Arc<StdMutex<Vec<Vec<u8>>>> = Arc::default();
        worker.register_port(7, output_port(&delivered));

        worker.forward(NodeId::LOCAL, 1, vec![0x90, 60, 100], None);
        worker.forward(NodeId::LOCAL, 1, vec![0xB0, 7, 64], None);

        let stats = worker.statistics();
        assert_eq!(stats.messages_forwarded, 1);
        assert_eq!(stats.messages_dropped, 1);
        assert_eq!(delivered.lock().unwrap().len(), 1);
        worker.shutdown();
    }

    #[test]
    fn network_forward_carries_context() {
        let (_devices, manager, peer) = world();
        manager
            .add(ForwardingRule::new(
                DeviceKey::local(1),
                DeviceKey::remote(peer, 5),
            ))
            .unwrap();

        let me = NodeId::generate();
        let worker = RoutingWorker::spawn(me);
        worker.set_route_manager(Arc::clone(&manager));
        let transport = Arc::new(RecordingTransport::default());
        worker.set_transport(transport.clone());

        worker.forward(NodeId::LOCAL, 1, vec![0xB0, 0x07, 0x40], None);

        let stats = worker.statistics();
        assert_eq!(stats.network_messages_sent, 1);
        assert_eq!(stats.messages_forwarded, 1);

        let packets = transport.packets.lock().unwrap();
        assert_eq!(packets.len(), 1);
        let packet = &packets[0];
        assert_eq!(packet.source_hash, node_hash(&me));
        assert_eq!(packet.dest_hash, node_hash(&peer));
        assert_eq!(packet.device_id, 5);
        assert_eq!(packet.payload, vec![0xB0, 0x07, 0x40]);
        assert!(packet.has_context());
        let context = packet.context.as_ref().unwrap();
        assert_eq!(context.hop_count, 1);
        assert_eq!(context.visited, vec![(node_hash(&me), 1)]);
        worker.shutdown();
    }

    #[test]
    fn sysex_goes_reliable() {
        let (devices, manager, peer) = world();
        devices.add_local(2, "SysEx In", DeviceDirection::Input, None);
        manager
            .add(ForwardingRule::new(
                DeviceKey::local(2),
                DeviceKey::remote(peer, 5),
            ))
            .unwrap();

        let worker = RoutingWorker::spawn(NodeId::generate());
        worker.set_route_manager(manager);
        let transport = Arc::new(RecordingTransport::default());
        worker.set_transport(transport.clone());

        worker.forward(NodeId::LOCAL, 2, vec![0xF0, 0x7E, 0xF7], None);
        worker.statistics();

        assert_eq!(transport.reliable.lock().unwrap().len(), 1);
        assert!(transport.packets.lock().unwrap().is_empty());
        worker.shutdown();
    }

    #[test]
    fn revisits_and_hop_caps_are_rejected() {
        let (_devices, manager, _) = world();
        manager
            .add(ForwardingRule::new(DeviceKey::local(1), DeviceKey::local(7)))
            .unwrap();

        let worker = RoutingWorker::spawn(NodeId::generate());
        worker.set_route_manager(manager);
        let delivered: Arc<StdMutex<Vec<Vec<u8>>>> = Arc::default();
        worker.register_port(7, output_port(&delivered));

        // The source device is already in the visited set.
        let mut visited = ForwardingContext::default();
        visited.visit(DeviceKey::local(1));
        worker.forward(NodeId::LOCAL, 1, vec![0x90, 60, 100], Some(visited));

        // Fresh device but the hop cap is already reached.
        let mut spent = ForwardingContext::default();
        for hop in 0..8 {
            spent.visit(DeviceKey::local(100 + hop));
        }
        worker.forward(NodeId::LOCAL, 1, vec![0x90, 60, 100], Some(spent));

        let stats = worker.statistics();
        assert_eq!(stats.loops_detected, 2);
        assert_eq!(stats.messages_forwarded, 0);
        assert!(delivered.lock().unwrap().is_empty());
        worker.shutdown();
    }

    #[test]
    fn direct_send_bypasses_rules() {
        let worker = RoutingWorker::spawn(NodeId::generate());
        let delivered: Arc<StdMutex<Vec<Vec<u8>>>> = Arc::default();
        worker.register_port(7, output_port(&delivered));

        // No rule store configured at all.
        worker.direct_send(NodeId::LOCAL, 7, vec![0xC0, 10]);
        let stats = worker.statistics();
        assert_eq!(stats.local_messages_sent, 1);
        assert_eq!(delivered.lock().unwrap().as_slice(), &[vec![0xC0, 10]]);
        worker.shutdown();
    }

    #[test]
    fn missing_port_is_a_routing_error() {
        let (_devices, manager, _) = world();
        manager
            .add(ForwardingRule::new(DeviceKey::local(1), DeviceKey::local(7)))
            .unwrap();
        let worker = RoutingWorker::spawn(NodeId::generate());
        worker.set_route_manager(manager);

        worker.forward(NodeId::LOCAL, 1, vec![0x90, 60, 100], None);
        let stats = worker.statistics();
        assert_eq!(stats.routing_errors, 1);
        assert_eq!(stats.messages_forwarded, 0);
        worker.shutdown();
    }

    #[test]
    fn received_queue_is_a_query_command() {
        let worker = RoutingWorker::spawn(NodeId::generate());
        worker.queue_received(3, vec![0x90, 60, 100]);
        worker.queue_received(3, vec![0x80, 60, 0]);

        let drained = worker.drain_received(3);
        assert_eq!(drained.len(), 2);
        assert!(worker.drain_received(3).is_empty());

        let stats = worker.statistics();
        assert_eq!(stats.network_messages_received, 2);
        worker.shutdown();
    }

    #[test]
    fn inbound_packet_is_delivered_and_chained() {
        let (devices, manager, _) = world();
        let origin = NodeId::generate();
        // The origin's stream is registered as a remote input so a chained
        // rule can read from it; device 8 is a second local output.
        devices.add_remote(origin, 7, "Origin Stream", DeviceDirection::Input, None);
        devices.add_local(8, "Second Synth", DeviceDirection::Output, None);
        manager
            .add(ForwardingRule::new(
                DeviceKey::remote(origin, 7),
                DeviceKey::local(8),
            ))
            .unwrap();

        let me = NodeId::generate();
        let worker = RoutingWorker::spawn(me);
        worker.set_route_manager(Arc::clone(&manager));
        let hashes = Arc::new(HashRegistry::new());
        hashes.register(origin);
        worker.set_hash_registry(hashes);

        let addressed: Arc<StdMutex<Vec<Vec<u8>>>> = Arc::default();
        let chained: Arc<StdMutex<Vec<Vec<u8>>>> = Arc::default();
        worker.register_port(7, output_port(&addressed));
        worker.register_port(8, output_port(&chained));

        let packet = MeshPacket::data(&origin, &me, 7, vec![0x90, 60, 100], 0, 0);
        worker.on_network_packet(packet);

        let stats = worker.statistics();
        assert_eq!(stats.network_messages_received, 1);
        // Addressed delivery plus the chained rule's delivery.
        assert_eq!(stats.local_messages_sent, 2);
        assert_eq!(stats.messages_forwarded, 1);
        assert_eq!(addressed.lock().unwrap().len(), 1);
        assert_eq!(chained.lock().unwrap().len(), 1);
        worker.shutdown();
    }

    #[test]
    fn unknown_source_hash_drops_the_packet() {
        let me = NodeId::generate();
        let worker = RoutingWorker::spawn(me);
        worker.set_hash_registry(Arc::new(HashRegistry::new()));

        let stranger = NodeId::generate();
        let packet = MeshPacket::data(&stranger, &me, 7, vec![0x90, 60, 100], 0, 0);
        worker.on_network_packet(packet);

        let stats = worker.statistics();
        assert_eq!(stats.routing_errors, 1);
        worker.shutdown();
    }

    #[test]
    fn reset_statistics_zeroes_counters() {
        let worker = RoutingWorker::spawn(NodeId::generate());
        worker.queue_received(1, vec![0xF8]);
        assert_ne!(worker.statistics(), RouterStats::default());
        worker.reset_statistics();
        assert_eq!(worker.statistics(), RouterStats::default());
        worker.shutdown();
    }

    #[test]
    fn failing_port_counts_routing_error() {
        struct FailingPort;
        impl MeshPort for FailingPort {
            fn name(&self) -> &str {
                "broken"
            }
            fn is_input(&self) -> bool {
                false
            }
            fn is_output(&self) -> bool {
                true
            }
            fn send(&mut self, _bytes: &[u8]) -> Result<(), PortError> {
                Err(PortError::Hardware("unplugged".into()))
            }
            fn drain_received(&mut self) -> Vec<Vec<u8>> {
                Vec::new()
            }
            fn stats(&self) -> crate::port::PortStats {
                crate::port::PortStats::default()
            }
        }

        let (_devices, manager, _) = world();
        manager
            .add(ForwardingRule::new(DeviceKey::local(1), DeviceKey::local(7)))
            .unwrap();
        let worker = RoutingWorker::spawn(NodeId::generate());
        worker.set_route_manager(manager);
        worker.register_port(7, Box::new(FailingPort));

        worker.forward(NodeId::LOCAL, 1, vec![0x90, 60, 100], None);
        let stats = worker.statistics();
        assert_eq!(stats.routing_errors, 1);
        assert_eq!(stats.messages_forwarded, 0);
        worker.shutdown();
    }

    #[test]
    fn unregister_drops_the_port() {
        let (_devices, manager, _) = world();
        manager
            .add(ForwardingRule::new(DeviceKey::local(1), DeviceKey::local(7)))
            .unwrap();
        let worker = RoutingWorker::spawn(NodeId::generate());
        worker.set_route_manager(manager);
        let delivered: Arc<StdMutex<Vec<Vec<u8>>>> = Arc::default();
        worker.register_port(7, output_port(&delivered));
        worker.unregister_port(7);

        worker.forward(NodeId::LOCAL, 1, vec![0x90, 60, 100], None);
        assert_eq!(worker.statistics().routing_errors, 1);
        assert!(delivered.lock().unwrap().is_empty());
        worker.shutdown();
    }

    #[test]
    fn inbound_packet_for_an_input_port_lands_in_its_receive_queue() {
        let me = NodeId::generate();
        let origin = NodeId::generate();
        let worker = RoutingWorker::spawn(me);
        let hashes = Arc::new(HashRegistry::new());
        hashes.register(origin);
        worker.set_hash_registry(hashes);
        worker.register_port(1, Box::new(LocalPort::input("Keys", ReceiveBuffer::new())));

        let packet = MeshPacket::data(&origin, &me, 1, vec![0xFE], 0, 0);
        worker.on_network_packet(packet);

        assert_eq!(worker.drain_received(1), vec![vec![0xFE]]);
        assert_eq!(worker.statistics().network_messages_received, 1);
        worker.shutdown();
    }
}

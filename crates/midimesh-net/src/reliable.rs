//! ACK/retry layer over the best-effort datagram path.
//!
//! Outbound bulk payloads are fragmented (1 KiB), each fragment tracked by
//! sequence until its ACK arrives. A single service thread doubles as the
//! retry timer and the callback executor, so completion and failure
//! callbacks never run on a real-time thread. One reliable channel exists
//! per peer; the reassembled payload is a whole mesh packet, so no device
//! association is needed at this layer.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;

use midimesh_proto::frame::{fragment, ReliableFrame, MAX_FRAGMENT_DATA};

use crate::DatagramSender;

/// Retry and timeout tuning.
#[derive(Debug, Clone)]
pub struct ReliableConfig {
    /// Base ACK timeout in milliseconds.
    pub timeout_ms: u64,
    /// Retries before a send is failed.
    pub max_retries: u32,
    /// Additional wait per retry already taken, in milliseconds.
    pub retry_backoff_ms: u64,
    /// Service-thread tick driving retries and callbacks.
    pub timer_interval: Duration,
}

impl Default for ReliableConfig {
    fn default() -> Self {
        ReliableConfig {
            timeout_ms: 100,
            max_retries: 3,
            retry_backoff_ms: 50,
            timer_interval: Duration::from_millis(10),
        }
    }
}

/// Fired once when every fragment of a send was acknowledged.
pub type SuccessCallback = Box<dyn FnOnce() + Send>;
/// Fired once with a human-readable reason when a send is abandoned.
pub type FailureCallback = Box<dyn FnOnce(&str) + Send>;
/// Delivery of a reassembled inbound message.
pub type MessageCallback = Arc<dyn Fn(Vec<u8>, SocketAddr) + Send + Sync>;

/// Counter snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReliableStats {
    /// Reliable sends initiated.
    pub reliable_sent: u64,
    /// Sends fully acknowledged.
    pub reliable_acked: u64,
    /// Sends abandoned after max retries or cancellation.
    pub reliable_failed: u64,
    /// Fragments transmitted (first attempts).
    pub fragments_sent: u64,
    /// Fragment retransmissions.
    pub retries: u64,
    /// Whole messages reassembled and delivered.
    pub messages_received: u64,
    /// Redundant fragments re-acknowledged without redelivery.
    pub duplicate_fragments: u64,
}

#[derive(Default)]
struct StatsInner {
    reliable_sent: AtomicU64,
    reliable_acked: AtomicU64,
    reliable_failed: AtomicU64,
    fragments_sent: AtomicU64,
    retries: AtomicU64,
    messages_received: AtomicU64,
    duplicate_fragments: AtomicU64,
}

impl StatsInner {
    fn snapshot(&self) -> ReliableStats {
        ReliableStats {
            reliable_sent: self.reliable_sent.load(Ordering::Relaxed),
            reliable_acked: self.reliable_acked.load(Ordering::Relaxed),
            reliable_failed: self.reliable_failed.load(Ordering::Relaxed),
            fragments_sent: self.fragments_sent.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            duplicate_fragments: self.duplicate_fragments.load(Ordering::Relaxed),
        }
    }
}

struct PendingFragment {
    frame: Vec<u8>,
    addr: SocketAddr,
    sent_at: Instant,
    retries: u32,
    group: u32,
}

struct PendingGroup {
    remaining: usize,
    on_success: Option<SuccessCallback>,
    on_failure: Option<FailureCallback>,
}

#[derive(Default)]
struct Pending {
    fragments: HashMap<u32, PendingFragment>,
    groups: HashMap<u32, PendingGroup>,
}

/// Per-peer reassembly state plus a window of recently delivered messages
/// so a retransmitted terminator is re-ACKed without duplicate delivery.
#[derive(Default)]
struct PeerReassembly {
    reassembler: midimesh_proto::Reassembler,
    delivered: VecDeque<u32>,
}

const DELIVERED_WINDOW: usize = 64;

enum Dispatch {
    Success(SuccessCallback),
    Failure(FailureCallback, String),
    Message(Vec<u8>, SocketAddr),
}

/// Reliable transport layered on a [`DatagramSender`].
pub struct ReliableTransport {
    sender: Arc<dyn DatagramSender>,
    config: ReliableConfig,
    pending: Mutex<Pending>,
    reassembly: Mutex<HashMap<SocketAddr, PeerReassembly>>,
    next_sequence: AtomicU32,
    stats: StatsInner,
    on_message: Mutex<Option<MessageCallback>>,
    dispatch_tx: Sender<Dispatch>,
    dispatch_rx: Mutex<Option<Receiver<Dispatch>>>,
    running: AtomicBool,
    service: Mutex<Option<JoinHandle<()>>>,
}

impl ReliableTransport {
    /// Build the layer over a datagram sender.
    pub fn new(sender: Arc<dyn DatagramSender>, config: ReliableConfig) -> Self {
        let (dispatch_tx, dispatch_rx) = unbounded();
        ReliableTransport {
            sender,
            config,
            pending: Mutex::new(Pending::default()),
            reassembly: Mutex::new(HashMap::new()),
            next_sequence: AtomicU32::new(0),
            stats: StatsInner::default(),
            on_message: Mutex::new(None),
            dispatch_tx,
            dispatch_rx: Mutex::new(Some(dispatch_rx)),
            running: AtomicBool::new(false),
            service: Mutex::new(None),
        }
    }

    /// Register the inbound-message callback. Final wiring step; call before
    /// [`start`](Self::start).
    pub fn set_message_callback(&self, callback: MessageCallback) {
        *self.on_message.lock() = Some(callback);
    }

    /// Counter snapshot.
    pub fn stats(&self) -> ReliableStats {
        self.stats.snapshot()
    }

    /// Start the service thread (retry timer + callback executor).
    pub fn start(self: &Arc<Self>) {
        let Some(rx) = self.dispatch_rx.lock().take() else {
            return;
        };
        self.running.store(true, Ordering::Release);
        let this = Arc::clone(self);
        match std::thread::Builder::new()
            .name("midimesh-reliable".into())
            .spawn(move || this.service_loop(rx))
        {
            Ok(handle) => *self.service.lock() = Some(handle),
            Err(err) => {
                self.running.store(false, Ordering::Release);
                tracing::error!(?err, "failed to spawn reliable service thread");
            }
        }
    }

    /// Stop the service thread and cancel every pending send.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.service.lock().take() {
            if handle.join().is_err() {
                tracing::error!("reliable service thread panicked");
            }
        }

        let cancelled: Vec<PendingGroup> = {
            let mut pending = self.pending.lock();
            pending.fragments.clear();
            pending.groups.drain().map(|(_, group)| group).collect()
        };
        for group in cancelled {
            self.stats.reliable_failed.fetch_add(1, Ordering::Relaxed);
            if let Some(on_failure) = group.on_failure {
                on_failure("Cancelled");
            }
        }
    }

    /// Send a payload with delivery confirmation.
    ///
    /// The payload is fragmented at [`MAX_FRAGMENT_DATA`]; the success
    /// callback fires once every fragment is acknowledged, the failure
    /// callback once any fragment exhausts its retries.
    pub fn send_reliable(
        &self,
        payload: &[u8],
        addr: SocketAddr,
        on_success: SuccessCallback,
        on_failure: FailureCallback,
    ) {
        let fragment_count = fragment_count_for(payload.len());
        let first = self
            .next_sequence
            .fetch_add(fragment_count as u32, Ordering::Relaxed);
        let frames = fragment(payload, first);

        let group = first;
        let mut encoded = Vec::with_capacity(frames.len());
        {
            let mut pending = self.pending.lock();
            pending.groups.insert(
                group,
                PendingGroup {
                    remaining: frames.len(),
                    on_success: Some(on_success),
                    on_failure: Some(on_failure),
                },
            );
            let now = Instant::now();
            for frame in &frames {
                let ReliableFrame::Fragment { sequence, .. } = frame else {
                    continue;
                };
                let bytes = frame.to_bytes();
                pending.fragments.insert(
                    *sequence,
                    PendingFragment {
                        frame: bytes.clone(),
                        addr,
                        sent_at: now,
                        retries: 0,
                        group,
                    },
                );
                encoded.push(bytes);
            }
        }

        self.stats.reliable_sent.fetch_add(1, Ordering::Relaxed);
        self.stats
            .fragments_sent
            .fetch_add(encoded.len() as u64, Ordering::Relaxed);
        for bytes in encoded {
            if let Err(err) = self.sender.send_datagram(&bytes, addr) {
                // The retry timer picks the fragment up again.
                tracing::debug!(?err, "initial fragment send failed");
            }
        }
    }

    /// Fire-and-forget datagram send through the same socket.
    pub fn send_unreliable(&self, payload: &[u8], addr: SocketAddr) -> io::Result<()> {
        self.sender.send_datagram(payload, addr)
    }

    /// Feed one inbound reliable frame, as surfaced by the UDP transport.
    pub fn handle_frame(&self, bytes: &[u8], from: SocketAddr) {
        let frame = match ReliableFrame::parse(bytes) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::trace!(%err, %from, "dropping malformed reliable frame");
                return;
            }
        };
        match frame {
            ReliableFrame::Ack { sequence } => self.handle_ack(sequence),
            ReliableFrame::Nack { sequence } => self.handle_nack(sequence),
            ReliableFrame::Fragment { sequence, data } => {
                self.handle_fragment(sequence, data, from)
            }
        }
    }

    fn handle_ack(&self, sequence: u32) {
        let completed = {
            let mut pending = self.pending.lock();
            let mut completed = None;
            if let Some(fragment) = pending.fragments.remove(&sequence) {
                if let Some(group) = pending.groups.get_mut(&fragment.group) {
                    group.remaining = group.remaining.saturating_sub(1);
                    if group.remaining == 0 {
                        completed = pending.groups.remove(&fragment.group);
                    }
                }
            }
            completed
        };
        if let Some(group) = completed {
            self.stats.reliable_acked.fetch_add(1, Ordering::Relaxed);
            if let Some(on_success) = group.on_success {
                let _ = self.dispatch_tx.send(Dispatch::Success(on_success));
            }
        }
    }

    fn handle_nack(&self, sequence: u32) {
        let resend = {
            let mut pending = self.pending.lock();
            pending.fragments.get_mut(&sequence).map(|fragment| {
                fragment.retries += 1;
                fragment.sent_at = Instant::now();
                (fragment.frame.clone(), fragment.addr)
            })
        };
        if let Some((bytes, addr)) = resend {
            self.stats.retries.fetch_add(1, Ordering::Relaxed);
            if let Err(err) = self.sender.send_datagram(&bytes, addr) {
                tracing::debug!(?err, "nack-triggered resend failed");
            }
        }
    }

    fn handle_fragment(&self, sequence: u32, data: Vec<u8>, from: SocketAddr) {
        // Always acknowledge; the sender retries until it hears us.
        let ack = ReliableFrame::Ack { sequence }.to_bytes();
        if let Err(err) = self.sender.send_datagram(&ack, from) {
            tracing::debug!(?err, "ack send failed");
        }

        let terminal = data.len() < MAX_FRAGMENT_DATA;
        let message = {
            let mut reassembly = self.reassembly.lock();
            let peer = reassembly.entry(from).or_default();
            if terminal && peer.delivered.contains(&sequence) {
                self.stats
                    .duplicate_fragments
                    .fetch_add(1, Ordering::Relaxed);
                return;
            }
            let message = peer.reassembler.accept(sequence, data);
            if message.is_some() {
                peer.delivered.push_back(sequence);
                if peer.delivered.len() > DELIVERED_WINDOW {
                    peer.delivered.pop_front();
                }
            }
            message
        };

        if let Some(message) = message {
            self.stats.messages_received.fetch_add(1, Ordering::Relaxed);
            let _ = self.dispatch_tx.send(Dispatch::Message(message, from));
        }
    }

    /// Age pending fragments; retry or fail them.
    fn check_pending(&self) {
        let now = Instant::now();
        let mut to_resend: Vec<(Vec<u8>, SocketAddr)> = Vec::new();
        let mut failed_groups: Vec<PendingGroup> = Vec::new();
        {
            let mut pending = self.pending.lock();
            let mut dead_groups: Vec<u32> = Vec::new();
            for fragment in pending.fragments.values_mut() {
                let threshold = Duration::from_millis(
                    self.config.timeout_ms
                        + u64::from(fragment.retries) * self.config.retry_backoff_ms,
                );
                if now.duration_since(fragment.sent_at) <= threshold {
                    continue;
                }
                if fragment.retries >= self.config.max_retries {
                    if !dead_groups.contains(&fragment.group) {
                        dead_groups.push(fragment.group);
                    }
                } else {
                    fragment.retries += 1;
                    fragment.sent_at = now;
                    to_resend.push((fragment.frame.clone(), fragment.addr));
                }
            }
            for group_id in dead_groups {
                pending.fragments.retain(|_, f| f.group != group_id);
                if let Some(group) = pending.groups.remove(&group_id) {
                    failed_groups.push(group);
                }
            }
        }

        for (bytes, addr) in to_resend {
            self.stats.retries.fetch_add(1, Ordering::Relaxed);
            if let Err(err) = self.sender.send_datagram(&bytes, addr) {
                tracing::debug!(?err, "timed retry send failed");
            }
        }
        for group in failed_groups {
            self.stats.reliable_failed.fetch_add(1, Ordering::Relaxed);
            if let Some(on_failure) = group.on_failure {
                let _ = self
                    .dispatch_tx
                    .send(Dispatch::Failure(on_failure, "Max retries exceeded".into()));
            }
        }
    }

    fn service_loop(&self, rx: Receiver<Dispatch>) {
        let mut last_check = Instant::now();
        while self.running.load(Ordering::Acquire) {
            match rx.recv_timeout(self.config.timer_interval) {
                Ok(Dispatch::Success(on_success)) => on_success(),
                Ok(Dispatch::Failure(on_failure, reason)) => on_failure(&reason),
                Ok(Dispatch::Message(message, from)) => {
                    let callback = self.on_message.lock().clone();
                    if let Some(callback) = callback {
                        callback(message, from);
                    }
                }
                Err(_) => {}
            }
            if last_check.elapsed() >= self.config.timer_interval {
                self.check_pending();
                last_check = Instant::now();
            }
        }
    }
}

// A short final chunk terminates a message; exact multiples (and the empty
// payload) get an extra empty terminator, so the count is always one more
// than the number of full chunks.
fn fragment_count_for(payload_len: usize) -> usize {
    payload_len / MAX_FRAGMENT_DATA + 1
}

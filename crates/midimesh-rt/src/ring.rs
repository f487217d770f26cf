//! Lock-free hand-off between the MIDI-input thread and the UDP transport
//! worker.
//!
//! The writer is a hardware callback that must never block or allocate; the
//! reader is the transport thread draining in batches. Overflow applies
//! drop-oldest: the stalest entry is evicted to make room and a counter
//! records the loss. All operations go through [`ArrayQueue`], which works
//! with atomics only and allocates nothing after construction.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_queue::ArrayQueue;

/// Recommended ring capacity; must be a power of two.
pub const DEFAULT_RING_CAPACITY: usize = 2048;

/// Largest MIDI message carried by the real-time path, in bytes.
///
/// Channel Voice messages are at most three bytes and System Real-Time one;
/// anything longer belongs on the reliable path.
pub const MAX_RT_PAYLOAD: usize = 4;

/// Fixed-size ring entry: a short MIDI message plus its source device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtEntry {
    data: [u8; MAX_RT_PAYLOAD],
    len: u8,
    /// Source device id within the local node.
    pub device_id: u16,
    /// Capture time, microseconds since the node-local epoch (wraps).
    pub timestamp_us: u32,
}

impl RtEntry {
    /// Build an entry, or `None` when the message is too long for the
    /// real-time path.
    #[inline]
    pub fn new(device_id: u16, bytes: &[u8], timestamp_us: u32) -> Option<Self> {
        if bytes.is_empty() || bytes.len() > MAX_RT_PAYLOAD {
            return None;
        }
        let mut data = [0u8; MAX_RT_PAYLOAD];
        data[..bytes.len()].copy_from_slice(bytes);
        Some(RtEntry {
            data,
            len: bytes.len() as u8,
            device_id,
            timestamp_us,
        })
    }

    /// The MIDI bytes of this entry.
    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }
}

/// Snapshot of ring-buffer counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct RingStats {
    /// Entries waiting to be read.
    pub ready: usize,
    /// Free slots.
    pub free: usize,
    /// Entries ever written (including ones later dropped).
    pub written: u64,
    /// Entries ever read.
    pub read: u64,
    /// Entries evicted by drop-oldest.
    pub dropped: u64,
}

impl RingStats {
    /// Dropped entries as a percentage of writes.
    pub fn drop_rate(&self) -> f64 {
        if self.written == 0 {
            0.0
        } else {
            self.dropped as f64 / self.written as f64 * 100.0
        }
    }
}

/// Fixed-capacity single-producer single-consumer message ring.
pub struct RtRingBuffer {
    queue: ArrayQueue<RtEntry>,
    written: AtomicU64,
    read: AtomicU64,
    dropped: AtomicU64,
}

impl RtRingBuffer {
    /// Create a ring with the given capacity, rounded up to a power of two.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2).next_power_of_two();
        RtRingBuffer {
            queue: ArrayQueue::new(capacity),
            written: AtomicU64::new(0),
            read: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Create a ring with [`DEFAULT_RING_CAPACITY`].
    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_RING_CAPACITY)
    }

    /// Slot count.
    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// Entries currently queued.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether the ring holds no entries.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Writer path. Never blocks, never allocates; on a full ring the oldest
    /// entry is evicted first and the dropped counter is bumped.
    #[inline]
    pub fn push(&self, entry: RtEntry) {
        if self.queue.push(entry).is_err() {
            let _ = self.queue.pop();
            self.dropped.fetch_add(1, Ordering::Relaxed);
            let _ = self.queue.push(entry);
        }
        self.written.fetch_add(1, Ordering::Relaxed);
    }

    /// Reader path: take one entry.
    #[inline]
    pub fn pop(&self) -> Option<RtEntry> {
        let entry = self.queue.pop();
        if entry.is_some() {
            self.read.fetch_add(1, Ordering::Relaxed);
        }
        entry
    }

    /// Reader path: fill `out` from the ring, returning the entry count.
    pub fn drain(&self, out: &mut [RtEntry]) -> usize {
        let mut count = 0;
        while count < out.len() {
            match self.queue.pop() {
                Some(entry) => {
                    out[count] = entry;
                    count += 1;
                }
                None => break,
            }
        }
        if count > 0 {
            self.read.fetch_add(count as u64, Ordering::Relaxed);
        }
        count
    }

    /// Counter snapshot.
    pub fn stats(&self) -> RingStats {
        let ready = self.queue.len();
        RingStats {
            ready,
            free: self.queue.capacity() - ready,
            written: self.written.load(Ordering::Relaxed),
            read: self.read.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

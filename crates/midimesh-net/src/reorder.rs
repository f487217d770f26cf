//! Sequence-ordered delivery for the reliable receive path.
//!
//! Sequences are 16-bit and wrap; ordering uses the signed-difference
//! comparator, so `a` precedes `b` exactly when `(b - a) as i16` is
//! positive. Out-of-order arrivals are buffered until the gap closes, large
//! gaps and stale buffered packets force a skip-forward with gap events, and
//! a bounded window of recently seen sequences catches duplicates.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Reorder tuning knobs.
#[derive(Debug, Clone)]
pub struct ReorderConfig {
    /// Gap beyond which preceding packets are declared lost.
    pub max_sequence_gap: u16,
    /// Age after which a buffered packet forces a skip-forward.
    pub delivery_timeout: Duration,
    /// Deliver duplicates instead of dropping them.
    pub allow_duplicates: bool,
    /// Size of the recently-seen window used for duplicate detection.
    pub history: usize,
}

impl Default for ReorderConfig {
    fn default() -> Self {
        ReorderConfig {
            max_sequence_gap: 64,
            delivery_timeout: Duration::from_millis(200),
            allow_duplicates: false,
            history: 256,
        }
    }
}

/// Events produced by the buffer, in the order they occurred.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReorderEvent<T> {
    /// In-order delivery of a packet.
    Delivered(u16, T),
    /// A sequence was declared lost.
    Gap(u16),
    /// A sequence arrived more than once.
    Duplicate(u16),
}

/// Counter snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReorderStats {
    /// Packets delivered in order.
    pub delivered: u64,
    /// Packets delivered after being buffered out of order.
    pub reordered: u64,
    /// Duplicate arrivals.
    pub duplicates: u64,
    /// Sequences declared lost.
    pub gaps_detected: u64,
    /// Arrivals older than the delivery cursor, discarded.
    pub stale_dropped: u64,
}

#[derive(Default)]
struct StatsInner {
    delivered: AtomicU64,
    reordered: AtomicU64,
    duplicates: AtomicU64,
    gaps_detected: AtomicU64,
    stale_dropped: AtomicU64,
}

struct State<T> {
    next_expected: u16,
    buffered: HashMap<u16, (T, Instant)>,
    seen: VecDeque<u16>,
    seen_set: HashSet<u16>,
}

/// Wrap-aware sequence comparator: does `a` precede `b`?
#[inline]
pub fn sequence_before(a: u16, b: u16) -> bool {
    (b.wrapping_sub(a) as i16) > 0
}

/// Reorder buffer over wrapping 16-bit sequence numbers.
pub struct ReorderBuffer<T> {
    config: ReorderConfig,
    state: Mutex<State<T>>,
    stats: StatsInner,
}

impl<T> ReorderBuffer<T> {
    /// Create a buffer expecting `first_sequence` next.
    pub fn new(config: ReorderConfig, first_sequence: u16) -> Self {
        ReorderBuffer {
            config,
            state: Mutex::new(State {
                next_expected: first_sequence,
                buffered: HashMap::new(),
                seen: VecDeque::new(),
                seen_set: HashSet::new(),
            }),
            stats: StatsInner::default(),
        }
    }

    /// The sequence the buffer will deliver next.
    pub fn next_expected(&self) -> u16 {
        self.state.lock().next_expected
    }

    /// Packets currently buffered out of order.
    pub fn buffered_len(&self) -> usize {
        self.state.lock().buffered.len()
    }

    /// Counter snapshot.
    pub fn stats(&self) -> ReorderStats {
        ReorderStats {
            delivered: self.stats.delivered.load(Ordering::Relaxed),
            reordered: self.stats.reordered.load(Ordering::Relaxed),
            duplicates: self.stats.duplicates.load(Ordering::Relaxed),
            gaps_detected: self.stats.gaps_detected.load(Ordering::Relaxed),
            stale_dropped: self.stats.stale_dropped.load(Ordering::Relaxed),
        }
    }

    /// Accept one packet; returns the events it caused, in order.
    pub fn push(&self, sequence: u16, item: T) -> Vec<ReorderEvent<T>> {
        let mut events = Vec::new();
        let mut state = self.state.lock();

        if state.seen_set.contains(&sequence) {
            self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
            events.push(ReorderEvent::Duplicate(sequence));
            if !self.config.allow_duplicates {
                return events;
            }
        } else {
            state.seen.push_back(sequence);
            state.seen_set.insert(sequence);
            while state.seen.len() > self.config.history {
                if let Some(old) = state.seen.pop_front() {
                    state.seen_set.remove(&old);
                }
            }
        }

        if sequence == state.next_expected {
            self.deliver(&mut state, sequence, item, false, &mut events);
            self.drain_contiguous(&mut state, &mut events);
        } else if sequence_before(sequence, state.next_expected) {
            self.stats.stale_dropped.fetch_add(1, Ordering::Relaxed);
        } else {
            let gap = sequence.wrapping_sub(state.next_expected);
            if gap > self.config.max_sequence_gap {
                // The run up to this packet is considered lost.
                self.skip_forward(&mut state, sequence, &mut events);
                self.deliver(&mut state, sequence, item, false, &mut events);
                state.buffered.clear();
            } else {
                state.buffered.insert(sequence, (item, Instant::now()));
            }
        }
        events
    }

    /// Scan buffered packets, skipping forward past any whose age exceeds
    /// the delivery timeout. Run from the reorder timer.
    pub fn poll_timeouts(&self) -> Vec<ReorderEvent<T>> {
        let now = Instant::now();
        let mut events = Vec::new();
        let mut state = self.state.lock();

        loop {
            // Oldest-by-sequence buffered packet that has waited too long.
            let expired = state
                .buffered
                .iter()
                .filter(|(_, (_, arrived))| {
                    now.duration_since(*arrived) > self.config.delivery_timeout
                })
                .map(|(&sequence, _)| sequence)
                .min_by(|&a, &b| {
                    if sequence_before(a, b) {
                        std::cmp::Ordering::Less
                    } else {
                        std::cmp::Ordering::Greater
                    }
                });
            let Some(target) = expired else { break };

            // Walk the cursor up to the expired packet, delivering anything
            // buffered on the way and declaring the rest lost.
            let mut sequence = state.next_expected;
            while sequence != target {
                if let Some((item, _)) = state.buffered.remove(&sequence) {
                    self.deliver(&mut state, sequence, item, true, &mut events);
                } else {
                    self.stats.gaps_detected.fetch_add(1, Ordering::Relaxed);
                    events.push(ReorderEvent::Gap(sequence));
                }
                sequence = sequence.wrapping_add(1);
            }
            state.next_expected = target;
            let Some((item, _)) = state.buffered.remove(&target) else {
                break;
            };
            self.deliver(&mut state, target, item, true, &mut events);
            self.drain_contiguous(&mut state, &mut events);
        }
        events
    }

    fn deliver(
        &self,
        state: &mut State<T>,
        sequence: u16,
        item: T,
        reordered: bool,
        events: &mut Vec<ReorderEvent<T>>,
    ) {
        self.stats.delivered.fetch_add(1, Ordering::Relaxed);
        if reordered {
            self.stats.reordered.fetch_add(1, Ordering::Relaxed);
        }
        state.next_expected = sequence.wrapping_add(1);
        events.push(ReorderEvent::Delivered(sequence, item));
    }

    fn drain_contiguous(&self, state: &mut State<T>, events: &mut Vec<ReorderEvent<T>>) {
        loop {
            let sequence = state.next_expected;
            let Some((item, _)) = state.buffered.remove(&sequence) else {
                break;
            };
            self.deliver(state, sequence, item, true, events);
        }
    }

    /// Emit gap events for every missing sequence between the cursor and
    /// `target`, then move the cursor to `target`.
    fn skip_forward(&self, state: &mut State<T>, target: u16, events: &mut Vec<ReorderEvent<T>>) {
        let mut sequence = state.next_expected;
        while sequence != target {
            if !state.buffered.contains_key(&sequence) {
                self.stats.gaps_detected.fetch_add(1, Ordering::Relaxed);
                events.push(ReorderEvent::Gap(sequence));
            }
            sequence = sequence.wrapping_add(1);
        }
        state.next_expected = target;
    }
}

/// Periodic driver for [`ReorderBuffer::poll_timeouts`].
pub struct ReorderTimer {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ReorderTimer {
    /// Spawn a timer thread invoking `tick` at `interval` until stopped.
    pub fn spawn(interval: Duration, mut tick: impl FnMut() + Send + 'static) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let handle = std::thread::Builder::new()
            .name("midimesh-reorder".into())
            .spawn(move || {
                while flag.load(Ordering::Acquire) {
                    std::thread::sleep(interval);
                    if !flag.load(Ordering::Acquire) {
                        break;
                    }
                    tick();
                }
            })
            .ok();
        ReorderTimer { running, handle }
    }

    /// Stop and join the timer thread.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ReorderTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delivered(events: &[ReorderEvent<u32>]) -> Vec<u16> {
        events
            .iter()
            .filter_map(|event| match event {
                ReorderEvent::Delivered(sequence, _) => Some(*sequence),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn comparator_is_wraparound_aware() {
        assert!(sequence_before(1, 2));
        assert!(!sequence_before(2, 1));
        assert!(sequence_before(65535, 0));
        assert!(!sequence_before(0, 65535));
        assert!(!sequence_before(5, 5));
    }

    #[test]
    fn out_of_order_arrivals_deliver_in_order() {
        let buffer = ReorderBuffer::new(ReorderConfig::default(), 1);
        let mut order = Vec::new();
        for sequence in [1u16, 3, 2, 4] {
            order.extend(delivered(&buffer.push(sequence, u32::from(sequence))));
        }
        assert_eq!(order, vec![1, 2, 3, 4]);

        let stats = buffer.stats();
        assert_eq!(stats.delivered, 4);
        assert!(stats.reordered >= 1);
        assert_eq!(stats.duplicates, 0);
        assert_eq!(stats.gaps_detected, 0);
    }

    #[test]
    fn stale_packets_are_discarded() {
        let buffer = ReorderBuffer::new(ReorderConfig::default(), 10);
        assert_eq!(delivered(&buffer.push(10, 0)), vec![10]);
        // 9 is now behind the cursor.
        assert!(delivered(&buffer.push(9, 0)).is_empty());
        assert_eq!(buffer.stats().stale_dropped, 1);
    }

    #[test]
    fn duplicates_fire_event_and_are_dropped_by_default() {
        let buffer = ReorderBuffer::new(ReorderConfig::default(), 0);
        buffer.push(0, 7);
        let events = buffer.push(0, 7);
        assert_eq!(events, vec![ReorderEvent::Duplicate(0)]);
        assert_eq!(buffer.stats().duplicates, 1);
        assert_eq!(buffer.stats().delivered, 1);
    }

    #[test]
    fn large_gap_skips_forward_with_gap_events() {
        let config = ReorderConfig {
            max_sequence_gap: 4,
            ..ReorderConfig::default()
        };
        let buffer = ReorderBuffer::new(config, 0);
        buffer.push(0, 0);
        let events = buffer.push(10, 10);

        let gaps: Vec<u16> = events
            .iter()
            .filter_map(|event| match event {
                ReorderEvent::Gap(sequence) => Some(*sequence),
                _ => None,
            })
            .collect();
        assert_eq!(gaps, (1..10).collect::<Vec<u16>>());
        assert_eq!(delivered(&events), vec![10]);
        assert_eq!(buffer.next_expected(), 11);
        assert_eq!(buffer.stats().gaps_detected, 9);
    }

    #[test]
    fn sequences_wrap_cleanly() {
        let buffer = ReorderBuffer::new(ReorderConfig::default(), 65534);
        let mut order = Vec::new();
        for sequence in [65534u16, 65535, 0, 1] {
            order.extend(delivered(&buffer.push(sequence, 0u32)));
        }
        assert_eq!(order, vec![65534, 65535, 0, 1]);
    }

    #[test]
    fn timeout_forces_skip_forward() {
        let config = ReorderConfig {
            delivery_timeout: Duration::from_millis(10),
            ..ReorderConfig::default()
        };
        let buffer = ReorderBuffer::new(config, 0);
        // 0 never arrives; 1 and 2 wait in the buffer.
        buffer.push(1, 1u32);
        buffer.push(2, 2u32);
        assert_eq!(buffer.buffered_len(), 2);

        std::thread::sleep(Duration::from_millis(25));
        let events = buffer.poll_timeouts();
        assert_eq!(
            events,
            vec![
                ReorderEvent::Gap(0),
                ReorderEvent::Delivered(1, 1),
                ReorderEvent::Delivered(2, 2),
            ]
        );
        assert_eq!(buffer.buffered_len(), 0);
        assert_eq!(buffer.next_expected(), 3);
    }

    proptest::proptest! {
        // Whatever arrival order the wire produces, the delivered
        // subsequence is wrap-aware monotone and free of duplicates.
        #[test]
        fn delivered_subsequence_is_monotone(
            sequences in proptest::collection::vec(0u16..48, 1..256),
        ) {
            let buffer = ReorderBuffer::new(ReorderConfig::default(), 0);
            let mut delivered = Vec::new();
            for sequence in sequences {
                for event in buffer.push(sequence, sequence) {
                    if let ReorderEvent::Delivered(s, _) = event {
                        delivered.push(s);
                    }
                }
            }
            for pair in delivered.windows(2) {
                proptest::prop_assert!(sequence_before(pair[0], pair[1]));
            }
            let mut seen = std::collections::HashSet::new();
            for sequence in &delivered {
                proptest::prop_assert!(seen.insert(*sequence));
            }
        }
    }

    #[test]
    fn timer_drives_poll() {
        let buffer = Arc::new(ReorderBuffer::new(
            ReorderConfig {
                delivery_timeout: Duration::from_millis(5),
                ..ReorderConfig::default()
            },
            0,
        ));
        buffer.push(2, 2u32);

        let poller = Arc::clone(&buffer);
        let events: Arc<Mutex<Vec<ReorderEvent<u32>>>> = Arc::default();
        let sink = Arc::clone(&events);
        let mut timer = ReorderTimer::spawn(Duration::from_millis(5), move || {
            sink.lock().extend(poller.poll_timeouts());
        });

        let deadline = Instant::now() + Duration::from_secs(1);
        while events.lock().is_empty() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        timer.stop();
        let events = events.lock();
        assert!(events.contains(&ReorderEvent::Delivered(2, 2)));
    }
}

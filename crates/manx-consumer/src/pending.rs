// Ack and redelivery bookkeeping: in-flight deliveries, the retry heap,
// and the ack floor.
use manx_api::SequencePair;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

/// One in-flight (delivered but unacknowledged) message.
#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub stream_seq: u64,
    pub consumer_seq: u64,
    pub first_delivered_micros: u64,
    pub last_delivered: Instant,
    pub num_delivered: u64,
    pub next_retry: Instant,
}

/// Tracks pending deliveries with a min-heap keyed by `next_retry`.
///
/// Heap entries are never updated in place; acks and deadline changes
/// leave stale entries behind, which `due` discards lazily by checking
/// the live deadline in the pending map. The heap head therefore always
/// reflects the earliest live deadline: a freshly delivered message on
/// its first backoff step fires before an older message parked on a late
/// step.
#[derive(Debug)]
pub struct RedeliveryEngine {
    pending: HashMap<u64, PendingEntry>,
    retry_heap: BinaryHeap<Reverse<(Instant, u64)>>,
    // Messages whose retry fired, waiting for an eligible request.
    redelivery_queue: VecDeque<u64>,
    // Acked consumer sequences above the floor, with their stream seqs.
    acked_above_floor: BTreeMap<u64, u64>,
    ack_floor: SequencePair,
    redeliveries: u64,
}

impl RedeliveryEngine {
    pub fn new() -> Self {
        Self {
            pending: HashMap::new(),
            retry_heap: BinaryHeap::new(),
            redelivery_queue: VecDeque::new(),
            acked_above_floor: BTreeMap::new(),
            ack_floor: SequencePair::default(),
            redeliveries: 0,
        }
    }

    pub fn num_ack_pending(&self) -> u64 {
        self.pending.len() as u64
    }

    pub fn num_redelivered(&self) -> u64 {
        self.redeliveries
    }

    pub fn ack_floor(&self) -> SequencePair {
        self.ack_floor
    }

    pub fn get(&self, stream_seq: u64) -> Option<&PendingEntry> {
        self.pending.get(&stream_seq)
    }

    /// Records a delivery attempt and schedules its retry deadline.
    /// Returns the updated attempt count.
    pub fn record_delivery(
        &mut self,
        stream_seq: u64,
        consumer_seq: u64,
        timestamp_micros: u64,
        now: Instant,
        backoff: Duration,
    ) -> u64 {
        if self.pending.contains_key(&stream_seq) {
            self.redeliveries += 1;
        }
        let entry = self
            .pending
            .entry(stream_seq)
            .and_modify(|entry| {
                entry.num_delivered += 1;
                entry.last_delivered = now;
            })
            .or_insert(PendingEntry {
                stream_seq,
                consumer_seq,
                first_delivered_micros: timestamp_micros,
                last_delivered: now,
                num_delivered: 1,
                next_retry: now,
            });
        entry.next_retry = now + backoff;
        let deadline = entry.next_retry;
        let attempts = entry.num_delivered;
        self.retry_heap.push(Reverse((deadline, stream_seq)));
        attempts
    }

    /// Acknowledges one message, advancing the floor through any
    /// contiguous acked prefix.
    pub fn ack(&mut self, stream_seq: u64) -> Option<PendingEntry> {
        let entry = self.pending.remove(&stream_seq)?;
        self.redelivery_queue.retain(|&seq| seq != stream_seq);
        self.acked_above_floor
            .insert(entry.consumer_seq, entry.stream_seq);
        self.advance_floor();
        Some(entry)
    }

    fn advance_floor(&mut self) {
        while let Some((&consumer_seq, &stream_seq)) = self.acked_above_floor.first_key_value() {
            if consumer_seq != self.ack_floor.consumer_seq + 1 {
                break;
            }
            self.ack_floor = SequencePair {
                consumer_seq,
                stream_seq,
            };
            self.acked_above_floor.remove(&consumer_seq);
        }
    }

    /// Cumulative ack: acknowledges every pending delivery with a
    /// consumer sequence at or below `consumer_seq`.
    pub fn ack_all_through(&mut self, consumer_seq: u64) -> Vec<PendingEntry> {
        let doomed: Vec<u64> = self
            .pending
            .values()
            .filter(|entry| entry.consumer_seq <= consumer_seq)
            .map(|entry| entry.stream_seq)
            .collect();
        doomed.into_iter().filter_map(|seq| self.ack(seq)).collect()
    }

    /// Negative ack: pulls the retry deadline to `now + delay`.
    pub fn nak(&mut self, stream_seq: u64, delay: Duration, now: Instant) -> bool {
        match self.pending.get_mut(&stream_seq) {
            Some(entry) => {
                entry.next_retry = now + delay;
                let deadline = entry.next_retry;
                self.retry_heap.push(Reverse((deadline, stream_seq)));
                true
            }
            None => false,
        }
    }

    /// Working-signal: extends the deadline without counting an attempt.
    pub fn in_progress(&mut self, stream_seq: u64, ack_wait: Duration, now: Instant) -> bool {
        match self.pending.get_mut(&stream_seq) {
            Some(entry) => {
                entry.next_retry = now + ack_wait;
                let deadline = entry.next_retry;
                self.redelivery_queue.retain(|&seq| seq != stream_seq);
                self.retry_heap.push(Reverse((deadline, stream_seq)));
                true
            }
            None => false,
        }
    }

    /// Drops a pending delivery without redelivering, advancing the floor
    /// as if it had been acknowledged.
    pub fn terminate(&mut self, stream_seq: u64) -> Option<PendingEntry> {
        self.ack(stream_seq)
    }

    /// Moves every entry whose deadline has passed onto the redelivery
    /// queue. Stale heap entries are discarded against the live deadline.
    pub fn collect_due(&mut self, now: Instant) {
        while let Some(Reverse((deadline, stream_seq))) = self.retry_heap.peek().copied() {
            if deadline > now {
                break;
            }
            self.retry_heap.pop();
            let Some(entry) = self.pending.get(&stream_seq) else {
                continue;
            };
            if entry.next_retry > now {
                continue;
            }
            if !self.redelivery_queue.contains(&stream_seq) {
                self.redelivery_queue.push_back(stream_seq);
            }
        }
    }

    /// Next message owed a redelivery, if any retry deadline has fired.
    pub fn pop_redelivery(&mut self) -> Option<u64> {
        self.redelivery_queue.pop_front()
    }

    pub fn push_front_redelivery(&mut self, stream_seq: u64) {
        self.redelivery_queue.push_front(stream_seq);
    }

    pub fn has_due_redeliveries(&self) -> bool {
        !self.redelivery_queue.is_empty()
    }

    /// Earliest live retry deadline, for the consumer timer.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((deadline, stream_seq))) = self.retry_heap.peek().copied() {
            match self.pending.get(&stream_seq) {
                Some(entry) if entry.next_retry == deadline => return Some(deadline),
                // Stale: acked or rescheduled since this entry was pushed.
                _ => {
                    self.retry_heap.pop();
                }
            }
        }
        None
    }

    /// Drops pending entries whose messages were removed from the log
    /// (purge). Returns the dropped stream sequences.
    pub fn drop_missing(&mut self, removed: &[u64]) -> Vec<u64> {
        let mut dropped = Vec::new();
        for &stream_seq in removed {
            if self.pending.remove(&stream_seq).is_some() {
                self.redelivery_queue.retain(|&seq| seq != stream_seq);
                dropped.push(stream_seq);
            }
        }
        dropped
    }

    /// Fast-forwards the floor when dropped entries left a gap that can
    /// never be acked.
    pub fn fast_forward_floor(&mut self, delivered: SequencePair) {
        if self.pending.is_empty() && self.acked_above_floor.is_empty() {
            if delivered.consumer_seq > self.ack_floor.consumer_seq {
                self.ack_floor = delivered;
            }
        } else {
            self.advance_floor();
        }
    }
}

impl Default for RedeliveryEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STEP: Duration = Duration::from_secs(1);

    #[tokio::test(start_paused = true)]
    async fn ack_advances_contiguous_floor() {
        let mut engine = RedeliveryEngine::new();
        let now = Instant::now();
        for (stream_seq, consumer_seq) in [(10, 1), (11, 2), (12, 3)] {
            engine.record_delivery(stream_seq, consumer_seq, 0, now, STEP);
        }
        engine.ack(11);
        // Out-of-order ack does not move the floor past the gap.
        assert_eq!(engine.ack_floor().consumer_seq, 0);
        engine.ack(10);
        assert_eq!(
            engine.ack_floor(),
            SequencePair {
                consumer_seq: 2,
                stream_seq: 11
            }
        );
        engine.ack(12);
        assert_eq!(engine.ack_floor().consumer_seq, 3);
        assert_eq!(engine.num_ack_pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn ack_all_through_is_cumulative() {
        let mut engine = RedeliveryEngine::new();
        let now = Instant::now();
        for (stream_seq, consumer_seq) in [(1, 1), (2, 2), (3, 3)] {
            engine.record_delivery(stream_seq, consumer_seq, 0, now, STEP);
        }
        let acked = engine.ack_all_through(2);
        assert_eq!(acked.len(), 2);
        assert_eq!(engine.ack_floor().consumer_seq, 2);
        assert_eq!(engine.num_ack_pending(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn due_entries_move_to_redelivery_queue() {
        let mut engine = RedeliveryEngine::new();
        let now = Instant::now();
        engine.record_delivery(1, 1, 0, now, STEP);
        engine.collect_due(now);
        assert!(!engine.has_due_redeliveries());
        engine.collect_due(now + STEP);
        assert_eq!(engine.pop_redelivery(), Some(1));
        assert_eq!(engine.pop_redelivery(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn new_delivery_shortens_next_deadline() {
        let mut engine = RedeliveryEngine::new();
        let now = Instant::now();
        // Old message parked on a late 10s backoff step.
        engine.record_delivery(1, 1, 0, now, Duration::from_secs(10));
        // New message delivered with a 2s first step.
        engine.record_delivery(2, 2, 0, now, Duration::from_secs(2));
        assert_eq!(engine.next_deadline(), Some(now + Duration::from_secs(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_heap_entries_are_discarded() {
        let mut engine = RedeliveryEngine::new();
        let now = Instant::now();
        engine.record_delivery(1, 1, 0, now, STEP);
        engine.in_progress(1, Duration::from_secs(30), now);
        // The original 1s entry is stale; the live deadline is 30s out.
        assert_eq!(engine.next_deadline(), Some(now + Duration::from_secs(30)));
        engine.collect_due(now + STEP);
        assert!(!engine.has_due_redeliveries());
    }

    #[tokio::test(start_paused = true)]
    async fn nak_reschedules_immediately() {
        let mut engine = RedeliveryEngine::new();
        let now = Instant::now();
        engine.record_delivery(1, 1, 0, now, Duration::from_secs(30));
        engine.nak(1, Duration::ZERO, now);
        engine.collect_due(now);
        assert_eq!(engine.pop_redelivery(), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn redelivery_increments_attempts() {
        let mut engine = RedeliveryEngine::new();
        let now = Instant::now();
        assert_eq!(engine.record_delivery(1, 1, 0, now, STEP), 1);
        assert_eq!(engine.record_delivery(1, 1, 0, now + STEP, STEP), 2);
        assert_eq!(engine.num_redelivered(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn drop_missing_clears_purged_sequences() {
        let mut engine = RedeliveryEngine::new();
        let now = Instant::now();
        engine.record_delivery(1, 1, 0, now, STEP);
        engine.record_delivery(2, 2, 0, now, STEP);
        let dropped = engine.drop_missing(&[1, 7]);
        assert_eq!(dropped, vec![1]);
        assert_eq!(engine.num_ack_pending(), 1);
        engine.ack(2);
        engine.fast_forward_floor(SequencePair {
            consumer_seq: 2,
            stream_seq: 2,
        });
        assert_eq!(engine.ack_floor().consumer_seq, 2);
    }
}

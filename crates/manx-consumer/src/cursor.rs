// Delivery cursor: tracks the next stream sequence to attempt for a
// consumer, given its filter set and start policy.
use crate::config::StartPoint;
use manx_stream::{Message, StreamLog};
use manx_subject::FilterSet;
use std::collections::VecDeque;

/// The cursor only moves forward, and only when a delivery has actually
/// been recorded; computing a candidate never advances it.
#[derive(Debug)]
pub struct DeliveryCursor {
    next_seq: u64,
    // Seed sequences for last-per-subject starts, ascending. Once drained
    // the cursor scans the log normally.
    skip_list: Option<VecDeque<u64>>,
}

impl DeliveryCursor {
    /// Positions a new cursor. Returns the cursor and the stream sequence
    /// the consumer reports as already "delivered" before its first real
    /// delivery (one below the first deliverable message).
    pub fn new(start: StartPoint, stream: &StreamLog, filters: &FilterSet) -> (Self, u64) {
        let from_seq = match start {
            StartPoint::All => stream.first_seq(),
            StartPoint::New => stream.last_seq() + 1,
            StartPoint::Seq(seq) => seq.max(stream.first_seq()),
            StartPoint::Time(micros) => stream
                .first_seq_at_or_after(micros)
                .unwrap_or(stream.last_seq() + 1),
            StartPoint::Last => stream
                .last_seqs_per_subject(filters)
                .last()
                .copied()
                .unwrap_or(stream.last_seq() + 1),
            StartPoint::LastPerSubject => {
                let seeds = stream.last_seqs_per_subject(filters);
                let first = seeds.first().copied().unwrap_or(stream.last_seq() + 1);
                // Seeds are served off the skip list; the scan position
                // parks past the current head so later arrivals follow.
                let cursor = Self {
                    next_seq: stream.last_seq() + 1,
                    skip_list: Some(seeds.into()),
                };
                let delivered = first.saturating_sub(1);
                return (cursor, delivered);
            }
        };
        // Skip leading non-matching messages so num_pending and the
        // reported delivered sequence reflect the filter set.
        let next_seq = match stream.next_matching(from_seq, filters) {
            Some(message) => message.seq,
            None => stream.last_seq() + 1,
        };
        (
            Self {
                next_seq,
                skip_list: None,
            },
            next_seq.saturating_sub(1),
        )
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Lowest not-yet-delivered matching message at or above the cursor,
    /// or None when the cursor is parked at the high-water mark.
    pub fn next_deliverable(&mut self, stream: &StreamLog, filters: &FilterSet) -> Option<Message> {
        if let Some(skip_list) = &mut self.skip_list {
            // Seeds may have been purged since the cursor was positioned.
            while let Some(&seq) = skip_list.front() {
                match stream.get(seq) {
                    Some(message) => return Some(message),
                    None => {
                        skip_list.pop_front();
                    }
                }
            }
            self.skip_list = None;
        }
        stream.next_matching(self.next_seq, filters)
    }

    /// Moves the cursor past `seq` after the delivery was recorded.
    pub fn advance_past(&mut self, seq: u64) {
        if let Some(skip_list) = &mut self.skip_list {
            skip_list.retain(|&pending| pending != seq);
            if skip_list.is_empty() {
                self.skip_list = None;
            }
        }
        self.next_seq = self.next_seq.max(seq + 1);
    }

    /// Matching messages not yet reached by the cursor.
    pub fn num_pending(&self, stream: &StreamLog, filters: &FilterSet) -> u64 {
        if let Some(skip_list) = &self.skip_list {
            return skip_list
                .iter()
                .filter(|seq| stream.get(**seq).is_some())
                .count() as u64;
        }
        stream.num_pending_from(self.next_seq, filters)
    }
}

// In-memory append-only stream log with sequence-addressed messages.
//
// The log is the capability handed to consumers: they read messages by
// sequence, watch the tail for new appends, and (for work-queue retention)
// remove messages once acknowledged. Sequences are 1-based and strictly
// increasing; purges advance the floor without renumbering.
use bytes::Bytes;
use manx_subject::FilterSet;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::watch;

pub type Result<T> = std::result::Result<T, StreamError>;
pub type Headers = HashMap<String, String>;

#[derive(thiserror::Error, Debug)]
pub enum StreamError {
    #[error("message not found: seq {0}")]
    MessageNotFound(u64),
}

/// How the stream disposes of messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RetentionPolicy {
    /// Messages are retained until stream limits evict them.
    #[default]
    Limits,
    /// Messages are removed once acknowledged; consumer filters on the
    /// stream must be pairwise non-overlapping.
    WorkQueue,
}

/// Stream-level defaults applied to consumers that leave the matching
/// fields unset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerLimits {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inactive_threshold_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_ack_pending: Option<u64>,
}

impl ConsumerLimits {
    pub fn is_empty(&self) -> bool {
        self.inactive_threshold_ms.is_none() && self.max_ack_pending.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    pub name: String,
    pub subjects: Vec<String>,
    #[serde(default)]
    pub retention: RetentionPolicy,
    /// Cap on pull-request batch sizes for consumers of this stream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_request_batch: Option<u64>,
    #[serde(default)]
    pub consumer_limits: ConsumerLimits,
}

impl StreamConfig {
    pub fn new(name: impl Into<String>, subjects: Vec<String>) -> Self {
        Self {
            name: name.into(),
            subjects,
            retention: RetentionPolicy::default(),
            max_request_batch: None,
            consumer_limits: ConsumerLimits::default(),
        }
    }

    pub fn work_queue(mut self) -> Self {
        self.retention = RetentionPolicy::WorkQueue;
        self
    }
}

#[derive(Debug, Clone)]
pub struct Message {
    pub seq: u64,
    pub subject: String,
    pub headers: Headers,
    pub payload: Bytes,
    pub timestamp_micros: u64,
}

#[derive(Debug)]
struct LogState {
    // Sequence-keyed so work-queue removal leaves holes without shifting.
    entries: BTreeMap<u64, Message>,
    next_seq: u64,
}

/// Append-only log for one stream.
#[derive(Debug)]
pub struct StreamLog {
    config: StreamConfig,
    state: Mutex<LogState>,
    // Last assigned sequence, observed by consumers waiting for appends.
    tail_tx: watch::Sender<u64>,
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_micros() as u64)
        .unwrap_or(0)
}

impl StreamLog {
    pub fn new(config: StreamConfig) -> Self {
        let (tail_tx, _) = watch::channel(0);
        Self {
            config,
            state: Mutex::new(LogState {
                entries: BTreeMap::new(),
                next_seq: 1,
            }),
            tail_tx,
        }
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn retention(&self) -> RetentionPolicy {
        self.config.retention
    }

    /// Appends a message and returns its sequence.
    pub fn append(&self, subject: impl Into<String>, headers: Headers, payload: Bytes) -> u64 {
        self.append_at(subject, headers, payload, now_micros())
    }

    /// Appends with an explicit timestamp, for replay and tests.
    pub fn append_at(
        &self,
        subject: impl Into<String>,
        headers: Headers,
        payload: Bytes,
        timestamp_micros: u64,
    ) -> u64 {
        let seq = {
            let mut state = self.state.lock().expect("log lock");
            let seq = state.next_seq;
            state.next_seq += 1;
            state.entries.insert(
                seq,
                Message {
                    seq,
                    subject: subject.into(),
                    headers,
                    payload,
                    timestamp_micros,
                },
            );
            seq
        };
        // Signal after the lock is dropped; receivers re-read state anyway.
        self.tail_tx.send_replace(seq);
        seq
    }

    pub fn get(&self, seq: u64) -> Option<Message> {
        let state = self.state.lock().expect("log lock");
        state.entries.get(&seq).cloned()
    }

    /// Lowest live sequence, or `next_seq` when the log is empty.
    pub fn first_seq(&self) -> u64 {
        let state = self.state.lock().expect("log lock");
        state
            .entries
            .keys()
            .next()
            .copied()
            .unwrap_or(state.next_seq)
    }

    /// Highest assigned sequence; 0 before the first append.
    pub fn last_seq(&self) -> u64 {
        let state = self.state.lock().expect("log lock");
        state.next_seq - 1
    }

    pub fn len(&self) -> usize {
        let state = self.state.lock().expect("log lock");
        state.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Watch the tail sequence; changes whenever a message is appended.
    pub fn watch_tail(&self) -> watch::Receiver<u64> {
        self.tail_tx.subscribe()
    }

    /// First live message at or above `seq` whose subject passes `filters`.
    pub fn next_matching(&self, seq: u64, filters: &FilterSet) -> Option<Message> {
        let state = self.state.lock().expect("log lock");
        state
            .entries
            .range(seq..)
            .find(|(_, message)| filters.matches(&message.subject))
            .map(|(_, message)| message.clone())
    }

    /// Count of live messages at or above `seq` matching `filters`.
    pub fn num_pending_from(&self, seq: u64, filters: &FilterSet) -> u64 {
        let state = self.state.lock().expect("log lock");
        state
            .entries
            .range(seq..)
            .filter(|(_, message)| filters.matches(&message.subject))
            .count() as u64
    }

    /// First sequence whose timestamp is at or after `timestamp_micros`.
    pub fn first_seq_at_or_after(&self, timestamp_micros: u64) -> Option<u64> {
        let state = self.state.lock().expect("log lock");
        state
            .entries
            .values()
            .find(|message| message.timestamp_micros >= timestamp_micros)
            .map(|message| message.seq)
    }

    /// Newest sequence per matching subject, ascending. Seeds the
    /// last-per-subject deliver policy.
    pub fn last_seqs_per_subject(&self, filters: &FilterSet) -> Vec<u64> {
        let state = self.state.lock().expect("log lock");
        let mut last: HashMap<&str, u64> = HashMap::new();
        for message in state.entries.values() {
            if filters.matches(&message.subject) {
                last.insert(message.subject.as_str(), message.seq);
            }
        }
        let mut seqs: Vec<u64> = last.into_values().collect();
        seqs.sort_unstable();
        seqs
    }

    /// Removes a single message, e.g. after a work-queue acknowledgement.
    pub fn remove(&self, seq: u64) -> Result<()> {
        let mut state = self.state.lock().expect("log lock");
        state
            .entries
            .remove(&seq)
            .map(|_| ())
            .ok_or(StreamError::MessageNotFound(seq))
    }

    /// Drops every message matching `subject` (all messages when `None`)
    /// and returns the removed sequences in ascending order.
    pub fn purge(&self, subject: Option<&str>) -> Vec<u64> {
        let removed = {
            let mut state = self.state.lock().expect("log lock");
            let doomed: Vec<u64> = match subject {
                Some(subject) => {
                    let filters = match FilterSet::new([subject]) {
                        Ok(filters) => filters,
                        Err(_) => return Vec::new(),
                    };
                    state
                        .entries
                        .values()
                        .filter(|message| filters.matches(&message.subject))
                        .map(|message| message.seq)
                        .collect()
                }
                None => state.entries.keys().copied().collect(),
            };
            for seq in &doomed {
                state.entries.remove(seq);
            }
            doomed
        };
        if !removed.is_empty() {
            // Wake consumers so parked cursors can fast-forward.
            self.tail_tx.send_modify(|_| {});
        }
        removed
    }
}

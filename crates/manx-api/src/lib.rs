// JSON wire surface of the consumer API: request/response bodies, the
// subject hierarchy they travel on, and the status headers replies carry.
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub mod headers;
pub mod subjects;

/// Ceiling on priority group name length.
pub const MAX_GROUP_NAME_LEN: usize = 24;

/// Group names are restricted to a conservative charset so they can be
/// embedded in subjects and headers without quoting.
pub fn valid_group_name(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_GROUP_NAME_LEN {
        return false;
    }
    name.chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '=' | '_' | '.' | '-'))
}

/// Where the delivery cursor starts for a new consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeliverPolicy {
    #[default]
    All,
    Last,
    New,
    ByStartSequence,
    ByStartTime,
    LastPerSubject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AckPolicy {
    None,
    All,
    #[default]
    Explicit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PriorityPolicy {
    #[default]
    None,
    PinnedClient,
    Overflow,
}

/// Consumer configuration as it travels on the wire. Durations are
/// explicit `*_ms` fields and timestamps `*_micros`, so the JSON body is
/// unambiguous without a clock convention.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ConsumerConfig {
    /// Ephemeral consumer name; exactly one of `name`/`durable_name`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub durable_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Push target; when set the consumer is push-based.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deliver_subject: Option<String>,

    #[serde(default)]
    pub deliver_policy: DeliverPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opt_start_seq: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opt_start_time_micros: Option<u64>,

    #[serde(default)]
    pub ack_policy: AckPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack_wait_ms: Option<u64>,
    /// Max delivery attempts per message; 0 or -1 means unlimited.
    #[serde(default)]
    pub max_deliver: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub backoff_ms: Vec<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_subject: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filter_subjects: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_waiting: Option<u64>,
    /// Cap on unacknowledged deliveries; -1 means unlimited.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_ack_pending: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inactive_threshold_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_request_batch: Option<u64>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub priority_groups: Vec<String>,
    #[serde(default)]
    pub priority_policy: PriorityPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pinned_ttl_ms: Option<u64>,
}

/// Action semantics for consumer create requests. Serialized as a plain
/// string; an absent or empty action means create-or-update, anything
/// else unknown is a hard parse error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConsumerAction {
    Create,
    Update,
    #[default]
    CreateOrUpdate,
}

impl Serialize for ConsumerAction {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let value = match self {
            ConsumerAction::Create => "create",
            ConsumerAction::Update => "update",
            ConsumerAction::CreateOrUpdate => "",
        };
        serializer.serialize_str(value)
    }
}

impl<'de> Deserialize<'de> for ConsumerAction {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        match value.as_str() {
            "create" => Ok(ConsumerAction::Create),
            "update" => Ok(ConsumerAction::Update),
            "" => Ok(ConsumerAction::CreateOrUpdate),
            other => Err(D::Error::custom(format!("unknown consumer action {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateConsumerRequest {
    pub stream: String,
    #[serde(default)]
    pub action: ConsumerAction,
    pub config: ConsumerConfig,
    #[serde(default)]
    pub pedantic: bool,
}

fn default_batch() -> u64 {
    1
}

/// Body of a pull request for the next batch of messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NextRequest {
    #[serde(default = "default_batch")]
    pub batch: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_ms: Option<u64>,
    #[serde(default)]
    pub no_wait: bool,
    /// Priority group this request belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// Pin id echoed back by a pinned client.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_pending: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_ack_pending: Option<u64>,
}

impl Default for NextRequest {
    fn default() -> Self {
        Self {
            batch: default_batch(),
            expires_ms: None,
            no_wait: false,
            group: None,
            id: None,
            min_pending: None,
            min_ack_pending: None,
        }
    }
}

impl NextRequest {
    /// True when the request carries any priority-related field.
    pub fn has_priority_fields(&self) -> bool {
        self.group.is_some()
            || self.id.is_some()
            || self.min_pending.is_some()
            || self.min_ack_pending.is_some()
    }

    pub fn has_overflow_thresholds(&self) -> bool {
        self.min_pending.is_some() || self.min_ack_pending.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnpinRequest {
    #[serde(default)]
    pub group: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SequencePair {
    pub consumer_seq: u64,
    pub stream_seq: u64,
}

/// Snapshot of a consumer's delivery state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerInfo {
    pub stream: String,
    pub name: String,
    pub created_micros: u64,
    pub config: ConsumerConfig,
    pub delivered: SequencePair,
    pub ack_floor: SequencePair,
    pub num_pending: u64,
    pub num_ack_pending: u64,
    pub num_redelivered: u64,
    pub num_waiting: u64,
}

/// Advisory bodies published on the advisory subject hierarchy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AdvisoryEvent {
    Pinned {
        stream: String,
        consumer: String,
        group: String,
        pin_id: String,
    },
    Unpinned {
        stream: String,
        consumer: String,
        group: String,
    },
    MaxDeliveries {
        stream: String,
        consumer: String,
        stream_seq: u64,
        deliveries: u64,
    },
    Terminated {
        stream: String,
        consumer: String,
        consumer_seq: u64,
        stream_seq: u64,
        deliveries: u64,
    },
    PendingDropped {
        stream: String,
        consumer: String,
        stream_seqs: Vec<u64>,
    },
}

impl AdvisoryEvent {
    /// Kind token used in the advisory subject.
    pub fn kind(&self) -> &'static str {
        match self {
            AdvisoryEvent::Pinned { .. } => subjects::ADVISORY_KIND_PINNED,
            AdvisoryEvent::Unpinned { .. } => subjects::ADVISORY_KIND_UNPINNED,
            AdvisoryEvent::MaxDeliveries { .. } => subjects::ADVISORY_KIND_MAX_DELIVERIES,
            AdvisoryEvent::Terminated { .. } => subjects::ADVISORY_KIND_TERMINATED,
            AdvisoryEvent::PendingDropped { .. } => subjects::ADVISORY_KIND_PENDING_DROPPED,
        }
    }

    pub fn subject(&self) -> String {
        let (stream, consumer) = match self {
            AdvisoryEvent::Pinned { stream, consumer, .. }
            | AdvisoryEvent::Unpinned { stream, consumer, .. }
            | AdvisoryEvent::MaxDeliveries { stream, consumer, .. }
            | AdvisoryEvent::Terminated { stream, consumer, .. }
            | AdvisoryEvent::PendingDropped { stream, consumer, .. } => (stream, consumer),
        };
        subjects::advisory(self.kind(), stream, consumer)
    }
}

// Consumer configuration validation and stream-limit resolution.
use crate::error::{ConsumerError, Result};
use manx_api::{AckPolicy, ConsumerConfig, DeliverPolicy, PriorityPolicy, valid_group_name};
use manx_stream::StreamConfig;
use manx_subject::FilterSet;
use std::time::Duration;

pub const DEFAULT_ACK_WAIT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_ACK_PENDING: u64 = 1000;
pub const DEFAULT_MAX_WAITING: usize = 512;
pub const DEFAULT_PINNED_TTL: Duration = Duration::from_secs(120);

/// Where the cursor starts, resolved from the deliver policy tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPoint {
    All,
    Last,
    New,
    Seq(u64),
    Time(u64),
    LastPerSubject,
}

/// A consumer config that passed validation, with stream-level defaults
/// applied and durations resolved. The submitted wire config is retained
/// for the byte-identical comparison create-action semantics require.
#[derive(Debug, Clone)]
pub struct ValidatedConfig {
    pub submitted: ConsumerConfig,
    pub name: String,
    pub durable: bool,
    pub filters: FilterSet,
    pub start: StartPoint,
    pub ack_policy: AckPolicy,
    pub ack_wait: Duration,
    /// None means unlimited attempts.
    pub max_deliver: Option<u64>,
    pub backoff: Vec<Duration>,
    pub max_waiting: usize,
    /// None means unlimited outstanding acks.
    pub max_ack_pending: Option<u64>,
    pub inactive_threshold: Option<Duration>,
    pub max_request_batch: Option<u64>,
    pub priority_policy: PriorityPolicy,
    pub priority_groups: Vec<String>,
    pub pinned_ttl: Duration,
    pub deliver_subject: Option<String>,
}

impl ValidatedConfig {
    /// The backoff step applied before the `num_delivered`-th redelivery.
    /// An empty backoff table falls back to `ack_wait`.
    pub fn backoff_step(&self, num_delivered: u64) -> Duration {
        if self.backoff.is_empty() {
            return self.ack_wait;
        }
        let index = (num_delivered.saturating_sub(1) as usize).min(self.backoff.len() - 1);
        self.backoff[index]
    }

    pub fn is_push(&self) -> bool {
        self.deliver_subject.is_some()
    }
}

fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && !name
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '.' | '*' | '>'))
}

/// Validates a submitted config against the stream it targets.
///
/// In pedantic mode any field whose effective value would be derived from
/// a stream-level default is rejected instead of silently filled in.
pub fn validate(
    config: &ConsumerConfig,
    stream: &StreamConfig,
    pedantic: bool,
) -> Result<ValidatedConfig> {
    let (name, durable) = match (&config.name, &config.durable_name) {
        (Some(name), Some(durable)) if name != durable => {
            return Err(ConsumerError::InvalidConfig(format!(
                "name {name:?} does not match durable name {durable:?}"
            )));
        }
        (_, Some(durable)) => (durable.clone(), true),
        (Some(name), None) => (name.clone(), false),
        (None, None) => (uuid::Uuid::new_v4().simple().to_string(), false),
    };
    if !valid_name(&name) {
        return Err(ConsumerError::InvalidConfig(format!(
            "invalid consumer name {name:?}"
        )));
    }

    let filters = match (&config.filter_subject, config.filter_subjects.as_slice()) {
        (Some(_), [_, ..]) => {
            return Err(ConsumerError::InvalidConfig(
                "both filter_subject and filter_subjects are set".to_string(),
            ));
        }
        (Some(subject), []) => FilterSet::new([subject.clone()]),
        (None, subjects) => FilterSet::new(subjects.iter().cloned()),
    }
    .map_err(|err| ConsumerError::InvalidConfig(err.to_string()))?;

    let start = match config.deliver_policy {
        DeliverPolicy::All => StartPoint::All,
        DeliverPolicy::Last => StartPoint::Last,
        DeliverPolicy::New => StartPoint::New,
        DeliverPolicy::LastPerSubject => StartPoint::LastPerSubject,
        DeliverPolicy::ByStartSequence => {
            let seq = config.opt_start_seq.ok_or_else(|| {
                ConsumerError::InvalidConfig(
                    "deliver policy by_start_sequence requires opt_start_seq".to_string(),
                )
            })?;
            StartPoint::Seq(seq)
        }
        DeliverPolicy::ByStartTime => {
            let time = config.opt_start_time_micros.ok_or_else(|| {
                ConsumerError::InvalidConfig(
                    "deliver policy by_start_time requires opt_start_time_micros".to_string(),
                )
            })?;
            StartPoint::Time(time)
        }
    };
    if config.opt_start_seq.is_some() && config.deliver_policy != DeliverPolicy::ByStartSequence {
        return Err(ConsumerError::InvalidConfig(
            "opt_start_seq requires deliver policy by_start_sequence".to_string(),
        ));
    }
    if config.opt_start_time_micros.is_some()
        && config.deliver_policy != DeliverPolicy::ByStartTime
    {
        return Err(ConsumerError::InvalidConfig(
            "opt_start_time_micros requires deliver policy by_start_time".to_string(),
        ));
    }

    let max_deliver = match config.max_deliver {
        d if d <= 0 => None,
        d => Some(d as u64),
    };
    if let Some(max) = max_deliver {
        if config.backoff_ms.len() as u64 > max {
            return Err(ConsumerError::InvalidConfig(format!(
                "max deliver is required to be >= length of backoff values ({} < {})",
                max,
                config.backoff_ms.len()
            )));
        }
    }

    if pedantic && !config.backoff_ms.is_empty() && config.ack_wait_ms.is_none() {
        return Err(ConsumerError::Pedantic(
            "ack_wait would be derived from the first backoff value".to_string(),
        ));
    }
    let ack_wait = match config.ack_wait_ms {
        Some(ms) => Duration::from_millis(ms),
        None => config
            .backoff_ms
            .first()
            .map(|ms| Duration::from_millis(*ms))
            .unwrap_or(DEFAULT_ACK_WAIT),
    };
    let backoff: Vec<Duration> = config
        .backoff_ms
        .iter()
        .map(|ms| Duration::from_millis(*ms))
        .collect();

    let limits = &stream.consumer_limits;
    let inactive_threshold = match (config.inactive_threshold_ms, limits.inactive_threshold_ms) {
        (Some(ms), _) => Some(Duration::from_millis(ms)),
        (None, Some(ms)) => {
            if pedantic {
                return Err(ConsumerError::Pedantic(
                    "inactive_threshold would be derived from stream consumer limits".to_string(),
                ));
            }
            Some(Duration::from_millis(ms))
        }
        (None, None) => None,
    };
    let max_ack_pending = match (config.max_ack_pending, limits.max_ack_pending) {
        (Some(-1), _) => None,
        (Some(value), _) if value < -1 => {
            return Err(ConsumerError::InvalidConfig(format!(
                "invalid max_ack_pending {value}"
            )));
        }
        (Some(value), _) => Some(value as u64),
        (None, Some(value)) => {
            if pedantic {
                return Err(ConsumerError::Pedantic(
                    "max_ack_pending would be derived from stream consumer limits".to_string(),
                ));
            }
            Some(value)
        }
        (None, None) => Some(DEFAULT_MAX_ACK_PENDING),
    };
    let max_request_batch = match (config.max_request_batch, stream.max_request_batch) {
        (Some(value), _) => Some(value),
        (None, Some(value)) => {
            if pedantic {
                return Err(ConsumerError::Pedantic(
                    "max_request_batch would be derived from the stream limit".to_string(),
                ));
            }
            Some(value)
        }
        (None, None) => None,
    };

    if config.priority_policy != PriorityPolicy::None && config.priority_groups.is_empty() {
        return Err(ConsumerError::PriorityPolicyWithoutGroup);
    }
    for group in &config.priority_groups {
        if group.is_empty() {
            return Err(ConsumerError::EmptyGroupName);
        }
        if !valid_group_name(group) {
            return Err(ConsumerError::InvalidGroupName(group.clone()));
        }
    }
    if config.deliver_subject.is_some() && config.priority_policy != PriorityPolicy::None {
        return Err(ConsumerError::InvalidConfig(
            "push consumers can not use a priority policy".to_string(),
        ));
    }

    Ok(ValidatedConfig {
        submitted: config.clone(),
        name,
        durable,
        filters,
        start,
        ack_policy: config.ack_policy,
        ack_wait,
        max_deliver,
        backoff,
        max_waiting: config
            .max_waiting
            .map(|value| value as usize)
            .unwrap_or(DEFAULT_MAX_WAITING),
        max_ack_pending,
        inactive_threshold,
        max_request_batch,
        priority_policy: config.priority_policy,
        priority_groups: config.priority_groups.clone(),
        pinned_ttl: config
            .pinned_ttl_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_PINNED_TTL),
        deliver_subject: config.deliver_subject.clone(),
    })
}

/// Update restrictions: identity, ack policy and deliver policy are fixed
/// for the lifetime of a consumer; everything else may be replaced.
pub fn check_update(old: &ValidatedConfig, new: &ValidatedConfig) -> Result<()> {
    if old.name != new.name || old.durable != new.durable {
        return Err(ConsumerError::InvalidConfig(
            "can not change consumer identity on update".to_string(),
        ));
    }
    if old.ack_policy != new.ack_policy {
        return Err(ConsumerError::InvalidConfig(
            "can not change ack policy on update".to_string(),
        ));
    }
    if old.submitted.deliver_policy != new.submitted.deliver_policy {
        return Err(ConsumerError::InvalidConfig(
            "can not change deliver policy on update".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use manx_stream::ConsumerLimits;

    fn stream_config() -> StreamConfig {
        StreamConfig::new("TEST", vec!["one".into(), "two".into()])
    }

    fn durable(name: &str) -> ConsumerConfig {
        ConsumerConfig {
            durable_name: Some(name.to_string()),
            ..ConsumerConfig::default()
        }
    }

    #[test]
    fn backoff_table_requires_room_in_max_deliver() {
        for (max_deliver, backoff, ok) in [
            (3, vec![1_000, 60_000], true),
            (2, vec![1_000, 60_000, 3_600_000], false),
            (0, vec![1_000, 60_000, 3_600_000], true),
        ] {
            let config = ConsumerConfig {
                max_deliver,
                backoff_ms: backoff,
                ..durable("C")
            };
            let result = validate(&config, &stream_config(), false);
            assert_eq!(result.is_ok(), ok, "max_deliver {max_deliver}");
            if !ok {
                let err = result.expect_err("error");
                assert!(err.to_string().contains("max deliver"), "{err}");
            }
        }
    }

    #[test]
    fn backoff_steps_saturate_at_the_last_entry() {
        let config = ConsumerConfig {
            backoff_ms: vec![2_000, 4_000],
            ack_wait_ms: Some(1_000),
            ..durable("C")
        };
        let validated = validate(&config, &stream_config(), false).expect("validate");
        assert_eq!(validated.backoff_step(1), Duration::from_secs(2));
        assert_eq!(validated.backoff_step(2), Duration::from_secs(4));
        assert_eq!(validated.backoff_step(9), Duration::from_secs(4));
    }

    #[test]
    fn empty_backoff_falls_back_to_ack_wait() {
        let validated = validate(&durable("C"), &stream_config(), false).expect("validate");
        assert_eq!(validated.backoff_step(1), DEFAULT_ACK_WAIT);
        assert_eq!(validated.backoff_step(5), DEFAULT_ACK_WAIT);
    }

    #[test]
    fn pedantic_rejects_derived_defaults() {
        let mut stream = stream_config();
        stream.consumer_limits = ConsumerLimits {
            inactive_threshold_ms: Some(60_000),
            max_ack_pending: None,
        };
        let err = validate(&durable("C"), &stream, true).expect_err("pedantic");
        assert!(err.to_string().contains("pedantic"), "{err}");

        stream.consumer_limits = ConsumerLimits {
            inactive_threshold_ms: None,
            max_ack_pending: Some(100),
        };
        let err = validate(&durable("C"), &stream, true).expect_err("pedantic");
        assert!(err.to_string().contains("pedantic"), "{err}");

        // Without pedantic the defaults apply silently.
        let validated = validate(&durable("C"), &stream, false).expect("validate");
        assert_eq!(validated.max_ack_pending, Some(100));
    }

    #[test]
    fn pedantic_rejects_backoff_without_ack_wait() {
        let config = ConsumerConfig {
            backoff_ms: vec![1_000, 60_000],
            ..durable("C")
        };
        let err = validate(&config, &stream_config(), true).expect_err("pedantic");
        assert!(err.to_string().contains("pedantic"), "{err}");
        let validated = validate(&config, &stream_config(), false).expect("validate");
        assert_eq!(validated.ack_wait, Duration::from_secs(1));
    }

    #[test]
    fn pedantic_rejects_inherited_request_batch_cap() {
        let mut stream = stream_config();
        stream.max_request_batch = Some(250);
        let err = validate(&durable("C"), &stream, true).expect_err("pedantic");
        assert!(err.to_string().contains("pedantic"), "{err}");
        let validated = validate(&durable("C"), &stream, false).expect("validate");
        assert_eq!(validated.max_request_batch, Some(250));
    }

    #[test]
    fn priority_policy_requires_groups() {
        let config = ConsumerConfig {
            priority_policy: PriorityPolicy::PinnedClient,
            ..durable("C")
        };
        let err = validate(&config, &stream_config(), false).expect_err("groups");
        assert!(matches!(err, ConsumerError::PriorityPolicyWithoutGroup));

        let config = ConsumerConfig {
            priority_policy: PriorityPolicy::Overflow,
            priority_groups: vec!["".into()],
            ..durable("C")
        };
        let err = validate(&config, &stream_config(), false).expect_err("empty group");
        assert!(matches!(err, ConsumerError::EmptyGroupName));

        let config = ConsumerConfig {
            priority_policy: PriorityPolicy::PinnedClient,
            priority_groups: vec!["group name\r\n".into()],
            ..durable("C")
        };
        let err = validate(&config, &stream_config(), false).expect_err("bad group");
        assert!(matches!(err, ConsumerError::InvalidGroupName(_)));
    }

    #[test]
    fn filter_subject_and_subjects_are_exclusive() {
        let config = ConsumerConfig {
            filter_subject: Some("one".into()),
            filter_subjects: vec!["two".into()],
            ..durable("C")
        };
        assert!(validate(&config, &stream_config(), false).is_err());
    }

    #[test]
    fn ephemeral_without_name_gets_one() {
        let validated =
            validate(&ConsumerConfig::default(), &stream_config(), false).expect("validate");
        assert!(!validated.durable);
        assert!(!validated.name.is_empty());
    }

    #[test]
    fn update_keeps_identity_and_ack_policy() {
        let stream = stream_config();
        let old = validate(&durable("C"), &stream, false).expect("old");
        let changed = ConsumerConfig {
            ack_policy: AckPolicy::None,
            ..durable("C")
        };
        let new = validate(&changed, &stream, false).expect("new");
        assert!(check_update(&old, &new).is_err());

        let relaxed = ConsumerConfig {
            max_deliver: 5,
            backoff_ms: vec![1_000],
            ..durable("C")
        };
        let new = validate(&relaxed, &stream, false).expect("new");
        assert!(check_update(&old, &new).is_ok());
    }
}

// Consumer lifecycle and admin: streams, create/update action semantics,
// work-queue exclusivity, unpin, and ephemeral reaping.
use crate::advisory::{Advisory, AdvisoryBus};
use crate::config::{self, ValidatedConfig};
use crate::consumer::Consumer;
use crate::delivery::DeliverySink;
use crate::error::{ConsumerError, Result};
use dashmap::DashMap;
use manx_api::{ConsumerAction, ConsumerInfo, CreateConsumerRequest, NextRequest, UnpinRequest};
use manx_stream::{RetentionPolicy, StreamConfig, StreamLog};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// One stream and its consumers. Admin operations on the consumer map are
/// serialized by the mutex; the hot pull/ack paths go through the
/// `Arc<Consumer>` handles directly.
pub struct StreamHandle {
    log: Arc<StreamLog>,
    consumers: Mutex<HashMap<String, Arc<Consumer>>>,
}

impl StreamHandle {
    fn new(config: StreamConfig) -> Self {
        Self {
            log: Arc::new(StreamLog::new(config)),
            consumers: Mutex::new(HashMap::new()),
        }
    }

    pub fn log(&self) -> &Arc<StreamLog> {
        &self.log
    }

    pub fn consumer(&self, name: &str) -> Option<Arc<Consumer>> {
        self.consumers.lock().expect("consumers lock").get(name).cloned()
    }

    pub fn consumer_names(&self) -> Vec<String> {
        self.consumers
            .lock()
            .expect("consumers lock")
            .keys()
            .cloned()
            .collect()
    }

    /// Purges matching messages and lets every consumer drop orphaned
    /// pending state.
    pub fn purge(&self, subject: Option<&str>) -> usize {
        let removed = self.log.purge(subject);
        if !removed.is_empty() {
            let consumers: Vec<Arc<Consumer>> = self
                .consumers
                .lock()
                .expect("consumers lock")
                .values()
                .cloned()
                .collect();
            for consumer in consumers {
                consumer.handle_purge(&removed);
            }
        }
        removed.len()
    }

    /// Rejects filter sets that overlap a sibling consumer's on a
    /// work-queue stream.
    fn check_work_queue_unique(&self, name: &str, validated: &ValidatedConfig) -> Result<()> {
        if self.log.retention() != RetentionPolicy::WorkQueue {
            return Ok(());
        }
        let consumers = self.consumers.lock().expect("consumers lock");
        for (other_name, other) in consumers.iter() {
            if other_name == name {
                continue;
            }
            if validated.filters.overlaps(&other.filters()) {
                return Err(ConsumerError::WorkQueueNotUnique(other_name.clone()));
            }
        }
        Ok(())
    }
}

/// Top-level registry of streams and their consumers.
///
/// Constructing one spawns the ephemeral-consumer sweeper, so a registry
/// must be created inside a tokio runtime.
pub struct Registry {
    streams: DashMap<String, Arc<StreamHandle>>,
    advisories: AdvisoryBus,
}

impl Registry {
    pub fn new() -> Arc<Self> {
        let registry = Arc::new(Self {
            streams: DashMap::new(),
            advisories: AdvisoryBus::new(),
        });
        tokio::spawn(sweep_inactive(Arc::downgrade(&registry)));
        registry
    }

    pub fn advisories(&self) -> broadcast::Receiver<Advisory> {
        self.advisories.subscribe()
    }

    pub fn add_stream(&self, config: StreamConfig) -> Result<Arc<StreamHandle>> {
        let name = config.name.clone();
        if self.streams.contains_key(&name) {
            return Err(ConsumerError::StreamAlreadyExists(name));
        }
        let handle = Arc::new(StreamHandle::new(config));
        self.streams.insert(name, handle.clone());
        Ok(handle)
    }

    pub fn stream(&self, name: &str) -> Result<Arc<StreamHandle>> {
        self.streams
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ConsumerError::StreamNotFound(name.to_string()))
    }

    pub fn consumer(&self, stream: &str, name: &str) -> Result<Arc<Consumer>> {
        self.stream(stream)?
            .consumer(name)
            .ok_or_else(|| ConsumerError::ConsumerNotFound(name.to_string()))
    }

    /// Create/update with action semantics. `create` tolerates an existing
    /// consumer only when the submitted config is byte-identical.
    pub fn create_consumer(&self, request: &CreateConsumerRequest) -> Result<ConsumerInfo> {
        let handle = self.stream(&request.stream)?;
        let validated = config::validate(&request.config, handle.log.config(), request.pedantic)?;
        let name = validated.name.clone();

        let existing = handle.consumer(&name);
        match (existing, request.action) {
            (Some(existing), ConsumerAction::Create) => {
                if existing.submitted_config() == request.config {
                    return Ok(existing.info());
                }
                Err(ConsumerError::ConsumerAlreadyExists(name))
            }
            (Some(existing), ConsumerAction::Update | ConsumerAction::CreateOrUpdate) => {
                let old =
                    config::validate(&existing.submitted_config(), handle.log.config(), false)?;
                config::check_update(&old, &validated)?;
                handle.check_work_queue_unique(&name, &validated)?;
                existing.update(validated);
                Ok(existing.info())
            }
            (None, ConsumerAction::Update) => Err(ConsumerError::ConsumerNotFound(name)),
            (None, ConsumerAction::Create | ConsumerAction::CreateOrUpdate) => {
                handle.check_work_queue_unique(&name, &validated)?;
                tracing::debug!(
                    stream = %request.stream,
                    consumer = %name,
                    durable = validated.durable,
                    "creating consumer"
                );
                metrics::counter!("manx_consumers_created_total").increment(1);
                let consumer =
                    Consumer::spawn(validated, handle.log.clone(), self.advisories.clone());
                let mut consumers = handle.consumers.lock().expect("consumers lock");
                // Lost race with a concurrent identical create.
                if let Some(racer) = consumers.get(&name) {
                    let racer = racer.clone();
                    drop(consumers);
                    consumer.delete();
                    return Ok(racer.info());
                }
                consumers.insert(name, consumer.clone());
                drop(consumers);
                Ok(consumer.info())
            }
        }
    }

    /// JSON ingress for create/update; malformed bodies (including unknown
    /// action strings) surface as `InvalidJson`.
    pub fn create_consumer_json(&self, body: &[u8]) -> Result<ConsumerInfo> {
        let request: CreateConsumerRequest = serde_json::from_slice(body)?;
        self.create_consumer(&request)
    }

    pub fn delete_consumer(&self, stream: &str, name: &str) -> Result<()> {
        let handle = self.stream(stream)?;
        let consumer = {
            let mut consumers = handle.consumers.lock().expect("consumers lock");
            consumers
                .remove(name)
                .ok_or_else(|| ConsumerError::ConsumerNotFound(name.to_string()))?
        };
        consumer.delete();
        Ok(())
    }

    pub fn pull(
        &self,
        stream: &str,
        consumer: &str,
        request: NextRequest,
        reply: DeliverySink,
    ) -> Result<()> {
        self.consumer(stream, consumer)?.pull(request, reply)
    }

    pub fn unpin(&self, stream: &str, consumer: &str, group: &str) -> Result<()> {
        self.consumer(stream, consumer)?.unpin(group)
    }

    pub fn unpin_json(&self, stream: &str, consumer: &str, body: &[u8]) -> Result<()> {
        let request: UnpinRequest = serde_json::from_slice(body)?;
        self.unpin(stream, consumer, &request.group)
    }

    /// Deletes ephemeral consumers idle past their inactive threshold.
    fn reap_inactive(&self, now: Instant) {
        for entry in self.streams.iter() {
            let handle = entry.value();
            let doomed: Vec<String> = {
                let consumers = handle.consumers.lock().expect("consumers lock");
                consumers
                    .iter()
                    .filter(|(_, consumer)| {
                        !consumer.is_durable()
                            && consumer
                                .inactive_threshold()
                                .is_some_and(|threshold| consumer.idle_for(now) >= threshold)
                    })
                    .map(|(name, _)| name.clone())
                    .collect()
            };
            for name in doomed {
                tracing::debug!(stream = %entry.key(), consumer = %name, "reaping inactive consumer");
                metrics::counter!("manx_consumers_reaped_total").increment(1);
                let _ = self.delete_consumer(entry.key(), &name);
            }
        }
    }
}

async fn sweep_inactive(registry: Weak<Registry>) {
    let mut interval = tokio::time::interval(SWEEP_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        interval.tick().await;
        let Some(registry) = registry.upgrade() else {
            break;
        };
        registry.reap_inactive(Instant::now());
    }
}

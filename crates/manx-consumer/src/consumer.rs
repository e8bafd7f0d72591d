// The consumer core: one mutex-guarded state block (filters, cursor,
// waiting queue, pending map, pins) and a single delivery-loop task.
//
// Ingress paths (pull requests, acks, unpin, stream appends, the retry
// timer) only mutate state and nudge the loop; all I/O towards clients
// happens after the mutex is released.
use crate::admission::{self, Eligibility, PinBoard};
use crate::advisory::AdvisoryBus;
use crate::config::ValidatedConfig;
use crate::cursor::DeliveryCursor;
use crate::delivery::{Delivery, DeliveryInfo, DeliverySink};
use crate::error::{ConsumerError, Result};
use crate::pending::RedeliveryEngine;
use crate::push::DeliverTarget;
use crate::waiting::WaitQueue;
use manx_api::{
    AckPolicy, AdvisoryEvent, ConsumerInfo, NextRequest, PriorityPolicy, SequencePair, headers,
};
use manx_stream::{RetentionPolicy, StreamLog};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Notify;
use tokio::time::Instant;

/// Ack-ingress verbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckKind {
    Ack,
    /// Negative ack with an optional redelivery delay; without one the
    /// configured backoff step applies.
    Nak(Option<Duration>),
    /// Extends the ack deadline without counting a delivery attempt.
    InProgress,
    /// Drops the message without further redeliveries.
    Term,
}

struct ConsumerState {
    cfg: ValidatedConfig,
    cursor: DeliveryCursor,
    waiting: WaitQueue,
    engine: RedeliveryEngine,
    pins: PinBoard,
    delivered: SequencePair,
    push_target: Option<Arc<dyn DeliverTarget>>,
    last_activity: Instant,
    closed: bool,
}

enum Outgoing {
    Sink(DeliverySink, Delivery),
    Push(Arc<dyn DeliverTarget>, String, Delivery),
}

pub struct Consumer {
    stream_name: String,
    name: String,
    stream: Arc<StreamLog>,
    state: Mutex<ConsumerState>,
    signal: Notify,
    advisories: AdvisoryBus,
    created_micros: u64,
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_micros() as u64)
        .unwrap_or(0)
}

impl Consumer {
    /// Builds the consumer and spawns its delivery loop.
    pub fn spawn(cfg: ValidatedConfig, stream: Arc<StreamLog>, advisories: AdvisoryBus) -> Arc<Self> {
        let now = Instant::now();
        let (cursor, delivered_stream_seq) = DeliveryCursor::new(cfg.start, &stream, &cfg.filters);
        let pins = PinBoard::new(cfg.priority_groups.iter().cloned(), cfg.pinned_ttl);
        let waiting = WaitQueue::new(cfg.max_waiting);
        let consumer = Arc::new(Self {
            stream_name: stream.name().to_string(),
            name: cfg.name.clone(),
            stream,
            state: Mutex::new(ConsumerState {
                cfg,
                cursor,
                waiting,
                engine: RedeliveryEngine::new(),
                pins,
                delivered: SequencePair {
                    consumer_seq: 0,
                    stream_seq: delivered_stream_seq,
                },
                push_target: None,
                last_activity: now,
                closed: false,
            }),
            signal: Notify::new(),
            advisories,
            created_micros: now_micros(),
        });
        tokio::spawn(run_loop(consumer.clone()));
        consumer
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }

    pub fn is_durable(&self) -> bool {
        self.state.lock().expect("consumer lock").cfg.durable
    }

    pub fn submitted_config(&self) -> manx_api::ConsumerConfig {
        self.state.lock().expect("consumer lock").cfg.submitted.clone()
    }

    pub fn filters(&self) -> manx_subject::FilterSet {
        self.state.lock().expect("consumer lock").cfg.filters.clone()
    }

    /// Replaces the configuration on update. Filters, backoff, limits and
    /// priority groups take effect immediately; the cursor keeps its
    /// position.
    pub fn update(&self, cfg: ValidatedConfig) {
        {
            let mut guard = self.state.lock().expect("consumer lock");
            let state = &mut *guard;
            state.pins = PinBoard::new(cfg.priority_groups.iter().cloned(), cfg.pinned_ttl);
            state.cfg = cfg;
            state.last_activity = Instant::now();
        }
        self.signal.notify_one();
    }

    /// Binds the publisher for a push-based consumer.
    pub fn bind_push_target(&self, target: Arc<dyn DeliverTarget>) {
        {
            let mut guard = self.state.lock().expect("consumer lock");
            guard.push_target = Some(target);
        }
        self.signal.notify_one();
    }

    /// Enqueues a pull request. Misuse of priority fields and oversized
    /// batches are answered with a status reply instead of queueing.
    pub fn pull(&self, request: NextRequest, reply: DeliverySink) -> Result<()> {
        let now = Instant::now();
        let mut guard = self.state.lock().expect("consumer lock");
        let state = &mut *guard;
        if state.closed {
            let _ = reply.send(Delivery::status(
                headers::STATUS_CONFLICT,
                headers::DESC_CONSUMER_DELETED,
            ));
            return Err(ConsumerError::Closed);
        }
        state.last_activity = now;

        if let Some(description) = priority_misuse(&state.cfg, &request) {
            metrics::counter!("manx_pull_requests_total", "result" => "bad_request").increment(1);
            let _ = reply.send(Delivery::status(headers::STATUS_BAD_REQUEST, description));
            return Ok(());
        }
        if let Some(cap) = state.cfg.max_request_batch {
            if request.batch > cap {
                let _ = reply.send(Delivery::status(
                    headers::STATUS_CONFLICT,
                    &headers::exceeded_max_request_batch(cap),
                ));
                return Ok(());
            }
        }
        // A request echoing a pin id that is not the current one is
        // answered immediately; queued holders are flushed by admission.
        if state.cfg.priority_policy == PriorityPolicy::PinnedClient {
            if let (Some(group), Some(offered)) = (&request.group, &request.id) {
                if state.pins.pin_id(group) != Some(offered.as_str()) {
                    metrics::counter!("manx_pull_requests_total", "result" => "wrong_pin")
                        .increment(1);
                    let _ = reply.send(Delivery::status(
                        headers::STATUS_WRONG_PIN,
                        headers::DESC_WRONG_PIN,
                    ));
                    return Ok(());
                }
            }
        }

        let expires_at = request
            .expires_ms
            .map(|ms| now + Duration::from_millis(ms));
        match state.waiting.push(&request, reply.clone(), expires_at, now) {
            Ok(_) => {
                metrics::counter!("manx_pull_requests_total", "result" => "queued").increment(1);
                drop(guard);
                self.signal.notify_one();
                Ok(())
            }
            Err(()) => {
                metrics::counter!("manx_pull_requests_total", "result" => "max_waiting")
                    .increment(1);
                let max_waiting = state.waiting.max_waiting();
                let _ = reply.send(Delivery::status(
                    headers::STATUS_CONFLICT,
                    &format!("Exceeded MaxWaiting of {max_waiting}"),
                ));
                Err(ConsumerError::MaxWaitingExceeded(max_waiting))
            }
        }
    }

    /// Ack ingress for one delivered stream sequence.
    pub fn handle_ack(&self, stream_seq: u64, kind: AckKind) {
        let now = Instant::now();
        let mut removed_from_log = Vec::new();
        {
            let mut guard = self.state.lock().expect("consumer lock");
            let state = &mut *guard;
            state.last_activity = now;
            match kind {
                AckKind::Ack => match state.cfg.ack_policy {
                    AckPolicy::Explicit => {
                        if let Some(entry) = state.engine.ack(stream_seq) {
                            metrics::histogram!("manx_ack_latency_seconds")
                                .record(now.duration_since(entry.last_delivered).as_secs_f64());
                            removed_from_log.push(stream_seq);
                        }
                    }
                    AckPolicy::All => {
                        if let Some(entry) = state.engine.get(stream_seq) {
                            let through = entry.consumer_seq;
                            for acked in state.engine.ack_all_through(through) {
                                removed_from_log.push(acked.stream_seq);
                            }
                        }
                    }
                    AckPolicy::None => {}
                },
                AckKind::Nak(delay) => {
                    let step = delay.unwrap_or_else(|| {
                        state
                            .engine
                            .get(stream_seq)
                            .map(|entry| state.cfg.backoff_step(entry.num_delivered))
                            .unwrap_or(state.cfg.ack_wait)
                    });
                    state.engine.nak(stream_seq, step, now);
                }
                AckKind::InProgress => {
                    state.engine.in_progress(stream_seq, state.cfg.ack_wait, now);
                }
                AckKind::Term => {
                    if let Some(entry) = state.engine.terminate(stream_seq) {
                        removed_from_log.push(stream_seq);
                        self.advisories.publish(AdvisoryEvent::Terminated {
                            stream: self.stream_name.clone(),
                            consumer: self.name.clone(),
                            consumer_seq: entry.consumer_seq,
                            stream_seq: entry.stream_seq,
                            deliveries: entry.num_delivered,
                        });
                    }
                }
            }
            if self.stream.retention() != RetentionPolicy::WorkQueue {
                removed_from_log.clear();
            }
        }
        for seq in removed_from_log {
            // Work-queue retention: the stream drops acked messages.
            let _ = self.stream.remove(seq);
        }
        self.signal.notify_one();
    }

    /// Admin unpin for one priority group.
    pub fn unpin(&self, group: &str) -> Result<()> {
        if group.is_empty() {
            return Err(ConsumerError::EmptyGroupName);
        }
        if !manx_api::valid_group_name(group) {
            return Err(ConsumerError::InvalidGroupName(group.to_string()));
        }
        let unpinned = {
            let mut guard = self.state.lock().expect("consumer lock");
            let state = &mut *guard;
            if !state.pins.has_group(group) {
                return Err(ConsumerError::InvalidPriorityGroup(group.to_string()));
            }
            state.pins.unpin(group)
        };
        if unpinned {
            self.advisories.publish(AdvisoryEvent::Unpinned {
                stream: self.stream_name.clone(),
                consumer: self.name.clone(),
                group: group.to_string(),
            });
        }
        self.signal.notify_one();
        Ok(())
    }

    /// Drops pending state for purged stream sequences and fast-forwards
    /// the cursor and ack floor past them.
    pub fn handle_purge(&self, removed: &[u64]) {
        let dropped = {
            let mut guard = self.state.lock().expect("consumer lock");
            let state = &mut *guard;
            let dropped = state.engine.drop_missing(removed);
            let delivered = state.delivered;
            state.engine.fast_forward_floor(delivered);
            dropped
        };
        if !dropped.is_empty() {
            self.advisories.publish(AdvisoryEvent::PendingDropped {
                stream: self.stream_name.clone(),
                consumer: self.name.clone(),
                stream_seqs: dropped,
            });
        }
        self.signal.notify_one();
    }

    /// Closes the consumer; every parked pull is answered with a 409.
    pub fn delete(&self) {
        let drained = {
            let mut guard = self.state.lock().expect("consumer lock");
            let state = &mut *guard;
            state.closed = true;
            state.waiting.drain()
        };
        for request in drained {
            let _ = request.reply.send(Delivery::status(
                headers::STATUS_CONFLICT,
                headers::DESC_CONSUMER_DELETED,
            ));
        }
        self.signal.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().expect("consumer lock").closed
    }

    /// Idle time since the last client activity, for ephemeral reaping.
    pub fn idle_for(&self, now: Instant) -> Duration {
        let state = self.state.lock().expect("consumer lock");
        if !state.waiting.is_empty() {
            return Duration::ZERO;
        }
        now.duration_since(state.last_activity)
    }

    pub fn inactive_threshold(&self) -> Option<Duration> {
        self.state
            .lock()
            .expect("consumer lock")
            .cfg
            .inactive_threshold
    }

    pub fn info(&self) -> ConsumerInfo {
        let guard = self.state.lock().expect("consumer lock");
        let state = &*guard;
        ConsumerInfo {
            stream: self.stream_name.clone(),
            name: self.name.clone(),
            created_micros: self.created_micros,
            config: state.cfg.submitted.clone(),
            delivered: state.delivered,
            ack_floor: state.engine.ack_floor(),
            num_pending: state.cursor.num_pending(&self.stream, &state.cfg.filters),
            num_ack_pending: state.engine.num_ack_pending(),
            num_redelivered: state.engine.num_redelivered(),
            num_waiting: state.waiting.len() as u64,
        }
    }

    /// One pass over expiries, pin TTLs, due redeliveries and deliverable
    /// messages. Returns the replies to flush once the lock is released.
    fn process(&self, now: Instant) -> Vec<Outgoing> {
        let mut out = Vec::new();
        let mut guard = self.state.lock().expect("consumer lock");
        let state = &mut *guard;
        if state.closed {
            return out;
        }

        state.waiting.reap_closed();

        for request in state.waiting.take_expired(now) {
            metrics::counter!("manx_pull_expired_total").increment(1);
            state.pins.forget_request(request.id);
            out.push(Outgoing::Sink(
                request.reply,
                Delivery::status(
                    headers::STATUS_REQUEST_TIMEOUT,
                    headers::DESC_REQUEST_TIMEOUT,
                ),
            ));
        }

        for group in state.pins.expire(now) {
            self.advisories.publish(AdvisoryEvent::Unpinned {
                stream: self.stream_name.clone(),
                consumer: self.name.clone(),
                group,
            });
        }

        state.engine.collect_due(now);
        self.deliver_ready(state, now, &mut out);

        // Anything a no-wait request did not get this pass it never will.
        let mut starved = Vec::new();
        for request in state.waiting.iter() {
            if request.no_wait {
                starved.push(request.id);
            }
        }
        for id in starved {
            if let Some(request) = state.waiting.remove(id) {
                out.push(Outgoing::Sink(
                    request.reply,
                    Delivery::status(headers::STATUS_NO_MESSAGES, headers::DESC_NO_MESSAGES),
                ));
            }
        }

        out
    }

    fn deliver_ready(&self, state: &mut ConsumerState, now: Instant, out: &mut Vec<Outgoing>) {
        loop {
            let redelivery_seq = state.engine.pop_redelivery();
            let (message, is_redelivery) = match redelivery_seq {
                Some(seq) => match self.stream.get(seq) {
                    Some(message) => (message, true),
                    None => {
                        // The message was purged out from under the
                        // pending entry; drop it and move on.
                        let dropped = state.engine.drop_missing(&[seq]);
                        if !dropped.is_empty() {
                            self.advisories.publish(AdvisoryEvent::PendingDropped {
                                stream: self.stream_name.clone(),
                                consumer: self.name.clone(),
                                stream_seqs: dropped,
                            });
                        }
                        continue;
                    }
                },
                None => match state.cursor.next_deliverable(&self.stream, &state.cfg.filters) {
                    Some(message) => (message, false),
                    None => break,
                },
            };

            if is_redelivery {
                if let (Some(max), Some(entry)) =
                    (state.cfg.max_deliver, state.engine.get(message.seq))
                {
                    if entry.num_delivered >= max {
                        self.exhaust(state, message.seq, out);
                        continue;
                    }
                }
            } else if state.cfg.ack_policy != AckPolicy::None {
                if let Some(cap) = state.cfg.max_ack_pending {
                    if state.engine.num_ack_pending() >= cap {
                        break;
                    }
                }
            }

            match self.choose_recipient(state, out) {
                Some(recipient) => {
                    self.deliver(state, message, is_redelivery, recipient, now, out);
                }
                None => {
                    if let Some(seq) = redelivery_seq {
                        state.engine.push_front_redelivery(seq);
                    }
                    break;
                }
            }
        }
    }

    /// Picks the delivery recipient: the push target, or the first
    /// eligible waiting request in FIFO order. Requests with a stale pin
    /// are flushed with a 423 along the way.
    fn choose_recipient(&self, state: &mut ConsumerState, out: &mut Vec<Outgoing>) -> Option<Recipient> {
        if state.cfg.is_push() {
            return state.push_target.clone().map(Recipient::Push);
        }
        loop {
            // Only overflow admission looks at the backlog depth; skip the
            // log scan for the other policies.
            let num_pending = match state.cfg.priority_policy {
                PriorityPolicy::Overflow => {
                    state.cursor.num_pending(&self.stream, &state.cfg.filters)
                }
                _ => 0,
            };
            let num_ack_pending = state.engine.num_ack_pending();
            let mut wrong_pins = Vec::new();
            let mut chosen = None;
            for request in state.waiting.iter() {
                match admission::evaluate(
                    state.cfg.priority_policy,
                    &state.pins,
                    request,
                    num_pending,
                    num_ack_pending,
                ) {
                    Eligibility::Deliver => {
                        chosen = Some((request.id, false));
                        break;
                    }
                    Eligibility::DeliverAndPin => {
                        chosen = Some((request.id, true));
                        break;
                    }
                    Eligibility::WrongPin => wrong_pins.push(request.id),
                    Eligibility::Wait => {}
                }
            }
            for id in &wrong_pins {
                if let Some(request) = state.waiting.remove(*id) {
                    metrics::counter!("manx_pull_requests_total", "result" => "wrong_pin")
                        .increment(1);
                    state.pins.forget_request(request.id);
                    out.push(Outgoing::Sink(
                        request.reply,
                        Delivery::status(headers::STATUS_WRONG_PIN, headers::DESC_WRONG_PIN),
                    ));
                }
            }
            match chosen {
                Some((id, assign_pin)) => return Some(Recipient::Request { id, assign_pin }),
                // Retry the scan if stale-pin requests were flushed; their
                // removal may unblock re-pinning.
                None if !wrong_pins.is_empty() => continue,
                None => return None,
            }
        }
    }

    fn deliver(
        &self,
        state: &mut ConsumerState,
        message: manx_stream::Message,
        is_redelivery: bool,
        recipient: Recipient,
        now: Instant,
        out: &mut Vec<Outgoing>,
    ) {
        let consumer_seq = if is_redelivery {
            state
                .engine
                .get(message.seq)
                .map(|entry| entry.consumer_seq)
                .unwrap_or(state.delivered.consumer_seq + 1)
        } else {
            state.delivered.consumer_seq + 1
        };

        let num_delivered = if state.cfg.ack_policy == AckPolicy::None {
            1
        } else {
            let attempts = state
                .engine
                .get(message.seq)
                .map(|entry| entry.num_delivered + 1)
                .unwrap_or(1);
            let step = state.cfg.backoff_step(attempts);
            state
                .engine
                .record_delivery(message.seq, consumer_seq, message.timestamp_micros, now, step)
        };

        if !is_redelivery {
            state.delivered = SequencePair {
                consumer_seq,
                stream_seq: message.seq,
            };
            state.cursor.advance_past(message.seq);
            if state.cfg.ack_policy == AckPolicy::None {
                let delivered = state.delivered;
                state.engine.fast_forward_floor(delivered);
            }
        }
        metrics::counter!(
            "manx_deliveries_total",
            "redelivery" => if is_redelivery { "true" } else { "false" }
        )
        .increment(1);
        if is_redelivery {
            metrics::counter!("manx_redeliveries_total").increment(1);
        }

        let info = DeliveryInfo {
            stream: self.stream_name.clone(),
            consumer: self.name.clone(),
            consumer_seq,
            stream_seq: message.seq,
            num_delivered,
            timestamp_micros: message.timestamp_micros,
        };
        let mut delivery = Delivery::message(&message, info);

        match recipient {
            Recipient::Push(target) => {
                let deliver_subject = state
                    .cfg
                    .deliver_subject
                    .clone()
                    .unwrap_or_default();
                out.push(Outgoing::Push(target, deliver_subject, delivery));
            }
            Recipient::Request { id, assign_pin } => {
                let group = state
                    .waiting
                    .iter()
                    .find(|request| request.id == id)
                    .and_then(|request| request.group.clone());
                if let Some(group) = &group {
                    if assign_pin {
                        let pin_id = state.pins.assign(group, id, now);
                        self.advisories.publish(AdvisoryEvent::Pinned {
                            stream: self.stream_name.clone(),
                            consumer: self.name.clone(),
                            group: group.clone(),
                            pin_id,
                        });
                    } else {
                        state.pins.touch(group, now);
                    }
                    if state.cfg.priority_policy == PriorityPolicy::PinnedClient {
                        if let Some(pin_id) = state.pins.pin_id(group) {
                            delivery = delivery.with_pin_id(pin_id);
                        }
                    }
                }
                let mut fulfilled = false;
                let mut reply = None;
                for request in state.waiting.iter_mut() {
                    if request.id == id {
                        request.delivered += 1;
                        fulfilled = request.remaining() == 0;
                        reply = Some(request.reply.clone());
                        metrics::histogram!("manx_pull_wait_seconds")
                            .record(now.duration_since(request.created_at).as_secs_f64());
                        break;
                    }
                }
                if let Some(reply) = reply {
                    out.push(Outgoing::Sink(reply, delivery));
                }
                if fulfilled {
                    state.waiting.remove(id);
                }
            }
        }

        // Ack-policy none on a work-queue stream consumes the message
        // right away.
        if state.cfg.ack_policy == AckPolicy::None
            && self.stream.retention() == RetentionPolicy::WorkQueue
        {
            let _ = self.stream.remove(message.seq);
        }
    }

    /// Max-deliver exhaustion: drop the pending entry, advise, and (for
    /// push consumers) publish a terminal status.
    fn exhaust(&self, state: &mut ConsumerState, stream_seq: u64, out: &mut Vec<Outgoing>) {
        let Some(entry) = state.engine.terminate(stream_seq) else {
            return;
        };
        metrics::counter!("manx_max_deliveries_total").increment(1);
        tracing::debug!(
            stream = %self.stream_name,
            consumer = %self.name,
            stream_seq,
            deliveries = entry.num_delivered,
            first_delivered_micros = entry.first_delivered_micros,
            "max deliveries exceeded"
        );
        self.advisories.publish(AdvisoryEvent::MaxDeliveries {
            stream: self.stream_name.clone(),
            consumer: self.name.clone(),
            stream_seq,
            deliveries: entry.num_delivered,
        });
        if let (true, Some(target)) = (state.cfg.is_push(), state.push_target.clone()) {
            let deliver_subject = state.cfg.deliver_subject.clone().unwrap_or_default();
            out.push(Outgoing::Push(
                target,
                deliver_subject,
                Delivery::status(headers::STATUS_CONFLICT, headers::DESC_MAX_DELIVERIES),
            ));
        }
        // Exhausting the message the pin holder was working through ends
        // that assignment.
        if state.cfg.priority_policy == PriorityPolicy::PinnedClient {
            for group in state.pins.unpin_all() {
                self.advisories.publish(AdvisoryEvent::Unpinned {
                    stream: self.stream_name.clone(),
                    consumer: self.name.clone(),
                    group,
                });
            }
        }
    }

    /// Earliest deadline the loop has to wake for.
    fn next_deadline(&self) -> Option<Instant> {
        let mut guard = self.state.lock().expect("consumer lock");
        let state = &mut *guard;
        [
            state.engine.next_deadline(),
            state.waiting.next_expiry(),
            state.pins.next_deadline(),
        ]
        .into_iter()
        .flatten()
        .min()
    }
}

enum Recipient {
    Request { id: u64, assign_pin: bool },
    Push(Arc<dyn DeliverTarget>),
}

/// Maps a pull request's priority fields against the consumer's policy.
/// Returns the Bad Request description for a mismatch.
fn priority_misuse(cfg: &ValidatedConfig, request: &NextRequest) -> Option<&'static str> {
    match cfg.priority_policy {
        PriorityPolicy::None => {
            if request.id.is_some() {
                Some(headers::DESC_NOT_PINNED_CONSUMER)
            } else if request.has_overflow_thresholds() {
                Some(headers::DESC_NOT_OVERFLOW_CONSUMER)
            } else if request.group.is_some() {
                Some(headers::DESC_PRIORITY_NOT_SUPPORTED)
            } else {
                None
            }
        }
        PriorityPolicy::PinnedClient => {
            if request.has_overflow_thresholds() {
                Some(headers::DESC_NOT_OVERFLOW_CONSUMER)
            } else if request.group.is_none() {
                Some(headers::DESC_GROUP_MISSING)
            } else if !cfg
                .priority_groups
                .iter()
                .any(|group| Some(group) == request.group.as_ref())
            {
                Some(headers::DESC_INVALID_GROUP)
            } else {
                None
            }
        }
        PriorityPolicy::Overflow => {
            if request.id.is_some() {
                Some(headers::DESC_NOT_PINNED_CONSUMER)
            } else if !request.has_priority_fields() {
                None
            } else if request.group.is_none() {
                Some(headers::DESC_GROUP_MISSING)
            } else if !cfg
                .priority_groups
                .iter()
                .any(|group| Some(group) == request.group.as_ref())
            {
                Some(headers::DESC_INVALID_GROUP)
            } else {
                None
            }
        }
    }
}

/// Delivery loop: wakes on stream appends, state changes and the earliest
/// timer deadline, then flushes staged replies outside the lock.
async fn run_loop(consumer: Arc<Consumer>) {
    let mut tail = consumer.stream.watch_tail();
    loop {
        if consumer.is_closed() {
            break;
        }
        let outgoing = consumer.process(Instant::now());
        for item in outgoing {
            match item {
                Outgoing::Sink(sink, delivery) => {
                    let _ = sink.send(delivery);
                }
                Outgoing::Push(target, deliver_subject, delivery) => {
                    target.deliver(&deliver_subject, delivery).await;
                }
            }
        }
        let deadline = consumer.next_deadline();
        tokio::select! {
            _ = consumer.signal.notified() => {}
            changed = tail.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = sleep_until_or_forever(deadline) => {}
        }
    }
}

async fn sleep_until_or_forever(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

// Priority admission: decides which waiting request, if any, receives the
// next message, and owns the per-group pin state machine.
use crate::waiting::WaitingRequest;
use manx_api::PriorityPolicy;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Outcome of evaluating one waiting request against the next message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Eligibility {
    /// Request receives the message.
    Deliver,
    /// Request receives the message and becomes the group's pin holder.
    DeliverAndPin,
    /// Request stays queued; re-evaluated on the next state change.
    Wait,
    /// Request carries a stale or wrong pin id: reply 423 and dequeue.
    WrongPin,
}

/// Pin state for one priority group. `unpinned ⇄ pinned` transitions are
/// driven by admission, TTL expiry and explicit unpin; the prior holder is
/// remembered so it is never re-picked as the next pin.
#[derive(Debug, Default)]
struct GroupPin {
    pin_id: Option<String>,
    holder: Option<u64>,
    last_active: Option<Instant>,
    prior_holder: Option<u64>,
}

#[derive(Debug)]
pub struct PinBoard {
    groups: HashMap<String, GroupPin>,
    ttl: Duration,
}

impl PinBoard {
    pub fn new<I, S>(groups: I, ttl: Duration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            groups: groups
                .into_iter()
                .map(|group| (group.into(), GroupPin::default()))
                .collect(),
            ttl,
        }
    }

    pub fn has_group(&self, group: &str) -> bool {
        self.groups.contains_key(group)
    }

    pub fn pin_id(&self, group: &str) -> Option<&str> {
        self.groups.get(group)?.pin_id.as_deref()
    }

    /// Assigns a fresh pin to `holder` and returns the generated token.
    pub fn assign(&mut self, group: &str, holder: u64, now: Instant) -> String {
        let pin_id = uuid::Uuid::new_v4().simple().to_string();
        if let Some(pin) = self.groups.get_mut(group) {
            pin.pin_id = Some(pin_id.clone());
            pin.holder = Some(holder);
            pin.last_active = Some(now);
            pin.prior_holder = None;
        }
        pin_id
    }

    /// Marks delivery activity for the holder, deferring TTL expiry.
    pub fn touch(&mut self, group: &str, now: Instant) {
        if let Some(pin) = self.groups.get_mut(group) {
            if pin.pin_id.is_some() {
                pin.last_active = Some(now);
            }
        }
    }

    /// Clears the pin for `group`. Returns true if a pin was active.
    pub fn unpin(&mut self, group: &str) -> bool {
        match self.groups.get_mut(group) {
            Some(pin) if pin.pin_id.is_some() => {
                pin.pin_id = None;
                pin.prior_holder = pin.holder.take();
                pin.last_active = None;
                true
            }
            _ => false,
        }
    }

    /// Clears every active pin; returns the affected group names.
    pub fn unpin_all(&mut self) -> Vec<String> {
        let groups: Vec<String> = self
            .groups
            .iter()
            .filter(|(_, pin)| pin.pin_id.is_some())
            .map(|(group, _)| group.clone())
            .collect();
        for group in &groups {
            self.unpin(group);
        }
        groups
    }

    /// Expires pins idle past the TTL; returns the unpinned group names.
    pub fn expire(&mut self, now: Instant) -> Vec<String> {
        let ttl = self.ttl;
        let expired: Vec<String> = self
            .groups
            .iter()
            .filter(|(_, pin)| {
                pin.pin_id.is_some()
                    && pin
                        .last_active
                        .is_some_and(|last_active| now.duration_since(last_active) >= ttl)
            })
            .map(|(group, _)| group.clone())
            .collect();
        for group in &expired {
            self.unpin(group);
        }
        expired
    }

    /// Earliest TTL deadline across active pins, for the consumer timer.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.groups
            .values()
            .filter(|pin| pin.pin_id.is_some())
            .filter_map(|pin| pin.last_active)
            .map(|last_active| last_active + self.ttl)
            .min()
    }

    /// Drops a departing request from holder bookkeeping so a vanished
    /// client does not block re-pinning.
    pub fn forget_request(&mut self, request_id: u64) {
        for pin in self.groups.values_mut() {
            if pin.prior_holder == Some(request_id) {
                pin.prior_holder = None;
            }
        }
    }

    fn evaluate_pinned(&self, request: &WaitingRequest) -> Eligibility {
        let Some(group) = request.group.as_deref() else {
            // Validation guarantees a group on pinned requests.
            return Eligibility::Wait;
        };
        let Some(pin) = self.groups.get(group) else {
            return Eligibility::Wait;
        };
        match (&pin.pin_id, &request.pin_id) {
            (Some(_), _) if pin.holder == Some(request.id) => Eligibility::Deliver,
            (Some(current), Some(offered)) if current == offered => Eligibility::Deliver,
            (Some(_), Some(_)) => Eligibility::WrongPin,
            (Some(_), None) => Eligibility::Wait,
            // No active pin: anything echoing an old token is stale, and
            // the previous holder is skipped with 423 rather than re-pinned.
            (None, Some(_)) => Eligibility::WrongPin,
            (None, None) if pin.prior_holder == Some(request.id) => Eligibility::WrongPin,
            (None, None) => Eligibility::DeliverAndPin,
        }
    }
}

/// Evaluates one waiting request for the next deliverable message.
pub fn evaluate(
    policy: PriorityPolicy,
    pins: &PinBoard,
    request: &WaitingRequest,
    num_pending: u64,
    num_ack_pending: u64,
) -> Eligibility {
    match policy {
        PriorityPolicy::None => Eligibility::Deliver,
        PriorityPolicy::Overflow => {
            let pending_met = request
                .min_pending
                .map_or(true, |min| num_pending >= min);
            let ack_pending_met = request
                .min_ack_pending
                .map_or(true, |min| num_ack_pending >= min);
            if pending_met && ack_pending_met {
                Eligibility::Deliver
            } else {
                Eligibility::Wait
            }
        }
        PriorityPolicy::PinnedClient => pins.evaluate_pinned(request),
    }
}

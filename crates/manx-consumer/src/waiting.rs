// FIFO queue of outstanding pull requests.
use crate::delivery::DeliverySink;
use manx_api::NextRequest;
use std::collections::VecDeque;
use tokio::time::Instant;

#[derive(Debug)]
pub struct WaitingRequest {
    pub id: u64,
    pub reply: DeliverySink,
    pub batch: u64,
    pub delivered: u64,
    pub expires_at: Option<Instant>,
    pub no_wait: bool,
    pub group: Option<String>,
    pub pin_id: Option<String>,
    pub min_pending: Option<u64>,
    pub min_ack_pending: Option<u64>,
    pub created_at: Instant,
}

impl WaitingRequest {
    pub fn remaining(&self) -> u64 {
        self.batch.saturating_sub(self.delivered)
    }

    pub fn expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| deadline <= now)
    }
}

/// Bounded FIFO of waiting requests. The bound is `max_waiting`; admitting
/// beyond it is a typed error surfaced to the caller.
#[derive(Debug)]
pub struct WaitQueue {
    queue: VecDeque<WaitingRequest>,
    max_waiting: usize,
    next_id: u64,
}

impl WaitQueue {
    pub fn new(max_waiting: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            max_waiting,
            next_id: 1,
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn max_waiting(&self) -> usize {
        self.max_waiting
    }

    /// Admits a request at the tail. Returns the assigned request id, or
    /// the request back when the queue is full.
    pub fn push(
        &mut self,
        request: &NextRequest,
        reply: DeliverySink,
        expires_at: Option<Instant>,
        now: Instant,
    ) -> Result<u64, ()> {
        if self.queue.len() >= self.max_waiting {
            return Err(());
        }
        let id = self.next_id;
        self.next_id += 1;
        self.queue.push_back(WaitingRequest {
            id,
            reply,
            batch: request.batch.max(1),
            delivered: 0,
            expires_at,
            no_wait: request.no_wait,
            group: request.group.clone(),
            pin_id: request.id.clone(),
            min_pending: request.min_pending,
            min_ack_pending: request.min_ack_pending,
            created_at: now,
        });
        Ok(id)
    }

    /// Removes and returns requests whose expiry has passed.
    pub fn take_expired(&mut self, now: Instant) -> Vec<WaitingRequest> {
        let mut expired = Vec::new();
        let mut keep = VecDeque::with_capacity(self.queue.len());
        for request in self.queue.drain(..) {
            if request.expired(now) {
                expired.push(request);
            } else {
                keep.push_back(request);
            }
        }
        self.queue = keep;
        expired
    }

    /// Drops requests whose reply inbox has been closed by the client.
    pub fn reap_closed(&mut self) {
        self.queue.retain(|request| !request.reply.is_closed());
    }

    /// Earliest expiry across waiting requests, for the consumer timer.
    pub fn next_expiry(&self) -> Option<Instant> {
        self.queue
            .iter()
            .filter_map(|request| request.expires_at)
            .min()
    }

    pub fn iter(&self) -> impl Iterator<Item = &WaitingRequest> {
        self.queue.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut WaitingRequest> {
        self.queue.iter_mut()
    }

    pub fn remove(&mut self, id: u64) -> Option<WaitingRequest> {
        let index = self.queue.iter().position(|request| request.id == id)?;
        self.queue.remove(index)
    }

    /// Removes every queued request, e.g. on consumer delete.
    pub fn drain(&mut self) -> Vec<WaitingRequest> {
        self.queue.drain(..).collect()
    }
}

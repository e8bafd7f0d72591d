// Advisory publication: informational events on a dedicated subject
// hierarchy, fanned out over a broadcast channel.
use manx_api::AdvisoryEvent;
use tokio::sync::broadcast;

const ADVISORY_CAPACITY: usize = 256;

/// An advisory event paired with the subject it is published on.
#[derive(Debug, Clone)]
pub struct Advisory {
    pub subject: String,
    pub event: AdvisoryEvent,
}

/// Fan-out bus for advisories. Lagging subscribers drop, they never block
/// the delivery path.
#[derive(Debug, Clone)]
pub struct AdvisoryBus {
    tx: broadcast::Sender<Advisory>,
}

impl AdvisoryBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(ADVISORY_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Advisory> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: AdvisoryEvent) {
        metrics::counter!("manx_advisories_total", "kind" => event.kind()).increment(1);
        let advisory = Advisory {
            subject: event.subject(),
            event,
        };
        tracing::debug!(subject = %advisory.subject, "advisory");
        // No receivers is fine; advisories are best-effort.
        let _ = self.tx.send(advisory);
    }
}

impl Default for AdvisoryBus {
    fn default() -> Self {
        Self::new()
    }
}

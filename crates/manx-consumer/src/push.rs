// Push-delivery seam: consumers configured with a deliver subject hand
// completed deliveries to an external publisher.
use crate::delivery::Delivery;
use async_trait::async_trait;
use std::fmt::Debug;
use tokio::sync::mpsc;

/// Publisher for push-based consumers. The consumer core publishes
/// deliveries to the configured deliver subject through this seam; the
/// transport behind it is a collaborator's concern.
#[async_trait]
pub trait DeliverTarget: Debug + Send + Sync {
    async fn deliver(&self, deliver_subject: &str, delivery: Delivery);
}

/// Channel-backed target, used by in-process wiring and tests.
#[derive(Debug)]
pub struct ChannelTarget {
    tx: mpsc::UnboundedSender<(String, Delivery)>,
}

impl ChannelTarget {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(String, Delivery)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl DeliverTarget for ChannelTarget {
    async fn deliver(&self, deliver_subject: &str, delivery: Delivery) {
        let _ = self.tx.send((deliver_subject.to_string(), delivery));
    }
}

// Deliveries and status replies emitted to a pull request's reply inbox.
use bytes::Bytes;
use manx_api::headers;
use manx_stream::{Headers, Message};
use tokio::sync::mpsc;

/// Reply inbox for a pull request or push target. Unbounded so replies can
/// be staged while the consumer mutex is held and flushed afterwards.
pub type DeliverySink = mpsc::UnboundedSender<Delivery>;

pub fn delivery_channel() -> (DeliverySink, mpsc::UnboundedReceiver<Delivery>) {
    mpsc::unbounded_channel()
}

/// Sequencing metadata attached to every delivered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryInfo {
    pub stream: String,
    pub consumer: String,
    pub consumer_seq: u64,
    pub stream_seq: u64,
    pub num_delivered: u64,
    pub timestamp_micros: u64,
}

/// Either a delivered stream message (with `info`) or a status-only reply
/// (headers carry `Status`/`Description`, payload empty, no `info`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub subject: String,
    pub headers: Headers,
    pub payload: Bytes,
    pub info: Option<DeliveryInfo>,
}

impl Delivery {
    pub fn message(message: &Message, info: DeliveryInfo) -> Self {
        Self {
            subject: message.subject.clone(),
            headers: message.headers.clone(),
            payload: message.payload.clone(),
            info: Some(info),
        }
    }

    pub fn status(code: &str, description: &str) -> Self {
        let mut hdrs = Headers::new();
        hdrs.insert(headers::STATUS.to_string(), code.to_string());
        hdrs.insert(headers::DESCRIPTION.to_string(), description.to_string());
        Self {
            subject: String::new(),
            headers: hdrs,
            payload: Bytes::new(),
            info: None,
        }
    }

    pub fn with_pin_id(mut self, pin_id: &str) -> Self {
        self.headers
            .insert(headers::PIN_ID.to_string(), pin_id.to_string());
        self
    }

    pub fn status_code(&self) -> Option<&str> {
        self.headers.get(headers::STATUS).map(String::as_str)
    }

    pub fn description(&self) -> Option<&str> {
        self.headers.get(headers::DESCRIPTION).map(String::as_str)
    }

    pub fn pin_id(&self) -> Option<&str> {
        self.headers.get(headers::PIN_ID).map(String::as_str)
    }

    pub fn is_status(&self) -> bool {
        self.info.is_none()
    }
}

// Shared helpers for consumer integration tests.
#![allow(dead_code)]
use bytes::Bytes;
use manx_api::{ConsumerAction, ConsumerConfig, CreateConsumerRequest, NextRequest};
use manx_consumer::{Delivery, Registry, StreamHandle, delivery_channel};
use manx_stream::{Headers, StreamConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

pub type Inbox = UnboundedReceiver<Delivery>;

pub fn stream_config(name: &str, subjects: &[&str]) -> StreamConfig {
    StreamConfig::new(name, subjects.iter().map(|s| s.to_string()).collect())
}

pub fn durable(name: &str) -> ConsumerConfig {
    ConsumerConfig {
        durable_name: Some(name.to_string()),
        ..ConsumerConfig::default()
    }
}

pub fn create(
    registry: &Arc<Registry>,
    stream: &str,
    config: ConsumerConfig,
) -> manx_api::ConsumerInfo {
    registry
        .create_consumer(&CreateConsumerRequest {
            stream: stream.to_string(),
            action: ConsumerAction::Create,
            config,
            pedantic: false,
        })
        .expect("create consumer")
}

pub fn publish(handle: &Arc<StreamHandle>, subject: &str, payload: &str) -> u64 {
    handle
        .log()
        .append(subject, Headers::new(), Bytes::copy_from_slice(payload.as_bytes()))
}

/// Sends a pull request and returns its reply inbox.
pub fn pull(registry: &Arc<Registry>, stream: &str, consumer: &str, request: NextRequest) -> Inbox {
    let (reply, inbox) = delivery_channel();
    // Misuse and overflow rejections arrive as status replies.
    let _ = registry.pull(stream, consumer, request, reply);
    inbox
}

pub fn batch(batch: u64) -> NextRequest {
    NextRequest {
        batch,
        ..NextRequest::default()
    }
}

pub fn batch_in_group(batch_size: u64, group: &str) -> NextRequest {
    NextRequest {
        batch: batch_size,
        group: Some(group.to_string()),
        ..NextRequest::default()
    }
}

/// Receives the next reply, panicking after `wait`.
pub async fn recv(inbox: &mut Inbox, wait: Duration) -> Delivery {
    tokio::time::timeout(wait, inbox.recv())
        .await
        .expect("timed out waiting for delivery")
        .expect("reply channel closed")
}

/// Asserts that nothing arrives within `wait`.
pub async fn recv_nothing(inbox: &mut Inbox, wait: Duration) {
    if let Ok(delivery) = tokio::time::timeout(wait, inbox.recv()).await {
        panic!("expected no delivery, got {delivery:?}");
    }
}

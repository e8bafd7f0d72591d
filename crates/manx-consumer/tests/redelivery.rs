// Redelivery engine end to end: backoff pacing, the timer-reset
// regression, max-deliver enforcement, ack verbs and work-queue retention.
mod common;

use common::*;
use manx_api::{
    AckPolicy, AdvisoryEvent, ConsumerConfig, NextRequest, headers, subjects,
};
use manx_consumer::{AckKind, ChannelTarget, Registry};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

const WAIT: Duration = Duration::from_secs(1);

#[tokio::test(start_paused = true)]
async fn unacked_messages_come_back_after_ack_wait() {
    let registry = Registry::new();
    let handle = registry
        .add_stream(stream_config("TEST", &["one"]))
        .expect("stream");
    create(
        &registry,
        "TEST",
        ConsumerConfig {
            ack_wait_ms: Some(2_000),
            ..durable("C")
        },
    );
    publish(&handle, "one", "data");

    let mut inbox = pull(&registry, "TEST", "C", batch(10));
    let first = recv(&mut inbox, WAIT).await.info.expect("info");
    assert_eq!(first.num_delivered, 1);

    let second = recv(&mut inbox, Duration::from_secs(5)).await.info.expect("info");
    assert_eq!(second.num_delivered, 2);
    assert_eq!(second.consumer_seq, first.consumer_seq);
    assert_eq!(second.stream_seq, first.stream_seq);
}

#[tokio::test(start_paused = true)]
async fn new_message_resets_the_redelivery_timer() {
    let registry = Registry::new();
    let handle = registry
        .add_stream(stream_config("TEST", &["events.>"]))
        .expect("stream");
    create(
        &registry,
        "TEST",
        ConsumerConfig {
            filter_subject: Some("events.>".into()),
            ack_policy: AckPolicy::Explicit,
            max_deliver: 3,
            backoff_ms: vec![2_000, 4_000],
            ack_wait_ms: Some(2_000),
            ..durable("C")
        },
    );

    let slack = Duration::from_millis(500);
    let backoff = [Duration::from_secs(2), Duration::from_secs(4)];
    let expected_backoff = |num_delivered: usize| {
        backoff[..num_delivered.saturating_sub(1).min(backoff.len())]
            .iter()
            .sum::<Duration>()
            + slack
    };

    let mut inbox = pull(
        &registry,
        "TEST",
        "C",
        NextRequest {
            batch: 100,
            ..NextRequest::default()
        },
    );

    let first_sent = Instant::now();
    publish(&handle, "events.first", "msg-1");
    let delivery = recv(&mut inbox, WAIT).await;
    assert_eq!(delivery.subject, "events.first");
    assert!(first_sent.elapsed() < expected_backoff(1));

    let delivery = recv(&mut inbox, Duration::from_secs(5)).await;
    assert_eq!(delivery.subject, "events.first");
    assert!(first_sent.elapsed() < expected_backoff(2));
    // events.first now sits on its final 4s backoff step.

    // A fresh message must fire on the first backoff step, not inherit
    // the late step of the older pending message.
    let second_sent = Instant::now();
    publish(&handle, "events.second", "msg-2");

    let mut first_redeliveries = 0;
    loop {
        let delivery = recv(&mut inbox, Duration::from_secs(10)).await;
        if delivery.subject == "events.first" {
            assert!(first_sent.elapsed() < expected_backoff(3));
            first_redeliveries += 1;
            continue;
        }
        let info = delivery.info.clone().expect("info");
        assert!(
            second_sent.elapsed() < expected_backoff(info.num_delivered as usize),
            "delivery {} of events.second arrived after {:?}",
            info.num_delivered,
            second_sent.elapsed()
        );
        if info.num_delivered >= 3 {
            break;
        }
    }
    assert!(first_redeliveries <= 1);
}

#[tokio::test(start_paused = true)]
async fn max_deliver_exhaustion_emits_an_advisory() {
    let registry = Registry::new();
    let handle = registry
        .add_stream(stream_config("TEST", &["one"]))
        .expect("stream");
    create(
        &registry,
        "TEST",
        ConsumerConfig {
            max_deliver: 2,
            ack_wait_ms: Some(1_000),
            ..durable("C")
        },
    );
    let mut advisories = registry.advisories();
    publish(&handle, "one", "doomed");

    let mut inbox = pull(&registry, "TEST", "C", batch(10));
    assert_eq!(recv(&mut inbox, WAIT).await.info.expect("info").num_delivered, 1);
    assert_eq!(
        recv(&mut inbox, Duration::from_secs(3)).await.info.expect("info").num_delivered,
        2
    );
    // No third delivery.
    recv_nothing(&mut inbox, Duration::from_secs(3)).await;

    let advisory = advisories.recv().await.expect("advisory");
    assert_eq!(
        advisory.subject,
        subjects::advisory(subjects::ADVISORY_KIND_MAX_DELIVERIES, "TEST", "C")
    );
    match advisory.event {
        AdvisoryEvent::MaxDeliveries {
            stream_seq,
            deliveries,
            ..
        } => {
            assert_eq!(stream_seq, 1);
            assert_eq!(deliveries, 2);
        }
        other => panic!("unexpected advisory {other:?}"),
    }

    // The exhausted entry no longer blocks the ack floor.
    let info = registry.consumer("TEST", "C").expect("consumer").info();
    assert_eq!(info.num_ack_pending, 0);
    assert_eq!(info.ack_floor.consumer_seq, 1);
}

#[tokio::test(start_paused = true)]
async fn nak_with_delay_schedules_a_single_retry() {
    let registry = Registry::new();
    let handle = registry
        .add_stream(stream_config("TEST", &["work.>"]))
        .expect("stream");
    create(
        &registry,
        "TEST",
        ConsumerConfig {
            filter_subject: Some("work.>".into()),
            ack_wait_ms: Some(60_000),
            ..durable("C")
        },
    );
    publish(&handle, "work.1", "item");

    let mut inbox = pull(&registry, "TEST", "C", batch(10));
    let info = recv(&mut inbox, WAIT).await.info.expect("info");
    let consumer = registry.consumer("TEST", "C").expect("consumer");

    consumer.handle_ack(
        info.stream_seq,
        AckKind::Nak(Some(Duration::from_secs(3))),
    );
    recv_nothing(&mut inbox, Duration::from_secs(2)).await;
    let redelivered = recv(&mut inbox, Duration::from_secs(3)).await.info.expect("info");
    assert_eq!(redelivered.num_delivered, 2);
    consumer.handle_ack(redelivered.stream_seq, AckKind::Ack);
    recv_nothing(&mut inbox, Duration::from_secs(90)).await;
}

#[tokio::test(start_paused = true)]
async fn in_progress_defers_redelivery_without_counting() {
    let registry = Registry::new();
    let handle = registry
        .add_stream(stream_config("TEST", &["one"]))
        .expect("stream");
    create(
        &registry,
        "TEST",
        ConsumerConfig {
            ack_wait_ms: Some(2_000),
            ..durable("C")
        },
    );
    publish(&handle, "one", "slow");

    let mut inbox = pull(&registry, "TEST", "C", batch(10));
    let info = recv(&mut inbox, WAIT).await.info.expect("info");
    let consumer = registry.consumer("TEST", "C").expect("consumer");

    tokio::time::sleep(Duration::from_millis(1_500)).await;
    consumer.handle_ack(info.stream_seq, AckKind::InProgress);
    // The original deadline passes without a redelivery.
    recv_nothing(&mut inbox, Duration::from_millis(1_500)).await;

    let redelivered = recv(&mut inbox, Duration::from_secs(2)).await.info.expect("info");
    assert_eq!(redelivered.num_delivered, 2);
}

#[tokio::test(start_paused = true)]
async fn term_drops_the_message_with_an_advisory() {
    let registry = Registry::new();
    let handle = registry
        .add_stream(stream_config("TEST", &["one"]))
        .expect("stream");
    create(
        &registry,
        "TEST",
        ConsumerConfig {
            ack_wait_ms: Some(1_000),
            ..durable("C")
        },
    );
    let mut advisories = registry.advisories();
    publish(&handle, "one", "poison");

    let mut inbox = pull(&registry, "TEST", "C", batch(10));
    let info = recv(&mut inbox, WAIT).await.info.expect("info");
    let consumer = registry.consumer("TEST", "C").expect("consumer");
    consumer.handle_ack(info.stream_seq, AckKind::Term);

    recv_nothing(&mut inbox, Duration::from_secs(5)).await;
    let advisory = advisories.recv().await.expect("advisory");
    assert!(matches!(advisory.event, AdvisoryEvent::Terminated { .. }));
}

#[tokio::test(start_paused = true)]
async fn ack_all_acknowledges_the_whole_prefix() {
    let registry = Registry::new();
    let handle = registry
        .add_stream(stream_config("TEST", &["one"]))
        .expect("stream");
    create(
        &registry,
        "TEST",
        ConsumerConfig {
            ack_policy: AckPolicy::All,
            ack_wait_ms: Some(30_000),
            ..durable("C")
        },
    );
    for i in 0..5 {
        publish(&handle, "one", &i.to_string());
    }

    let mut inbox = pull(&registry, "TEST", "C", batch(5));
    let mut last = None;
    for _ in 0..5 {
        last = recv(&mut inbox, WAIT).await.info;
    }
    let consumer = registry.consumer("TEST", "C").expect("consumer");
    assert_eq!(consumer.info().num_ack_pending, 5);

    // Ack the third delivery cumulatively.
    consumer.handle_ack(3, AckKind::Ack);
    let info = consumer.info();
    assert_eq!(info.num_ack_pending, 2);
    assert_eq!(info.ack_floor.consumer_seq, 3);

    consumer.handle_ack(last.expect("last info").stream_seq, AckKind::Ack);
    assert_eq!(consumer.info().ack_floor.consumer_seq, 5);
}

#[tokio::test(start_paused = true)]
async fn work_queue_retention_removes_acked_messages() {
    let registry = Registry::new();
    let handle = registry
        .add_stream(stream_config("WQ", &["jobs.>"]).work_queue())
        .expect("stream");
    create(
        &registry,
        "WQ",
        ConsumerConfig {
            filter_subject: Some("jobs.>".into()),
            ..durable("worker")
        },
    );
    for i in 0..3 {
        publish(&handle, &format!("jobs.{i}"), "job");
    }
    assert_eq!(handle.log().len(), 3);

    let mut inbox = pull(&registry, "WQ", "worker", batch(3));
    let consumer = registry.consumer("WQ", "worker").expect("consumer");
    for _ in 0..3 {
        let info = recv(&mut inbox, WAIT).await.info.expect("info");
        consumer.handle_ack(info.stream_seq, AckKind::Ack);
    }
    assert!(handle.log().is_empty());
}

#[tokio::test(start_paused = true)]
async fn push_consumers_deliver_without_pull_requests() {
    let registry = Registry::new();
    let handle = registry
        .add_stream(stream_config("TEST", &["one"]))
        .expect("stream");
    create(
        &registry,
        "TEST",
        ConsumerConfig {
            deliver_subject: Some("push.inbox".into()),
            ack_wait_ms: Some(30_000),
            ..durable("P")
        },
    );
    let consumer = registry.consumer("TEST", "P").expect("consumer");
    let (target, mut deliveries) = ChannelTarget::new();
    consumer.bind_push_target(Arc::new(target));

    publish(&handle, "one", "pushed");
    let (deliver_subject, delivery) =
        tokio::time::timeout(WAIT, deliveries.recv())
            .await
            .expect("timely")
            .expect("open");
    assert_eq!(deliver_subject, "push.inbox");
    assert_eq!(delivery.payload, b"pushed".as_slice());
    consumer.handle_ack(delivery.info.expect("info").stream_seq, AckKind::Ack);
}

#[tokio::test(start_paused = true)]
async fn push_consumer_exhaustion_publishes_a_terminal_status() {
    let registry = Registry::new();
    let handle = registry
        .add_stream(stream_config("TEST", &["one"]))
        .expect("stream");
    create(
        &registry,
        "TEST",
        ConsumerConfig {
            deliver_subject: Some("push.inbox".into()),
            max_deliver: 1,
            ack_wait_ms: Some(1_000),
            ..durable("P")
        },
    );
    let consumer = registry.consumer("TEST", "P").expect("consumer");
    let (target, mut deliveries) = ChannelTarget::new();
    consumer.bind_push_target(Arc::new(target));

    publish(&handle, "one", "doomed");
    let (_, delivery) = tokio::time::timeout(WAIT, deliveries.recv())
        .await
        .expect("timely")
        .expect("open");
    assert!(!delivery.is_status());

    let (_, status) = tokio::time::timeout(Duration::from_secs(3), deliveries.recv())
        .await
        .expect("timely")
        .expect("open");
    assert_eq!(status.description(), Some(headers::DESC_MAX_DELIVERIES));
}

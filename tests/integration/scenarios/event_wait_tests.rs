//! Wait/notification race behavior over the bus

use std::time::{Duration, Instant};

use serde_json::json;

use svharness::{EventAggregator, LoopbackBus, QuitCondition, SessionEvent};

use crate::integration::init_tracing;

fn done() -> QuitCondition {
    QuitCondition::new("done", |events: &[SessionEvent]| {
        events.iter().any(|event| event.payload["status"] == "done")
    })
}

fn far_deadline() -> tokio::time::Instant {
    tokio::time::Instant::now() + Duration::from_secs(30)
}

#[tokio::test]
async fn action_triggered_before_the_wait_returns_without_blocking() {
    init_tracing();

    let bus = LoopbackBus::new();
    let mut aggregator = EventAggregator::subscribe(&bus, "/session/race").unwrap();

    // The satisfying action completes before collect_until is ever called.
    bus.publish(SessionEvent::status("/session/race", json!({"status": "done"})));

    let started = Instant::now();
    let index = aggregator
        .collect_until(&[done()], true, far_deadline())
        .await
        .unwrap();

    assert_eq!(index, 0);
    assert!(
        started.elapsed() < Duration::from_millis(100),
        "pre-satisfied wait must not block, took {:?}",
        started.elapsed()
    );
}

#[tokio::test]
async fn any_permutation_of_notifications_is_observed_in_delivery_order() {
    init_tracing();

    let bus = LoopbackBus::new();
    let mut aggregator = EventAggregator::subscribe(&bus, "/session/order").unwrap();

    // Interleave kinds and shuffle payload identifiers; delivery order is
    // what must be preserved.
    let sequence = [3, 1, 4, 1, 5, 9, 2, 6];
    for (position, id) in sequence.iter().enumerate() {
        let event = if position % 2 == 0 {
            SessionEvent::progress("/session/order", json!({"id": id}))
        } else {
            SessionEvent::status("/session/order", json!({"id": id}))
        };
        bus.publish(event);
    }

    let observed: Vec<i64> = aggregator
        .events()
        .iter()
        .map(|event| event.payload["id"].as_i64().unwrap())
        .collect();
    assert_eq!(observed, sequence.map(i64::from).to_vec());
}

#[tokio::test]
async fn concurrent_predicates_neither_drop_nor_reorder_events() {
    init_tracing();

    let bus = LoopbackBus::new();
    let mut aggregator = EventAggregator::subscribe(&bus, "/session/multi").unwrap();

    let publisher = bus.clone();
    tokio::spawn(async move {
        for i in 0..5 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.publish(SessionEvent::progress("/session/multi", json!({"seq": i})));
        }
        publisher.publish(SessionEvent::status("/session/multi", json!({"status": "done"})));
    });

    let saw_three = QuitCondition::new("saw-seq-3", |events: &[SessionEvent]| {
        events.iter().any(|event| event.payload["seq"] == 3)
    });
    let index = aggregator
        .collect_until(&[saw_three, done()], true, far_deadline())
        .await
        .unwrap();
    assert_eq!(index, 0);

    // Waiting again with the other predicate picks up from the same log.
    let index = aggregator
        .collect_until(&[done()], true, far_deadline())
        .await
        .unwrap();
    assert_eq!(index, 0);

    let seqs: Vec<i64> = aggregator
        .events()
        .iter()
        .filter_map(|event| event.payload["seq"].as_i64())
        .collect();
    assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
}

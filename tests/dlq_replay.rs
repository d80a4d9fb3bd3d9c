mod support;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use delivery_core::context::RequestContext;
use delivery_core::dlq::ReplayReport;
use delivery_core::envelope::Envelope;
use delivery_core::processor::{HandlerError, MessageHandler, QueueConsumer};
use delivery_core::publisher::SendOptions;
use serde_json::{json, Value};
use support::Harness;

/// Rejects every message.
#[derive(Default)]
struct Poison {
    calls: AtomicUsize,
}

#[async_trait]
impl MessageHandler for Poison {
    async fn handle(&self, _ctx: &RequestContext, _envelope: &Envelope) -> Result<Value, HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(HandlerError::new("cannot process"))
    }
}

fn consumer(h: &Harness, queue: &str, handler: Arc<Poison>) -> QueueConsumer {
    let destination = h.publisher.destinations().queue(queue).unwrap().clone();
    QueueConsumer::new(Arc::new(h.broker.clone()), h.processor(), destination, handler)
        .with_visibility_timeout(Duration::ZERO)
}

/// Receive until the broker's redrive limit moves the message aside.
async fn fail_into_dead_letters(consumer: &QueueConsumer) {
    for _ in 0..4 {
        consumer.poll_once().await.unwrap();
    }
}

#[tokio::test]
async fn poison_message_is_replayed_exactly_once() {
    let h = Harness::new();
    let dlq = h.dlq();
    let poison = Arc::new(Poison::default());
    let consumer = consumer(&h, "emails", poison.clone());

    h.publisher
        .send(
            &Harness::ctx(),
            "emails",
            "email.requested",
            &json!({"to": "a@b.c"}),
            SendOptions::new().idempotency_key("welcome-7"),
        )
        .await
        .unwrap();
    fail_into_dead_letters(&consumer).await;
    assert_eq!(poison.calls.load(Ordering::SeqCst), 3);
    assert_eq!(dlq.get_count("emails").await.unwrap().dead_letters, 1);

    let peeked = dlq.get_dead_letters("emails", 10).await.unwrap();
    assert_eq!(peeked.len(), 1);
    assert_eq!(
        peeked[0].envelope.as_ref().and_then(|e| e.idempotency_key.as_deref()),
        Some("welcome-7")
    );

    let first = dlq.reprocess_all("emails").await.unwrap();
    assert_eq!(first, ReplayReport { reprocessed: 1, skipped: 0, failed: 0 });
    let resent: Envelope = Envelope::parse(&h.broker.bodies("emails")[0]).unwrap();
    assert_eq!(resent.metadata.reprocessed, Some(true));
    assert!(resent.metadata.original_failed_at.is_some());

    // Still poison: it fails its way back into the dead-letter queue.
    fail_into_dead_letters(&consumer).await;
    assert_eq!(h.broker.queue_len("emails"), 0);
    let sends_before = h.broker.send_calls();

    let second = dlq.reprocess_all("emails").await.unwrap();
    assert_eq!(second, ReplayReport { reprocessed: 0, skipped: 1, failed: 0 });
    assert_eq!(h.broker.send_calls(), sends_before);
    assert_eq!(h.broker.queue_len("emails"), 0);
    assert_eq!(h.broker.queue_len("emails-dlq"), 0);
    assert_eq!(h.metrics.replay_count("emails", "skipped"), 1);
}

#[tokio::test]
async fn fifo_replay_is_not_swallowed_by_the_original_dedup_window() {
    let h = Harness::new();
    let dlq = h.dlq();
    let consumer = consumer(&h, "orders", Arc::new(Poison::default()));

    h.publisher
        .send(
            &Harness::ctx(),
            "orders",
            "order.created",
            &json!({"orderId": 42}),
            SendOptions::new().idempotency_key("order-created-42"),
        )
        .await
        .unwrap();
    fail_into_dead_letters(&consumer).await;
    assert_eq!(h.broker.queue_len("orders-dlq.fifo"), 1);

    let report = dlq.reprocess_all("orders").await.unwrap();

    assert_eq!(report.reprocessed, 1);
    assert_eq!(h.broker.queue_len("orders.fifo"), 1);
    assert_eq!(h.broker.queue_len("orders-dlq.fifo"), 0);
}

#[tokio::test]
async fn purge_drains_the_dead_letter_queue() {
    let h = Harness::new();
    let dlq = h.dlq();
    let consumer = consumer(&h, "emails", Arc::new(Poison::default()));
    for n in 0..3 {
        h.publisher
            .send(&Harness::ctx(), "emails", "email.requested", &json!({"n": n}), SendOptions::new())
            .await
            .unwrap();
    }
    fail_into_dead_letters(&consumer).await;

    let counts = dlq.get_all_counts().await.unwrap();
    let emails = counts.iter().find(|c| c.destination == "emails").unwrap();
    assert_eq!(emails.dead_letter_address, "emails-dlq");
    assert_eq!(emails.dead_letters, 3);

    assert_eq!(dlq.purge("emails").await.unwrap(), 3);
    assert_eq!(dlq.get_count("emails").await.unwrap().dead_letters, 0);
}

mod support;

use delivery_core::bus::BrokerClient;
use delivery_core::context::{RequestContext, SYSTEM_TENANT};
use delivery_core::envelope::Envelope;
use delivery_core::publisher::{BatchItem, PublishError, SendOptions};
use serde_json::json;
use support::Harness;

#[tokio::test]
async fn fifo_sends_with_the_same_key_deliver_once() {
    let h = Harness::new();
    let ctx = Harness::ctx();
    let options = SendOptions::new().idempotency_key("order-created-42");

    let first = h
        .publisher
        .send(&ctx, "orders", "order.created", &json!({"orderId": 42}), options.clone())
        .await
        .unwrap();
    let second = h
        .publisher
        .send(&ctx, "orders", "order.created", &json!({"orderId": 42}), options)
        .await
        .unwrap();

    assert_eq!(first, second);
    let received = h.broker.receive("orders.fifo", 10, None).await.unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].group_id.as_deref(), Some("acme"));
    assert_eq!(received[0].attributes.get("eventType").map(String::as_str), Some("order.created"));
}

#[tokio::test]
async fn explicit_deduplication_id_wins_over_the_key() {
    let h = Harness::new();
    let ctx = Harness::ctx();

    for dedup in ["attempt-1", "attempt-2"] {
        h.publisher
            .send(
                &ctx,
                "orders",
                "order.created",
                &json!({}),
                SendOptions::new().idempotency_key("order-created-42").deduplication_id(dedup),
            )
            .await
            .unwrap();
    }

    assert_eq!(h.broker.queue_len("orders.fifo"), 2);
}

#[tokio::test]
async fn system_envelopes_need_no_tenant() {
    let h = Harness::new();

    let err = h
        .publisher
        .send(&RequestContext::new(), "orders", "tenant.provisioned", &json!({}), SendOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(err, PublishError::Envelope(_)));

    h.publisher
        .send(&RequestContext::new(), "orders", "tenant.provisioned", &json!({}), SendOptions::new().system())
        .await
        .unwrap();
    let received = h.broker.receive("orders.fifo", 10, None).await.unwrap();
    let envelope: Envelope = Envelope::parse(received[0].body.as_deref().unwrap()).unwrap();
    assert_eq!(envelope.tenant_id, SYSTEM_TENANT);
    assert_eq!(received[0].group_id.as_deref(), Some(SYSTEM_TENANT));
}

#[tokio::test]
async fn unknown_destinations_fail_before_any_send() {
    let h = Harness::new();

    let err = h
        .publisher
        .publish(&Harness::ctx(), "nowhere", "order.created", &json!({}), SendOptions::new())
        .await
        .unwrap_err();

    assert!(matches!(err, PublishError::UnknownDestination(name) if name == "nowhere"));
    assert_eq!(h.broker.send_calls(), 0);
    assert_eq!(h.metrics.send_failure_count("nowhere", "unknown_destination"), 1);
}

#[tokio::test]
async fn batches_are_split_into_provider_chunks() {
    let h = Harness::new();
    let items: Vec<_> = (0..12)
        .map(|n| BatchItem::new("email.requested", json!({"n": n})))
        .collect();

    let result = h
        .publisher
        .send_batch(&Harness::ctx(), "emails", items)
        .await
        .unwrap();

    assert!(result.is_complete());
    let indexes: Vec<_> = result.successful.iter().map(|s| s.index).collect();
    assert_eq!(indexes, (0..12).collect::<Vec<_>>());
    assert_eq!(h.broker.queue_len("emails"), 12);
    assert_eq!(h.metrics.sent_count("emails", "email.requested"), 12);
}

#[tokio::test]
async fn topic_publishes_fan_out() {
    let h = Harness::new();

    h.publisher
        .publish(&Harness::ctx(), "order-events", "order.shipped", &json!({"orderId": 42}), SendOptions::new())
        .await
        .unwrap();

    let bodies = h.broker.bodies("order-audit");
    assert_eq!(bodies.len(), 1);
    let envelope: Envelope = Envelope::parse(&bodies[0]).unwrap();
    assert_eq!(envelope.event_type, "order.shipped");
    assert_eq!(envelope.metadata.queue_name.as_deref(), Some("order-events"));
}

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, instrument, warn};

use super::{
    BatchFailure, BatchItem, BatchResult, BatchSent, Destination, DestinationKind,
    DestinationRegistry, PublishError, SendOptions,
};
use crate::breaker::CircuitBreakerGateway;
use crate::bus::{BrokerClient, OutgoingMessage, MAX_BATCH_SIZE};
use crate::context::RequestContext;
use crate::envelope::{Envelope, EnvelopeBuilder};
use crate::metrics::DeliveryMetrics;

/// Sends enveloped messages to logical queues and topics.
///
/// FIFO destinations get a deduplication id (explicit override, then the
/// envelope's idempotency key, then its message id) and a group id (explicit,
/// then the tenant). Every send goes through the breaker for its address.
#[derive(Clone)]
pub struct Publisher {
    broker: Arc<dyn BrokerClient>,
    destinations: DestinationRegistry,
    envelopes: EnvelopeBuilder,
    gateway: Arc<CircuitBreakerGateway>,
    metrics: Arc<DeliveryMetrics>,
}

impl Publisher {
    pub fn new(
        broker: Arc<dyn BrokerClient>,
        destinations: DestinationRegistry,
        envelopes: EnvelopeBuilder,
        gateway: Arc<CircuitBreakerGateway>,
        metrics: Arc<DeliveryMetrics>,
    ) -> Self {
        Self {
            broker,
            destinations,
            envelopes,
            gateway,
            metrics,
        }
    }

    pub fn destinations(&self) -> &DestinationRegistry {
        &self.destinations
    }

    pub fn envelopes(&self) -> &EnvelopeBuilder {
        &self.envelopes
    }

    /// Send to a named queue, returning the provider message id.
    #[instrument(skip(self, ctx, payload, options), fields(destination = %queue, event_type = %event_type))]
    pub async fn send<T>(
        &self,
        ctx: &RequestContext,
        queue: &str,
        event_type: &str,
        payload: &T,
        options: SendOptions,
    ) -> Result<String, PublishError>
    where
        T: Serialize + Sync,
    {
        self.deliver(DestinationKind::Queue, ctx, queue, event_type, payload, &options)
            .await
    }

    /// Publish to a named topic, returning the provider message id.
    #[instrument(skip(self, ctx, payload, options), fields(destination = %topic, event_type = %event_type))]
    pub async fn publish<T>(
        &self,
        ctx: &RequestContext,
        topic: &str,
        event_type: &str,
        payload: &T,
        options: SendOptions,
    ) -> Result<String, PublishError>
    where
        T: Serialize + Sync,
    {
        self.deliver(DestinationKind::Topic, ctx, topic, event_type, payload, &options)
            .await
    }

    /// Send many messages to a queue in provider-sized chunks.
    ///
    /// Fails only when the queue is unknown; every other failure is reported
    /// per entry.
    pub async fn send_batch<T>(
        &self,
        ctx: &RequestContext,
        queue: &str,
        items: Vec<BatchItem<T>>,
    ) -> Result<BatchResult, PublishError>
    where
        T: Serialize + Send + Sync,
    {
        self.deliver_batch(DestinationKind::Queue, ctx, queue, items)
            .await
    }

    pub async fn publish_batch<T>(
        &self,
        ctx: &RequestContext,
        topic: &str,
        items: Vec<BatchItem<T>>,
    ) -> Result<BatchResult, PublishError>
    where
        T: Serialize + Send + Sync,
    {
        self.deliver_batch(DestinationKind::Topic, ctx, topic, items)
            .await
    }

    fn resolve(&self, kind: DestinationKind, name: &str) -> Result<&Destination, PublishError> {
        self.destinations.get(kind, name).inspect_err(|err| {
            self.metrics.record_send_failure(name, err.reason());
            warn!(destination = %name, %kind, "unknown destination");
        })
    }

    fn envelope<'a, T>(
        &self,
        ctx: &RequestContext,
        destination: &Destination,
        event_type: &str,
        payload: &'a T,
        options: &SendOptions,
    ) -> Result<Envelope<&'a T>, PublishError> {
        let key = options.idempotency_key.clone();
        let mut envelope = if options.system {
            self.envelopes
                .create_system_envelope(Some(ctx), event_type, payload, key)?
        } else {
            self.envelopes.create_envelope(ctx, event_type, payload, key)?
        };
        envelope.metadata.queue_name = Some(destination.name.clone());
        Ok(envelope)
    }

    fn message<T: Serialize>(
        destination: &Destination,
        envelope: &Envelope<T>,
        options: &SendOptions,
    ) -> Result<OutgoingMessage, PublishError> {
        let mut message = OutgoingMessage::new(envelope.to_json()?)
            .with_attribute("eventType", envelope.event_type.as_str())
            .with_attribute("tenantId", envelope.tenant_id.as_str());
        if destination.fifo {
            let deduplication_id = options
                .deduplication_id
                .as_deref()
                .filter(|id| !id.trim().is_empty())
                .unwrap_or_else(|| envelope.dedupe_key());
            let group_id = options
                .group_id
                .as_deref()
                .filter(|id| !id.trim().is_empty())
                .unwrap_or(envelope.tenant_id.as_str());
            message = message
                .with_deduplication_id(deduplication_id)
                .with_group_id(group_id);
        }
        if let Some(delay) = options.delay_seconds {
            message = message.with_delay_seconds(delay);
        }
        Ok(message)
    }

    async fn deliver<T>(
        &self,
        kind: DestinationKind,
        ctx: &RequestContext,
        name: &str,
        event_type: &str,
        payload: &T,
        options: &SendOptions,
    ) -> Result<String, PublishError>
    where
        T: Serialize + Sync,
    {
        let destination = self.resolve(kind, name)?;
        let result = self
            .envelope(ctx, destination, event_type, payload, options)
            .and_then(|envelope| Self::message(destination, &envelope, options));
        let message = match result {
            Ok(message) => message,
            Err(err) => {
                self.metrics.record_send_failure(name, err.reason());
                return Err(err);
            }
        };

        let broker = self.broker.clone();
        let address = destination.address.clone();
        let sent = self
            .gateway
            .call(&destination.address, move || async move {
                broker.send(&address, message).await
            })
            .await;

        match sent {
            Ok(message_id) => {
                self.metrics.record_sent(name, event_type);
                debug!(destination = %name, %message_id, "message sent");
                Ok(message_id)
            }
            Err(err) => {
                let err = PublishError::from_breaker(name, err);
                self.metrics.record_send_failure(name, err.reason());
                warn!(destination = %name, error = %err, "send failed");
                Err(err)
            }
        }
    }

    async fn deliver_batch<T>(
        &self,
        kind: DestinationKind,
        ctx: &RequestContext,
        name: &str,
        items: Vec<BatchItem<T>>,
    ) -> Result<BatchResult, PublishError>
    where
        T: Serialize + Send + Sync,
    {
        let destination = self.resolve(kind, name)?;
        let mut result = BatchResult::default();

        let mut indexed = Vec::with_capacity(items.len());
        for (index, item) in items.iter().enumerate() {
            let built = self
                .envelope(ctx, destination, &item.event_type, &item.payload, &item.options)
                .and_then(|envelope| Self::message(destination, &envelope, &item.options));
            match built {
                Ok(message) => indexed.push((index, item.event_type.as_str(), message)),
                Err(err) => {
                    self.metrics.record_send_failure(name, err.reason());
                    result.failed.push(BatchFailure {
                        index,
                        error: err.to_string(),
                    });
                }
            }
        }

        for chunk in indexed.chunks(MAX_BATCH_SIZE) {
            let messages: Vec<OutgoingMessage> =
                chunk.iter().map(|(_, _, message)| message.clone()).collect();
            let broker = self.broker.clone();
            let address = destination.address.clone();
            let outcome = self
                .gateway
                .call(&destination.address, move || async move {
                    broker.send_batch(&address, messages).await
                })
                .await;

            match outcome {
                Ok(outcome) => {
                    for sent in outcome.successful {
                        if let Some((index, event_type, _)) = chunk.get(sent.index) {
                            self.metrics.record_sent(name, event_type);
                            result.successful.push(BatchSent {
                                index: *index,
                                message_id: sent.message_id,
                            });
                        }
                    }
                    for failed in outcome.failed {
                        if let Some((index, _, _)) = chunk.get(failed.index) {
                            self.metrics.record_send_failure(name, "broker");
                            result.failed.push(BatchFailure {
                                index: *index,
                                error: failed.error,
                            });
                        }
                    }
                }
                Err(err) => {
                    let err = PublishError::from_breaker(name, err);
                    warn!(destination = %name, error = %err, entries = chunk.len(), "batch send failed");
                    for (index, _, _) in chunk {
                        self.metrics.record_send_failure(name, err.reason());
                        result.failed.push(BatchFailure {
                            index: *index,
                            error: err.to_string(),
                        });
                    }
                }
            }
        }

        result.successful.sort_by_key(|sent| sent.index);
        result.failed.sort_by_key(|failed| failed.index);
        debug!(
            destination = %name,
            successful = result.successful.len(),
            failed = result.failed.len(),
            "batch sent"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{InMemoryBroker, QueueSettings};
    use crate::config::BreakerConfig;
    use serde_json::{json, Value};

    struct Fixture {
        broker: InMemoryBroker,
        metrics: Arc<DeliveryMetrics>,
        publisher: Publisher,
    }

    fn fixture() -> Fixture {
        let broker = InMemoryBroker::new();
        broker
            .create_queue("orders.fifo", QueueSettings::fifo())
            .unwrap();
        broker
            .create_queue("emails", QueueSettings::standard())
            .unwrap();
        broker.create_topic("order-events").unwrap();
        broker.subscribe("order-events", "emails").unwrap();

        let metrics = Arc::new(DeliveryMetrics::detached().unwrap());
        let gateway = Arc::new(CircuitBreakerGateway::new(
            &BreakerConfig::default(),
            metrics.clone(),
        ));
        let destinations = DestinationRegistry::new()
            .with_queue("orders", "orders.fifo")
            .with_queue("emails", "emails")
            .with_topic("order-events", "order-events");
        let publisher = Publisher::new(
            Arc::new(broker.clone()),
            destinations,
            EnvelopeBuilder::new("orders-service"),
            gateway,
            metrics.clone(),
        );
        Fixture {
            broker,
            metrics,
            publisher,
        }
    }

    fn tenant() -> RequestContext {
        RequestContext::for_tenant("acme").with_user("user-7")
    }

    #[tokio::test]
    async fn fifo_send_uses_idempotency_key_and_tenant_group() {
        let f = fixture();
        let options = SendOptions::new().idempotency_key("order-created-42");

        let first = f
            .publisher
            .send(&tenant(), "orders", "order.created", &json!({"orderId": 42}), options.clone())
            .await
            .unwrap();
        let second = f
            .publisher
            .send(&tenant(), "orders", "order.created", &json!({"orderId": 42}), options)
            .await
            .unwrap();

        assert_eq!(first, second);
        let received = f.broker.receive("orders.fifo", 10, None).await.unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].group_id.as_deref(), Some("acme"));

        let envelope: Envelope = Envelope::parse(received[0].body.as_deref().unwrap()).unwrap();
        assert_eq!(envelope.tenant_id, "acme");
        assert_eq!(envelope.idempotency_key.as_deref(), Some("order-created-42"));
        assert_eq!(envelope.metadata.queue_name.as_deref(), Some("orders"));
        assert_eq!(envelope.metadata.user_id.as_deref(), Some("user-7"));
        assert_eq!(f.metrics.sent_count("orders", "order.created"), 2);
    }

    #[tokio::test]
    async fn explicit_deduplication_id_wins() {
        let f = fixture();
        for dedup in ["a", "b"] {
            f.publisher
                .send(
                    &tenant(),
                    "orders",
                    "order.created",
                    &json!({}),
                    SendOptions::new()
                        .idempotency_key("same-key")
                        .deduplication_id(dedup)
                        .group_id("order-42"),
                )
                .await
                .unwrap();
        }

        assert_eq!(f.broker.queue_len("orders.fifo"), 2);
        let received = f.broker.receive("orders.fifo", 1, None).await.unwrap();
        assert_eq!(received[0].group_id.as_deref(), Some("order-42"));
    }

    #[tokio::test]
    async fn unknown_destination_fails_and_is_counted() {
        let f = fixture();
        let err = f
            .publisher
            .send(&tenant(), "missing", "order.created", &json!({}), SendOptions::new())
            .await
            .unwrap_err();

        assert!(matches!(err, PublishError::UnknownDestination(ref name) if name == "missing"));
        assert!(err.is_permanent());
        assert_eq!(f.metrics.send_failure_count("missing", "unknown_destination"), 1);
        assert_eq!(f.broker.send_calls(), 0);
    }

    #[tokio::test]
    async fn tenant_scoped_send_requires_tenant() {
        let f = fixture();
        let err = f
            .publisher
            .send(&RequestContext::new(), "emails", "email.requested", &json!({}), SendOptions::new())
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "envelope");

        f.publisher
            .send(
                &RequestContext::new(),
                "emails",
                "email.requested",
                &json!({}),
                SendOptions::new().system(),
            )
            .await
            .unwrap();
        let body = f.broker.bodies("emails").pop().unwrap();
        let envelope: Envelope = Envelope::parse(&body).unwrap();
        assert_eq!(envelope.tenant_id, "system");
    }

    #[tokio::test]
    async fn publish_fans_out_through_topic() {
        let f = fixture();
        f.publisher
            .publish(&tenant(), "order-events", "order.created", &json!({"orderId": 1}), SendOptions::new())
            .await
            .unwrap();

        let bodies = f.broker.bodies("emails");
        assert_eq!(bodies.len(), 1);
        let envelope: Envelope<Value> = Envelope::parse(&bodies[0]).unwrap();
        assert_eq!(envelope.payload["orderId"], 1);
        assert!(f.publisher.send(&tenant(), "order-events", "x", &json!({}), SendOptions::new()).await.is_err());
    }

    #[tokio::test]
    async fn broker_failures_are_recorded_and_propagated() {
        let f = fixture();
        f.broker.set_unavailable(true);

        let err = f
            .publisher
            .send(&tenant(), "emails", "email.requested", &json!({}), SendOptions::new())
            .await
            .unwrap_err();

        assert!(matches!(err, PublishError::Broker { .. }));
        assert!(!err.is_permanent());
        assert_eq!(f.metrics.send_failure_count("emails", "broker"), 1);
    }

    #[tokio::test]
    async fn batch_is_chunked_and_partitioned() {
        let f = fixture();
        let mut items: Vec<BatchItem<Value>> = (0..23)
            .map(|i| BatchItem::new("order.created", json!({ "i": i })))
            .collect();
        items[5].event_type = String::new();

        let result = f
            .publisher
            .send_batch(&tenant(), "emails", items)
            .await
            .unwrap();

        assert_eq!(result.successful.len(), 22);
        assert_eq!(result.failed.len(), 1);
        assert_eq!(result.failed[0].index, 5);
        assert!(!result.is_complete());
        assert_eq!(f.broker.queue_len("emails"), 22);
        assert_eq!(result.successful[5].index, 6);
    }

    #[tokio::test]
    async fn batch_to_unknown_destination_fails_whole_call() {
        let f = fixture();
        let items = vec![BatchItem::new("order.created", json!({}))];
        assert!(f.publisher.publish_batch(&tenant(), "nope", items).await.is_err());
    }
}

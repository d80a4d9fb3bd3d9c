use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};

use super::{DeadLetterResolver, DlqError};
use crate::breaker::CircuitBreakerGateway;
use crate::bus::{BrokerClient, BrokerError, OutgoingMessage, ReceivedMessage, MAX_BATCH_SIZE};
use crate::config::DlqConfig;
use crate::context::SYSTEM_TENANT;
use crate::envelope::Envelope;
use crate::idempotency::IdempotencyStore;
use crate::metrics::DeliveryMetrics;
use crate::publisher::{Destination, DestinationRegistry};

/// Namespace for replay markers inside the idempotency cache.
const REPLAY_NAMESPACE: &str = "dlq-replay:";

/// Floor for the replay visibility timeout; at zero a failed message would
/// be received again in the same run.
const MIN_REPLAY_VISIBILITY: Duration = Duration::from_secs(1);

/// A message sitting in a dead-letter queue.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    pub message_id: String,
    pub receipt_handle: String,
    pub body: Option<String>,
    /// `None` when the body is missing or not a valid envelope.
    pub envelope: Option<Envelope>,
    pub receive_count: u32,
    /// When the message landed in the dead-letter queue.
    pub failed_at: DateTime<Utc>,
}

impl From<ReceivedMessage> for DeadLetter {
    fn from(message: ReceivedMessage) -> Self {
        let envelope = message.body.as_deref().and_then(|body| Envelope::parse(body).ok());
        Self {
            message_id: message.message_id,
            receipt_handle: message.receipt_handle,
            body: message.body,
            envelope,
            receive_count: message.receive_count,
            failed_at: message.sent_at,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplayReport {
    pub reprocessed: usize,
    /// Already replayed within the tracking window; deleted without a resend.
    pub skipped: usize,
    /// Left in the dead-letter queue.
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DlqCount {
    pub destination: String,
    pub address: String,
    pub dead_letter_address: String,
    pub messages: u64,
    pub dead_letters: u64,
}

enum Replayed {
    Resent,
    Skipped,
}

/// Inspects, replays and purges the dead-letter queues paired with the
/// registered queues.
///
/// Replay marks each message (by its envelope's dedupe key) before resending
/// it, so a poison message that fails again and lands back in the
/// dead-letter queue is deleted instead of looping through the main queue
/// forever. The original is deleted only after the resend succeeded. Resends
/// go through the same per-address breaker as the publisher.
#[derive(Clone)]
pub struct DlqConsumer {
    broker: Arc<dyn BrokerClient>,
    gateway: Arc<CircuitBreakerGateway>,
    destinations: DestinationRegistry,
    resolver: DeadLetterResolver,
    replays: IdempotencyStore,
    config: DlqConfig,
    metrics: Arc<DeliveryMetrics>,
}

impl DlqConsumer {
    pub fn new(
        broker: Arc<dyn BrokerClient>,
        gateway: Arc<CircuitBreakerGateway>,
        destinations: DestinationRegistry,
        idempotency: &IdempotencyStore,
        config: DlqConfig,
        metrics: Arc<DeliveryMetrics>,
    ) -> Self {
        let replays = idempotency.namespaced(format!(
            "{}{REPLAY_NAMESPACE}",
            idempotency.config().key_prefix
        ));
        Self {
            broker,
            gateway,
            destinations,
            resolver: DeadLetterResolver::new(&config),
            replays,
            config,
            metrics,
        }
    }

    fn resolve(&self, destination: &str) -> Result<(&Destination, String), DlqError> {
        let main = self
            .destinations
            .queue(destination)
            .map_err(|_| DlqError::UnknownDestination(destination.to_string()))?;
        let dead_letters = self.resolver.resolve(&main.address);
        Ok((main, dead_letters))
    }

    /// Dead-letter address paired with a registered queue.
    pub fn dead_letter_address(&self, destination: &str) -> Result<String, DlqError> {
        self.resolve(destination).map(|(_, address)| address)
    }

    /// Look at up to `max` dead letters without deleting them.
    ///
    /// Receiving is a soft claim: with a non-zero peek visibility timeout the
    /// returned messages stay hidden from other readers until it lapses.
    pub async fn get_dead_letters(&self, destination: &str, max: usize) -> Result<Vec<DeadLetter>, DlqError> {
        let (_, address) = self.resolve(destination)?;
        let max = max.clamp(1, MAX_BATCH_SIZE);
        let messages = self
            .broker
            .receive(&address, max, Some(self.config.peek_visibility_timeout()))
            .await
            .map_err(|e| DlqError::broker(&address, e))?;
        Ok(messages.into_iter().map(DeadLetter::from).collect())
    }

    /// Replay every dead letter of `destination` back to its main queue.
    ///
    /// Received messages stay hidden for the replay visibility timeout, so a
    /// failed one does not come straight back. The run ends when a receive
    /// returns nothing new, or once it has tried as many messages as the
    /// queue held when it started. Per-message failures are counted, not
    /// raised; only a failed receive aborts the run.
    #[instrument(skip(self), fields(destination = %destination))]
    pub async fn reprocess_all(&self, destination: &str) -> Result<ReplayReport, DlqError> {
        let (main, address) = self.resolve(destination)?;
        let depth = self
            .broker
            .approximate_count(&address)
            .await
            .map_err(|e| DlqError::broker(&address, e))?;
        let visibility = self.config.replay_visibility_timeout().max(MIN_REPLAY_VISIBILITY);
        let mut report = ReplayReport::default();
        let mut seen = HashSet::new();

        while (seen.len() as u64) < depth {
            let batch = self
                .broker
                .receive(&address, self.config.batch_size, Some(visibility))
                .await
                .map_err(|e| DlqError::broker(&address, e))?;
            // Failed messages may become visible again within one run.
            if batch.iter().all(|m| seen.contains(&m.message_id)) {
                break;
            }

            for message in batch {
                if !seen.insert(message.message_id.clone()) {
                    continue;
                }
                let message_id = message.message_id.clone();
                match self.replay(main, &address, message).await {
                    Ok(Replayed::Resent) => {
                        report.reprocessed += 1;
                        self.metrics.record_replay(destination, "reprocessed");
                    }
                    Ok(Replayed::Skipped) => {
                        report.skipped += 1;
                        self.metrics.record_replay(destination, "skipped");
                    }
                    Err(err) => {
                        report.failed += 1;
                        self.metrics.record_replay(destination, "failed");
                        warn!(%message_id, error = %err, "dead letter replay failed");
                    }
                }
            }
        }

        info!(
            reprocessed = report.reprocessed,
            skipped = report.skipped,
            failed = report.failed,
            "dead letter replay finished"
        );
        Ok(report)
    }

    async fn replay(&self, main: &Destination, address: &str, message: ReceivedMessage) -> Result<Replayed, DlqError> {
        let body = message
            .body
            .as_deref()
            .ok_or_else(|| DlqError::EmptyMessage(message.message_id.clone()))?;
        let envelope = match Envelope::<Value>::parse(body) {
            Ok(envelope) => Some(envelope),
            Err(err) => {
                warn!(message_id = %message.message_id, error = %err, "replaying a message that is not an envelope");
                None
            }
        };
        let key = envelope
            .as_ref()
            .map_or(message.message_id.as_str(), |e| e.dedupe_key())
            .to_string();

        if !self
            .replays
            .mark_if_absent(&key, Some(self.config.replay_ttl()))
            .await?
        {
            debug!(%key, "already replayed; dropping dead letter");
            self.delete(address, &message.receipt_handle).await?;
            return Ok(Replayed::Skipped);
        }

        let outgoing = match self.replay_message(main, &key, &message, envelope) {
            Ok(outgoing) => outgoing,
            Err(err) => {
                self.unmark(&key).await;
                return Err(err);
            }
        };
        let sent = self
            .gateway
            .call(&main.address, || self.broker.send(&main.address, outgoing))
            .await;
        if let Err(err) = sent {
            self.unmark(&key).await;
            return Err(DlqError::from_breaker(&main.address, err));
        }

        // The marker turns a leftover copy into a skip on the next run.
        if let Err(err) = self.delete(address, &message.receipt_handle).await {
            warn!(%key, error = %err, "replayed message could not be deleted from the dead-letter queue");
        }
        debug!(%key, "dead letter replayed");
        Ok(Replayed::Resent)
    }

    fn replay_message(
        &self,
        main: &Destination,
        key: &str,
        message: &ReceivedMessage,
        envelope: Option<Envelope>,
    ) -> Result<OutgoingMessage, DlqError> {
        let mut tenant_id = None;
        let body = match envelope {
            Some(mut envelope) => {
                envelope.metadata.reprocessed = Some(true);
                envelope.metadata.original_failed_at = Some(message.sent_at);
                tenant_id = Some(envelope.tenant_id.clone());
                envelope
                    .to_json()
                    .map_err(|e| DlqError::broker(&main.address, BrokerError::Rejected(e.to_string())))?
            }
            None => message.body.clone().unwrap_or_default(),
        };

        let mut outgoing = OutgoingMessage::new(body).with_attribute("reprocessed", "true");
        for (name, value) in &message.attributes {
            outgoing = outgoing.with_attribute(name.clone(), value.clone());
        }
        if main.fifo {
            let group_id = message
                .group_id
                .clone()
                .or(tenant_id)
                .unwrap_or_else(|| SYSTEM_TENANT.to_string());
            outgoing = outgoing
                .with_deduplication_id(replay_deduplication_id(key))
                .with_group_id(group_id);
        }
        Ok(outgoing)
    }

    async fn unmark(&self, key: &str) {
        if let Err(err) = self.replays.forget(key).await {
            warn!(%key, error = %err, "failed to clear replay marker");
        }
    }

    async fn delete(&self, address: &str, receipt_handle: &str) -> Result<(), DlqError> {
        self.broker
            .delete(address, receipt_handle)
            .await
            .map_err(|e| DlqError::broker(address, e))
    }

    /// Delete every dead letter of `destination`. Irreversible.
    #[instrument(skip(self), fields(destination = %destination))]
    pub async fn purge(&self, destination: &str) -> Result<usize, DlqError> {
        let (_, address) = self.resolve(destination)?;
        let mut purged = 0;
        loop {
            let batch = self
                .broker
                .receive(&address, self.config.batch_size, Some(purge_visibility(&self.config)))
                .await
                .map_err(|e| DlqError::broker(&address, e))?;
            if batch.is_empty() {
                break;
            }
            for message in batch {
                self.delete(&address, &message.receipt_handle).await?;
                purged += 1;
            }
        }
        warn!(dead_letter_address = %address, purged, "dead-letter queue purged");
        Ok(purged)
    }

    /// Approximate depth of one queue and its dead-letter queue.
    pub async fn get_count(&self, destination: &str) -> Result<DlqCount, DlqError> {
        let (main, dead_letter_address) = self.resolve(destination)?;
        let messages = self
            .broker
            .approximate_count(&main.address)
            .await
            .map_err(|e| DlqError::broker(&main.address, e))?;
        let dead_letters = self
            .broker
            .approximate_count(&dead_letter_address)
            .await
            .map_err(|e| DlqError::broker(&dead_letter_address, e))?;
        Ok(DlqCount {
            destination: destination.to_string(),
            address: main.address.clone(),
            dead_letter_address,
            messages,
            dead_letters,
        })
    }

    /// Counts for every registered queue that has a dead-letter queue.
    pub async fn get_all_counts(&self) -> Result<Vec<DlqCount>, DlqError> {
        let names: Vec<String> = self.destinations.queues().map(|d| d.name.clone()).collect();
        let mut counts = Vec::with_capacity(names.len());
        for name in names {
            match self.get_count(&name).await {
                Ok(count) => counts.push(count),
                Err(DlqError::Broker {
                    source: BrokerError::DestinationNotFound(address),
                    ..
                }) => debug!(destination = %name, %address, "no dead-letter queue"),
                Err(err) => return Err(err),
            }
        }
        Ok(counts)
    }
}

/// Stable provider dedup id for a replay, distinct from the original send's.
fn replay_deduplication_id(key: &str) -> String {
    format!("replay-{}", URL_SAFE_NO_PAD.encode(Sha256::digest(key.as_bytes())))
}

fn purge_visibility(config: &DlqConfig) -> Duration {
    config.replay_visibility_timeout().max(MIN_REPLAY_VISIBILITY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{InMemoryBroker, QueueSettings};
    use crate::cache::InMemoryCache;
    use crate::config::{BreakerConfig, IdempotencyConfig};
    use crate::context::RequestContext;
    use crate::envelope::EnvelopeBuilder;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Delegates to an in-memory broker but can fail sends on demand.
    #[derive(Clone, Default)]
    struct FlakySends {
        inner: InMemoryBroker,
        failing: Arc<AtomicBool>,
    }

    #[async_trait]
    impl BrokerClient for FlakySends {
        async fn send(&self, address: &str, message: OutgoingMessage) -> Result<String, BrokerError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(BrokerError::ConnectionFailed(address.to_string()));
            }
            self.inner.send(address, message).await
        }

        async fn receive(
            &self,
            address: &str,
            max: usize,
            visibility_timeout: Option<Duration>,
        ) -> Result<Vec<ReceivedMessage>, BrokerError> {
            self.inner.receive(address, max, visibility_timeout).await
        }

        async fn delete(&self, address: &str, receipt_handle: &str) -> Result<(), BrokerError> {
            self.inner.delete(address, receipt_handle).await
        }

        async fn approximate_count(&self, address: &str) -> Result<u64, BrokerError> {
            self.inner.approximate_count(address).await
        }
    }

    struct Fixture {
        broker: FlakySends,
        metrics: Arc<DeliveryMetrics>,
        gateway: Arc<CircuitBreakerGateway>,
        consumer: DlqConsumer,
    }

    fn fixture(config: DlqConfig) -> Fixture {
        let broker = FlakySends::default();
        broker.inner.create_queue("orders", QueueSettings::standard()).unwrap();
        broker.inner.create_queue("orders-dlq", QueueSettings::standard()).unwrap();
        broker
            .inner
            .create_queue("payments.fifo", QueueSettings::fifo().with_redrive("payments-dlq.fifo", 3))
            .unwrap();
        broker.inner.create_queue("emails", QueueSettings::standard()).unwrap();

        let metrics = Arc::new(DeliveryMetrics::detached().unwrap());
        let idempotency = IdempotencyStore::new(Arc::new(InMemoryCache::new()), IdempotencyConfig::default());
        // High volume threshold keeps failing sends from tripping the breaker.
        let gateway = Arc::new(CircuitBreakerGateway::new(
            &BreakerConfig {
                volume_threshold: 1_000,
                ..BreakerConfig::default()
            },
            metrics.clone(),
        ));
        let consumer = DlqConsumer::new(
            Arc::new(broker.clone()),
            gateway.clone(),
            DestinationRegistry::new()
                .with_queue("orders", "orders")
                .with_queue("payments", "payments.fifo")
                .with_queue("emails", "emails"),
            &idempotency,
            config,
            metrics.clone(),
        );
        Fixture {
            broker,
            metrics,
            gateway,
            consumer,
        }
    }

    fn envelope_body(key: &str) -> String {
        EnvelopeBuilder::new("orders-service")
            .create_envelope(&RequestContext::for_tenant("acme"), "order.created", json!({"orderId": 42}), Some(key.to_string()))
            .unwrap()
            .to_json()
            .unwrap()
    }

    async fn dead_letter(broker: &FlakySends, body: String) {
        broker.inner.send("orders-dlq", OutgoingMessage::new(body)).await.unwrap();
    }

    #[tokio::test]
    async fn peek_leaves_messages_in_place() {
        let f = fixture(DlqConfig::default());
        dead_letter(&f.broker, envelope_body("order-42")).await;
        dead_letter(&f.broker, "not json".into()).await;

        let letters = f.consumer.get_dead_letters("orders", 10).await.unwrap();

        assert_eq!(letters.len(), 2);
        assert_eq!(
            letters[0].envelope.as_ref().and_then(|e| e.idempotency_key.as_deref()),
            Some("order-42")
        );
        assert!(letters[1].envelope.is_none());
        assert_eq!(f.broker.inner.queue_len("orders-dlq"), 2);
        assert_eq!(f.consumer.get_dead_letters("orders", 10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn replay_resends_tagged_copy_then_deletes() {
        let f = fixture(DlqConfig::default());
        dead_letter(&f.broker, envelope_body("order-42")).await;

        let report = f.consumer.reprocess_all("orders").await.unwrap();

        assert_eq!(report, ReplayReport { reprocessed: 1, skipped: 0, failed: 0 });
        assert_eq!(f.broker.inner.queue_len("orders-dlq"), 0);
        let bodies = f.broker.inner.bodies("orders");
        assert_eq!(bodies.len(), 1);
        let resent: Envelope = Envelope::parse(&bodies[0]).unwrap();
        assert_eq!(resent.metadata.reprocessed, Some(true));
        assert!(resent.metadata.original_failed_at.is_some());
        assert_eq!(f.metrics.replay_count("orders", "reprocessed"), 1);
    }

    #[tokio::test]
    async fn second_replay_of_the_same_message_only_deletes() {
        let f = fixture(DlqConfig::default());
        let body = envelope_body("order-42");
        dead_letter(&f.broker, body.clone()).await;
        f.consumer.reprocess_all("orders").await.unwrap();

        dead_letter(&f.broker, body).await;
        let report = f.consumer.reprocess_all("orders").await.unwrap();

        assert_eq!(report, ReplayReport { reprocessed: 0, skipped: 1, failed: 0 });
        assert_eq!(f.broker.inner.queue_len("orders"), 1);
        assert_eq!(f.broker.inner.queue_len("orders-dlq"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_resend_keeps_the_message_and_clears_the_marker() {
        let f = fixture(DlqConfig {
            replay_visibility_timeout_secs: 1,
            ..DlqConfig::default()
        });
        dead_letter(&f.broker, envelope_body("order-42")).await;
        f.broker.failing.store(true, Ordering::SeqCst);

        let report = f.consumer.reprocess_all("orders").await.unwrap();

        assert_eq!(report, ReplayReport { reprocessed: 0, skipped: 0, failed: 1 });
        assert_eq!(f.broker.inner.queue_len("orders-dlq"), 1);

        f.broker.failing.store(false, Ordering::SeqCst);
        tokio::time::advance(Duration::from_secs(1)).await;
        let report = f.consumer.reprocess_all("orders").await.unwrap();
        assert_eq!(report.reprocessed, 1);
        assert_eq!(f.broker.inner.queue_len("orders"), 1);
    }

    #[tokio::test]
    async fn every_failing_dead_letter_is_counted_past_one_batch() {
        // Hand-built config; validation would reject a zero timeout.
        let f = fixture(DlqConfig {
            replay_visibility_timeout_secs: 0,
            ..DlqConfig::default()
        });
        for key in 0..11 {
            dead_letter(&f.broker, envelope_body(&format!("order-{key}"))).await;
        }
        f.broker.failing.store(true, Ordering::SeqCst);

        let report = f.consumer.reprocess_all("orders").await.unwrap();

        assert_eq!(report, ReplayReport { reprocessed: 0, skipped: 0, failed: 11 });
        assert_eq!(f.broker.inner.queue_len("orders-dlq"), 11);
        assert_eq!(f.broker.inner.queue_len("orders"), 0);
    }

    #[tokio::test]
    async fn open_breaker_holds_the_replay_back() {
        let f = fixture(DlqConfig::default());
        dead_letter(&f.broker, envelope_body("order-42")).await;
        f.gateway.breaker("orders").force_open();

        let report = f.consumer.reprocess_all("orders").await.unwrap();

        assert_eq!(report, ReplayReport { reprocessed: 0, skipped: 0, failed: 1 });
        assert_eq!(f.broker.inner.queue_len("orders"), 0);
        assert_eq!(f.broker.inner.queue_len("orders-dlq"), 1);
    }

    #[tokio::test]
    async fn fifo_replay_uses_a_fresh_deduplication_id() {
        let f = fixture(DlqConfig::default());
        let body = envelope_body("pay-7");
        // The original send's dedup id is still inside the provider window.
        f.broker
            .inner
            .send(
                "payments.fifo",
                OutgoingMessage::new(body.clone()).with_group_id("acme").with_deduplication_id("pay-7"),
            )
            .await
            .unwrap();
        let received = f.broker.inner.receive("payments.fifo", 1, None).await.unwrap();
        f.broker.inner.delete("payments.fifo", &received[0].receipt_handle).await.unwrap();
        f.broker
            .inner
            .send(
                "payments-dlq.fifo",
                OutgoingMessage::new(body).with_group_id("acme").with_deduplication_id("pay-7"),
            )
            .await
            .unwrap();

        let report = f.consumer.reprocess_all("payments").await.unwrap();

        assert_eq!(report.reprocessed, 1);
        assert_eq!(f.broker.inner.queue_len("payments.fifo"), 1);
        assert!(replay_deduplication_id("pay-7").starts_with("replay-"));
        assert_ne!(replay_deduplication_id("pay-7"), replay_deduplication_id("pay-8"));
    }

    #[tokio::test]
    async fn purge_and_counts() {
        let f = fixture(DlqConfig::default());
        for key in ["a", "b", "c"] {
            dead_letter(&f.broker, envelope_body(key)).await;
        }

        let counts = f.consumer.get_all_counts().await.unwrap();
        let names: Vec<_> = counts.iter().map(|c| c.destination.as_str()).collect();
        assert_eq!(names, vec!["orders", "payments"]);
        assert_eq!(counts[0].dead_letters, 3);

        assert_eq!(f.consumer.purge("orders").await.unwrap(), 3);
        assert_eq!(f.consumer.get_count("orders").await.unwrap().dead_letters, 0);
    }

    #[tokio::test]
    async fn unknown_destination() {
        let f = fixture(DlqConfig::default());
        assert!(matches!(
            f.consumer.reprocess_all("nowhere").await,
            Err(DlqError::UnknownDestination(_))
        ));
    }
}

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{MessageHandler, MessageProcessor, ProcessError, ProcessOptions};
use crate::bus::{BrokerClient, BrokerError, MAX_BATCH_SIZE};
use crate::idempotency::Executed;
use crate::publisher::Destination;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConsumeReport {
    pub received: usize,
    pub processed: usize,
    pub duplicates: usize,
    /// Left on the queue to reappear after the visibility timeout.
    pub failed: usize,
}

/// Polls one queue and runs each message through a [`MessageProcessor`].
///
/// Handled and duplicate messages are deleted. Failures are left alone so
/// the broker redelivers them and, past its receive limit, moves them to
/// the dead-letter queue.
pub struct QueueConsumer {
    broker: Arc<dyn BrokerClient>,
    processor: MessageProcessor,
    handler: Arc<dyn MessageHandler>,
    destination: Destination,
    options: ProcessOptions,
    batch_size: usize,
    visibility_timeout: Option<Duration>,
}

impl QueueConsumer {
    pub fn new(
        broker: Arc<dyn BrokerClient>,
        processor: MessageProcessor,
        destination: Destination,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        Self {
            broker,
            processor,
            handler,
            destination,
            options: ProcessOptions::default(),
            batch_size: MAX_BATCH_SIZE,
            visibility_timeout: None,
        }
    }

    pub fn with_options(mut self, options: ProcessOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.clamp(1, MAX_BATCH_SIZE);
        self
    }

    /// Hide received messages for `timeout` instead of the queue default.
    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = Some(timeout);
        self
    }

    pub async fn poll_once(&self) -> Result<ConsumeReport, BrokerError> {
        let address = &self.destination.address;
        let messages = self
            .broker
            .receive(address, self.batch_size, self.visibility_timeout)
            .await?;

        let mut report = ConsumeReport {
            received: messages.len(),
            ..ConsumeReport::default()
        };
        for message in &messages {
            let outcome = self
                .processor
                .process(&self.destination.name, message, self.handler.as_ref(), &self.options)
                .await;
            match outcome {
                Ok(executed) => {
                    if let Executed::Duplicate(_) = executed {
                        report.duplicates += 1;
                    } else {
                        report.processed += 1;
                    }
                    if let Err(err) = self.broker.delete(address, &message.receipt_handle).await {
                        warn!(message_id = %message.message_id, error = %err, "failed to delete handled message");
                    }
                }
                Err(ProcessError::LockContention { key }) => {
                    report.failed += 1;
                    debug!(message_id = %message.message_id, %key, "message busy elsewhere; leaving for redelivery");
                }
                Err(err) => {
                    report.failed += 1;
                    warn!(
                        message_id = %message.message_id,
                        receive_count = message.receive_count,
                        error = %err,
                        "message processing failed"
                    );
                }
            }
        }
        Ok(report)
    }

    /// Poll until `shutdown` turns true, sleeping `idle` after an empty or
    /// failed poll.
    pub fn spawn(self, idle: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if *shutdown.borrow() {
                    break;
                }
                let busy = match self.poll_once().await {
                    Ok(report) => report.received > 0,
                    Err(err) => {
                        warn!(destination = %self.destination.name, error = %err, "receive failed");
                        false
                    }
                };
                if busy {
                    continue;
                }
                tokio::select! {
                    _ = tokio::time::sleep(idle) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
            debug!(destination = %self.destination.name, "queue consumer stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{InMemoryBroker, OutgoingMessage, QueueSettings};
    use crate::cache::InMemoryCache;
    use crate::config::IdempotencyConfig;
    use crate::context::RequestContext;
    use crate::envelope::{Envelope, EnvelopeBuilder};
    use crate::idempotency::IdempotencyStore;
    use crate::metrics::DeliveryMetrics;
    use crate::processor::HandlerError;
    use crate::publisher::DestinationRegistry;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FailOn {
        event_type: &'static str,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl MessageHandler for FailOn {
        async fn handle(&self, _ctx: &RequestContext, envelope: &Envelope) -> Result<Value, HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if envelope.event_type == self.event_type {
                return Err(HandlerError::new("poison"));
            }
            Ok(Value::Null)
        }
    }

    fn body(event_type: &str, key: &str) -> String {
        EnvelopeBuilder::new("orders-service")
            .create_envelope(&RequestContext::for_tenant("acme"), event_type, json!({}), Some(key.to_string()))
            .unwrap()
            .to_json()
            .unwrap()
    }

    #[tokio::test]
    async fn deletes_handled_and_leaves_failures() {
        let broker = InMemoryBroker::new();
        broker
            .create_queue("orders", QueueSettings::standard().with_redrive("orders-dlq", 2))
            .unwrap();
        for (event_type, key) in [("order.created", "a"), ("order.created", "a"), ("order.poison", "b")] {
            broker.send("orders", OutgoingMessage::new(body(event_type, key))).await.unwrap();
        }

        let processor = MessageProcessor::new(
            IdempotencyStore::new(Arc::new(InMemoryCache::new()), IdempotencyConfig::default()),
            Arc::new(DeliveryMetrics::detached().unwrap()),
        );
        let handler = Arc::new(FailOn {
            event_type: "order.poison",
            calls: AtomicUsize::new(0),
        });
        let destination = DestinationRegistry::new()
            .with_queue("orders", "orders")
            .queue("orders")
            .unwrap()
            .clone();
        let consumer = QueueConsumer::new(Arc::new(broker.clone()), processor, destination, handler.clone())
            .with_visibility_timeout(Duration::ZERO);

        let report = consumer.poll_once().await.unwrap();
        assert_eq!(
            report,
            ConsumeReport {
                received: 3,
                processed: 1,
                duplicates: 1,
                failed: 1
            }
        );
        assert_eq!(broker.queue_len("orders"), 1);

        // Second failure, then the redrive limit moves it aside.
        consumer.poll_once().await.unwrap();
        let report = consumer.poll_once().await.unwrap();
        assert_eq!(report.received, 0);
        assert_eq!(broker.queue_len("orders"), 0);
        assert_eq!(broker.queue_len("orders-dlq"), 1);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    }
}

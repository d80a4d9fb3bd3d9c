#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use delivery_core::breaker::CircuitBreakerGateway;
use delivery_core::bus::{InMemoryBroker, QueueSettings};
use delivery_core::cache::InMemoryCache;
use delivery_core::config::DeliveryConfig;
use delivery_core::context::RequestContext;
use delivery_core::dlq::DlqConsumer;
use delivery_core::envelope::EnvelopeBuilder;
use delivery_core::idempotency::IdempotencyStore;
use delivery_core::metrics::DeliveryMetrics;
use delivery_core::outbox::{InMemoryOutboxStore, SideEffectService};
use delivery_core::outbox_worker::{
    InMemoryJobScheduler, JobScheduler, LogSink, OutboxSweeper, OutboxWorker, SideEffectDispatcher,
};
use delivery_core::processor::MessageProcessor;
use delivery_core::publisher::{DestinationRegistry, Publisher};
use serde_json::Value;

/// `orders` is a FIFO queue, `emails` a standard one; the `order-events`
/// topic fans out to `order-audit`. Short backoff keeps retry tests quick,
/// and a high volume threshold keeps breakers closed through outages.
pub const CONFIG: &str = r#"
service_name = "orders-service"

[breaker]
volume_threshold = 1000

[worker]
backoff_base_ms = 100
backoff_max_ms = 1000

[destinations.queues.orders]
address = "orders.fifo"

[destinations.queues.emails]
address = "emails"

[destinations.topics.order-events]
address = "order-events"
"#;

pub struct Harness {
    pub config: DeliveryConfig,
    pub broker: InMemoryBroker,
    pub cache: InMemoryCache,
    pub idempotency: IdempotencyStore,
    pub metrics: Arc<DeliveryMetrics>,
    /// Shared by the publisher and the dead-letter replayer.
    pub gateway: Arc<CircuitBreakerGateway>,
    pub publisher: Publisher,
    pub store: InMemoryOutboxStore,
    /// Lines written by the email and audit sinks.
    pub sink_log: Arc<Mutex<Vec<String>>>,
}

impl Harness {
    pub fn new() -> Self {
        let config = DeliveryConfig::from_toml_str(CONFIG).expect("test config is valid");
        let _ = delivery_core::telemetry::init_tracing(&config.logging);

        let broker = InMemoryBroker::new();
        broker
            .create_queue("orders.fifo", QueueSettings::for_address("orders.fifo").with_redrive("orders-dlq.fifo", 3))
            .unwrap();
        broker
            .create_queue("emails", QueueSettings::standard().with_redrive("emails-dlq", 3))
            .unwrap();
        broker.create_queue("order-audit", QueueSettings::standard()).unwrap();
        broker.create_topic("order-events").unwrap();
        broker.subscribe("order-events", "order-audit").unwrap();

        let cache = InMemoryCache::new();
        let idempotency = IdempotencyStore::new(Arc::new(cache.clone()), config.idempotency.clone());
        let metrics = Arc::new(DeliveryMetrics::detached().unwrap());
        let gateway = Arc::new(CircuitBreakerGateway::new(&config.breaker, metrics.clone()));
        let publisher = Publisher::new(
            Arc::new(broker.clone()),
            DestinationRegistry::from_config(&config.destinations),
            EnvelopeBuilder::new(config.service_name.clone()),
            gateway.clone(),
            metrics.clone(),
        );

        Self {
            config,
            broker,
            cache,
            idempotency,
            metrics,
            gateway,
            publisher,
            store: InMemoryOutboxStore::new(),
            sink_log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn ctx() -> RequestContext {
        RequestContext::for_tenant("acme")
            .with_user("user-7")
            .with_correlation_id("corr-1")
    }

    pub fn worker(&self) -> Arc<OutboxWorker> {
        let sink = Arc::new(LogSink::with_buffer(self.sink_log.clone()));
        let dispatcher = SideEffectDispatcher::new(self.publisher.clone(), sink.clone(), sink);
        Arc::new(OutboxWorker::new(Arc::new(self.store.clone()), dispatcher, self.metrics.clone()))
    }

    pub fn scheduler(&self) -> InMemoryJobScheduler {
        InMemoryJobScheduler::new(&self.config.worker, self.worker())
    }

    pub fn side_effects(&self, scheduler: Arc<dyn JobScheduler>) -> SideEffectService {
        SideEffectService::new(self.publisher.clone(), scheduler, self.config.worker.clone())
    }

    pub fn sweeper(&self, scheduler: Arc<dyn JobScheduler>) -> OutboxSweeper {
        OutboxSweeper::new(Arc::new(self.store.clone()), scheduler, self.config.worker.clone())
    }

    pub fn dlq(&self) -> DlqConsumer {
        DlqConsumer::new(
            Arc::new(self.broker.clone()),
            self.gateway.clone(),
            self.publisher.destinations().clone(),
            &self.idempotency,
            self.config.dlq.clone(),
            self.metrics.clone(),
        )
    }

    pub fn processor(&self) -> MessageProcessor {
        MessageProcessor::new(self.idempotency.clone(), self.metrics.clone())
    }

    pub fn envelope_body(&self, event_type: &str, payload: Value, key: Option<&str>) -> String {
        self.publisher
            .envelopes()
            .create_envelope(&Self::ctx(), event_type, payload, key.map(str::to_string))
            .unwrap()
            .to_json()
            .unwrap()
    }

    pub fn sink_lines(&self) -> Vec<String> {
        self.sink_log.lock().unwrap().clone()
    }
}

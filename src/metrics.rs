//! Prometheus counters shared by the delivery components.
//!
//! Components receive an `Arc<DeliveryMetrics>` through their constructors;
//! nothing here is global.

use prometheus::{IntCounterVec, Opts, Registry};

/// Counters for sends, consumption, outbox dispatch, DLQ replay and
/// circuit breaker activity.
#[derive(Clone)]
pub struct DeliveryMetrics {
    messages_sent: IntCounterVec,
    send_failures: IntCounterVec,
    messages_consumed: IntCounterVec,
    outbox_dispatch: IntCounterVec,
    dlq_replay: IntCounterVec,
    circuit_transitions: IntCounterVec,
    circuit_rejections: IntCounterVec,
}

impl std::fmt::Debug for DeliveryMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryMetrics").finish_non_exhaustive()
    }
}

fn counter_vec(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> Result<IntCounterVec, prometheus::Error> {
    let counter = IntCounterVec::new(Opts::new(name, help), labels)?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

impl DeliveryMetrics {
    /// Register every delivery counter with `registry`.
    pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        Ok(Self {
            messages_sent: counter_vec(
                registry,
                "delivery_messages_sent_total",
                "Messages accepted by the broker",
                &["destination", "event_type"],
            )?,
            send_failures: counter_vec(
                registry,
                "delivery_send_failures_total",
                "Messages that could not be sent",
                &["destination", "reason"],
            )?,
            messages_consumed: counter_vec(
                registry,
                "delivery_messages_consumed_total",
                "Messages handled by the message processor",
                &["destination", "event_type", "duplicate"],
            )?,
            outbox_dispatch: counter_vec(
                registry,
                "delivery_outbox_dispatch_total",
                "Outbox side effects dispatched by outcome",
                &["effect_type", "outcome"],
            )?,
            dlq_replay: counter_vec(
                registry,
                "delivery_dlq_replay_total",
                "Dead-letter messages handled during replay by outcome",
                &["destination", "outcome"],
            )?,
            circuit_transitions: counter_vec(
                registry,
                "delivery_circuit_transitions_total",
                "Circuit breaker state transitions",
                &["key", "state"],
            )?,
            circuit_rejections: counter_vec(
                registry,
                "delivery_circuit_rejections_total",
                "Calls rejected by an open circuit",
                &["key"],
            )?,
        })
    }

    /// Build an instance backed by a private registry.
    pub fn detached() -> Result<Self, prometheus::Error> {
        Self::register(&Registry::new())
    }

    pub fn record_sent(&self, destination: &str, event_type: &str) {
        self.messages_sent
            .with_label_values(&[destination, event_type])
            .inc();
    }

    pub fn record_send_failure(&self, destination: &str, reason: &str) {
        self.send_failures
            .with_label_values(&[destination, reason])
            .inc();
    }

    pub fn record_consumed(&self, destination: &str, event_type: &str, duplicate: bool) {
        let duplicate = if duplicate { "true" } else { "false" };
        self.messages_consumed
            .with_label_values(&[destination, event_type, duplicate])
            .inc();
    }

    pub fn record_dispatch(&self, effect_type: &str, outcome: &str) {
        self.outbox_dispatch
            .with_label_values(&[effect_type, outcome])
            .inc();
    }

    pub fn record_replay(&self, destination: &str, outcome: &str) {
        self.dlq_replay
            .with_label_values(&[destination, outcome])
            .inc();
    }

    pub fn record_transition(&self, key: &str, state: &str) {
        self.circuit_transitions
            .with_label_values(&[key, state])
            .inc();
    }

    pub fn record_rejection(&self, key: &str) {
        self.circuit_rejections.with_label_values(&[key]).inc();
    }

    pub fn sent_count(&self, destination: &str, event_type: &str) -> u64 {
        self.messages_sent
            .with_label_values(&[destination, event_type])
            .get()
    }

    pub fn send_failure_count(&self, destination: &str, reason: &str) -> u64 {
        self.send_failures
            .with_label_values(&[destination, reason])
            .get()
    }

    pub fn consumed_count(&self, destination: &str, event_type: &str, duplicate: bool) -> u64 {
        let duplicate = if duplicate { "true" } else { "false" };
        self.messages_consumed
            .with_label_values(&[destination, event_type, duplicate])
            .get()
    }

    pub fn dispatch_count(&self, effect_type: &str, outcome: &str) -> u64 {
        self.outbox_dispatch
            .with_label_values(&[effect_type, outcome])
            .get()
    }

    pub fn replay_count(&self, destination: &str, outcome: &str) -> u64 {
        self.dlq_replay
            .with_label_values(&[destination, outcome])
            .get()
    }

    pub fn transition_count(&self, key: &str, state: &str) -> u64 {
        self.circuit_transitions
            .with_label_values(&[key, state])
            .get()
    }

    pub fn rejection_count(&self, key: &str) -> u64 {
        self.circuit_rejections.with_label_values(&[key]).get()
    }
}

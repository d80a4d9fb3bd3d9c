//! In-memory broker for testing and single-process scenarios.
//!
//! Models the parts of a hosted queue service the delivery core relies on:
//! visibility timeouts, receive counts, redrive to a dead-letter queue,
//! FIFO queues with per-group ordering and a deduplication window, and
//! topics fanning out to subscribed queues.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{BrokerClient, BrokerError, OutgoingMessage, ReceivedMessage};

/// How long a FIFO deduplication id suppresses repeats.
pub const DEFAULT_DEDUP_WINDOW: Duration = Duration::from_secs(5 * 60);

const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);

/// Move messages to `dead_letter_address` once they have been received
/// `max_receive_count` times without being deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedrivePolicy {
    pub dead_letter_address: String,
    pub max_receive_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSettings {
    pub fifo: bool,
    pub visibility_timeout: Duration,
    pub dedup_window: Duration,
    pub redrive: Option<RedrivePolicy>,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            fifo: false,
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
            dedup_window: DEFAULT_DEDUP_WINDOW,
            redrive: None,
        }
    }
}

impl QueueSettings {
    pub fn standard() -> Self {
        Self::default()
    }

    pub fn fifo() -> Self {
        Self {
            fifo: true,
            ..Self::default()
        }
    }

    /// Settings inferred from the address: `.fifo` suffix means FIFO.
    pub fn for_address(address: &str) -> Self {
        if address.ends_with(".fifo") {
            Self::fifo()
        } else {
            Self::standard()
        }
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    pub fn with_redrive(mut self, dead_letter_address: impl Into<String>, max_receive_count: u32) -> Self {
        self.redrive = Some(RedrivePolicy {
            dead_letter_address: dead_letter_address.into(),
            max_receive_count,
        });
        self
    }
}

#[derive(Debug, Clone)]
struct StoredMessage {
    message_id: String,
    body: String,
    attributes: BTreeMap<String, String>,
    group_id: Option<String>,
    receive_count: u32,
    visible_at: Instant,
    receipt_handle: Option<String>,
    sent_at: DateTime<Utc>,
}

impl StoredMessage {
    fn to_received(&self, receipt_handle: String) -> ReceivedMessage {
        ReceivedMessage {
            message_id: self.message_id.clone(),
            receipt_handle,
            body: Some(self.body.clone()),
            attributes: self.attributes.clone(),
            group_id: self.group_id.clone(),
            receive_count: self.receive_count,
            sent_at: self.sent_at,
        }
    }
}

struct QueueState {
    settings: QueueSettings,
    messages: VecDeque<StoredMessage>,
    /// Deduplication id -> (original message id, expiry).
    dedup: HashMap<String, (String, Instant)>,
}

impl QueueState {
    fn new(settings: QueueSettings) -> Self {
        Self {
            settings,
            messages: VecDeque::new(),
            dedup: HashMap::new(),
        }
    }

    fn enqueue(&mut self, address: &str, message: &OutgoingMessage, now: Instant) -> Result<String, BrokerError> {
        if self.settings.fifo {
            let group_id = message.group_id.as_deref().unwrap_or_default();
            if group_id.is_empty() {
                return Err(BrokerError::Rejected(format!("{address}: FIFO queues require a group id")));
            }
            let dedup_id = message.deduplication_id.as_deref().unwrap_or_default();
            if dedup_id.is_empty() {
                return Err(BrokerError::Rejected(format!(
                    "{address}: FIFO queues require a deduplication id"
                )));
            }
            self.dedup.retain(|_, (_, expires_at)| *expires_at > now);
            if let Some((original, _)) = self.dedup.get(dedup_id) {
                debug!(address, dedup_id, "duplicate send suppressed");
                return Ok(original.clone());
            }
            let message_id = Uuid::new_v4().to_string();
            self.dedup.insert(
                dedup_id.to_string(),
                (message_id.clone(), now + self.settings.dedup_window),
            );
            self.push(message_id.clone(), message, now);
            return Ok(message_id);
        }

        let message_id = Uuid::new_v4().to_string();
        self.push(message_id.clone(), message, now);
        Ok(message_id)
    }

    fn push(&mut self, message_id: String, message: &OutgoingMessage, now: Instant) {
        let delay = message.delay_seconds.map_or(Duration::ZERO, |s| Duration::from_secs(u64::from(s)));
        let group_id = if self.settings.fifo {
            message.group_id.clone()
        } else {
            None
        };
        self.messages.push_back(StoredMessage {
            message_id,
            body: message.body.clone(),
            attributes: message.attributes.clone(),
            group_id,
            receive_count: 0,
            visible_at: now + delay,
            receipt_handle: None,
            sent_at: Utc::now(),
        });
    }
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    /// Topic address -> subscribed queue addresses.
    topics: HashMap<String, Vec<String>>,
}

/// Thread-safe in-memory broker. Clones share state.
///
/// ```
/// use delivery_core::bus::{BrokerClient, InMemoryBroker, OutgoingMessage, QueueSettings};
///
/// # tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap().block_on(async {
/// let broker = InMemoryBroker::new();
/// broker.create_queue("orders", QueueSettings::standard()).unwrap();
///
/// broker.send("orders", OutgoingMessage::new("{}")).await.unwrap();
/// let received = broker.receive("orders", 10, None).await.unwrap();
/// assert_eq!(received.len(), 1);
/// broker.delete("orders", &received[0].receipt_handle).await.unwrap();
/// # });
/// ```
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    unavailable: Arc<AtomicBool>,
    send_calls: Arc<AtomicU64>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, BrokerState>, BrokerError> {
        self.state
            .lock()
            .map_err(|e| BrokerError::Poisoned(e.to_string()))
    }

    fn ensure_available(&self, address: &str) -> Result<(), BrokerError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BrokerError::ConnectionFailed(format!("{address}: broker unavailable")));
        }
        Ok(())
    }

    /// Create a queue. A redrive target that does not exist yet is created
    /// with the same FIFO setting.
    pub fn create_queue(&self, address: impl Into<String>, settings: QueueSettings) -> Result<(), BrokerError> {
        let address = address.into();
        let mut state = self.state()?;
        if let Some(policy) = &settings.redrive {
            let dlq_settings = QueueSettings {
                fifo: settings.fifo,
                ..QueueSettings::default()
            };
            state
                .queues
                .entry(policy.dead_letter_address.clone())
                .or_insert_with(|| QueueState::new(dlq_settings));
        }
        state.queues.insert(address, QueueState::new(settings));
        Ok(())
    }

    pub fn create_topic(&self, address: impl Into<String>) -> Result<(), BrokerError> {
        self.state()?.topics.entry(address.into()).or_default();
        Ok(())
    }

    /// Deliver every message published to `topic` into `queue` as well.
    pub fn subscribe(&self, topic: &str, queue: &str) -> Result<(), BrokerError> {
        let mut state = self.state()?;
        if !state.queues.contains_key(queue) {
            return Err(BrokerError::DestinationNotFound(queue.to_string()));
        }
        let subscribers = state
            .topics
            .get_mut(topic)
            .ok_or_else(|| BrokerError::DestinationNotFound(topic.to_string()))?;
        if !subscribers.iter().any(|q| q == queue) {
            subscribers.push(queue.to_string());
        }
        Ok(())
    }

    /// Simulate an outage: every call fails with `ConnectionFailed` while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of `send` calls that reached the broker, including rejected
    /// and deduplicated ones.
    pub fn send_calls(&self) -> u64 {
        self.send_calls.load(Ordering::SeqCst)
    }

    /// Bodies of every message in the queue, visible or in flight, in order.
    pub fn bodies(&self, address: &str) -> Vec<String> {
        self.state()
            .ok()
            .and_then(|state| {
                state
                    .queues
                    .get(address)
                    .map(|q| q.messages.iter().map(|m| m.body.clone()).collect())
            })
            .unwrap_or_default()
    }

    pub fn queue_len(&self, address: &str) -> usize {
        self.state()
            .ok()
            .and_then(|state| state.queues.get(address).map(|q| q.messages.len()))
            .unwrap_or(0)
    }
}

#[async_trait]
impl BrokerClient for InMemoryBroker {
    async fn send(&self, address: &str, message: OutgoingMessage) -> Result<String, BrokerError> {
        self.send_calls.fetch_add(1, Ordering::SeqCst);
        self.ensure_available(address)?;
        let now = Instant::now();
        let mut state = self.state()?;

        if let Some(subscribers) = state.topics.get(address).cloned() {
            for queue_address in subscribers {
                if let Some(queue) = state.queues.get_mut(&queue_address) {
                    let mut copy = message.clone();
                    if queue.settings.fifo && copy.group_id.is_none() {
                        copy.group_id = Some(address.to_string());
                    }
                    if let Err(err) = queue.enqueue(&queue_address, &copy, now) {
                        warn!(topic = address, queue = %queue_address, error = %err, "topic fan-out rejected");
                    }
                }
            }
            return Ok(Uuid::new_v4().to_string());
        }

        let queue = state
            .queues
            .get_mut(address)
            .ok_or_else(|| BrokerError::DestinationNotFound(address.to_string()))?;
        queue.enqueue(address, &message, now)
    }

    async fn receive(
        &self,
        address: &str,
        max: usize,
        visibility_timeout: Option<Duration>,
    ) -> Result<Vec<ReceivedMessage>, BrokerError> {
        self.ensure_available(address)?;
        let now = Instant::now();
        let mut state = self.state()?;
        let queue = state
            .queues
            .get_mut(address)
            .ok_or_else(|| BrokerError::DestinationNotFound(address.to_string()))?;

        let visibility = visibility_timeout.unwrap_or(queue.settings.visibility_timeout);
        let redrive = queue.settings.redrive.clone();
        let fifo = queue.settings.fifo;

        let mut delivered = Vec::new();
        let mut dead = Vec::new();
        let mut blocked_groups: HashSet<String> = HashSet::new();
        let mut index = 0;

        while index < queue.messages.len() && delivered.len() < max {
            let (visible, group_id, receive_count) = {
                let message = &queue.messages[index];
                (message.visible_at <= now, message.group_id.clone(), message.receive_count)
            };

            if fifo {
                if let Some(group_id) = group_id {
                    if blocked_groups.contains(&group_id) {
                        index += 1;
                        continue;
                    }
                    if !visible {
                        // An in-flight message holds back the rest of its group.
                        blocked_groups.insert(group_id);
                        index += 1;
                        continue;
                    }
                }
            }
            if !visible {
                index += 1;
                continue;
            }

            if let Some(policy) = &redrive {
                if receive_count >= policy.max_receive_count {
                    if let Some(message) = queue.messages.remove(index) {
                        dead.push(message);
                    }
                    continue;
                }
            }

            let receipt_handle = Uuid::new_v4().to_string();
            let message = &mut queue.messages[index];
            message.receive_count += 1;
            message.visible_at = now + visibility;
            message.receipt_handle = Some(receipt_handle.clone());
            delivered.push(message.to_received(receipt_handle));
            index += 1;
        }

        if let Some(policy) = redrive {
            if !dead.is_empty() {
                match state.queues.get_mut(&policy.dead_letter_address) {
                    Some(dlq) => {
                        for mut message in dead {
                            debug!(
                                source = address,
                                dead_letter = %policy.dead_letter_address,
                                message_id = %message.message_id,
                                "redriving message"
                            );
                            message.receive_count = 0;
                            message.visible_at = now;
                            message.receipt_handle = None;
                            message.sent_at = Utc::now();
                            dlq.messages.push_back(message);
                        }
                    }
                    None => warn!(
                        source = address,
                        dead_letter = %policy.dead_letter_address,
                        dropped = dead.len(),
                        "dead-letter queue missing; messages dropped"
                    ),
                }
            }
        }

        Ok(delivered)
    }

    async fn delete(&self, address: &str, receipt_handle: &str) -> Result<(), BrokerError> {
        self.ensure_available(address)?;
        let mut state = self.state()?;
        let queue = state
            .queues
            .get_mut(address)
            .ok_or_else(|| BrokerError::DestinationNotFound(address.to_string()))?;
        let position = queue
            .messages
            .iter()
            .position(|m| m.receipt_handle.as_deref() == Some(receipt_handle))
            .ok_or_else(|| BrokerError::InvalidReceipt(receipt_handle.to_string()))?;
        queue.messages.remove(position);
        Ok(())
    }

    /// Visible plus in-flight messages.
    async fn approximate_count(&self, address: &str) -> Result<u64, BrokerError> {
        self.ensure_available(address)?;
        let state = self.state()?;
        let queue = state
            .queues
            .get(address)
            .ok_or_else(|| BrokerError::DestinationNotFound(address.to_string()))?;
        Ok(queue.messages.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fifo_message(body: &str, group: &str, dedup: &str) -> OutgoingMessage {
        OutgoingMessage::new(body)
            .with_group_id(group)
            .with_deduplication_id(dedup)
    }

    #[tokio::test]
    async fn unknown_destination_is_an_error() {
        let broker = InMemoryBroker::new();
        let err = broker.send("missing", OutgoingMessage::new("{}")).await.unwrap_err();
        assert_eq!(err, BrokerError::DestinationNotFound("missing".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn received_messages_reappear_after_visibility_timeout() {
        let broker = InMemoryBroker::new();
        broker
            .create_queue("jobs", QueueSettings::standard().with_visibility_timeout(Duration::from_secs(10)))
            .unwrap();
        broker.send("jobs", OutgoingMessage::new("a")).await.unwrap();

        let first = broker.receive("jobs", 10, None).await.unwrap();
        assert_eq!(first.len(), 1);
        assert!(broker.receive("jobs", 10, None).await.unwrap().is_empty());

        tokio::time::advance(Duration::from_secs(11)).await;
        let again = broker.receive("jobs", 10, None).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].receive_count, 2);
        assert_ne!(again[0].receipt_handle, first[0].receipt_handle);

        assert!(broker.delete("jobs", &first[0].receipt_handle).await.is_err());
        broker.delete("jobs", &again[0].receipt_handle).await.unwrap();
        assert_eq!(broker.approximate_count("jobs").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn zero_visibility_peek_leaves_message_visible() {
        let broker = InMemoryBroker::new();
        broker.create_queue("jobs", QueueSettings::standard()).unwrap();
        broker.send("jobs", OutgoingMessage::new("a")).await.unwrap();

        broker.receive("jobs", 10, Some(Duration::ZERO)).await.unwrap();
        let again = broker.receive("jobs", 10, Some(Duration::ZERO)).await.unwrap();
        assert_eq!(again.len(), 1);
    }

    #[tokio::test]
    async fn redrives_after_max_receive_count() {
        let broker = InMemoryBroker::new();
        broker
            .create_queue("jobs", QueueSettings::standard().with_redrive("jobs-dlq", 2))
            .unwrap();
        broker.send("jobs", OutgoingMessage::new("poison")).await.unwrap();

        for _ in 0..2 {
            assert_eq!(broker.receive("jobs", 1, Some(Duration::ZERO)).await.unwrap().len(), 1);
        }
        assert!(broker.receive("jobs", 1, Some(Duration::ZERO)).await.unwrap().is_empty());
        assert_eq!(broker.bodies("jobs-dlq"), vec!["poison".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn fifo_deduplicates_within_window() {
        let broker = InMemoryBroker::new();
        broker.create_queue("orders.fifo", QueueSettings::fifo()).unwrap();

        let first = broker.send("orders.fifo", fifo_message("a", "acme", "order-1")).await.unwrap();
        let second = broker.send("orders.fifo", fifo_message("b", "acme", "order-1")).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(broker.queue_len("orders.fifo"), 1);

        tokio::time::advance(DEFAULT_DEDUP_WINDOW + Duration::from_secs(1)).await;
        broker.send("orders.fifo", fifo_message("c", "acme", "order-1")).await.unwrap();
        assert_eq!(broker.queue_len("orders.fifo"), 2);
    }

    #[tokio::test]
    async fn fifo_requires_group_and_dedup_ids() {
        let broker = InMemoryBroker::new();
        broker.create_queue("orders.fifo", QueueSettings::fifo()).unwrap();

        let err = broker
            .send("orders.fifo", OutgoingMessage::new("a").with_deduplication_id("d"))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Rejected(_)));

        let err = broker
            .send("orders.fifo", OutgoingMessage::new("a").with_group_id("g"))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Rejected(_)));
    }

    #[tokio::test]
    async fn fifo_holds_group_while_message_in_flight() {
        let broker = InMemoryBroker::new();
        broker.create_queue("orders.fifo", QueueSettings::fifo()).unwrap();
        broker.send("orders.fifo", fifo_message("a1", "a", "1")).await.unwrap();
        broker.send("orders.fifo", fifo_message("a2", "a", "2")).await.unwrap();
        broker.send("orders.fifo", fifo_message("b1", "b", "3")).await.unwrap();

        let first = broker.receive("orders.fifo", 1, None).await.unwrap();
        assert_eq!(first[0].body.as_deref(), Some("a1"));

        // a2 waits behind in-flight a1; b1 is free.
        let next = broker.receive("orders.fifo", 10, None).await.unwrap();
        let bodies: Vec<_> = next.iter().filter_map(|m| m.body.clone()).collect();
        assert_eq!(bodies, vec!["b1".to_string()]);

        broker.delete("orders.fifo", &first[0].receipt_handle).await.unwrap();
        let last = broker.receive("orders.fifo", 10, None).await.unwrap();
        assert_eq!(last[0].body.as_deref(), Some("a2"));
    }

    #[tokio::test]
    async fn topics_fan_out_to_subscribers() {
        let broker = InMemoryBroker::new();
        broker.create_topic("order-events").unwrap();
        broker.create_queue("billing", QueueSettings::standard()).unwrap();
        broker.create_queue("shipping", QueueSettings::standard()).unwrap();
        broker.subscribe("order-events", "billing").unwrap();
        broker.subscribe("order-events", "shipping").unwrap();

        broker.send("order-events", OutgoingMessage::new("created")).await.unwrap();

        assert_eq!(broker.bodies("billing"), vec!["created".to_string()]);
        assert_eq!(broker.bodies("shipping"), vec!["created".to_string()]);
    }

    #[tokio::test]
    async fn outage_fails_calls() {
        let broker = InMemoryBroker::new();
        broker.create_queue("jobs", QueueSettings::standard()).unwrap();
        broker.set_unavailable(true);

        let err = broker.send("jobs", OutgoingMessage::new("a")).await.unwrap_err();
        assert!(err.is_transient());

        broker.set_unavailable(false);
        broker.send("jobs", OutgoingMessage::new("a")).await.unwrap();
        assert_eq!(broker.send_calls(), 2);
    }
}

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::BrokerError;

/// Largest number of messages one batch call may carry.
pub const MAX_BATCH_SIZE: usize = 10;

/// A message about to be sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub body: String,
    /// Provider-level deduplication token (ordered destinations only).
    pub deduplication_id: Option<String>,
    /// Ordering group (ordered destinations only).
    pub group_id: Option<String>,
    pub delay_seconds: Option<u32>,
    pub attributes: BTreeMap<String, String>,
}

impl OutgoingMessage {
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            deduplication_id: None,
            group_id: None,
            delay_seconds: None,
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_deduplication_id(mut self, id: impl Into<String>) -> Self {
        self.deduplication_id = Some(id.into());
        self
    }

    pub fn with_group_id(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    pub fn with_delay_seconds(mut self, seconds: u32) -> Self {
        self.delay_seconds = Some(seconds);
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

/// A message handed out by `receive`; hidden from other receivers until its
/// visibility timeout lapses or it is deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub message_id: String,
    pub receipt_handle: String,
    /// `None` when the provider delivered an empty message.
    pub body: Option<String>,
    pub attributes: BTreeMap<String, String>,
    pub group_id: Option<String>,
    /// How many times this message has been received, including this one.
    pub receive_count: u32,
    /// When the message entered its current queue.
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchEntrySuccess {
    /// Position of the entry in the submitted batch.
    pub index: usize,
    pub message_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchEntryFailure {
    pub index: usize,
    pub error: String,
}

/// Per-entry result of a batch send.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSendOutcome {
    pub successful: Vec<BatchEntrySuccess>,
    pub failed: Vec<BatchEntryFailure>,
}

/// Queue/topic broker operations.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Send one message, returning the provider message id.
    async fn send(&self, address: &str, message: OutgoingMessage) -> Result<String, BrokerError>;

    /// Send up to [`MAX_BATCH_SIZE`] messages, reporting each entry's result.
    ///
    /// The default sends entries one by one.
    async fn send_batch(
        &self,
        address: &str,
        messages: Vec<OutgoingMessage>,
    ) -> Result<BatchSendOutcome, BrokerError> {
        if messages.len() > MAX_BATCH_SIZE {
            return Err(BrokerError::Rejected(format!(
                "batch of {} exceeds the limit of {MAX_BATCH_SIZE}",
                messages.len()
            )));
        }
        let mut outcome = BatchSendOutcome::default();
        for (index, message) in messages.into_iter().enumerate() {
            match self.send(address, message).await {
                Ok(message_id) => outcome.successful.push(BatchEntrySuccess { index, message_id }),
                Err(err) => outcome.failed.push(BatchEntryFailure {
                    index,
                    error: err.to_string(),
                }),
            }
        }
        Ok(outcome)
    }

    /// Receive up to `max` visible messages, hiding them for
    /// `visibility_timeout` (the queue default when `None`).
    async fn receive(
        &self,
        address: &str,
        max: usize,
        visibility_timeout: Option<Duration>,
    ) -> Result<Vec<ReceivedMessage>, BrokerError>;

    async fn delete(&self, address: &str, receipt_handle: &str) -> Result<(), BrokerError>;

    async fn approximate_count(&self, address: &str) -> Result<u64, BrokerError>;
}

#[async_trait]
impl<B: BrokerClient + ?Sized> BrokerClient for Arc<B> {
    async fn send(&self, address: &str, message: OutgoingMessage) -> Result<String, BrokerError> {
        (**self).send(address, message).await
    }

    async fn send_batch(
        &self,
        address: &str,
        messages: Vec<OutgoingMessage>,
    ) -> Result<BatchSendOutcome, BrokerError> {
        (**self).send_batch(address, messages).await
    }

    async fn receive(
        &self,
        address: &str,
        max: usize,
        visibility_timeout: Option<Duration>,
    ) -> Result<Vec<ReceivedMessage>, BrokerError> {
        (**self).receive(address, max, visibility_timeout).await
    }

    async fn delete(&self, address: &str, receipt_handle: &str) -> Result<(), BrokerError> {
        (**self).delete(address, receipt_handle).await
    }

    async fn approximate_count(&self, address: &str) -> Result<u64, BrokerError> {
        (**self).approximate_count(address).await
    }
}

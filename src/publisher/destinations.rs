use std::collections::BTreeMap;
use std::fmt;

use super::PublishError;
use crate::config::{DestinationEntry, DestinationsConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestinationKind {
    Queue,
    Topic,
}

impl fmt::Display for DestinationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DestinationKind::Queue => f.write_str("queue"),
            DestinationKind::Topic => f.write_str("topic"),
        }
    }
}

/// A logical destination and the provider address behind it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub name: String,
    pub address: String,
    pub kind: DestinationKind,
    /// Ordered delivery with group ids and provider deduplication.
    pub fifo: bool,
}

/// Logical name -> provider address, for queues and topics separately.
#[derive(Debug, Clone, Default)]
pub struct DestinationRegistry {
    queues: BTreeMap<String, Destination>,
    topics: BTreeMap<String, Destination>,
}

impl DestinationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &DestinationsConfig) -> Self {
        let mut registry = Self::new();
        for (name, entry) in &config.queues {
            registry.insert(DestinationKind::Queue, name, entry);
        }
        for (name, entry) in &config.topics {
            registry.insert(DestinationKind::Topic, name, entry);
        }
        registry
    }

    fn insert(&mut self, kind: DestinationKind, name: &str, entry: &DestinationEntry) {
        let destination = Destination {
            name: name.to_string(),
            address: entry.address.clone(),
            kind,
            fifo: entry.is_fifo(),
        };
        match kind {
            DestinationKind::Queue => self.queues.insert(name.to_string(), destination),
            DestinationKind::Topic => self.topics.insert(name.to_string(), destination),
        };
    }

    /// Register a queue; an address ending in `.fifo` makes it ordered.
    pub fn with_queue(mut self, name: &str, address: &str) -> Self {
        self.insert(DestinationKind::Queue, name, &DestinationEntry::new(address));
        self
    }

    pub fn with_topic(mut self, name: &str, address: &str) -> Self {
        self.insert(DestinationKind::Topic, name, &DestinationEntry::new(address));
        self
    }

    pub fn queue(&self, name: &str) -> Result<&Destination, PublishError> {
        self.queues
            .get(name)
            .ok_or_else(|| PublishError::UnknownDestination(name.to_string()))
    }

    pub fn topic(&self, name: &str) -> Result<&Destination, PublishError> {
        self.topics
            .get(name)
            .ok_or_else(|| PublishError::UnknownDestination(name.to_string()))
    }

    pub fn get(&self, kind: DestinationKind, name: &str) -> Result<&Destination, PublishError> {
        match kind {
            DestinationKind::Queue => self.queue(name),
            DestinationKind::Topic => self.topic(name),
        }
    }

    pub fn queues(&self) -> impl Iterator<Item = &Destination> {
        self.queues.values()
    }

    pub fn topics(&self) -> impl Iterator<Item = &Destination> {
        self.topics.values()
    }

    /// Find a queue by provider address.
    pub fn queue_by_address(&self, address: &str) -> Option<&Destination> {
        self.queues.values().find(|d| d.address == address)
    }
}

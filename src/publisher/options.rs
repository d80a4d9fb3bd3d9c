/// Per-send options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendOptions {
    /// Business idempotency key stamped into the envelope.
    pub idempotency_key: Option<String>,
    /// Explicit provider deduplication id; wins over the idempotency key.
    pub deduplication_id: Option<String>,
    /// Ordering group for FIFO destinations; defaults to the tenant.
    pub group_id: Option<String>,
    pub delay_seconds: Option<u32>,
    /// Build a system envelope, so no tenant is required.
    pub system: bool,
}

impl SendOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn deduplication_id(mut self, id: impl Into<String>) -> Self {
        self.deduplication_id = Some(id.into());
        self
    }

    pub fn group_id(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    pub fn delay_seconds(mut self, seconds: u32) -> Self {
        self.delay_seconds = Some(seconds);
        self
    }

    pub fn system(mut self) -> Self {
        self.system = true;
        self
    }
}

/// One entry of a batch send.
#[derive(Debug, Clone)]
pub struct BatchItem<T> {
    pub event_type: String,
    pub payload: T,
    pub options: SendOptions,
}

impl<T> BatchItem<T> {
    pub fn new(event_type: impl Into<String>, payload: T) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            options: SendOptions::default(),
        }
    }

    pub fn with_options(mut self, options: SendOptions) -> Self {
        self.options = options;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchSent {
    /// Position of the item in the submitted batch.
    pub index: usize,
    pub message_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchFailure {
    pub index: usize,
    pub error: String,
}

/// Partition of a batch into sent and failed entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchResult {
    pub successful: Vec<BatchSent>,
    pub failed: Vec<BatchFailure>,
}

impl BatchResult {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

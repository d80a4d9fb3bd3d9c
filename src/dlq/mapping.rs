use std::collections::BTreeMap;

use moka::sync::Cache;

use crate::config::DlqConfig;

const FIFO_SUFFIX: &str = ".fifo";
const DLQ_SUFFIX: &str = "-dlq";

/// Dead-letter address for `main` by naming convention:
/// `orders` -> `orders-dlq`, `orders.fifo` -> `orders-dlq.fifo`.
pub fn dead_letter_address(main: &str) -> String {
    match main.strip_suffix(FIFO_SUFFIX) {
        Some(base) => format!("{base}{DLQ_SUFFIX}{FIFO_SUFFIX}"),
        None => format!("{main}{DLQ_SUFFIX}"),
    }
}

/// Main address -> dead-letter address, with configured overrides taking
/// precedence over [`dead_letter_address`]. Derived pairs are cached.
#[derive(Clone)]
pub struct DeadLetterResolver {
    overrides: BTreeMap<String, String>,
    cache: Cache<String, String>,
}

impl DeadLetterResolver {
    pub fn new(config: &DlqConfig) -> Self {
        Self {
            overrides: config.overrides.clone(),
            cache: Cache::builder()
                .max_capacity(config.mapping_cache_capacity)
                .time_to_live(config.mapping_cache_ttl())
                .build(),
        }
    }

    pub fn resolve(&self, main: &str) -> String {
        if let Some(address) = self.overrides.get(main) {
            return address.clone();
        }
        self.cache
            .get_with(main.to_string(), || dead_letter_address(main))
    }
}

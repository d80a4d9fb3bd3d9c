use std::future::Future;
use std::sync::Arc;

use moka::notification::RemovalCause;
use moka::sync::Cache;
use tracing::debug;

use super::{BreakerError, BreakerListener, BreakerSettings, BreakerSnapshot, CircuitBreaker, CircuitState};
use crate::config::BreakerConfig;
use crate::metrics::DeliveryMetrics;

/// Approximate heap cost of one cached breaker, excluding its key.
const BREAKER_WEIGHT: usize = 512;

struct MetricsListener {
    metrics: Arc<DeliveryMetrics>,
}

impl BreakerListener for MetricsListener {
    fn on_state_change(&self, key: &str, _from: CircuitState, to: CircuitState) {
        self.metrics.record_transition(key, to.as_str());
    }
}

/// Per-destination breakers, created on first use.
///
/// Breakers live in a byte-bounded cache and expire after sitting idle for
/// `cache_ttl`; an evicted breaker is shut down and its listeners detached.
/// A key seen again after eviction starts from a fresh, closed breaker.
pub struct CircuitBreakerGateway {
    breakers: Cache<String, Arc<CircuitBreaker>>,
    settings: BreakerSettings,
    metrics: Arc<DeliveryMetrics>,
}

impl CircuitBreakerGateway {
    pub fn new(config: &BreakerConfig, metrics: Arc<DeliveryMetrics>) -> Self {
        let breakers = Cache::builder()
            .weigher(|key: &String, _breaker: &Arc<CircuitBreaker>| -> u32 {
                u32::try_from(key.len() + BREAKER_WEIGHT).unwrap_or(u32::MAX)
            })
            .max_capacity(config.cache_max_bytes)
            .time_to_idle(config.cache_ttl())
            .eviction_listener(
                |key: Arc<String>, breaker: Arc<CircuitBreaker>, cause: RemovalCause| {
                    debug!(key = %key, ?cause, "circuit breaker evicted");
                    breaker.shutdown();
                },
            )
            .build();

        Self {
            breakers,
            settings: BreakerSettings::from(config),
            metrics,
        }
    }

    /// The breaker for `key`, created closed if absent.
    pub fn breaker(&self, key: &str) -> Arc<CircuitBreaker> {
        self.breakers.get_with(key.to_string(), || {
            let breaker = CircuitBreaker::new(key, self.settings.clone());
            breaker.add_listener(Arc::new(MetricsListener {
                metrics: self.metrics.clone(),
            }));
            Arc::new(breaker)
        })
    }

    /// Run `operation` through the breaker for `key`.
    pub async fn call<T, E, F, Fut>(&self, key: &str, operation: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let breaker = self.breaker(key);
        let result = breaker.call(operation).await;
        if matches!(result, Err(BreakerError::Open { .. })) {
            self.metrics.record_rejection(key);
        }
        result
    }

    /// Current state for `key`, if a breaker is cached.
    pub fn state(&self, key: &str) -> Option<CircuitState> {
        self.breakers.get(key).map(|breaker| breaker.state())
    }

    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let mut snapshots: Vec<_> = self
            .breakers
            .iter()
            .map(|(_, breaker)| breaker.snapshot())
            .collect();
        snapshots.sort_by(|a, b| a.key.cmp(&b.key));
        snapshots
    }

    /// Drop the breaker for `key`; it is shut down by the eviction listener.
    pub fn invalidate(&self, key: &str) {
        self.breakers.invalidate(key);
    }

    /// Apply pending evictions now instead of on the next cache access.
    pub fn run_pending_tasks(&self) {
        self.breakers.run_pending_tasks();
    }

    pub fn len(&self) -> u64 {
        self.breakers.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

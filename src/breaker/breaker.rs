use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

use super::window::RollingWindow;
use super::BreakerError;
use crate::config::BreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Notified on every state transition.
pub trait BreakerListener: Send + Sync {
    fn on_state_change(&self, key: &str, from: CircuitState, to: CircuitState);
}

/// Thresholds for one breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerSettings {
    pub timeout: Duration,
    pub error_threshold_percentage: u32,
    pub reset_timeout: Duration,
    pub volume_threshold: u32,
    pub rolling_window: Duration,
    pub rolling_buckets: u32,
}

impl From<&BreakerConfig> for BreakerSettings {
    fn from(config: &BreakerConfig) -> Self {
        Self {
            timeout: config.timeout(),
            error_threshold_percentage: config.error_threshold_percentage,
            reset_timeout: config.reset_timeout(),
            volume_threshold: config.volume_threshold,
            rolling_window: config.rolling_window(),
            rolling_buckets: config.rolling_buckets,
        }
    }
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self::from(&BreakerConfig::default())
    }
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerSnapshot {
    pub key: String,
    pub state: CircuitState,
    pub calls: u64,
    pub failures: u64,
}

struct Inner {
    state: CircuitState,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
    window: RollingWindow,
}

/// Three-state breaker for one destination.
///
/// Closed: calls pass and outcomes are counted. Once at least
/// `volume_threshold` calls sit in the rolling window and the failure
/// percentage exceeds `error_threshold_percentage`, the circuit opens.
/// Open: calls are rejected without running until `reset_timeout` passes.
/// Half-open: exactly one trial call runs; success closes the circuit,
/// failure reopens it.
pub struct CircuitBreaker {
    key: String,
    settings: BreakerSettings,
    inner: Mutex<Inner>,
    listeners: Mutex<Vec<Arc<dyn BreakerListener>>>,
    shut_down: AtomicBool,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("key", &self.key)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Admission for one call. Dropping it unsettled (the caller's future was
/// cancelled) counts as a failure so a half-open trial is never leaked.
struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl CallPermit<'_> {
    fn settle(mut self, success: bool) {
        self.settled = true;
        self.breaker.record(success, self.trial);
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.record(false, self.trial);
        }
    }
}

impl CircuitBreaker {
    pub fn new(key: impl Into<String>, settings: BreakerSettings) -> Self {
        let window = RollingWindow::new(settings.rolling_window, settings.rolling_buckets);
        Self {
            key: key.into(),
            settings,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                opened_at: None,
                trial_in_flight: false,
                window,
            }),
            listeners: Mutex::new(Vec::new()),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn settings(&self) -> &BreakerSettings {
        &self.settings
    }

    // Poisoning is ignored: the counters hold no cross-field invariant.
    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> CircuitState {
        self.inner().state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let mut inner = self.inner();
        let (calls, failures) = inner.window.totals(Instant::now());
        BreakerSnapshot {
            key: self.key.clone(),
            state: inner.state,
            calls,
            failures,
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn BreakerListener>) {
        if self.is_shut_down() {
            return;
        }
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Detach all listeners. The breaker keeps guarding calls made through
    /// references that are still held.
    pub fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Run `operation` through the breaker, bounded by the breaker timeout.
    ///
    /// A timed-out call is abandoned from the caller's side and counted as
    /// a failure; the remote side may still complete it.
    pub async fn call<T, E, F, Fut>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = self.admit()?;
        match tokio::time::timeout(self.settings.timeout, operation()).await {
            Ok(Ok(value)) => {
                permit.settle(true);
                Ok(value)
            }
            Ok(Err(err)) => {
                permit.settle(false);
                Err(BreakerError::Inner(err))
            }
            Err(_) => {
                permit.settle(false);
                warn!(key = %self.key, timeout = ?self.settings.timeout, "call timed out");
                Err(BreakerError::Timeout {
                    key: self.key.clone(),
                    timeout: self.settings.timeout,
                })
            }
        }
    }

    fn admit<E>(&self) -> Result<CallPermit<'_>, BreakerError<E>> {
        let now = Instant::now();
        let mut inner = self.inner();
        let state = inner.state;
        let trial = match state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                let cooled = inner
                    .opened_at
                    .map_or(true, |opened| now >= opened + self.settings.reset_timeout);
                if !cooled {
                    return Err(self.rejected());
                }
                inner.state = CircuitState::HalfOpen;
                inner.trial_in_flight = true;
                drop(inner);
                self.notify(state, CircuitState::HalfOpen);
                true
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    return Err(self.rejected());
                }
                inner.trial_in_flight = true;
                true
            }
        };
        Ok(CallPermit {
            breaker: self,
            trial,
            settled: false,
        })
    }

    fn rejected<E>(&self) -> BreakerError<E> {
        BreakerError::Open {
            key: self.key.clone(),
        }
    }

    fn record(&self, success: bool, trial: bool) {
        let now = Instant::now();
        let mut inner = self.inner();
        let from = inner.state;

        let to = if trial {
            inner.trial_in_flight = false;
            if success {
                inner.window.reset();
                CircuitState::Closed
            } else {
                inner.opened_at = Some(now);
                CircuitState::Open
            }
        } else {
            inner.window.record(now, success);
            if inner.state == CircuitState::Closed && !success && self.should_trip(&mut inner, now) {
                inner.opened_at = Some(now);
                CircuitState::Open
            } else {
                inner.state
            }
        };

        inner.state = to;
        drop(inner);
        if from != to {
            self.notify(from, to);
        }
    }

    fn should_trip(&self, inner: &mut Inner, now: Instant) -> bool {
        let (calls, failures) = inner.window.totals(now);
        calls >= u64::from(self.settings.volume_threshold)
            && failures * 100 > u64::from(self.settings.error_threshold_percentage) * calls
    }

    /// Open the circuit immediately.
    pub fn force_open(&self) {
        let mut inner = self.inner();
        let from = inner.state;
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        inner.trial_in_flight = false;
        drop(inner);
        if from != CircuitState::Open {
            self.notify(from, CircuitState::Open);
        }
    }

    /// Close the circuit and clear its counters.
    pub fn reset(&self) {
        let mut inner = self.inner();
        let from = inner.state;
        inner.state = CircuitState::Closed;
        inner.opened_at = None;
        inner.trial_in_flight = false;
        inner.window.reset();
        drop(inner);
        if from != CircuitState::Closed {
            self.notify(from, CircuitState::Closed);
        }
    }

    fn notify(&self, from: CircuitState, to: CircuitState) {
        match to {
            CircuitState::Open => warn!(key = %self.key, %from, %to, "circuit opened"),
            _ => info!(key = %self.key, %from, %to, "circuit state changed"),
        }
        let listeners = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in listeners {
            listener.on_state_change(&self.key, from, to);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn settings() -> BreakerSettings {
        BreakerSettings {
            timeout: Duration::from_millis(500),
            error_threshold_percentage: 50,
            reset_timeout: Duration::from_secs(30),
            volume_threshold: 4,
            rolling_window: Duration::from_secs(10),
            rolling_buckets: 10,
        }
    }

    async fn fail(breaker: &CircuitBreaker) {
        let _ = breaker.call(|| async { Err::<(), _>("down") }).await;
    }

    async fn succeed(breaker: &CircuitBreaker) {
        breaker.call(|| async { Ok::<_, &str>(()) }).await.unwrap();
    }

    #[derive(Default)]
    struct Recorder {
        transitions: Mutex<Vec<(CircuitState, CircuitState)>>,
    }

    impl BreakerListener for Recorder {
        fn on_state_change(&self, _key: &str, from: CircuitState, to: CircuitState) {
            self.transitions.lock().unwrap().push((from, to));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stays_closed_below_volume_threshold() {
        let breaker = CircuitBreaker::new("orders", settings());
        for _ in 0..3 {
            fail(&breaker).await;
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn opens_when_failure_rate_exceeds_threshold() {
        let breaker = CircuitBreaker::new("orders", settings());
        succeed(&breaker).await;
        fail(&breaker).await;
        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Closed);
        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn exactly_half_failing_does_not_trip() {
        let breaker = CircuitBreaker::new("orders", settings());
        succeed(&breaker).await;
        succeed(&breaker).await;
        fail(&breaker).await;
        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn open_circuit_rejects_without_calling() {
        let breaker = CircuitBreaker::new("orders", settings());
        breaker.force_open();
        let calls = AtomicUsize::new(0);

        let err = breaker
            .call(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, &str>(())
            })
            .await
            .unwrap_err();

        assert!(err.is_open());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_allows_one_trial_then_closes() {
        let breaker = CircuitBreaker::new("orders", settings());
        breaker.force_open();
        tokio::time::advance(Duration::from_secs(31)).await;

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let trial = breaker.call(|| async move {
            let _ = release_rx.await;
            Ok::<_, &str>("trial")
        });
        tokio::pin!(trial);

        // Drive the trial until it parks on the channel.
        assert!(futures::poll!(trial.as_mut()).is_pending());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        let second = breaker.call(|| async { Ok::<_, &str>("second") }).await;
        assert!(second.unwrap_err().is_open());

        release_tx.send(()).unwrap();
        assert_eq!(trial.await.unwrap(), "trial");
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_trial_reopens() {
        let breaker = CircuitBreaker::new("orders", settings());
        breaker.force_open();
        tokio::time::advance(Duration::from_secs(31)).await;

        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker
            .call(|| async { Ok::<_, &str>(()) })
            .await
            .unwrap_err()
            .is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_calls_time_out_and_count_as_failures() {
        let breaker = CircuitBreaker::new("orders", settings());

        let err = breaker
            .call(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, &str>(())
            })
            .await
            .unwrap_err();

        assert!(matches!(err, BreakerError::Timeout { .. }));
        assert_eq!(breaker.snapshot().failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn listeners_see_transitions_until_shutdown() {
        let breaker = CircuitBreaker::new("orders", settings());
        let recorder = Arc::new(Recorder::default());
        breaker.add_listener(recorder.clone());

        breaker.force_open();
        breaker.reset();
        breaker.shutdown();
        breaker.force_open();

        let transitions = recorder.transitions.lock().unwrap().clone();
        assert_eq!(
            transitions,
            vec![
                (CircuitState::Closed, CircuitState::Open),
                (CircuitState::Open, CircuitState::Closed),
            ]
        );
        assert!(breaker.is_shut_down());
    }
}

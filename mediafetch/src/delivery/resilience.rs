//! Retry policy and circuit breaker for delivery resilience.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// External dependency a breaker protects.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Dependency {
    /// Where content and payloads are fetched from.
    SourcePlatform,
    /// Where payloads are sent to.
    DestinationPlatform,
}

/// Configuration for retry behavior.
///
/// `max_retries` counts retries after the first attempt, so a phase runs at
/// most `max_retries + 1` times.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_retries: u32,
    /// Delay before the first retry in milliseconds.
    pub initial_delay_ms: u64,
    /// Maximum delay between retries in milliseconds.
    pub max_delay_ms: u64,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add up to 25% jitter to delays.
    pub use_jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 5_000,
            max_delay_ms: 300_000,
            backoff_multiplier: 2.0,
            use_jitter: true,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `retry` (1-based): `initial × multiplier^(retry-1)`, capped.
    pub fn delay_for_attempt(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }

        let base_delay = self.initial_delay_ms as f64
            * self
                .backoff_multiplier
                .powi(retry.saturating_sub(1).min(i32::MAX as u32) as i32);

        let delay_ms = base_delay.min(self.max_delay_ms as f64) as u64;

        let final_delay = if self.use_jitter {
            let jitter = (delay_ms as f64 * 0.25 * rand::random::<f64>()) as u64;
            delay_ms + jitter
        } else {
            delay_ms
        };

        Duration::from_millis(final_delay)
    }

    /// Whether another attempt is allowed after `failures` failed ones.
    pub fn should_retry(&self, failures: u32) -> bool {
        failures <= self.max_retries
    }
}

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through.
    Closed,
    /// Calls fail fast.
    Open,
    /// A single probe call is allowed.
    HalfOpen,
}

/// Breaker tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Failures older than this no longer count toward the threshold.
    pub failure_window: Duration,
    /// How long the circuit stays open before probing.
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window: Duration::from_secs(5 * 60),
            cooldown: Duration::from_secs(60),
        }
    }
}

/// A state change, published on the manager's broadcast channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerTransition {
    pub dependency: Dependency,
    pub from: CircuitState,
    pub to: CircuitState,
}

/// Rejection from an open circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{dependency} unavailable, retry in {retry_after:?}")]
pub struct DependencyUnavailable {
    pub dependency: Dependency,
    pub retry_after: Duration,
}

/// Outcome of a call routed through [`CircuitBreaker::call`].
#[derive(Debug, Error)]
pub enum CallError<E> {
    #[error(transparent)]
    Unavailable(DependencyUnavailable),
    #[error(transparent)]
    Inner(E),
}

/// Snapshot of breaker counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BreakerStats {
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub rejected_calls: u64,
    pub state_changes: u64,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure_at: Option<Instant>,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// Circuit breaker for one dependency.
pub struct CircuitBreaker {
    dependency: Dependency,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
    transitions: Option<broadcast::Sender<BreakerTransition>>,
    total_calls: AtomicU64,
    successful_calls: AtomicU64,
    failed_calls: AtomicU64,
    rejected_calls: AtomicU64,
    state_changes: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(dependency: Dependency, config: BreakerConfig) -> Self {
        Self {
            dependency,
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure_at: None,
                opened_at: None,
                probe_in_flight: false,
            }),
            transitions: None,
            total_calls: AtomicU64::new(0),
            successful_calls: AtomicU64::new(0),
            failed_calls: AtomicU64::new(0),
            rejected_calls: AtomicU64::new(0),
            state_changes: AtomicU64::new(0),
        }
    }

    fn with_transitions(mut self, tx: broadcast::Sender<BreakerTransition>) -> Self {
        self.transitions = Some(tx);
        self
    }

    pub fn dependency(&self) -> Dependency {
        self.dependency
    }

    /// Current state, applying the open → half-open cooldown if due.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.check_state_transition(&mut inner);
        inner.state
    }

    /// Ask for permission to call the dependency.
    ///
    /// In half-open state only one permit is outstanding at a time; other
    /// callers are rejected until the probe reports back.
    pub fn try_acquire(self: &Arc<Self>) -> Result<BreakerPermit, DependencyUnavailable> {
        let mut inner = self.inner.lock();
        self.check_state_transition(&mut inner);

        let state = inner.state;
        let probe = match state {
            CircuitState::Closed => false,
            CircuitState::HalfOpen if !inner.probe_in_flight => {
                inner.probe_in_flight = true;
                true
            }
            CircuitState::HalfOpen | CircuitState::Open => {
                let retry_after = self.remaining_cooldown(&inner);
                drop(inner);
                self.rejected_calls.fetch_add(1, Ordering::Relaxed);
                debug!(dependency = %self.dependency, ?retry_after, "Circuit open, failing fast");
                return Err(DependencyUnavailable {
                    dependency: self.dependency,
                    retry_after,
                });
            }
        };

        self.total_calls.fetch_add(1, Ordering::Relaxed);
        Ok(BreakerPermit {
            breaker: Arc::clone(self),
            probe,
            settled: false,
        })
    }

    /// Run `f` through the breaker. `is_failure` decides which errors count
    /// against the dependency; other errors settle the call as a success.
    pub async fn call<T, E, F, Fut>(
        self: &Arc<Self>,
        is_failure: impl Fn(&E) -> bool,
        f: F,
    ) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = self.try_acquire().map_err(CallError::Unavailable)?;
        match f().await {
            Ok(value) => {
                permit.success();
                Ok(value)
            }
            Err(e) => {
                if is_failure(&e) {
                    permit.failure();
                } else {
                    permit.success();
                }
                Err(CallError::Inner(e))
            }
        }
    }

    /// Reset the breaker to closed state.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;
        inner.last_failure_at = None;
        inner.opened_at = None;
        inner.probe_in_flight = false;
        self.set_state(&mut inner, CircuitState::Closed);
    }

    pub fn stats(&self) -> BreakerStats {
        BreakerStats {
            total_calls: self.total_calls.load(Ordering::Relaxed),
            successful_calls: self.successful_calls.load(Ordering::Relaxed),
            failed_calls: self.failed_calls.load(Ordering::Relaxed),
            rejected_calls: self.rejected_calls.load(Ordering::Relaxed),
            state_changes: self.state_changes.load(Ordering::Relaxed),
        }
    }

    fn record_success(&self, probe: bool) {
        self.successful_calls.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;
        inner.last_failure_at = None;
        if probe {
            inner.probe_in_flight = false;
            if inner.state == CircuitState::HalfOpen {
                inner.opened_at = None;
                self.set_state(&mut inner, CircuitState::Closed);
                info!(dependency = %self.dependency, "Circuit breaker closed after successful probe");
            }
        }
    }

    fn record_failure(&self, probe: bool) {
        self.failed_calls.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        let mut inner = self.inner.lock();

        if probe {
            inner.probe_in_flight = false;
            if inner.state == CircuitState::HalfOpen {
                inner.opened_at = Some(now);
                self.set_state(&mut inner, CircuitState::Open);
                warn!(dependency = %self.dependency, "Circuit breaker probe failed, reopening");
            }
            return;
        }

        if inner.state != CircuitState::Closed {
            return;
        }

        let within_window = inner
            .last_failure_at
            .is_some_and(|last| now.duration_since(last) <= self.config.failure_window);
        inner.consecutive_failures = if within_window {
            inner.consecutive_failures + 1
        } else {
            1
        };
        inner.last_failure_at = Some(now);

        if inner.consecutive_failures >= self.config.failure_threshold {
            inner.opened_at = Some(now);
            let failures = inner.consecutive_failures;
            self.set_state(&mut inner, CircuitState::Open);
            warn!(
                dependency = %self.dependency,
                failures,
                "Circuit breaker opened after consecutive failures"
            );
        }
    }

    fn release_probe(&self) {
        self.inner.lock().probe_in_flight = false;
    }

    fn remaining_cooldown(&self, inner: &BreakerInner) -> Duration {
        match (inner.state, inner.opened_at) {
            (CircuitState::Open, Some(opened_at)) => {
                self.config.cooldown.saturating_sub(opened_at.elapsed())
            }
            // Half-open with a probe outstanding; check back shortly.
            _ => Duration::from_secs(1).min(self.config.cooldown),
        }
    }

    fn check_state_transition(&self, inner: &mut BreakerInner) {
        if inner.state == CircuitState::Open
            && let Some(opened_at) = inner.opened_at
            && opened_at.elapsed() >= self.config.cooldown
        {
            inner.probe_in_flight = false;
            self.set_state(inner, CircuitState::HalfOpen);
            debug!(dependency = %self.dependency, "Circuit breaker transitioned to half-open state");
        }
    }

    fn set_state(&self, inner: &mut BreakerInner, to: CircuitState) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        self.state_changes.fetch_add(1, Ordering::Relaxed);
        if let Some(tx) = &self.transitions {
            // No subscribers is fine.
            let _ = tx.send(BreakerTransition {
                dependency: self.dependency,
                from,
                to,
            });
        }
    }
}

/// Permission to make one call. Settle it with [`success`](Self::success)
/// or [`failure`](Self::failure); dropping it unsettled frees a half-open
/// probe slot without recording an outcome.
pub struct BreakerPermit {
    breaker: Arc<CircuitBreaker>,
    probe: bool,
    settled: bool,
}

impl BreakerPermit {
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.record_success(self.probe);
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.record_failure(self.probe);
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if !self.settled && self.probe {
            self.breaker.release_probe();
        }
    }
}

/// Circuit breakers keyed by dependency.
pub struct CircuitBreakerManager {
    breakers: RwLock<HashMap<Dependency, Arc<CircuitBreaker>>>,
    config: BreakerConfig,
    transitions: broadcast::Sender<BreakerTransition>,
}

impl CircuitBreakerManager {
    pub fn new(config: BreakerConfig) -> Self {
        let (transitions, _) = broadcast::channel(64);
        Self {
            breakers: RwLock::new(HashMap::new()),
            config,
            transitions,
        }
    }

    /// Get or create the breaker for a dependency.
    pub fn get(&self, dependency: Dependency) -> Arc<CircuitBreaker> {
        {
            let breakers = self.breakers.read();
            if let Some(breaker) = breakers.get(&dependency) {
                return breaker.clone();
            }
        }

        let mut breakers = self.breakers.write();
        breakers
            .entry(dependency)
            .or_insert_with(|| {
                Arc::new(
                    CircuitBreaker::new(dependency, self.config.clone())
                        .with_transitions(self.transitions.clone()),
                )
            })
            .clone()
    }

    /// Check if a dependency is currently accepting calls.
    pub fn is_allowed(&self, dependency: Dependency) -> bool {
        self.get(dependency).state() != CircuitState::Open
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BreakerTransition> {
        self.transitions.subscribe()
    }

    /// Stats for every breaker created so far.
    pub fn stats(&self) -> Vec<(Dependency, CircuitState, BreakerStats)> {
        let breakers: Vec<Arc<CircuitBreaker>> = self.breakers.read().values().cloned().collect();
        breakers
            .into_iter()
            .map(|b| (b.dependency(), b.state(), b.stats()))
            .collect()
    }
}

impl Default for CircuitBreakerManager {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

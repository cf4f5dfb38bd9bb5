//! Circuit breaker for fail-fast protection of a chronically failing dependency.
//!
//! One breaker guards one logical dependency. Transitions are driven only by call
//! outcomes and elapsed time, and every transition is pushed to subscribers.

use crate::error::{OrchestrationError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 64;

/// Circuit breaker tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Failure ratio (0-1) at or above which a Closed breaker opens.
    pub failure_ratio: f64,
    /// Samples required in the sampling window before the ratio is evaluated.
    pub minimum_throughput: u32,
    /// Outcomes older than this no longer count toward the ratio.
    pub sampling_window: Duration,
    /// How long the breaker stays Open before admitting trial calls.
    pub open_duration: Duration,
    /// Consecutive HalfOpen successes needed to close.
    pub success_threshold: u32,
    /// Concurrent trial calls admitted while HalfOpen.
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_ratio: 0.5,
            minimum_throughput: 10,
            sampling_window: Duration::from_secs(60),
            open_duration: Duration::from_secs(30),
            success_threshold: 2,
            half_open_max_calls: 2,
        }
    }
}

/// Externally visible breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CircuitState {
    /// Calls pass through.
    Closed,
    /// Calls are rejected without running.
    Open,
    /// A limited number of trial calls are admitted.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Notification pushed on every state transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitStateChange {
    /// Name of the breaker that transitioned.
    pub breaker: String,
    /// Previous state.
    pub from: CircuitState,
    /// New state.
    pub to: CircuitState,
    /// When the transition happened.
    pub at: DateTime<Utc>,
    /// Human-readable cause.
    pub reason: String,
}

/// Counters and rates for observability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerStatistics {
    /// Breaker name.
    pub name: String,
    /// Current state.
    pub state: CircuitState,
    /// Lifetime successful calls.
    pub successful_calls: u64,
    /// Lifetime failed calls.
    pub failed_calls: u64,
    /// Lifetime calls rejected without running.
    pub rejected_calls: u64,
    /// Lifetime failed / (successful + failed); zero with no calls.
    pub failure_rate: f64,
    /// Failure ratio over the current sampling window.
    pub window_failure_rate: f64,
    /// Samples currently in the sampling window.
    pub window_samples: usize,
    /// When the breaker last opened.
    pub last_opened: Option<DateTime<Utc>>,
    /// When the breaker last closed.
    pub last_closed: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Closed,
    Open { since: Instant },
    HalfOpen { in_flight: u32, successes: u32 },
}

impl Phase {
    const fn state(&self) -> CircuitState {
        match self {
            Phase::Closed => CircuitState::Closed,
            Phase::Open { .. } => CircuitState::Open,
            Phase::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }
}

#[derive(Debug)]
struct Inner {
    phase: Phase,
    samples: VecDeque<(Instant, bool)>,
    last_opened: Option<DateTime<Utc>>,
    last_closed: Option<DateTime<Utc>>,
}

impl Inner {
    fn prune(&mut self, window: Duration) {
        let now = Instant::now();
        while let Some((at, _)) = self.samples.front() {
            if now.duration_since(*at) > window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    fn window_failure_rate(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let failures = self.samples.iter().filter(|(_, ok)| !ok).count();
        failures as f64 / self.samples.len() as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Permit {
    Normal,
    Trial,
}

/// Lock-free lifetime counters.
#[derive(Debug, Default)]
struct Counters {
    successful: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
}

/// Circuit breaker guarding one dependency.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
    counters: Counters,
    events: broadcast::Sender<CircuitStateChange>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    /// Creates a breaker with its own notification channel.
    ///
    /// # Arguments
    /// * `name` - Name of the guarded dependency, used in errors, logs, and events
    /// * `config` - Thresholds and timings
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self::with_events(name, config, events)
    }

    /// Creates a breaker that publishes into an existing channel.
    pub fn with_events(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        events: broadcast::Sender<CircuitStateChange>,
    ) -> Self {
        let name = name.into();
        debug!(
            breaker = %name,
            failure_ratio = config.failure_ratio,
            minimum_throughput = config.minimum_throughput,
            open_ms = config.open_duration.as_millis() as u64,
            "Circuit breaker initialized"
        );
        Self {
            name,
            config,
            inner: Mutex::new(Inner {
                phase: Phase::Closed,
                samples: VecDeque::new(),
                last_opened: None,
                last_closed: None,
            }),
            counters: Counters::default(),
            events,
        }
    }

    /// Name of the guarded dependency.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The configuration in use.
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state. An Open breaker whose open duration elapsed still reports Open
    /// until the next call moves it to HalfOpen.
    pub fn state(&self) -> CircuitState {
        self.lock().phase.state()
    }

    /// Subscribes to state-change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<CircuitStateChange> {
        self.events.subscribe()
    }

    /// Runs `operation` if the breaker admits it.
    ///
    /// Cancellations are not counted as failures.
    ///
    /// # Errors
    /// Returns `OrchestrationError::CircuitOpen` without running the operation when the
    /// breaker is Open (or HalfOpen with no trial slot free); otherwise returns the
    /// operation's own error.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let permit = self.acquire()?;
        let result = operation().await;

        match &result {
            Ok(_) => self.on_success(permit),
            Err(e) if e.is_cancelled() => self.release(permit),
            Err(e) => self.on_failure(permit, e),
        }
        result
    }

    /// Forces the breaker Closed and clears the sampling window.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.samples.clear();
        let from = inner.phase.state();
        inner.phase = Phase::Closed;
        if from != CircuitState::Closed {
            inner.last_closed = Some(Utc::now());
            self.notify(from, CircuitState::Closed, "manual reset");
        }
        info!(breaker = %self.name, "Circuit breaker reset");
    }

    /// Returns counters and rates.
    pub fn get_statistics(&self) -> CircuitBreakerStatistics {
        let mut inner = self.lock();
        inner.prune(self.config.sampling_window);

        let successful = self.counters.successful.load(Ordering::Relaxed);
        let failed = self.counters.failed.load(Ordering::Relaxed);
        let total = successful + failed;

        CircuitBreakerStatistics {
            name: self.name.clone(),
            state: inner.phase.state(),
            successful_calls: successful,
            failed_calls: failed,
            rejected_calls: self.counters.rejected.load(Ordering::Relaxed),
            failure_rate: if total == 0 { 0.0 } else { failed as f64 / total as f64 },
            window_failure_rate: inner.window_failure_rate(),
            window_samples: inner.samples.len(),
            last_opened: inner.last_opened,
            last_closed: inner.last_closed,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn acquire(&self) -> Result<Permit> {
        let mut inner = self.lock();
        match inner.phase {
            Phase::Closed => return Ok(Permit::Normal),
            Phase::Open { since } if since.elapsed() >= self.config.open_duration => {
                inner.phase = Phase::HalfOpen { in_flight: 1, successes: 0 };
                self.notify(CircuitState::Open, CircuitState::HalfOpen, "open duration elapsed");
                info!(breaker = %self.name, "Circuit breaker: Open -> HalfOpen");
                return Ok(Permit::Trial);
            }
            Phase::HalfOpen { in_flight, successes }
                if in_flight < self.config.half_open_max_calls.max(1) =>
            {
                inner.phase = Phase::HalfOpen { in_flight: in_flight + 1, successes };
                return Ok(Permit::Trial);
            }
            Phase::Open { .. } | Phase::HalfOpen { .. } => {}
        }
        drop(inner);

        self.counters.rejected.fetch_add(1, Ordering::Relaxed);
        debug!(breaker = %self.name, "Call rejected by open circuit");
        Err(OrchestrationError::CircuitOpen { name: self.name.clone() })
    }

    fn release(&self, permit: Permit) {
        if permit != Permit::Trial {
            return;
        }
        let mut inner = self.lock();
        if let Phase::HalfOpen { in_flight, successes } = inner.phase {
            inner.phase = Phase::HalfOpen { in_flight: in_flight.saturating_sub(1), successes };
        }
    }

    fn on_success(&self, permit: Permit) {
        self.counters.successful.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.lock();

        match inner.phase {
            Phase::Closed => {
                inner.samples.push_back((Instant::now(), true));
                inner.prune(self.config.sampling_window);
                self.evaluate_closed(&mut inner, "last call succeeded");
            }
            Phase::HalfOpen { in_flight, successes } if permit == Permit::Trial => {
                let successes = successes + 1;
                if successes >= self.config.success_threshold.max(1) {
                    inner.phase = Phase::Closed;
                    inner.samples.clear();
                    inner.last_closed = Some(Utc::now());
                    self.notify(
                        CircuitState::HalfOpen,
                        CircuitState::Closed,
                        &format!("{successes} consecutive trial successes"),
                    );
                    info!(breaker = %self.name, successes, "Circuit breaker: HalfOpen -> Closed");
                } else {
                    inner.phase =
                        Phase::HalfOpen { in_flight: in_flight.saturating_sub(1), successes };
                }
            }
            // A call admitted while Closed finished after the breaker opened.
            Phase::HalfOpen { .. } | Phase::Open { .. } => {}
        }
    }

    fn on_failure(&self, permit: Permit, error: &OrchestrationError) {
        self.counters.failed.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.lock();

        match inner.phase {
            Phase::Closed => {
                inner.samples.push_back((Instant::now(), false));
                inner.prune(self.config.sampling_window);
                self.evaluate_closed(&mut inner, &format!("last error: {error}"));
            }
            Phase::HalfOpen { .. } if permit == Permit::Trial => {
                inner.phase = Phase::Open { since: Instant::now() };
                inner.last_opened = Some(Utc::now());
                self.notify(
                    CircuitState::HalfOpen,
                    CircuitState::Open,
                    &format!("trial call failed: {error}"),
                );
                warn!(breaker = %self.name, error = %error, "Circuit breaker: HalfOpen -> Open");
            }
            Phase::HalfOpen { .. } | Phase::Open { .. } => {}
        }
    }

    /// Opens a Closed breaker once the window is full enough and the ratio is reached.
    fn evaluate_closed(&self, inner: &mut Inner, last: &str) {
        let samples = inner.samples.len();
        let ratio = inner.window_failure_rate();
        if samples < self.config.minimum_throughput as usize || ratio < self.config.failure_ratio {
            return;
        }

        inner.phase = Phase::Open { since: Instant::now() };
        inner.last_opened = Some(Utc::now());
        let reason = format!("failure ratio {ratio:.2} over {samples} calls; {last}");
        self.notify(CircuitState::Closed, CircuitState::Open, &reason);
        warn!(breaker = %self.name, failure_ratio = ratio, samples, "Circuit breaker: Closed -> Open");
    }

    fn notify(&self, from: CircuitState, to: CircuitState, reason: &str) {
        // No receivers is not an error.
        let _ = self.events.send(CircuitStateChange {
            breaker: self.name.clone(),
            from,
            to,
            at: Utc::now(),
            reason: reason.to_string(),
        });
    }
}

/// Hands out one breaker per guarded dependency, created lazily from a shared config.
///
/// All breakers publish into the registry's channel.
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    events: broadcast::Sender<CircuitStateChange>,
}

impl fmt::Debug for CircuitBreakerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakerRegistry")
            .field("config", &self.config)
            .field(
                "breaker_count",
                &self.breakers.read().unwrap_or_else(PoisonError::into_inner).len(),
            )
            .finish()
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl CircuitBreakerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self { config, breakers: RwLock::new(HashMap::new()), events }
    }

    /// Returns the breaker for `name`, creating it on first use.
    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.get(name) {
            return breaker;
        }
        let mut breakers = self.breakers.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(breakers.entry(name.to_string()).or_insert_with(|| {
            Arc::new(CircuitBreaker::with_events(name, self.config.clone(), self.events.clone()))
        }))
    }

    /// Returns the breaker for `name` if one exists.
    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.read().unwrap_or_else(PoisonError::into_inner).get(name).cloned()
    }

    /// Subscribes to transitions of every breaker in the registry.
    pub fn subscribe(&self) -> broadcast::Receiver<CircuitStateChange> {
        self.events.subscribe()
    }

    /// Statistics for every breaker, sorted by name.
    pub fn statistics(&self) -> Vec<CircuitBreakerStatistics> {
        let breakers: Vec<Arc<CircuitBreaker>> =
            self.breakers.read().unwrap_or_else(PoisonError::into_inner).values().cloned().collect();
        let mut stats: Vec<_> = breakers.iter().map(|b| b.get_statistics()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    /// Forces every breaker Closed.
    pub fn reset_all(&self) {
        let breakers: Vec<Arc<CircuitBreaker>> =
            self.breakers.read().unwrap_or_else(PoisonError::into_inner).values().cloned().collect();
        for breaker in breakers {
            breaker.reset();
        }
    }
}

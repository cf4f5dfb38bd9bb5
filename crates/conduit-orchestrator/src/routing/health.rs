//! Rolling health tracking per provider.
//!
//! Each provider owns its own short-held mutex; the outer map lock is only taken
//! for writing when a provider is seen for the first time.

use super::types::{HealthState, HealthStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Thresholds for health classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Number of most recent outcomes kept per provider.
    pub window_size: usize,
    /// Samples required before a provider leaves `Unknown`.
    pub min_samples: usize,
    /// Success rate below this is `Unhealthy`.
    pub unhealthy_below: f64,
    /// Success rate below this (and not unhealthy) is `Degraded`.
    pub degraded_below: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self { window_size: 100, min_samples: 5, unhealthy_below: 0.5, degraded_below: 0.8 }
    }
}

#[derive(Debug, Clone, Copy)]
struct Outcome {
    success: bool,
    elapsed: Duration,
}

#[derive(Debug)]
struct ProviderHealth {
    window: VecDeque<Outcome>,
    total_requests: u64,
    consecutive_failures: u32,
    last_updated: Option<DateTime<Utc>>,
    state: HealthState,
}

impl ProviderHealth {
    fn new(capacity: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(capacity),
            total_requests: 0,
            consecutive_failures: 0,
            last_updated: None,
            state: HealthState::Unknown,
        }
    }

    fn success_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let successes = self.window.iter().filter(|o| o.success).count();
        successes as f64 / self.window.len() as f64
    }

    fn average_latency(&self) -> Option<Duration> {
        if self.window.is_empty() {
            return None;
        }
        let total: Duration = self.window.iter().map(|o| o.elapsed).sum();
        Some(total / self.window.len() as u32)
    }

    fn classify(&self, config: &HealthConfig) -> HealthState {
        if self.window.len() < config.min_samples.max(1) {
            return HealthState::Unknown;
        }
        let rate = self.success_rate();
        if rate < config.unhealthy_below {
            HealthState::Unhealthy
        } else if rate < config.degraded_below {
            HealthState::Degraded
        } else {
            HealthState::Healthy
        }
    }

    fn snapshot(&self, provider: &str) -> HealthStatus {
        HealthStatus {
            provider: provider.to_string(),
            state: self.state,
            is_healthy: self.state != HealthState::Unhealthy,
            success_rate: self.success_rate(),
            response_time: self.average_latency(),
            window_samples: self.window.len(),
            total_requests: self.total_requests,
            consecutive_failures: self.consecutive_failures,
            last_updated: self.last_updated,
        }
    }
}

/// Tracks rolling success rate and latency for every provider.
#[derive(Debug)]
pub struct HealthMonitor {
    config: HealthConfig,
    providers: RwLock<HashMap<String, Arc<Mutex<ProviderHealth>>>>,
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new(HealthConfig::default())
    }
}

impl HealthMonitor {
    /// Creates a monitor with the given thresholds.
    #[must_use]
    pub fn new(config: HealthConfig) -> Self {
        Self { config, providers: RwLock::new(HashMap::new()) }
    }

    /// Returns the thresholds in use.
    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    fn entry(&self, provider: &str) -> Arc<Mutex<ProviderHealth>> {
        if let Some(entry) =
            self.providers.read().unwrap_or_else(PoisonError::into_inner).get(provider)
        {
            return Arc::clone(entry);
        }
        let mut providers = self.providers.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            providers
                .entry(provider.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(ProviderHealth::new(self.config.window_size)))),
        )
    }

    /// Records the outcome of one provider call.
    ///
    /// # Arguments
    /// * `provider` - Provider name
    /// * `success` - Whether the call succeeded
    /// * `elapsed` - Wall time the call took
    pub fn record_outcome(&self, provider: &str, success: bool, elapsed: Duration) {
        let entry = self.entry(provider);
        let mut health = entry.lock().unwrap_or_else(PoisonError::into_inner);

        if health.window.len() >= self.config.window_size.max(1) {
            health.window.pop_front();
        }
        health.window.push_back(Outcome { success, elapsed });
        health.total_requests += 1;
        health.consecutive_failures = if success { 0 } else { health.consecutive_failures + 1 };
        health.last_updated = Some(Utc::now());

        let previous = health.state;
        health.state = health.classify(&self.config);

        if previous != health.state {
            match health.state {
                HealthState::Unhealthy => warn!(
                    provider = %provider,
                    from = %previous,
                    success_rate = health.success_rate(),
                    "Provider became unhealthy"
                ),
                _ => info!(
                    provider = %provider,
                    from = %previous,
                    to = %health.state,
                    "Provider health changed"
                ),
            }
        } else {
            debug!(provider = %provider, success, elapsed_ms = elapsed.as_millis() as u64, "Recorded outcome");
        }
    }

    /// Returns the current snapshot; `Unknown` for providers never seen.
    pub fn get_health_status(&self, provider: &str) -> HealthStatus {
        let entry = {
            let providers = self.providers.read().unwrap_or_else(PoisonError::into_inner);
            providers.get(provider).cloned()
        };
        match entry {
            Some(entry) => entry.lock().unwrap_or_else(PoisonError::into_inner).snapshot(provider),
            None => HealthStatus::unknown(provider),
        }
    }

    /// Snapshots every provider that has recorded at least one outcome, sorted by name.
    pub fn snapshot_all(&self) -> Vec<HealthStatus> {
        let entries: Vec<(String, Arc<Mutex<ProviderHealth>>)> = {
            let providers = self.providers.read().unwrap_or_else(PoisonError::into_inner);
            providers.iter().map(|(name, entry)| (name.clone(), Arc::clone(entry))).collect()
        };
        let mut snapshots: Vec<HealthStatus> = entries
            .iter()
            .map(|(name, entry)| entry.lock().unwrap_or_else(PoisonError::into_inner).snapshot(name))
            .collect();
        snapshots.sort_by(|a, b| a.provider.cmp(&b.provider));
        snapshots
    }

    /// Clears the history of one provider, returning it to `Unknown`.
    pub fn reset(&self, provider: &str) {
        let removed =
            self.providers.write().unwrap_or_else(PoisonError::into_inner).remove(provider).is_some();
        if removed {
            info!(provider = %provider, "Health history reset");
        }
    }

    /// Clears the history of every provider.
    pub fn reset_all(&self) {
        self.providers.write().unwrap_or_else(PoisonError::into_inner).clear();
        info!("Health history reset for all providers");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(monitor: &HealthMonitor, provider: &str, outcomes: &[bool]) {
        for ok in outcomes {
            monitor.record_outcome(provider, *ok, Duration::from_millis(100));
        }
    }

    #[test]
    fn test_unseen_provider_is_unknown() {
        let monitor = HealthMonitor::default();
        let status = monitor.get_health_status("nobody");
        assert_eq!(status.state, HealthState::Unknown);
        assert!(status.is_healthy);
        assert!(status.response_time.is_none());
    }

    #[test]
    fn test_stays_unknown_below_min_samples() {
        let monitor = HealthMonitor::default();
        record(&monitor, "a", &[false, false, false, false]);
        let status = monitor.get_health_status("a");
        assert_eq!(status.state, HealthState::Unknown);
        assert_eq!(status.total_requests, 4);
        assert_eq!(status.consecutive_failures, 4);
    }

    #[test]
    fn test_classification_thresholds() {
        let monitor = HealthMonitor::default();
        record(&monitor, "healthy", &[true; 5]);
        record(&monitor, "degraded", &[true, true, true, false, false, true, true, true, true, false]);
        record(&monitor, "unhealthy", &[false, false, false, true, true]);

        assert_eq!(monitor.get_health_status("healthy").state, HealthState::Healthy);
        assert_eq!(monitor.get_health_status("degraded").state, HealthState::Degraded);
        let unhealthy = monitor.get_health_status("unhealthy");
        assert_eq!(unhealthy.state, HealthState::Unhealthy);
        assert!(!unhealthy.is_healthy);
    }

    #[test]
    fn test_window_evicts_oldest_samples() {
        let monitor =
            HealthMonitor::new(HealthConfig { window_size: 5, ..HealthConfig::default() });
        record(&monitor, "a", &[false; 5]);
        assert_eq!(monitor.get_health_status("a").state, HealthState::Unhealthy);

        record(&monitor, "a", &[true; 5]);
        let status = monitor.get_health_status("a");
        assert_eq!(status.state, HealthState::Healthy);
        assert!((status.success_rate - 1.0).abs() < f64::EPSILON);
        assert_eq!(status.window_samples, 5);
        assert_eq!(status.total_requests, 10);
        assert_eq!(status.consecutive_failures, 0);
    }

    #[test]
    fn test_average_latency() {
        let monitor = HealthMonitor::default();
        monitor.record_outcome("a", true, Duration::from_millis(100));
        monitor.record_outcome("a", true, Duration::from_millis(300));
        assert_eq!(monitor.get_health_status("a").response_time, Some(Duration::from_millis(200)));
    }

    #[test]
    fn test_get_health_status_is_idempotent() {
        let monitor = HealthMonitor::default();
        record(&monitor, "a", &[true, false, true, true, true, true]);
        let first = monitor.get_health_status("a");
        let second = monitor.get_health_status("a");
        assert_eq!(first, second);
    }

    #[test]
    fn test_reset_returns_to_unknown() {
        let monitor = HealthMonitor::default();
        record(&monitor, "a", &[false; 6]);
        record(&monitor, "b", &[true; 6]);
        monitor.reset("a");
        assert_eq!(monitor.get_health_status("a").state, HealthState::Unknown);
        assert_eq!(monitor.get_health_status("b").state, HealthState::Healthy);

        monitor.reset_all();
        assert!(monitor.snapshot_all().is_empty());
    }

    #[test]
    fn test_concurrent_recording() {
        let monitor = Arc::new(HealthMonitor::default());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let monitor = Arc::clone(&monitor);
                std::thread::spawn(move || {
                    let name = if i % 2 == 0 { "even" } else { "odd" };
                    for _ in 0..10 {
                        monitor.record_outcome(name, true, Duration::from_millis(5));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let snapshots = monitor.snapshot_all();
        assert_eq!(snapshots.len(), 2);
        assert!(snapshots.iter().all(|s| s.total_requests == 40));
        assert_eq!(snapshots[0].provider, "even");
    }
}

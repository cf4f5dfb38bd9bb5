//! TOML configuration for the dispatch and orchestration layer.

use crate::coordination::CoordinationConfig;
use crate::dispatch::DispatchConfig;
use crate::logging::LoggingConfig;
use crate::resilience::{BackoffStrategy, CircuitBreakerConfig, RetryConfig};
use crate::routing::{Capability, HealthConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// I/O error reading the file.
    #[error("Failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error.
    #[error("Failed to parse TOML configuration: {0}")]
    Toml(#[from] toml::de::Error),

    /// Configuration validation error.
    #[error("Invalid configuration: {0}")]
    Validation(String),
}

/// Result type for configuration operations.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConduitConfig {
    /// Log output.
    pub logging: LoggingConfig,
    /// Health classification thresholds.
    pub health: HealthConfig,
    /// Per-provider circuit breaker tuning.
    pub circuit_breaker: CircuitBreakerSettings,
    /// Retry tuning.
    pub retry: RetrySettings,
    /// Dispatcher strategy and fallback depth.
    pub dispatch: DispatchConfig,
    /// Multi-agent coordination tuning.
    pub coordination: CoordinationConfig,
    /// Configured providers.
    pub providers: Vec<ProviderSettings>,
}

/// `[circuit_breaker]` section; durations in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    pub failure_ratio: f64,
    pub minimum_throughput: u32,
    pub sampling_window_ms: u64,
    pub open_duration_ms: u64,
    pub success_threshold: u32,
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_ratio: 0.5,
            minimum_throughput: 10,
            sampling_window_ms: 60_000,
            open_duration_ms: 30_000,
            success_threshold: 2,
            half_open_max_calls: 2,
        }
    }
}

impl CircuitBreakerSettings {
    /// Converts to breaker configuration.
    pub fn to_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_ratio: self.failure_ratio,
            minimum_throughput: self.minimum_throughput,
            sampling_window: Duration::from_millis(self.sampling_window_ms),
            open_duration: Duration::from_millis(self.open_duration_ms),
            success_threshold: self.success_threshold,
            half_open_max_calls: self.half_open_max_calls,
        }
    }
}

/// `[retry]` section; durations in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff: BackoffStrategy,
    pub jitter: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
            backoff: BackoffStrategy::Exponential,
            jitter: true,
        }
    }
}

impl RetrySettings {
    /// Converts to retry configuration.
    pub fn to_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            backoff: self.backoff,
            jitter: self.jitter,
        }
    }
}

/// One `[[providers]]` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    /// Registry key; must match the handle supplied at wiring time.
    pub name: String,
    /// Capability names (e.g. "chat", "vision", "text_to_speech").
    pub capabilities: Vec<String>,
    /// Cost per 1K input units.
    pub input_cost_per_1k: f64,
    /// Cost per 1K output units.
    pub output_cost_per_1k: f64,
    /// Lower is preferred.
    pub priority: u32,
    /// Disabled providers are registered but never selected.
    pub enabled: bool,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            name: String::new(),
            capabilities: vec!["chat".to_string()],
            input_cost_per_1k: 0.0,
            output_cost_per_1k: 0.0,
            priority: 100,
            enabled: true,
        }
    }
}

/// Configuration loader.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads and validates configuration from a TOML file.
    ///
    /// # Arguments
    /// * `path` - Path to the configuration file
    ///
    /// # Errors
    /// Returns error if the file cannot be read, parsed, or validated.
    pub fn load(path: &Path) -> Result<ConduitConfig> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parses and validates configuration from a TOML string.
    pub fn parse(content: &str) -> Result<ConduitConfig> {
        let config: ConduitConfig = toml::from_str(content)?;
        Self::validate(&config)?;
        Ok(config)
    }

    /// Validates configuration.
    ///
    /// # Errors
    /// Returns `ConfigError::Validation` describing the first problem found.
    pub fn validate(config: &ConduitConfig) -> Result<()> {
        let health = &config.health;
        check_ratio("health.unhealthy_below", health.unhealthy_below)?;
        check_ratio("health.degraded_below", health.degraded_below)?;
        if health.unhealthy_below > health.degraded_below {
            return Err(invalid(format!(
                "health.unhealthy_below ({}) must be <= health.degraded_below ({})",
                health.unhealthy_below, health.degraded_below
            )));
        }
        check_positive("health.window_size", health.window_size as u64)?;
        if health.min_samples > health.window_size {
            return Err(invalid(format!(
                "health.min_samples ({}) must be <= health.window_size ({})",
                health.min_samples, health.window_size
            )));
        }

        let breaker = &config.circuit_breaker;
        check_ratio("circuit_breaker.failure_ratio", breaker.failure_ratio)?;
        check_positive("circuit_breaker.minimum_throughput", u64::from(breaker.minimum_throughput))?;
        check_positive("circuit_breaker.sampling_window_ms", breaker.sampling_window_ms)?;
        check_positive("circuit_breaker.success_threshold", u64::from(breaker.success_threshold))?;
        check_positive("circuit_breaker.half_open_max_calls", u64::from(breaker.half_open_max_calls))?;

        let retry = &config.retry;
        check_positive("retry.max_attempts", u64::from(retry.max_attempts))?;
        if retry.initial_delay_ms > retry.max_delay_ms {
            return Err(invalid(format!(
                "retry.initial_delay_ms ({}) must be <= retry.max_delay_ms ({})",
                retry.initial_delay_ms, retry.max_delay_ms
            )));
        }

        check_positive("dispatch.fallback_count", config.dispatch.fallback_count as u64)?;

        let coordination = &config.coordination;
        check_positive("coordination.max_debate_rounds", u64::from(coordination.max_debate_rounds))?;
        check_ratio("coordination.similarity_threshold", coordination.similarity_threshold)?;

        let mut seen = HashSet::new();
        for provider in &config.providers {
            if provider.name.trim().is_empty() {
                return Err(invalid("Provider name must not be empty".to_string()));
            }
            if !seen.insert(provider.name.to_lowercase()) {
                return Err(invalid(format!("Duplicate provider name: '{}'", provider.name)));
            }
            if provider.input_cost_per_1k < 0.0 || provider.output_cost_per_1k < 0.0 {
                return Err(invalid(format!("Provider '{}': costs must be >= 0", provider.name)));
            }
            for capability in &provider.capabilities {
                if capability.parse::<Capability>().is_err() {
                    return Err(invalid(format!(
                        "Provider '{}': unknown capability '{}'. Valid options: chat, streaming, embeddings, images, tools, vision, text_to_speech",
                        provider.name, capability
                    )));
                }
            }
        }

        Ok(())
    }
}

fn invalid(message: String) -> ConfigError {
    ConfigError::Validation(message)
}

fn check_ratio(field: &str, value: f64) -> Result<()> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(invalid(format!("{field} ({value}) must be between 0.0 and 1.0")))
    }
}

fn check_positive(field: &str, value: u64) -> Result<()> {
    if value == 0 { Err(invalid(format!("{field} must be greater than 0"))) } else { Ok(()) }
}

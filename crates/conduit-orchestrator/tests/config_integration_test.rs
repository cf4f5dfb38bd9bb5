//! Integration tests for loading configuration and wiring the dispatch stack from it.

use async_trait::async_trait;
use conduit_abstraction::{Provider, ProviderError, ProviderRequest, ProviderResponse};
use conduit_orchestrator::routing::Capability;
use conduit_orchestrator::{
    BackoffStrategy, ConfigError, ConfigLoader, CoordinationStrategy, MultiAgentCoordinator,
    ProviderDispatcher, ProviderRegistry, SelectionContext, SelectionStrategy,
};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio_util::sync::CancellationToken;

const FULL_CONFIG: &str = r#"
[logging]
level = "conduit_orchestrator=debug"
json = true

[health]
window_size = 50
min_samples = 3

[circuit_breaker]
failure_ratio = 0.6
minimum_throughput = 4
open_duration_ms = 5000

[retry]
max_attempts = 2
initial_delay_ms = 10
max_delay_ms = 100
backoff = "linear"
jitter = false

[dispatch]
default_strategy = "least_cost"
fallback_count = 2

[coordination]
max_debate_rounds = 5
similarity_threshold = 0.9

[[providers]]
name = "premium"
capabilities = ["chat", "vision", "tools"]
input_cost_per_1k = 0.03
output_cost_per_1k = 0.06
priority = 1

[[providers]]
name = "budget"
input_cost_per_1k = 0.001
output_cost_per_1k = 0.002
priority = 2

[[providers]]
name = "retired"
priority = 3
enabled = false
"#;

struct Named(String);

#[async_trait]
impl Provider for Named {
    fn name(&self) -> &str {
        &self.0
    }

    async fn invoke(
        &self,
        _request: &ProviderRequest,
        _cancellation: &CancellationToken,
    ) -> Result<ProviderResponse, ProviderError> {
        Ok(ProviderResponse::text(format!("from {}", self.0)))
    }
}

fn write_config(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

#[test]
fn test_full_config_round_trips_into_components() {
    let file = write_config(FULL_CONFIG);
    let config = ConfigLoader::load(file.path()).unwrap();

    assert!(config.logging.json);
    assert_eq!(config.health.window_size, 50);
    assert!((config.health.unhealthy_below - 0.5).abs() < f64::EPSILON);

    let breaker = config.circuit_breaker.to_config();
    assert_eq!(breaker.minimum_throughput, 4);
    assert_eq!(breaker.open_duration, Duration::from_secs(5));
    assert_eq!(breaker.success_threshold, 2);

    let retry = config.retry.to_config();
    assert_eq!(retry.backoff, BackoffStrategy::Linear);
    assert_eq!(retry.initial_delay, Duration::from_millis(10));

    assert_eq!(config.dispatch.default_strategy, SelectionStrategy::LeastCost);
    assert_eq!(config.coordination.max_debate_rounds, 5);
    assert_eq!(config.providers.len(), 3);
    assert_eq!(config.providers[1].capabilities, vec!["chat".to_string()]);
}

#[tokio::test]
async fn test_dispatcher_built_from_config() {
    let config = ConfigLoader::parse(FULL_CONFIG).unwrap();
    let registry = Arc::new(ProviderRegistry::from_settings(&config.providers, |name| {
        Some(Arc::new(Named(name.to_string())) as Arc<dyn Provider>)
    }));
    assert_eq!(registry.count(), 3);
    assert_eq!(registry.enabled().len(), 2);

    let dispatcher = ProviderDispatcher::from_config(Arc::clone(&registry), &config);
    let request = ProviderRequest::from_prompt("hello");
    let token = CancellationToken::new();

    let cheapest = dispatcher.dispatch_default(&SelectionContext::new(), &request, &token).await.unwrap();
    assert_eq!(cheapest.provider, "budget");

    let vision = dispatcher
        .dispatch_default(&SelectionContext::new().require(Capability::Vision), &request, &token)
        .await
        .unwrap();
    assert_eq!(vision.response.content, "from premium");

    let coordinator = MultiAgentCoordinator::new(CoordinationStrategy::Debate, config.coordination.clone());
    assert_eq!(coordinator.strategy(), CoordinationStrategy::Debate);
}

#[test]
fn test_invalid_files_are_rejected() {
    let cases = [
        ("[retry]\ninitial_delay_ms = 5000\nmax_delay_ms = 10\n", "initial_delay_ms"),
        ("[circuit_breaker]\nfailure_ratio = 1.5\n", "failure_ratio"),
        ("[[providers]]\nname = \"a\"\n[[providers]]\nname = \"A\"\n", "Duplicate"),
        ("[[providers]]\nname = \"a\"\ncapabilities = [\"telepathy\"]\n", "telepathy"),
    ];

    for (content, needle) in cases {
        let file = write_config(content);
        match ConfigLoader::load(file.path()) {
            Err(ConfigError::Validation(message)) => assert!(message.contains(needle), "{message}"),
            other => panic!("expected validation error for {needle}, got {other:?}"),
        }
    }

    let unknown_strategy = write_config("[dispatch]\ndefault_strategy = \"fastest\"\n");
    assert!(matches!(ConfigLoader::load(unknown_strategy.path()), Err(ConfigError::Toml(_))));

    let missing = ConfigLoader::load(std::path::Path::new("/nonexistent/conduit.toml"));
    assert!(matches!(missing, Err(ConfigError::Io(_))));
}

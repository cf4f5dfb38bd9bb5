//! Types for provider routing.

use conduit_abstraction::Provider;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// A single provider capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Chat completion.
    Chat,
    /// Streaming responses.
    Streaming,
    /// Embedding generation.
    Embeddings,
    /// Image generation.
    Images,
    /// Tool / function calling.
    Tools,
    /// Image understanding.
    Vision,
    /// Text-to-speech.
    TextToSpeech,
}

impl FromStr for Capability {
    type Err = ();

    /// Parses a capability name; case and `-`/`_` are interchangeable.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "chat" => Ok(Self::Chat),
            "streaming" => Ok(Self::Streaming),
            "embeddings" => Ok(Self::Embeddings),
            "images" => Ok(Self::Images),
            "tools" => Ok(Self::Tools),
            "vision" => Ok(Self::Vision),
            "text_to_speech" | "tts" => Ok(Self::TextToSpeech),
            _ => Err(()),
        }
    }
}

/// Capability flags advertised by a provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[allow(clippy::struct_excessive_bools)]
pub struct Capabilities {
    pub chat: bool,
    pub streaming: bool,
    pub embeddings: bool,
    pub images: bool,
    pub tools: bool,
    pub vision: bool,
    pub text_to_speech: bool,
}

impl Capabilities {
    /// Chat-only capability set.
    #[must_use]
    pub fn chat() -> Self {
        Self { chat: true, ..Self::default() }
    }

    /// Builds a capability set from a list of capabilities.
    #[must_use]
    pub fn from_list(capabilities: &[Capability]) -> Self {
        let mut caps = Self::default();
        for capability in capabilities {
            caps.set(*capability, true);
        }
        caps
    }

    /// Returns a copy with `capability` enabled.
    #[must_use]
    pub fn with(mut self, capability: Capability) -> Self {
        self.set(capability, true);
        self
    }

    /// Sets one capability flag.
    pub fn set(&mut self, capability: Capability, enabled: bool) {
        match capability {
            Capability::Chat => self.chat = enabled,
            Capability::Streaming => self.streaming = enabled,
            Capability::Embeddings => self.embeddings = enabled,
            Capability::Images => self.images = enabled,
            Capability::Tools => self.tools = enabled,
            Capability::Vision => self.vision = enabled,
            Capability::TextToSpeech => self.text_to_speech = enabled,
        }
    }

    /// Whether one capability is present.
    #[must_use]
    pub const fn has(&self, capability: Capability) -> bool {
        match capability {
            Capability::Chat => self.chat,
            Capability::Streaming => self.streaming,
            Capability::Embeddings => self.embeddings,
            Capability::Images => self.images,
            Capability::Tools => self.tools,
            Capability::Vision => self.vision,
            Capability::TextToSpeech => self.text_to_speech,
        }
    }

    /// Whether every capability in `required` is present here.
    #[must_use]
    pub fn satisfies(&self, required: &[Capability]) -> bool {
        required.iter().all(|c| self.has(*c))
    }
}

/// Cost per 1K units of input and output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Pricing {
    /// Cost per 1K input units.
    pub input_cost_per_1k: f64,
    /// Cost per 1K output units.
    pub output_cost_per_1k: f64,
}

impl Pricing {
    /// Creates a pricing record.
    #[must_use]
    pub const fn new(input_cost_per_1k: f64, output_cost_per_1k: f64) -> Self {
        Self { input_cost_per_1k, output_cost_per_1k }
    }

    /// Average of input and output unit cost; compared against cost ceilings.
    #[must_use]
    pub fn average(&self) -> f64 {
        (self.input_cost_per_1k + self.output_cost_per_1k) / 2.0
    }

    /// Summed input and output unit cost; used by the LeastCost strategy.
    #[must_use]
    pub fn total(&self) -> f64 {
        self.input_cost_per_1k + self.output_cost_per_1k
    }
}

/// Static metadata for a registered provider.
///
/// Descriptors are never mutated in place; updating a provider replaces its descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderDescriptor {
    /// Unique registry key.
    pub name: String,
    /// Advertised capabilities.
    pub capabilities: Capabilities,
    /// Unit pricing.
    pub pricing: Pricing,
    /// Lower is preferred.
    pub priority: u32,
    /// Disabled providers are never selected.
    pub enabled: bool,
}

impl ProviderDescriptor {
    /// Creates an enabled chat provider descriptor with zero cost.
    #[must_use]
    pub fn new(name: impl Into<String>, priority: u32) -> Self {
        Self {
            name: name.into(),
            capabilities: Capabilities::chat(),
            pricing: Pricing::default(),
            priority,
            enabled: true,
        }
    }

    /// Sets the capabilities.
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Sets the pricing.
    #[must_use]
    pub fn with_pricing(mut self, input_cost_per_1k: f64, output_cost_per_1k: f64) -> Self {
        self.pricing = Pricing::new(input_cost_per_1k, output_cost_per_1k);
        self
    }

    /// Sets the enabled flag.
    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// Health classification of a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HealthState {
    /// Not enough samples to judge.
    Unknown,
    /// Success rate at or above the degraded threshold.
    Healthy,
    /// Success rate between the unhealthy and degraded thresholds.
    Degraded,
    /// Success rate below the unhealthy threshold.
    Unhealthy,
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthState::Unknown => write!(f, "unknown"),
            HealthState::Healthy => write!(f, "healthy"),
            HealthState::Degraded => write!(f, "degraded"),
            HealthState::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Point-in-time health snapshot for one provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    /// Provider name.
    pub provider: String,
    /// Current classification.
    pub state: HealthState,
    /// Whether the provider may be used; only `Unhealthy` is not.
    pub is_healthy: bool,
    /// Success rate over the rolling window (0-1). Zero when there are no samples.
    pub success_rate: f64,
    /// Rolling average latency of the samples in the window, if any.
    pub response_time: Option<Duration>,
    /// Number of samples in the rolling window.
    pub window_samples: usize,
    /// Lifetime number of recorded outcomes.
    pub total_requests: u64,
    /// Failures since the last success.
    pub consecutive_failures: u32,
    /// When an outcome was last recorded.
    pub last_updated: Option<DateTime<Utc>>,
}

impl HealthStatus {
    /// Snapshot for a provider that has never been seen.
    #[must_use]
    pub fn unknown(provider: &str) -> Self {
        Self {
            provider: provider.to_string(),
            state: HealthState::Unknown,
            is_healthy: true,
            success_rate: 0.0,
            response_time: None,
            window_samples: 0,
            total_requests: 0,
            consecutive_failures: 0,
            last_updated: None,
        }
    }
}

/// Strategy used to pick among eligible providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    /// Lowest priority value wins; ties keep registration order.
    Priority,
    /// Lowest summed input+output unit cost wins.
    LeastCost,
    /// Lowest known response time wins.
    FastestResponse,
    /// Shared rotating counter over the candidates.
    RoundRobin,
    /// Uniform random pick.
    Random,
    /// Exact, case-insensitive match on `SelectionContext::specific_provider`.
    Specific,
    /// Delegates to `SelectionContext::ranker`.
    Custom,
}

impl fmt::Display for SelectionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SelectionStrategy::Priority => "priority",
            SelectionStrategy::LeastCost => "least_cost",
            SelectionStrategy::FastestResponse => "fastest_response",
            SelectionStrategy::RoundRobin => "round_robin",
            SelectionStrategy::Random => "random",
            SelectionStrategy::Specific => "specific",
            SelectionStrategy::Custom => "custom",
        };
        write!(f, "{name}")
    }
}

impl FromStr for SelectionStrategy {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "priority" => Ok(Self::Priority),
            "least_cost" | "cost" => Ok(Self::LeastCost),
            "fastest_response" | "fastest" => Ok(Self::FastestResponse),
            "round_robin" => Ok(Self::RoundRobin),
            "random" => Ok(Self::Random),
            "specific" => Ok(Self::Specific),
            "custom" => Ok(Self::Custom),
            _ => Err(()),
        }
    }
}

/// A provider that survived filtering, with the data the decision was based on.
#[derive(Clone)]
pub struct ProviderCandidate {
    /// Descriptor at selection time.
    pub descriptor: ProviderDescriptor,
    /// Health snapshot at selection time.
    pub health: HealthStatus,
    /// Handle used to invoke the provider.
    pub handle: Arc<dyn Provider>,
}

impl ProviderCandidate {
    /// Provider name.
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }
}

impl fmt::Debug for ProviderCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderCandidate")
            .field("descriptor", &self.descriptor)
            .field("health", &self.health)
            .finish_non_exhaustive()
    }
}

/// Caller-supplied ranking for the Custom strategy.
pub trait ProviderRanker: Send + Sync {
    /// Picks a provider name from the eligible candidates, or none.
    fn rank(&self, candidates: &[ProviderCandidate]) -> Option<String>;
}

/// Constraints for one selection request.
#[derive(Clone, Default)]
pub struct SelectionContext {
    /// Every listed capability must be present.
    pub required_capabilities: Vec<Capability>,
    /// Upper bound on the average of input and output unit cost.
    pub max_cost: Option<f64>,
    /// Upper bound on the rolling response time; ignored for providers without samples.
    pub max_response_time: Option<Duration>,
    /// Lower bound on success rate; ignored for providers without samples.
    pub min_success_rate: Option<f64>,
    /// Provider names never to select (case-insensitive).
    pub excluded: HashSet<String>,
    /// Target of the Specific strategy.
    pub specific_provider: Option<String>,
    /// Ranking used by the Custom strategy.
    pub ranker: Option<Arc<dyn ProviderRanker>>,
    /// Keep providers classified `Unhealthy` in the candidate set.
    pub allow_unhealthy: bool,
}

impl fmt::Debug for SelectionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelectionContext")
            .field("required_capabilities", &self.required_capabilities)
            .field("max_cost", &self.max_cost)
            .field("max_response_time", &self.max_response_time)
            .field("min_success_rate", &self.min_success_rate)
            .field("excluded", &self.excluded)
            .field("specific_provider", &self.specific_provider)
            .field("ranker", &self.ranker.as_ref().map(|_| "<ranker>"))
            .field("allow_unhealthy", &self.allow_unhealthy)
            .finish()
    }
}

impl SelectionContext {
    /// Context with no constraints.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requires a capability.
    #[must_use]
    pub fn require(mut self, capability: Capability) -> Self {
        self.required_capabilities.push(capability);
        self
    }

    /// Sets the cost ceiling.
    #[must_use]
    pub fn with_max_cost(mut self, max_cost: f64) -> Self {
        self.max_cost = Some(max_cost);
        self
    }

    /// Sets the response-time ceiling.
    #[must_use]
    pub fn with_max_response_time(mut self, max: Duration) -> Self {
        self.max_response_time = Some(max);
        self
    }

    /// Sets the minimum success rate.
    #[must_use]
    pub fn with_min_success_rate(mut self, rate: f64) -> Self {
        self.min_success_rate = Some(rate);
        self
    }

    /// Excludes a provider.
    #[must_use]
    pub fn exclude(mut self, name: impl Into<String>) -> Self {
        self.excluded.insert(name.into());
        self
    }

    /// Targets a specific provider.
    #[must_use]
    pub fn with_specific(mut self, name: impl Into<String>) -> Self {
        self.specific_provider = Some(name.into());
        self
    }

    /// Sets the custom ranker.
    #[must_use]
    pub fn with_ranker(mut self, ranker: Arc<dyn ProviderRanker>) -> Self {
        self.ranker = Some(ranker);
        self
    }

    /// Whether `name` is in the exclusion set.
    pub fn is_excluded(&self, name: &str) -> bool {
        self.excluded.iter().any(|e| e.eq_ignore_ascii_case(name))
    }
}

/// Why a selection produced no provider.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectionError {
    /// The registry has no enabled providers.
    #[error("No providers are registered")]
    NoProviders,

    /// Providers exist but none passed the constraints.
    #[error("No providers meet the selection constraints: {reason}")]
    NoEligibleProviders {
        /// Which filters removed the candidates.
        reason: String,
    },

    /// Candidates existed but the strategy picked none.
    #[error("Strategy '{strategy}' produced no pick: {reason}")]
    NoStrategyPick {
        /// The strategy that was applied.
        strategy: SelectionStrategy,
        /// Strategy-specific detail.
        reason: String,
    },
}

/// Outcome of a single-provider selection.
#[derive(Debug, Clone)]
pub struct SelectionResult {
    /// Whether a provider was chosen.
    pub success: bool,
    /// Strategy that was applied.
    pub strategy: SelectionStrategy,
    /// The chosen provider with its metadata and health snapshot.
    pub selected: Option<ProviderCandidate>,
    /// Why nothing was chosen.
    pub failure: Option<SelectionError>,
}

impl SelectionResult {
    /// Successful selection.
    #[must_use]
    pub fn chosen(strategy: SelectionStrategy, candidate: ProviderCandidate) -> Self {
        Self { success: true, strategy, selected: Some(candidate), failure: None }
    }

    /// Failed selection.
    #[must_use]
    pub fn failed(strategy: SelectionStrategy, failure: SelectionError) -> Self {
        Self { success: false, strategy, selected: None, failure: Some(failure) }
    }

    /// Name of the chosen provider.
    pub fn provider_name(&self) -> Option<&str> {
        self.selected.as_ref().map(ProviderCandidate::name)
    }

    /// Human-readable failure reason.
    pub fn failure_reason(&self) -> Option<String> {
        self.failure.as_ref().map(ToString::to_string)
    }

    /// Converts into a `Result` for `?` propagation.
    pub fn into_result(self) -> Result<ProviderCandidate, SelectionError> {
        match (self.selected, self.failure) {
            (Some(candidate), _) => Ok(candidate),
            (None, Some(failure)) => Err(failure),
            (None, None) => Err(SelectionError::NoStrategyPick {
                strategy: self.strategy,
                reason: "no candidate recorded".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capabilities_satisfy_required() {
        let caps = Capabilities::chat().with(Capability::Tools).with(Capability::Vision);
        assert!(caps.satisfies(&[Capability::Chat, Capability::Tools]));
        assert!(caps.satisfies(&[]));
        assert!(!caps.satisfies(&[Capability::Embeddings]));
    }

    #[test]
    fn test_capability_parsing() {
        assert_eq!("text-to-speech".parse::<Capability>(), Ok(Capability::TextToSpeech));
        assert_eq!("Vision".parse::<Capability>(), Ok(Capability::Vision));
        assert!("telepathy".parse::<Capability>().is_err());
    }

    #[test]
    fn test_pricing_average_and_total() {
        let pricing = Pricing::new(1.0, 3.0);
        assert!((pricing.average() - 2.0).abs() < f64::EPSILON);
        assert!((pricing.total() - 4.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_strategy_round_trip_through_strings() {
        for strategy in [
            SelectionStrategy::Priority,
            SelectionStrategy::LeastCost,
            SelectionStrategy::FastestResponse,
            SelectionStrategy::RoundRobin,
            SelectionStrategy::Random,
            SelectionStrategy::Specific,
            SelectionStrategy::Custom,
        ] {
            assert_eq!(strategy.to_string().parse::<SelectionStrategy>(), Ok(strategy));
        }
        assert_eq!("Round-Robin".parse::<SelectionStrategy>(), Ok(SelectionStrategy::RoundRobin));
        assert!("quality".parse::<SelectionStrategy>().is_err());
    }

    #[test]
    fn test_exclusion_is_case_insensitive() {
        let ctx = SelectionContext::new().exclude("OpenAI");
        assert!(ctx.is_excluded("openai"));
        assert!(!ctx.is_excluded("gemini"));
    }

    #[test]
    fn test_unknown_health_gets_benefit_of_the_doubt() {
        let status = HealthStatus::unknown("fresh");
        assert_eq!(status.state, HealthState::Unknown);
        assert!(status.is_healthy);
        assert_eq!(status.total_requests, 0);
    }
}

//! Provider selection.
//!
//! Filters the registry against a [`SelectionContext`] using live health data, then
//! applies a [`SelectionStrategy`] to the survivors.

use super::health::HealthMonitor;
use super::registry::ProviderRegistry;
use super::types::{
    HealthState, ProviderCandidate, SelectionContext, SelectionError, SelectionResult,
    SelectionStrategy,
};
use rand::Rng;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

/// Selects providers from a registry.
///
/// The round-robin counter is owned by the selector, so independent selectors never
/// share rotation state.
#[derive(Debug)]
pub struct ProviderSelector {
    registry: Arc<ProviderRegistry>,
    health: Arc<HealthMonitor>,
    round_robin: AtomicUsize,
}

impl ProviderSelector {
    /// Creates a new selector.
    ///
    /// # Arguments
    /// * `registry` - Provider registry
    /// * `health` - Health monitor consulted for every selection
    pub fn new(registry: Arc<ProviderRegistry>, health: Arc<HealthMonitor>) -> Self {
        Self { registry, health, round_robin: AtomicUsize::new(0) }
    }

    /// The registry being selected from.
    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    /// The health monitor consulted for every selection.
    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    /// Selects one provider.
    ///
    /// # Arguments
    /// * `strategy` - How to choose among eligible candidates
    /// * `context` - Constraints for this request
    ///
    /// # Returns
    /// A `SelectionResult` carrying either the chosen candidate or a failure reason.
    pub fn select_provider(
        &self,
        strategy: SelectionStrategy,
        context: &SelectionContext,
    ) -> SelectionResult {
        let result = self.eligible(context).and_then(|mut candidates| {
            let index = self.pick(strategy, &candidates, context)?;
            Ok(candidates.swap_remove(index))
        });

        match result {
            Ok(candidate) => {
                debug!(
                    strategy = %strategy,
                    provider = %candidate.name(),
                    health = %candidate.health.state,
                    "Provider selected"
                );
                SelectionResult::chosen(strategy, candidate)
            }
            Err(failure) => {
                debug!(strategy = %strategy, reason = %failure, "Provider selection failed");
                SelectionResult::failed(strategy, failure)
            }
        }
    }

    /// Selects up to `count` distinct providers in preference order.
    ///
    /// The first entry is the provider `select_provider` would have returned; the rest
    /// follow the same strategy applied to the remaining candidates. Specific and Custom
    /// lead with their pick, then continue in priority order. RoundRobin advances the
    /// rotation once per chain and fills the fallbacks from the providers that follow.
    ///
    /// # Errors
    /// Returns the same failures as `select_provider` when no first pick exists.
    pub fn select_providers(
        &self,
        strategy: SelectionStrategy,
        count: usize,
        context: &SelectionContext,
    ) -> Result<Vec<ProviderCandidate>, SelectionError> {
        let mut remaining = self.eligible(context)?;
        let mut chain = Vec::with_capacity(count.min(remaining.len()));
        let mut rotation = 0;

        while chain.len() < count && !remaining.is_empty() {
            let pick = if chain.is_empty() {
                self.pick(strategy, &remaining, context)?
            } else {
                match strategy {
                    SelectionStrategy::Specific | SelectionStrategy::Custom => {
                        pick_priority(&remaining)
                    }
                    SelectionStrategy::FastestResponse => {
                        pick_fastest(&remaining).unwrap_or_else(|| pick_priority(&remaining))
                    }
                    // Removal shifts the next provider in rotation into the vacated index.
                    SelectionStrategy::RoundRobin => rotation % remaining.len(),
                    _ => self.pick(strategy, &remaining, context)?,
                }
            };
            rotation = pick;
            chain.push(remaining.remove(pick));
        }

        debug!(
            strategy = %strategy,
            chain = ?chain.iter().map(ProviderCandidate::name).collect::<Vec<_>>(),
            "Fallback chain built"
        );
        Ok(chain)
    }

    /// Enumerates enabled providers and applies every context filter.
    fn eligible(&self, context: &SelectionContext) -> Result<Vec<ProviderCandidate>, SelectionError> {
        let providers = self.registry.enabled();
        if providers.is_empty() {
            return Err(SelectionError::NoProviders);
        }

        let mut rejected: Vec<String> = Vec::new();
        let candidates: Vec<ProviderCandidate> = providers
            .into_iter()
            .filter_map(|registered| {
                let health = self.health.get_health_status(&registered.descriptor.name);
                let candidate = ProviderCandidate {
                    descriptor: registered.descriptor,
                    health,
                    handle: registered.handle,
                };
                match rejection(&candidate, context) {
                    Some(reason) => {
                        rejected.push(format!("{}: {reason}", candidate.name()));
                        None
                    }
                    None => Some(candidate),
                }
            })
            .collect();

        if candidates.is_empty() {
            return Err(SelectionError::NoEligibleProviders { reason: rejected.join(", ") });
        }
        Ok(candidates)
    }

    /// Applies a strategy, returning an index into `candidates`.
    fn pick(
        &self,
        strategy: SelectionStrategy,
        candidates: &[ProviderCandidate],
        context: &SelectionContext,
    ) -> Result<usize, SelectionError> {
        let no_pick = |reason: &str| SelectionError::NoStrategyPick {
            strategy,
            reason: reason.to_string(),
        };

        match strategy {
            SelectionStrategy::Priority => Ok(pick_priority(candidates)),
            SelectionStrategy::LeastCost => Ok(candidates
                .iter()
                .enumerate()
                .min_by(|(_, a), (_, b)| {
                    a.descriptor.pricing.total().total_cmp(&b.descriptor.pricing.total())
                })
                .map_or(0, |(i, _)| i)),
            SelectionStrategy::FastestResponse => {
                pick_fastest(candidates).ok_or_else(|| no_pick("no candidate has a latency sample"))
            }
            SelectionStrategy::RoundRobin => {
                let tick = self.round_robin.fetch_add(1, Ordering::Relaxed);
                Ok(tick % candidates.len())
            }
            SelectionStrategy::Random => Ok(rand::thread_rng().gen_range(0..candidates.len())),
            SelectionStrategy::Specific => {
                let target = context
                    .specific_provider
                    .as_deref()
                    .ok_or_else(|| no_pick("no specific provider named"))?;
                candidates
                    .iter()
                    .position(|c| c.name().eq_ignore_ascii_case(target))
                    .ok_or_else(|| no_pick(&format!("'{target}' is not an eligible provider")))
            }
            SelectionStrategy::Custom => {
                let ranker =
                    context.ranker.as_ref().ok_or_else(|| no_pick("no custom ranker supplied"))?;
                let chosen =
                    ranker.rank(candidates).ok_or_else(|| no_pick("ranker returned no provider"))?;
                candidates
                    .iter()
                    .position(|c| c.name() == chosen)
                    .ok_or_else(|| no_pick(&format!("ranker chose unknown provider '{chosen}'")))
            }
        }
    }
}

/// Lowest priority value; `min_by_key` keeps the first of equal keys.
fn pick_priority(candidates: &[ProviderCandidate]) -> usize {
    candidates
        .iter()
        .enumerate()
        .min_by_key(|(_, c)| c.descriptor.priority)
        .map_or(0, |(i, _)| i)
}

/// Lowest known response time; candidates without samples are not ranked.
fn pick_fastest(candidates: &[ProviderCandidate]) -> Option<usize> {
    candidates
        .iter()
        .enumerate()
        .filter_map(|(i, c)| c.health.response_time.map(|t| (i, t)))
        .min_by_key(|(_, t)| *t)
        .map(|(i, _)| i)
}

/// Returns why a candidate fails the context, if it does.
fn rejection(candidate: &ProviderCandidate, context: &SelectionContext) -> Option<String> {
    let descriptor = &candidate.descriptor;
    let health = &candidate.health;

    if context.is_excluded(&descriptor.name) {
        return Some("excluded".to_string());
    }
    if !descriptor.capabilities.satisfies(&context.required_capabilities) {
        return Some("missing required capability".to_string());
    }
    if let Some(max_cost) = context.max_cost {
        if descriptor.pricing.average() > max_cost {
            return Some(format!("average cost {:.4} above {max_cost:.4}", descriptor.pricing.average()));
        }
    }
    if let (Some(max), Some(actual)) = (context.max_response_time, health.response_time) {
        if actual > max {
            return Some(format!("response time {}ms above {}ms", actual.as_millis(), max.as_millis()));
        }
    }
    if let Some(min_rate) = context.min_success_rate {
        if health.window_samples > 0 && health.success_rate < min_rate {
            return Some(format!("success rate {:.2} below {min_rate:.2}", health.success_rate));
        }
    }
    if health.state == HealthState::Unhealthy && !context.allow_unhealthy {
        return Some("unhealthy".to_string());
    }
    None
}

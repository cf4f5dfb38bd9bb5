//! Provider routing: health tracking, the provider registry, and strategy-based selection.

pub mod health;
pub mod registry;
pub mod selector;
pub mod types;

pub use health::{HealthConfig, HealthMonitor};
pub use registry::{ProviderRegistry, RegisteredProvider};
pub use selector::ProviderSelector;
pub use types::{
    Capabilities, Capability, HealthState, HealthStatus, Pricing, ProviderCandidate,
    ProviderDescriptor, ProviderRanker, SelectionContext, SelectionError, SelectionResult,
    SelectionStrategy,
};

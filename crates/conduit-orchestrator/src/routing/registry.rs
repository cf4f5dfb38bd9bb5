//! Provider registry.
//!
//! Holds the configured providers in registration order together with their
//! static descriptors.

use super::types::{Capabilities, Capability, Pricing, ProviderDescriptor};
use crate::config::ProviderSettings;
use conduit_abstraction::Provider;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, warn};

/// A provider handle paired with its descriptor.
#[derive(Clone)]
pub struct RegisteredProvider {
    /// Static metadata.
    pub descriptor: ProviderDescriptor,
    /// Invocation handle.
    pub handle: Arc<dyn Provider>,
}

impl fmt::Debug for RegisteredProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredProvider")
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

/// Registry of providers, ordered by first registration.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: RwLock<Vec<RegisteredProvider>>,
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry").field("provider_count", &self.count()).finish()
    }
}

impl ProviderRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a provider.
    ///
    /// # Arguments
    /// * `descriptor` - Static metadata; `descriptor.name` is the registry key
    /// * `handle` - Invocation handle
    ///
    /// # Returns
    /// Returns `true` if the provider was newly registered, `false` if it replaced an
    /// existing entry. A replaced entry keeps its original position.
    pub fn register(&self, descriptor: ProviderDescriptor, handle: Arc<dyn Provider>) -> bool {
        debug!(provider = %descriptor.name, priority = descriptor.priority, "Registering provider");

        let mut providers = self.providers.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = providers.iter_mut().find(|p| p.descriptor.name == descriptor.name)
        {
            warn!(provider = %descriptor.name, "Provider replaced in registry");
            *existing = RegisteredProvider { descriptor, handle };
            return false;
        }
        providers.push(RegisteredProvider { descriptor, handle });
        true
    }

    /// Removes a provider.
    ///
    /// # Returns
    /// Returns `true` if the provider was found and removed.
    pub fn unregister(&self, name: &str) -> bool {
        let mut providers = self.providers.write().unwrap_or_else(PoisonError::into_inner);
        let before = providers.len();
        providers.retain(|p| p.descriptor.name != name);
        let removed = providers.len() != before;
        if !removed {
            warn!(provider = %name, "Attempted to unregister unknown provider");
        }
        removed
    }

    /// Looks up a provider by exact name.
    pub fn get(&self, name: &str) -> Option<RegisteredProvider> {
        self.providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|p| p.descriptor.name == name)
            .cloned()
    }

    /// All providers in registration order, enabled or not.
    pub fn list(&self) -> Vec<RegisteredProvider> {
        self.providers.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Enabled providers in registration order.
    pub fn enabled(&self) -> Vec<RegisteredProvider> {
        self.providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|p| p.descriptor.enabled)
            .cloned()
            .collect()
    }

    /// Enables or disables a provider by replacing its descriptor.
    ///
    /// # Returns
    /// Returns `false` if no provider has that name.
    pub fn set_enabled(&self, name: &str, enabled: bool) -> bool {
        let mut providers = self.providers.write().unwrap_or_else(PoisonError::into_inner);
        match providers.iter_mut().find(|p| p.descriptor.name == name) {
            Some(entry) => {
                entry.descriptor = entry.descriptor.clone().with_enabled(enabled);
                debug!(provider = %name, enabled, "Provider toggled");
                true
            }
            None => false,
        }
    }

    /// Number of registered providers.
    pub fn count(&self) -> usize {
        self.providers.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Builds a descriptor from configuration.
    ///
    /// Capability names are validated by the config loader; unknown names are skipped here.
    pub fn descriptor_from_settings(settings: &ProviderSettings) -> ProviderDescriptor {
        let capabilities: Vec<Capability> =
            settings.capabilities.iter().filter_map(|c| c.parse::<Capability>().ok()).collect();
        ProviderDescriptor {
            name: settings.name.clone(),
            capabilities: Capabilities::from_list(&capabilities),
            pricing: Pricing::new(
                settings.input_cost_per_1k,
                settings.output_cost_per_1k,
            ),
            priority: settings.priority,
            enabled: settings.enabled,
        }
    }

    /// Builds a registry from configured providers, resolving each handle by name.
    ///
    /// Providers without a handle are skipped with a warning.
    pub fn from_settings<F>(settings: &[ProviderSettings], mut resolve: F) -> Self
    where
        F: FnMut(&str) -> Option<Arc<dyn Provider>>,
    {
        let registry = Self::new();
        for entry in settings {
            match resolve(&entry.name) {
                Some(handle) => {
                    registry.register(Self::descriptor_from_settings(entry), handle);
                }
                None => warn!(provider = %entry.name, "No handle for configured provider"),
            }
        }
        registry
    }
}

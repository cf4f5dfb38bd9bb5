//! Agent implementations.

pub mod provider;

pub use provider::ProviderAgent;

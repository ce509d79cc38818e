//! Chain registry.
//!
//! Chains are registered on a [`ChainRegistryBuilder`] during startup and
//! sealed into an immutable [`ChainRegistry`] before any message is
//! processed. A process-wide registry can be installed once with [`install`].

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use crate::chains::chain::Chain;
use crate::error::ChainError;

/// Collects chains before the registry is sealed.
#[derive(Default)]
pub struct ChainRegistryBuilder {
    chains: HashMap<String, Arc<dyn Chain>>,
}

impl ChainRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a chain. Names must be unique.
    pub fn register(&mut self, chain: Arc<dyn Chain>) -> Result<(), ChainError> {
        let name = chain.name().to_string();
        if self.chains.contains_key(&name) {
            return Err(ChainError::DuplicateChain { name });
        }
        tracing::debug!(chain = %name, "Registered chain");
        self.chains.insert(name, chain);
        Ok(())
    }

    /// Seal the registry. No chain can be added or replaced afterwards.
    pub fn build(self) -> ChainRegistry {
        ChainRegistry {
            chains: self.chains,
        }
    }
}

/// Immutable name → chain table.
pub struct ChainRegistry {
    chains: HashMap<String, Arc<dyn Chain>>,
}

impl ChainRegistry {
    pub fn get(&self, name: &str) -> Option<Arc<dyn Chain>> {
        self.chains.get(name).cloned()
    }

    /// Like [`get`](Self::get), but a missing chain is an error.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Chain>, ChainError> {
        self.get(name).ok_or_else(|| ChainError::UnknownChain {
            name: name.to_string(),
        })
    }

    /// Registered chain names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.chains.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.chains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }
}

static GLOBAL: OnceLock<Arc<ChainRegistry>> = OnceLock::new();

/// Install the process-wide registry. Fails if one is already installed.
pub fn install(registry: ChainRegistry) -> Result<Arc<ChainRegistry>, ChainError> {
    let registry = Arc::new(registry);
    GLOBAL
        .set(registry.clone())
        .map_err(|_| ChainError::RegistryInstalled)?;
    tracing::info!(chains = registry.len(), "Chain registry installed");
    Ok(registry)
}

/// The process-wide registry, if installed.
pub fn global() -> Option<Arc<ChainRegistry>> {
    GLOBAL.get().cloned()
}

//! Adapter registry.
//!
//! Built once at the process root and shared behind an `Arc`; there is no global
//! instance, so tests can assemble registries with whatever adapters they need.

use std::collections::HashMap;
use std::sync::Arc;

use crate::adapters::{AdapterMetadata, PosAdapter};
use crate::error::IntegrationError;
use crate::systems::ExternalSystemType;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("no adapter registered for '{system}'")]
    AdapterNotFound { system: ExternalSystemType },
}

impl From<RegistryError> for IntegrationError {
    fn from(err: RegistryError) -> Self {
        IntegrationError::not_found(err.to_string())
    }
}

#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<ExternalSystemType, Arc<dyn PosAdapter>>,
    metadata: HashMap<ExternalSystemType, AdapterMetadata>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an adapter, replacing any previous one for the same system.
    pub fn register(&mut self, adapter: Arc<dyn PosAdapter>, metadata: AdapterMetadata) {
        let system = adapter.system();
        self.adapters.insert(system, adapter);
        self.metadata.insert(system, metadata);
    }

    pub fn get(&self, system: ExternalSystemType) -> Result<Arc<dyn PosAdapter>, RegistryError> {
        self.adapters
            .get(&system)
            .cloned()
            .ok_or(RegistryError::AdapterNotFound { system })
    }

    pub fn get_metadata(
        &self,
        system: ExternalSystemType,
    ) -> Result<&AdapterMetadata, RegistryError> {
        self.metadata
            .get(&system)
            .ok_or(RegistryError::AdapterNotFound { system })
    }

    /// Metadata sorted by system for stable ordering.
    pub fn list_metadata(&self) -> Vec<AdapterMetadata> {
        let mut metadata: Vec<_> = self.metadata.values().cloned().collect();
        metadata.sort_by_key(|entry| entry.system);
        metadata
    }

    pub fn systems(&self) -> Vec<ExternalSystemType> {
        let mut systems: Vec<_> = self.adapters.keys().copied().collect();
        systems.sort();
        systems
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("systems", &self.systems())
            .finish()
    }
}

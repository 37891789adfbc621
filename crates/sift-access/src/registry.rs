//! Adapter registry keyed by source type
//!
//! Callers register one [`AdapterFactory`] per [`SourceType`]. The first
//! lookup for a type builds the adapter and caches it; later lookups share the
//! same `Arc<dyn DataSourceAdapter>`.
//!
//! # Example
//!
//! ```rust,ignore
//! use sift_access::prelude::*;
//!
//! fn memory() -> Result<Arc<dyn DataSourceAdapter>> {
//!     Ok(Arc::new(MemoryAdapter::default()))
//! }
//!
//! let mut registry = AdapterRegistry::new();
//! registry.register("memory", Arc::new(memory));
//!
//! let adapter = registry.get_or_create(&"memory".into()).transpose()?;
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use crate::connection::{DataSourceAdapter, SourceType};
use crate::error::Result;

/// Builds adapters for one source type
pub trait AdapterFactory: Send + Sync {
    /// Create an adapter instance
    fn create(&self) -> Result<Arc<dyn DataSourceAdapter>>;
}

impl<F> AdapterFactory for F
where
    F: Fn() -> Result<Arc<dyn DataSourceAdapter>> + Send + Sync,
{
    fn create(&self) -> Result<Arc<dyn DataSourceAdapter>> {
        self()
    }
}

/// Registry of adapter factories with a lazily filled instance cache
#[derive(Default)]
pub struct AdapterRegistry {
    factories: HashMap<SourceType, Arc<dyn AdapterFactory>>,
    cache: HashMap<SourceType, Arc<dyn DataSourceAdapter>>,
}

impl AdapterRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory; a cached adapter for the same type is dropped
    ///
    /// Returns the adapter that was cached under this type, if any, so the
    /// caller can destroy it.
    pub fn register(
        &mut self,
        source_type: impl Into<SourceType>,
        factory: Arc<dyn AdapterFactory>,
    ) -> Option<Arc<dyn DataSourceAdapter>> {
        let source_type = source_type.into();
        self.factories.insert(source_type.clone(), factory);
        self.cache.remove(&source_type)
    }

    /// Get a factory
    pub fn get(&self, source_type: &SourceType) -> Option<&Arc<dyn AdapterFactory>> {
        self.factories.get(source_type)
    }

    /// Get (or create and cache) the adapter for a type
    ///
    /// `None` when no factory is registered for the type.
    pub fn get_or_create(
        &mut self,
        source_type: &SourceType,
    ) -> Option<Result<Arc<dyn DataSourceAdapter>>> {
        if let Some(cached) = self.cache.get(source_type) {
            return Some(Ok(cached.clone()));
        }

        let factory = self.factories.get(source_type)?;
        match factory.create() {
            Ok(adapter) => {
                self.cache.insert(source_type.clone(), adapter.clone());
                Some(Ok(adapter))
            }
            Err(e) => Some(Err(e)),
        }
    }

    /// Take every cached adapter out of the registry
    pub fn drain_cached(&mut self) -> Vec<(SourceType, Arc<dyn DataSourceAdapter>)> {
        self.cache.drain().collect()
    }

    /// Registered types, sorted
    pub fn types(&self) -> Vec<SourceType> {
        let mut types: Vec<_> = self.factories.keys().cloned().collect();
        types.sort();
        types
    }

    /// Check if a type is registered
    pub fn contains(&self, source_type: &SourceType) -> bool {
        self.factories.contains_key(source_type)
    }

    /// Number of registered types
    pub fn len(&self) -> usize {
        self.factories.len()
    }

    /// Check if registry is empty
    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

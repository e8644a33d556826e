//! Plugin-based source registry
//!
//! The registry allows counter sources and record stores to be registered
//! dynamically at runtime, avoiding hardcoded if-else chains.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use portmeter_core::registry::SourceRegistry;
//!
//! // Registry with the in-process stores (memory, file) already registered
//! let registry = SourceRegistry::with_builtin_stores();
//!
//! // Plugin crates add themselves
//! portmeter_counter_nft::register(&registry);
//! portmeter_store_sqlite::register(&registry);
//!
//! let source = registry.create_counter_source(&config.counter_source)?;
//! let store = registry.create_record_store(&config.record_store).await?;
//! ```

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::config::{CounterSourceConfig, RecordStoreConfig};
use crate::error::{Error, Result};
use crate::state::{FileRecordStoreFactory, MemoryRecordStoreFactory};
use crate::traits::{CounterSource, CounterSourceFactory, RecordStore, RecordStoreFactory};

/// Registry for plugin-based counter source and record store creation
///
/// ## Thread Safety
///
/// The registry uses interior mutability with RwLock, allowing concurrent
/// reads and exclusive writes.
#[derive(Default)]
pub struct SourceRegistry {
    /// Registered counter source factories
    counter_sources: RwLock<HashMap<String, Box<dyn CounterSourceFactory>>>,

    /// Registered record store factories
    record_stores: RwLock<HashMap<String, Arc<dyn RecordStoreFactory>>>,
}

impl SourceRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with the `memory` and `file` stores registered
    pub fn with_builtin_stores() -> Self {
        let registry = Self::new();
        registry.register_record_store("memory", Box::new(MemoryRecordStoreFactory));
        registry.register_record_store("file", Box::new(FileRecordStoreFactory));
        registry
    }

    /// Register a counter source factory
    ///
    /// # Parameters
    ///
    /// - `name`: Counter source type name (e.g., "nft")
    /// - `factory`: Factory object for creating source instances
    pub fn register_counter_source(
        &self,
        name: impl Into<String>,
        factory: Box<dyn CounterSourceFactory>,
    ) {
        let mut sources = self
            .counter_sources
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        sources.insert(name.into(), factory);
    }

    /// Register a record store factory
    ///
    /// # Parameters
    ///
    /// - `name`: Record store type name (e.g., "sqlite", "file")
    /// - `factory`: Factory object for creating store instances
    pub fn register_record_store(
        &self,
        name: impl Into<String>,
        factory: Box<dyn RecordStoreFactory>,
    ) {
        let mut stores = self
            .record_stores
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        stores.insert(name.into(), Arc::from(factory));
    }

    /// Create a counter source from configuration
    ///
    /// # Returns
    ///
    /// - `Ok(Box<dyn CounterSource>)`: Created source instance
    /// - `Err(Error)`: If the source type is not registered or creation fails
    pub fn create_counter_source(
        &self,
        config: &CounterSourceConfig,
    ) -> Result<Box<dyn CounterSource>> {
        let source_type = config.type_name();
        let sources = self
            .counter_sources
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let factory = sources.get(source_type).ok_or_else(|| {
            Error::config(format!("Unknown counter source type: {}", source_type))
        })?;

        factory.create(config)
    }

    /// Create a record store from configuration
    ///
    /// # Returns
    ///
    /// - `Ok(Box<dyn RecordStore>)`: Created store instance
    /// - `Err(Error)`: If the store type is not registered or creation fails
    pub async fn create_record_store(
        &self,
        config: &RecordStoreConfig,
    ) -> Result<Box<dyn RecordStore>> {
        let store_type = config.type_name();

        let factory = {
            let stores = self
                .record_stores
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            stores
                .get(store_type)
                .ok_or_else(|| Error::config(format!("Unknown record store type: {}", store_type)))?
                .clone()
        };

        // Lock released before the async create
        factory.create(config).await
    }

    /// List all registered counter source types
    pub fn list_counter_sources(&self) -> Vec<String> {
        let sources = self
            .counter_sources
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut names: Vec<String> = sources.keys().cloned().collect();
        names.sort();
        names
    }

    /// List all registered record store types
    pub fn list_record_stores(&self) -> Vec<String> {
        let stores = self
            .record_stores
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut names: Vec<String> = stores.keys().cloned().collect();
        names.sort();
        names
    }

    /// Check if a counter source type is registered
    pub fn has_counter_source(&self, name: &str) -> bool {
        self.counter_sources
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains_key(name)
    }

    /// Check if a record store type is registered
    pub fn has_record_store(&self, name: &str) -> bool {
        self.record_stores
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains_key(name)
    }
}

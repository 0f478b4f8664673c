use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use crate::index::Index;

/// A collection of named chart indexes.
#[derive(Debug, Default)]
pub struct IndexRegistry {
    indexes: Mutex<HashMap<String, Arc<Index>>>,
}

impl IndexRegistry {
    /// Returns a new empty registry.
    pub fn new() -> Self {
        IndexRegistry::default()
    }

    /// Returns the index with the given name.
    pub fn get(&self, name: &str) -> Result<Arc<Index>, errors::IndexNotFound> {
        self.indexes
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| errors::IndexNotFound(name.to_string()))
    }

    /// Creates a named index, returning the existing instance if one is
    /// already present.
    pub fn create(&self, name: &str) -> Arc<Index> {
        self.indexes
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    /// Returns the sorted names of all indexes in the registry.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.indexes.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }
}

/// Errors that can occur when looking up named indexes
pub mod errors {
    use thiserror::Error;

    /// The named index does not exist
    #[derive(Debug, Error)]
    #[error("index {0} not found")]
    pub struct IndexNotFound(pub String);
}

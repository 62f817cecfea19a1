//! Bind-once knowledge base shared across heuristics.
//!
//! Rules may race to initialize shared state; the first to publish a key
//! wins and later publishers adopt the existing value through their
//! `load_kb` capability. Keys are never rebound and never deleted, so a
//! handle obtained once stays valid for the lifetime of the knowledge base.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::KnowledgeBaseError;

type StoredValue = Arc<dyn Any + Send + Sync>;

/// Write-once attribute store keyed by string.
///
/// Values are shared handles; the binding rule typically keeps the same
/// handle and mutates the interior, while adopters read through the handle
/// they load. Two `HammerTime` instances configured with the same knowledge
/// base share every heuristic's state.
#[derive(Default)]
pub struct KnowledgeBase {
    entries: RwLock<HashMap<String, StoredValue>>,
}

impl KnowledgeBase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `key` holds a value.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.read().contains_key(key)
    }

    /// Binds `key` to `value`. Fails if the key is already bound.
    pub fn set<T>(&self, key: &str, value: Arc<T>) -> Result<(), KnowledgeBaseError>
    where
        T: Any + Send + Sync,
    {
        let mut entries = self.entries.write();
        if entries.contains_key(key) {
            return Err(KnowledgeBaseError::AlreadyBound(key.to_string()));
        }
        entries.insert(key.to_string(), value);
        Ok(())
    }

    /// Returns the value bound to `key`, downcast to `T`.
    pub fn get<T>(&self, key: &str) -> Result<Arc<T>, KnowledgeBaseError>
    where
        T: Any + Send + Sync,
    {
        let entries = self.entries.read();
        let value = entries
            .get(key)
            .ok_or_else(|| KnowledgeBaseError::Unbound(key.to_string()))?;
        value
            .clone()
            .downcast::<T>()
            .map_err(|_| KnowledgeBaseError::TypeMismatch(key.to_string()))
    }
}

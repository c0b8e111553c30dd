//! In-memory storage backend.
//!
//! Thread-safe and non-persistent. Intended for embedded usage, tests, and as
//! the reference implementation of the [`SubjectStorage`] contract.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde_json::Value;

use crate::storage::traits::{StorageError, StorageResolver, SubjectStorage};
use crate::subject::property::{Property, PropertyKey, PropertyKind, StoredProperty};
use crate::value::{Payload, PropertyMap};

pub(crate) fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

#[derive(Debug, Default, Clone)]
struct SubjectRecord {
    props: PropertyMap,
    ext_props: PropertyMap,
}

impl SubjectRecord {
    fn map(&self, kind: PropertyKind) -> &PropertyMap {
        match kind {
            PropertyKind::Default => &self.props,
            PropertyKind::Extended => &self.ext_props,
        }
    }

    fn map_mut(&mut self, kind: PropertyKind) -> &mut PropertyMap {
        match kind {
            PropertyKind::Default => &mut self.props,
            PropertyKind::Extended => &mut self.ext_props,
        }
    }

    fn is_empty(&self) -> bool {
        self.props.is_empty() && self.ext_props.is_empty()
    }
}

type SharedState = Arc<RwLock<HashMap<String, SubjectRecord>>>;

/// Shared in-memory store for any number of subjects.
///
/// Cloning is cheap and every clone sees the same data, so one store can act
/// as the resolver for a whole router.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    state: SharedState,
}

impl MemoryStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage handle for one subject.
    #[must_use]
    pub fn storage(&self, subject: impl Into<String>) -> MemoryStorage {
        MemoryStorage {
            subject: subject.into(),
            state: Arc::clone(&self.state),
        }
    }

    /// Names of subjects that currently hold at least one property.
    pub fn subjects(&self) -> Result<Vec<String>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("memory.subjects"))?;
        let mut names: Vec<String> = state
            .iter()
            .filter(|(_, rec)| !rec.is_empty())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        Ok(names)
    }
}

impl StorageResolver for MemoryStore {
    fn resolve(
        &self,
        subject: &str,
        _event_data: Option<&Payload>,
    ) -> Result<Box<dyn SubjectStorage>, StorageError> {
        Ok(Box::new(self.storage(subject)))
    }
}

/// Storage handle bound to one subject of a [`MemoryStore`].
#[derive(Debug, Clone)]
pub struct MemoryStorage {
    subject: String,
    state: SharedState,
}

impl MemoryStorage {
    /// Subject this handle is bound to.
    #[must_use]
    pub fn subject(&self) -> &str {
        &self.subject
    }
}

impl SubjectStorage for MemoryStorage {
    fn load(&self) -> Result<(PropertyMap, PropertyMap), StorageError> {
        let state = self.state.read().map_err(|_| lock_err("memory.load"))?;
        Ok(state
            .get(&self.subject)
            .map(|rec| (rec.props.clone(), rec.ext_props.clone()))
            .unwrap_or_default())
    }

    fn store(
        &self,
        inserts: &[StoredProperty],
        updates: &[StoredProperty],
        deletes: &[PropertyKey],
    ) -> Result<(), StorageError> {
        if inserts.is_empty() && updates.is_empty() && deletes.is_empty() {
            return Ok(());
        }
        let mut state = self.state.write().map_err(|_| lock_err("memory.store"))?;
        let rec = state.entry(self.subject.clone()).or_default();
        for prop in inserts.iter().chain(updates) {
            rec.map_mut(prop.key.kind)
                .insert(prop.key.name.clone(), prop.value.clone());
        }
        for key in deletes {
            rec.map_mut(key.kind).remove(&key.name);
        }
        Ok(())
    }

    fn set(&self, property: &Property, old_default: &Value) -> Result<(Value, Value), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("memory.set"))?;
        let rec = state.entry(self.subject.clone()).or_default();
        let map = rec.map_mut(property.key.kind);
        let old = map
            .get(&property.key.name)
            .cloned()
            .unwrap_or_else(|| old_default.clone());
        let new = property.value.compute(&old)?;
        map.insert(property.key.name.clone(), new.clone());
        Ok((new, old))
    }

    fn get(&self, key: &PropertyKey) -> Result<Value, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("memory.get"))?;
        state
            .get(&self.subject)
            .and_then(|rec| rec.map(key.kind).get(&key.name))
            .cloned()
            .ok_or_else(|| StorageError::PropertyNotFound(key.clone()))
    }

    fn delete(&self, key: &PropertyKey) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("memory.delete"))?;
        if let Some(rec) = state.get_mut(&self.subject) {
            rec.map_mut(key.kind).remove(&key.name);
        }
        Ok(())
    }

    fn get_ext_props(&self) -> Result<PropertyMap, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("memory.get_ext_props"))?;
        Ok(state
            .get(&self.subject)
            .map(|rec| rec.ext_props.clone())
            .unwrap_or_default())
    }

    fn flush(&self) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("memory.flush"))?;
        state.remove(&self.subject);
        Ok(())
    }

    fn is_persistent(&self) -> bool {
        false
    }

    fn is_concurrency_safe(&self) -> bool {
        true
    }
}

//! Write-back property cache with per-namespace dirty tracking.

use std::collections::BTreeSet;

use serde_json::Value;

use crate::subject::property::{PropertyKey, PropertyKind, StoredProperty};
use crate::value::PropertyMap;

#[derive(Debug, Default, Clone)]
struct NamespaceCache {
    values: PropertyMap,
    created: BTreeSet<String>,
    updated: BTreeSet<String>,
    deleted: BTreeSet<String>,
}

impl NamespaceCache {
    fn loaded(values: PropertyMap) -> Self {
        Self {
            values,
            ..Self::default()
        }
    }

    fn set(&mut self, name: &str, value: Value) {
        if self.deleted.remove(name) {
            self.updated.insert(name.to_string());
        } else if self.values.contains_key(name) {
            if !self.created.contains(name) {
                self.updated.insert(name.to_string());
            }
        } else {
            self.created.insert(name.to_string());
        }
        self.values.insert(name.to_string(), value);
    }

    fn delete(&mut self, name: &str) -> bool {
        if self.values.remove(name).is_none() {
            return false;
        }
        self.updated.remove(name);
        if !self.created.remove(name) {
            self.deleted.insert(name.to_string());
        }
        true
    }

    fn refresh(&mut self, name: &str, value: Option<Value>) {
        self.created.remove(name);
        self.updated.remove(name);
        self.deleted.remove(name);
        match value {
            Some(v) => {
                self.values.insert(name.to_string(), v);
            }
            None => {
                self.values.remove(name);
            }
        }
    }

    fn is_dirty(&self) -> bool {
        !(self.created.is_empty() && self.updated.is_empty() && self.deleted.is_empty())
    }
}

/// Pending cache changes, ready for [`SubjectStorage::store`].
///
/// [`SubjectStorage::store`]: crate::storage::SubjectStorage::store
#[derive(Debug, Default, Clone, PartialEq)]
pub struct CacheChanges {
    /// Properties created since load.
    pub inserts: Vec<StoredProperty>,
    /// Properties that existed at load and changed since.
    pub updates: Vec<StoredProperty>,
    /// Properties that existed at load and were removed since.
    pub deletes: Vec<PropertyKey>,
}

impl CacheChanges {
    /// Whether there is nothing to write.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }
}

/// Properties of one subject as loaded from storage, plus local changes.
#[derive(Debug, Clone)]
pub struct PropertyCache {
    default: NamespaceCache,
    extended: NamespaceCache,
}

impl PropertyCache {
    /// Cache over freshly loaded maps, with nothing pending.
    #[must_use]
    pub fn new(props: PropertyMap, ext_props: PropertyMap) -> Self {
        Self {
            default: NamespaceCache::loaded(props),
            extended: NamespaceCache::loaded(ext_props),
        }
    }

    fn ns(&self, kind: PropertyKind) -> &NamespaceCache {
        match kind {
            PropertyKind::Default => &self.default,
            PropertyKind::Extended => &self.extended,
        }
    }

    fn ns_mut(&mut self, kind: PropertyKind) -> &mut NamespaceCache {
        match kind {
            PropertyKind::Default => &mut self.default,
            PropertyKind::Extended => &mut self.extended,
        }
    }

    /// Cached value.
    #[must_use]
    pub fn get(&self, key: &PropertyKey) -> Option<&Value> {
        self.ns(key.kind).values.get(&key.name)
    }

    /// All cached values of a namespace.
    #[must_use]
    pub fn values(&self, kind: PropertyKind) -> &PropertyMap {
        &self.ns(kind).values
    }

    /// Write locally and mark the property created or updated.
    pub fn set(&mut self, key: &PropertyKey, value: Value) {
        self.ns_mut(key.kind).set(&key.name, value);
    }

    /// Remove locally. Returns false if the property was not cached.
    pub fn delete(&mut self, key: &PropertyKey) -> bool {
        self.ns_mut(key.kind).delete(&key.name)
    }

    /// Record a value read from or written to storage directly; clears any
    /// pending change for the property.
    pub fn refresh(&mut self, key: &PropertyKey, value: Option<Value>) {
        self.ns_mut(key.kind).refresh(&key.name, value);
    }

    /// Whether any change is pending.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.default.is_dirty() || self.extended.is_dirty()
    }

    /// Pending changes of both namespaces.
    #[must_use]
    pub fn changes(&self) -> CacheChanges {
        let mut out = CacheChanges::default();
        for kind in [PropertyKind::Default, PropertyKind::Extended] {
            let ns = self.ns(kind);
            let stored = |name: &String| {
                ns.values
                    .get(name)
                    .map(|v| StoredProperty::new(PropertyKey::new(kind, name.clone()), v.clone()))
            };
            out.inserts.extend(ns.created.iter().filter_map(stored));
            out.updates.extend(ns.updated.iter().filter_map(stored));
            out.deletes
                .extend(ns.deleted.iter().map(|name| PropertyKey::new(kind, name.clone())));
        }
        out
    }
}

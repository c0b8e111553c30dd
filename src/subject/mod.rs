//! Subjects: named, stateful entities events are about.
//!
//! A [`Subject`] owns a storage handle and, optionally, a write-back
//! [`PropertyCache`]. Writes to default-namespace properties route a
//! `subject-property-changed` event through the subject's router before the
//! write call returns; deletes route `subject-property-deleted`. Extended
//! properties never route anything.
//!
//! In cache mode writes stay in memory until [`Subject::store`] is called.
//! Without the cache every write runs the backend's atomic read-modify-write.

pub mod cache;
pub mod property;

use std::fmt;

use serde_json::{json, Number, Value};

use crate::error::SubjectError;
use crate::router::{DispatchPolicy, EventRouter};
use crate::storage::{StorageError, SubjectStorage};
use crate::value::{add_number, negate_number, Payload, PropertyMap};

use cache::PropertyCache;
use property::{Property, PropertyKey, PropertyKind, PropertyValue};

/// Routed after a default property changed value.
pub const SUBJECT_PROPERTY_CHANGED: &str = "subject-property-changed";
/// Routed after a default property was deleted.
pub const SUBJECT_PROPERTY_DELETED: &str = "subject-property-deleted";
/// Routed after every property of a subject was removed.
pub const SUBJECT_FLUSHED: &str = "subject-flushed";

/// Payload key holding the property name of a property event.
pub const PROPERTY_NAME: &str = "property_name";
/// Payload key holding the new value of a change event.
pub const VALUE: &str = "value";
/// Payload key holding the previous value of a change event.
pub const OLD_VALUE: &str = "old_value";

/// Dispatch extension naming the property of a property event.
pub const PROPERTY_NAME_EXTENSION: &str = "propertyname";

/// A named entity with two property namespaces backed by a storage handle.
pub struct Subject {
    name: String,
    storage: Box<dyn SubjectStorage>,
    cache: Option<PropertyCache>,
    use_cache: bool,
    router: Option<EventRouter>,
    event_info: Payload,
}

impl fmt::Debug for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subject")
            .field("name", &self.name)
            .field("use_cache", &self.use_cache)
            .field("loaded", &self.cache.is_some())
            .field("routed", &self.router.is_some())
            .finish_non_exhaustive()
    }
}

impl Subject {
    /// Cached subject without a router: writes never route events.
    pub fn new(name: impl Into<String>, storage: Box<dyn SubjectStorage>) -> Self {
        Self {
            name: name.into(),
            storage,
            cache: None,
            use_cache: true,
            router: None,
            event_info: Payload::new(),
        }
    }

    /// Route property events through `router`.
    #[must_use]
    pub fn with_router(mut self, router: EventRouter) -> Self {
        self.router = Some(router);
        self
    }

    /// Default cache mode for calls that do not choose one.
    #[must_use]
    pub fn with_cache(mut self, use_cache: bool) -> Self {
        self.use_cache = use_cache;
        self
    }

    /// Attach the attributes of the inbound event being handled.
    #[must_use]
    pub fn with_event_info(mut self, event_info: Payload) -> Self {
        self.event_info = event_info;
        self
    }

    /// Subject name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Attributes of the inbound event, empty when none were attached.
    #[must_use]
    pub fn event_info(&self) -> &Payload {
        &self.event_info
    }

    /// Default cache mode.
    #[must_use]
    pub const fn use_cache(&self) -> bool {
        self.use_cache
    }

    /// Router property events go through.
    #[must_use]
    pub fn router(&self) -> Option<&EventRouter> {
        self.router.as_ref()
    }

    /// Backend handle.
    #[must_use]
    pub fn storage(&self) -> &dyn SubjectStorage {
        self.storage.as_ref()
    }

    /// Whether local changes are waiting for [`Subject::store`].
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.cache.as_ref().is_some_and(PropertyCache::is_dirty)
    }

    fn cache_mut(&mut self) -> Result<&mut PropertyCache, SubjectError> {
        let cache = match self.cache.take() {
            Some(cache) => cache,
            None => {
                let (props, ext_props) = self.storage.load()?;
                PropertyCache::new(props, ext_props)
            }
        };
        Ok(self.cache.insert(cache))
    }

    fn not_found(&self, name: &str) -> SubjectError {
        SubjectError::NotFound {
            subject: self.name.clone(),
            property: name.to_string(),
        }
    }

    fn route(&mut self, event_type: &str, payload: Payload, extra: Payload) -> Result<(), SubjectError> {
        if let Some(router) = self.router.clone() {
            router.route_with_extra(event_type, self, payload, DispatchPolicy::Default, extra)?;
        }
        Ok(())
    }

    fn property_extra(name: &str) -> Payload {
        let mut extra = Payload::new();
        extra.insert(PROPERTY_NAME_EXTENSION.to_string(), Value::from(name));
        extra
    }

    fn write(
        &mut self,
        key: PropertyKey,
        value: PropertyValue,
        old_default: &Value,
        muted: bool,
        use_cache: bool,
    ) -> Result<(Value, Value), SubjectError> {
        let (new, old) = if use_cache {
            let cache = self.cache_mut()?;
            let old = cache.get(&key).cloned().unwrap_or_else(|| old_default.clone());
            let new = value.compute(&old)?;
            cache.set(&key, new.clone());
            (new, old)
        } else {
            let property = Property {
                key: key.clone(),
                value,
            };
            let (new, old) = self.storage.set(&property, old_default)?;
            if let Some(cache) = self.cache.as_mut() {
                cache.refresh(&key, Some(new.clone()));
            }
            (new, old)
        };

        if !muted && key.kind == PropertyKind::Default && new != old {
            let mut payload = Payload::new();
            payload.insert(PROPERTY_NAME.to_string(), Value::from(key.name.as_str()));
            payload.insert(OLD_VALUE.to_string(), old.clone());
            payload.insert(VALUE.to_string(), new.clone());
            self.route(SUBJECT_PROPERTY_CHANGED, payload, Self::property_extra(&key.name))?;
        }
        Ok((new, old))
    }

    /// Write a default property and route the change. Returns `(new, old)`.
    ///
    /// # Errors
    /// `SubjectError::Routing` means the value was written but handling the
    /// change event failed.
    pub fn set(&mut self, name: &str, value: impl Into<PropertyValue>) -> Result<(Value, Value), SubjectError> {
        self.set_property(name, value, PropertyKind::Default, false, None)
    }

    /// Write a default property without routing a change event.
    pub fn set_muted(
        &mut self,
        name: &str,
        value: impl Into<PropertyValue>,
    ) -> Result<(Value, Value), SubjectError> {
        self.set_property(name, value, PropertyKind::Default, true, None)
    }

    /// Write an extended property.
    pub fn set_ext(&mut self, name: &str, value: impl Into<PropertyValue>) -> Result<(Value, Value), SubjectError> {
        self.set_property(name, value, PropertyKind::Extended, true, None)
    }

    /// Write with every option spelled out. `use_cache: None` picks the
    /// subject's default mode.
    pub fn set_property(
        &mut self,
        name: &str,
        value: impl Into<PropertyValue>,
        kind: PropertyKind,
        muted: bool,
        use_cache: Option<bool>,
    ) -> Result<(Value, Value), SubjectError> {
        let use_cache = use_cache.unwrap_or(self.use_cache);
        self.write(PropertyKey::new(kind, name), value.into(), &Value::Null, muted, use_cache)
    }

    /// Read a default property.
    ///
    /// # Errors
    /// - `NotFound`: if the property is not set
    pub fn get(&mut self, name: &str) -> Result<Value, SubjectError> {
        self.get_property(name, PropertyKind::Default, None)
    }

    /// Read an extended property.
    pub fn get_ext(&mut self, name: &str) -> Result<Value, SubjectError> {
        self.get_property(name, PropertyKind::Extended, None)
    }

    /// Read a default property, falling back to `default` when it is not set.
    pub fn get_or(&mut self, name: &str, default: Value) -> Result<Value, SubjectError> {
        match self.get(name) {
            Err(err) if err.is_not_found() => Ok(default),
            other => other,
        }
    }

    /// Read with every option spelled out. An uncached read refreshes the
    /// cache entry when a cache is loaded.
    pub fn get_property(
        &mut self,
        name: &str,
        kind: PropertyKind,
        use_cache: Option<bool>,
    ) -> Result<Value, SubjectError> {
        let key = PropertyKey::new(kind, name);
        if use_cache.unwrap_or(self.use_cache) {
            let found = self.cache_mut()?.get(&key).cloned();
            return found.ok_or_else(|| self.not_found(name));
        }
        match self.storage.get(&key) {
            Ok(value) => {
                if let Some(cache) = self.cache.as_mut() {
                    cache.refresh(&key, Some(value.clone()));
                }
                Ok(value)
            }
            Err(err) if err.is_not_found() => {
                if let Some(cache) = self.cache.as_mut() {
                    cache.refresh(&key, None);
                }
                Err(self.not_found(name))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Delete a default property and route `subject-property-deleted`.
    ///
    /// # Errors
    /// - `NotFound`: in cache mode, if the property is not set
    pub fn delete(&mut self, name: &str) -> Result<(), SubjectError> {
        self.delete_property(name, PropertyKind::Default, false, None)
    }

    /// Delete a default property without routing an event.
    pub fn delete_muted(&mut self, name: &str) -> Result<(), SubjectError> {
        self.delete_property(name, PropertyKind::Default, true, None)
    }

    /// Delete an extended property.
    pub fn delete_ext(&mut self, name: &str) -> Result<(), SubjectError> {
        self.delete_property(name, PropertyKind::Extended, true, None)
    }

    /// Delete with every option spelled out. Uncached deletes of missing
    /// properties succeed.
    pub fn delete_property(
        &mut self,
        name: &str,
        kind: PropertyKind,
        muted: bool,
        use_cache: Option<bool>,
    ) -> Result<(), SubjectError> {
        let key = PropertyKey::new(kind, name);
        if use_cache.unwrap_or(self.use_cache) {
            if !self.cache_mut()?.delete(&key) {
                return Err(self.not_found(name));
            }
        } else {
            self.storage.delete(&key)?;
            if let Some(cache) = self.cache.as_mut() {
                cache.refresh(&key, None);
            }
        }

        if !muted && kind == PropertyKind::Default {
            let mut payload = Payload::new();
            payload.insert(PROPERTY_NAME.to_string(), Value::from(name));
            self.route(SUBJECT_PROPERTY_DELETED, payload, Self::property_extra(name))?;
        }
        Ok(())
    }

    /// Atomically add `amount` to a numeric property (missing counts as 0),
    /// bypassing the cache. Returns `(new, old)`.
    ///
    /// # Errors
    /// - `Storage(InvalidValue)`: if the current value is not a number
    pub fn incr(&mut self, name: &str, amount: impl Into<Number>) -> Result<(Value, Value), SubjectError> {
        let amount = amount.into();
        let update = PropertyValue::try_update(move |old| {
            add_number(old, &amount)
                .ok_or_else(|| StorageError::InvalidValue(format!("cannot add {amount} to {old}")))
        });
        self.write(PropertyKey::default_ns(name), update, &json!(0), false, false)
    }

    /// Atomically subtract `amount`; see [`Subject::incr`].
    pub fn decr(&mut self, name: &str, amount: impl Into<Number>) -> Result<(Value, Value), SubjectError> {
        let amount = amount.into();
        let negated = negate_number(&amount)
            .ok_or_else(|| StorageError::InvalidValue(format!("cannot negate {amount}")))?;
        self.incr(name, negated)
    }

    /// Whether a default property is set.
    pub fn contains(&mut self, name: &str) -> Result<bool, SubjectError> {
        if self.use_cache {
            return Ok(self.cache_mut()?.values(PropertyKind::Default).contains_key(name));
        }
        Ok(self.storage.load()?.0.contains_key(name))
    }

    /// Number of default properties.
    pub fn len(&mut self) -> Result<usize, SubjectError> {
        if self.use_cache {
            return Ok(self.cache_mut()?.values(PropertyKind::Default).len());
        }
        Ok(self.storage.load()?.0.len())
    }

    /// Whether no default property is set.
    pub fn is_empty(&mut self) -> Result<bool, SubjectError> {
        Ok(self.len()? == 0)
    }

    /// Snapshot of the default properties.
    pub fn properties(&mut self) -> Result<PropertyMap, SubjectError> {
        if self.use_cache {
            return Ok(self.cache_mut()?.values(PropertyKind::Default).clone());
        }
        Ok(self.storage.load()?.0)
    }

    /// Extended properties, from the cache when loaded.
    pub fn get_ext_props(&self) -> Result<PropertyMap, SubjectError> {
        match &self.cache {
            Some(cache) => Ok(cache.values(PropertyKind::Extended).clone()),
            None => Ok(self.storage.get_ext_props()?),
        }
    }

    /// Write pending cache changes and drop the cache. A failed write keeps
    /// the cache so the call can be repeated.
    pub fn store(&mut self) -> Result<(), SubjectError> {
        let Some(cache) = self.cache.take() else {
            return Ok(());
        };
        let changes = cache.changes();
        if changes.is_empty() {
            return Ok(());
        }
        if let Err(err) = self.storage.store(&changes.inserts, &changes.updates, &changes.deletes) {
            self.cache = Some(cache);
            return Err(err.into());
        }
        Ok(())
    }

    /// Drop the cache without writing it.
    pub fn discard_cache(&mut self) {
        self.cache = None;
    }

    /// Remove every property from storage and route `subject-flushed` with
    /// the state as seen right before. A failed flush keeps the cache.
    pub fn flush(&mut self) -> Result<(), SubjectError> {
        let (props, ext_props) = match &self.cache {
            Some(cache) => (
                cache.values(PropertyKind::Default).clone(),
                cache.values(PropertyKind::Extended).clone(),
            ),
            None => self.storage.load()?,
        };
        self.storage.flush()?;
        self.cache = None;

        let mut payload = Payload::new();
        payload.insert("props".to_string(), Value::Object(props));
        payload.insert("ext_props".to_string(), Value::Object(ext_props));
        self.route(SUBJECT_FLUSHED, payload, Payload::new())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::router::{ChannelDispatcher, EventRouter, OutboundEvent};
    use crate::storage::MemoryStore;
    use crossbeam_channel::Receiver;

    fn subject(store: &MemoryStore, name: &str) -> Subject {
        Subject::new(name, Box::new(store.storage(name)))
    }

    fn routed(store: &MemoryStore, name: &str) -> (Subject, Receiver<OutboundEvent>) {
        let (dispatcher, rx) = ChannelDispatcher::new("test", 16);
        let router = EventRouter::builder()
            .dispatcher(dispatcher)
            .resolver(store.clone())
            .build();
        (subject(store, name).with_router(router), rx)
    }

    #[test]
    fn cached_writes_reach_storage_on_store() {
        let store = MemoryStore::new();
        let mut s = subject(&store, "user|1");
        s.set("name", "ada").unwrap();
        assert!(s.is_dirty());
        assert!(store.subjects().unwrap().is_empty());

        s.store().unwrap();
        assert!(!s.is_dirty());
        let mut fresh = subject(&store, "user|1");
        assert_eq!(fresh.get("name").unwrap(), json!("ada"));
    }

    #[test]
    fn discarded_subject_reverts() {
        let store = MemoryStore::new();
        let mut s = subject(&store, "s");
        s.set("a", 1).unwrap();
        s.discard_cache();
        assert!(s.get("a").unwrap_err().is_not_found());
    }

    #[test]
    fn uncached_write_is_immediate_and_refreshes_cache() {
        let store = MemoryStore::new();
        let mut s = subject(&store, "s");
        assert!(!s.contains("a").unwrap());
        s.set_property("a", 5, PropertyKind::Default, false, Some(false)).unwrap();
        assert_eq!(s.get("a").unwrap(), json!(5));
        assert!(!s.is_dirty());
        assert_eq!(subject(&store, "s").get("a").unwrap(), json!(5));
    }

    #[test]
    fn update_functions_see_the_old_value() {
        let store = MemoryStore::new();
        let mut s = subject(&store, "s");
        s.set("n", 1).unwrap();
        let (new, old) = s
            .set("n", PropertyValue::update(|v| json!(v.as_i64().unwrap_or(0) * 10)))
            .unwrap();
        assert_eq!((new, old), (json!(10), json!(1)));
    }

    #[test]
    fn incr_and_decr_are_uncached() {
        let store = MemoryStore::new();
        let mut s = subject(&store, "s");
        assert_eq!(s.incr("count", 2).unwrap(), (json!(2), json!(0)));
        assert_eq!(s.decr("count", 5).unwrap(), (json!(-3), json!(2)));
        assert_eq!(subject(&store, "s").get("count").unwrap(), json!(-3));

        s.set_property("label", "x", PropertyKind::Default, true, Some(false)).unwrap();
        let err = s.incr("label", 1).unwrap_err();
        assert!(matches!(err, SubjectError::Storage(StorageError::InvalidValue(_))));
    }

    #[test]
    fn cached_delete_of_missing_property_fails() {
        let store = MemoryStore::new();
        let mut s = subject(&store, "s");
        assert!(s.delete("nope").unwrap_err().is_not_found());
        s.delete_property("nope", PropertyKind::Default, false, Some(false)).unwrap();
    }

    #[test]
    fn extended_namespace_is_separate() {
        let store = MemoryStore::new();
        let mut s = subject(&store, "s");
        s.set_ext("group", "g1").unwrap();
        s.set("group", "other").unwrap();
        assert_eq!(s.get_ext("group").unwrap(), json!("g1"));
        assert_eq!(s.get_ext_props().unwrap().len(), 1);
        assert_eq!(s.len().unwrap(), 1);
        s.store().unwrap();
        assert_eq!(subject(&store, "s").get_ext_props().unwrap()["group"], json!("g1"));
    }

    #[test]
    fn unhandled_change_events_are_dispatched() {
        let store = MemoryStore::new();
        let (mut s, rx) = routed(&store, "device|1");
        s.set("temp", 20).unwrap();
        let event = rx.try_recv().unwrap();
        assert_eq!(event.event_type, SUBJECT_PROPERTY_CHANGED);
        assert_eq!(event.subject, "device|1");
        assert_eq!(event.payload[PROPERTY_NAME], json!("temp"));
        assert_eq!(event.payload[OLD_VALUE], Value::Null);
        assert_eq!(event.payload[VALUE], json!(20));
        assert_eq!(event.extra[PROPERTY_NAME_EXTENSION], json!("temp"));
    }

    #[test]
    fn muted_unchanged_and_extended_writes_route_nothing() {
        let store = MemoryStore::new();
        let (mut s, rx) = routed(&store, "s");
        s.set_muted("a", 1).unwrap();
        s.set_ext("b", 2).unwrap();
        s.delete_muted("a").unwrap();
        s.delete_ext("b").unwrap();
        assert!(rx.try_recv().is_err());

        s.set("c", 3).unwrap();
        s.set("c", 3).unwrap();
        assert_eq!(rx.try_iter().count(), 1);
    }

    #[test]
    fn delete_and_flush_route_events() {
        let store = MemoryStore::new();
        let (mut s, rx) = routed(&store, "s");
        s.set_muted("a", 1).unwrap();
        s.set_ext("e", true).unwrap();
        s.delete("a").unwrap();
        let deleted = rx.try_recv().unwrap();
        assert_eq!(deleted.event_type, SUBJECT_PROPERTY_DELETED);
        assert_eq!(deleted.payload[PROPERTY_NAME], json!("a"));

        s.set_muted("b", 2).unwrap();
        s.store().unwrap();
        s.flush().unwrap();
        let flushed = rx.try_recv().unwrap();
        assert_eq!(flushed.event_type, SUBJECT_FLUSHED);
        assert_eq!(flushed.payload["props"], json!({"b": 2}));
        assert_eq!(flushed.payload["ext_props"], json!({"e": true}));
        assert!(store.subjects().unwrap().is_empty());
    }

    /// Memory storage whose batched writes and flushes fail while `broken`.
    struct Flaky {
        inner: crate::storage::MemoryStorage,
        broken: Arc<AtomicBool>,
    }

    impl Flaky {
        fn check(&self) -> Result<(), StorageError> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(StorageError::BackendError("backend unavailable".into()));
            }
            Ok(())
        }
    }

    impl SubjectStorage for Flaky {
        fn load(&self) -> Result<(PropertyMap, PropertyMap), StorageError> {
            self.inner.load()
        }

        fn store(
            &self,
            inserts: &[property::StoredProperty],
            updates: &[property::StoredProperty],
            deletes: &[PropertyKey],
        ) -> Result<(), StorageError> {
            self.check()?;
            self.inner.store(inserts, updates, deletes)
        }

        fn set(&self, property: &Property, old_default: &Value) -> Result<(Value, Value), StorageError> {
            self.inner.set(property, old_default)
        }

        fn get(&self, key: &PropertyKey) -> Result<Value, StorageError> {
            self.inner.get(key)
        }

        fn delete(&self, key: &PropertyKey) -> Result<(), StorageError> {
            self.inner.delete(key)
        }

        fn get_ext_props(&self) -> Result<PropertyMap, StorageError> {
            self.inner.get_ext_props()
        }

        fn flush(&self) -> Result<(), StorageError> {
            self.check()?;
            self.inner.flush()
        }

        fn is_persistent(&self) -> bool {
            false
        }

        fn is_concurrency_safe(&self) -> bool {
            true
        }
    }

    fn flaky(store: &MemoryStore, name: &str) -> (Subject, Arc<AtomicBool>) {
        let broken = Arc::new(AtomicBool::new(false));
        let storage = Flaky {
            inner: store.storage(name),
            broken: Arc::clone(&broken),
        };
        (Subject::new(name, Box::new(storage)), broken)
    }

    #[test]
    fn failed_store_keeps_pending_changes() {
        let store = MemoryStore::new();
        let (mut s, broken) = flaky(&store, "s");
        s.set("a", 1).unwrap();
        broken.store(true, Ordering::SeqCst);
        assert!(s.store().is_err());
        assert!(s.is_dirty());

        broken.store(false, Ordering::SeqCst);
        s.store().unwrap();
        assert_eq!(subject(&store, "s").get("a").unwrap(), json!(1));
    }

    #[test]
    fn failed_flush_keeps_the_cache() {
        let store = MemoryStore::new();
        let (mut s, broken) = flaky(&store, "s");
        s.set("a", 1).unwrap();
        s.set_muted("pending", true).unwrap();
        broken.store(true, Ordering::SeqCst);
        assert!(s.flush().is_err());
        assert!(s.is_dirty());
        assert_eq!(s.get("pending").unwrap(), json!(true));

        broken.store(false, Ordering::SeqCst);
        s.flush().unwrap();
        assert!(!s.is_dirty());
        assert!(store.subjects().unwrap().is_empty());
    }
}

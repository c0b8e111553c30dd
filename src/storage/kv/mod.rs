//! Key/value (hash-per-subject) storage backend.
//!
//! Each subject is one hash stored under `s:{key_prefix}{subject}`; each field
//! is a namespace tag followed by the property name, and each value is the
//! property's JSON text. Atomic updates use optimistic concurrency: WATCH the
//! hash, read the old value, then EXEC a write that aborts if the hash changed
//! in between. Aborted cycles retry until one commits.

mod memory;
#[cfg(feature = "redis")]
mod redis_client;

pub use memory::MemoryKeyValueClient;
#[cfg(feature = "redis")]
pub use redis_client::RedisKeyValueClient;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::storage::traits::{StorageError, StorageResolver, SubjectStorage};
use crate::subject::property::{Property, PropertyKey, PropertyKind, StoredProperty};
use crate::value::{Payload, PropertyMap};

/// Opaque version observed by [`KeyValueClient::watch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchToken(pub u64);

/// One command of a MULTI/EXEC block on a single hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HashOp {
    /// Read a field; yields `Some(value)` or `None` in the EXEC reply.
    Get {
        /// Hash field.
        field: String,
    },
    /// Write a field; yields `None` in the EXEC reply.
    Set {
        /// Hash field.
        field: String,
        /// Field value.
        value: String,
    },
    /// Remove a field; yields `None` in the EXEC reply.
    Del {
        /// Hash field.
        field: String,
    },
}

/// Result of [`KeyValueClient::exec`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecOutcome {
    /// The watched key changed; nothing was applied.
    Aborted,
    /// Every command was applied; one reply per command.
    Committed(Vec<Option<String>>),
}

/// Client for a hash-oriented key/value server.
///
/// Implementations are shared by every subject of a process and must be safe
/// for concurrent use.
pub trait KeyValueClient: Send + Sync {
    /// All fields of a hash (empty when the key is missing).
    fn hgetall(&self, key: &str) -> Result<Vec<(String, String)>, StorageError>;

    /// One field of a hash.
    fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StorageError>;

    /// Fields whose name starts with `field_prefix`.
    fn hscan(&self, key: &str, field_prefix: &str) -> Result<Vec<(String, String)>, StorageError>;

    /// Start watching `key`.
    fn watch(&self, key: &str) -> Result<WatchToken, StorageError>;

    /// Apply `ops` atomically. With a watch token the block aborts if the key
    /// was modified since the token was taken.
    fn exec(
        &self,
        key: &str,
        watch: Option<WatchToken>,
        ops: &[HashOp],
    ) -> Result<ExecOutcome, StorageError>;

    /// Remove a key.
    fn del(&self, key: &str) -> Result<(), StorageError>;

    /// Whether the server keeps data across restarts.
    fn is_persistent(&self) -> bool {
        true
    }
}

/// Key/value backend settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyValueConfig {
    /// Inserted between `s:` and the subject name.
    pub key_prefix: String,
}

/// Resolver building [`KeyValueStorage`] handles over one shared client.
#[derive(Clone)]
pub struct KeyValueBackend {
    client: Arc<dyn KeyValueClient>,
    config: KeyValueConfig,
}

impl KeyValueBackend {
    /// Backend over `client`.
    pub fn new(client: Arc<dyn KeyValueClient>, config: KeyValueConfig) -> Self {
        Self { client, config }
    }

    /// Storage handle for one subject.
    #[must_use]
    pub fn storage(&self, subject: &str) -> KeyValueStorage {
        KeyValueStorage {
            key: format!("s:{}{}", self.config.key_prefix, subject),
            client: Arc::clone(&self.client),
        }
    }
}

impl std::fmt::Debug for KeyValueBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyValueBackend")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl StorageResolver for KeyValueBackend {
    fn resolve(
        &self,
        subject: &str,
        _event_data: Option<&Payload>,
    ) -> Result<Box<dyn SubjectStorage>, StorageError> {
        Ok(Box::new(self.storage(subject)))
    }
}

/// Storage for one subject hash.
pub struct KeyValueStorage {
    key: String,
    client: Arc<dyn KeyValueClient>,
}

impl KeyValueStorage {
    /// Hash key holding this subject.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    fn decode_value(raw: Option<String>, default: &Value) -> Result<Value, StorageError> {
        match raw {
            Some(text) => Ok(serde_json::from_str(&text)?),
            None => Ok(default.clone()),
        }
    }

    fn set_with_watch(&self, property: &Property, field: &str, old_default: &Value) -> Result<(Value, Value), StorageError> {
        let mut attempt: u64 = 0;
        loop {
            attempt += 1;
            let token = self.client.watch(&self.key)?;
            let old = Self::decode_value(self.client.hget(&self.key, field)?, old_default)?;
            let new = property.value.compute(&old)?;
            let ops = [HashOp::Set {
                field: field.to_string(),
                value: serde_json::to_string(&new)?,
            }];
            match self.client.exec(&self.key, Some(token), &ops)? {
                ExecOutcome::Committed(_) => return Ok((new, old)),
                ExecOutcome::Aborted => {
                    debug!(key = %self.key, field, attempt, "watched key changed, retrying");
                }
            }
        }
    }
}

impl SubjectStorage for KeyValueStorage {
    fn load(&self) -> Result<(PropertyMap, PropertyMap), StorageError> {
        let mut props = PropertyMap::new();
        let mut ext_props = PropertyMap::new();
        for (field, raw) in self.client.hgetall(&self.key)? {
            let Some(key) = PropertyKey::decode(&field) else {
                debug!(key = %self.key, field, "skipping field without a namespace tag");
                continue;
            };
            let value: Value = serde_json::from_str(&raw)?;
            match key.kind {
                PropertyKind::Default => props.insert(key.name, value),
                PropertyKind::Extended => ext_props.insert(key.name, value),
            };
        }
        Ok((props, ext_props))
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
        let mut ops = Vec::with_capacity(inserts.len() + updates.len() + deletes.len());
        for prop in inserts.iter().chain(updates) {
            ops.push(HashOp::Set {
                field: prop.key.encoded(),
                value: serde_json::to_string(&prop.value)?,
            });
        }
        ops.extend(deletes.iter().map(|key| HashOp::Del { field: key.encoded() }));
        self.client.exec(&self.key, None, &ops)?;
        Ok(())
    }

    fn set(&self, property: &Property, old_default: &Value) -> Result<(Value, Value), StorageError> {
        let field = property.key.encoded();
        if property.value.is_computed() {
            return self.set_with_watch(property, &field, old_default);
        }

        let new = property.value.compute(old_default)?;
        let ops = [
            HashOp::Get { field: field.clone() },
            HashOp::Set {
                field,
                value: serde_json::to_string(&new)?,
            },
        ];
        match self.client.exec(&self.key, None, &ops)? {
            ExecOutcome::Committed(mut replies) if !replies.is_empty() => {
                let old = Self::decode_value(replies.swap_remove(0), old_default)?;
                Ok((new, old))
            }
            other => Err(StorageError::BackendError(format!(
                "unexpected reply to unwatched exec on {}: {other:?}",
                self.key
            ))),
        }
    }

    fn get(&self, key: &PropertyKey) -> Result<Value, StorageError> {
        match self.client.hget(&self.key, &key.encoded())? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Err(StorageError::PropertyNotFound(key.clone())),
        }
    }

    fn delete(&self, key: &PropertyKey) -> Result<(), StorageError> {
        self.client
            .exec(&self.key, None, &[HashOp::Del { field: key.encoded() }])?;
        Ok(())
    }

    fn get_ext_props(&self) -> Result<PropertyMap, StorageError> {
        let tag = PropertyKind::Extended.tag().to_string();
        let mut props = PropertyMap::new();
        for (field, raw) in self.client.hscan(&self.key, &tag)? {
            if let Some(key) = PropertyKey::decode(&field) {
                props.insert(key.name, serde_json::from_str(&raw)?);
            }
        }
        Ok(props)
    }

    fn flush(&self) -> Result<(), StorageError> {
        self.client.del(&self.key)
    }

    fn is_persistent(&self) -> bool {
        self.client.is_persistent()
    }

    fn is_concurrency_safe(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subject::property::PropertyValue;
    use serde_json::json;

    fn backend() -> (Arc<MemoryKeyValueClient>, KeyValueBackend) {
        let client = Arc::new(MemoryKeyValueClient::new());
        let backend = KeyValueBackend::new(
            client.clone(),
            KeyValueConfig {
                key_prefix: "test:".to_string(),
            },
        );
        (client, backend)
    }

    #[test]
    fn key_layout() {
        let (client, backend) = backend();
        let storage = backend.storage("device-1");
        assert_eq!(storage.key(), "s:test:device-1");
        storage.set(&Property::new("temp", 21), &Value::Null).unwrap();
        storage.set(&Property::ext("zone", "north"), &Value::Null).unwrap();
        let mut fields = client.hgetall("s:test:device-1").unwrap();
        fields.sort();
        assert_eq!(
            fields,
            vec![
                ("ezone".to_string(), "\"north\"".to_string()),
                ("ptemp".to_string(), "21".to_string()),
            ]
        );
    }

    #[test]
    fn plain_set_reports_old_value() {
        let (_, backend) = backend();
        let storage = backend.storage("s");
        assert_eq!(
            storage.set(&Property::new("a", 1), &json!("dflt")).unwrap(),
            (json!(1), json!("dflt"))
        );
        assert_eq!(
            storage.set(&Property::new("a", 2), &Value::Null).unwrap(),
            (json!(2), json!(1))
        );
    }

    #[test]
    fn watched_set_retries_after_conflict() {
        let (client, backend) = backend();
        let storage = backend.storage("s");
        storage.set(&Property::new("n", 5), &Value::Null).unwrap();
        client.inject_conflicts(3);
        let before = client.exec_attempts();
        let incr = PropertyValue::update(|old| json!(old.as_i64().unwrap_or(0) + 1));
        let (new, old) = storage.set(&Property::new("n", incr), &json!(0)).unwrap();
        assert_eq!((new, old), (json!(6), json!(5)));
        assert_eq!(client.exec_attempts() - before, 4);
    }

    #[test]
    fn load_get_ext_and_flush() {
        let (_, backend) = backend();
        let storage = backend.storage("s");
        storage
            .store(
                &[StoredProperty::new(PropertyKey::default_ns("a"), json!({"x": 1}))],
                &[StoredProperty::new(PropertyKey::extended("b"), json!(true))],
                &[],
            )
            .unwrap();
        let (props, ext) = storage.load().unwrap();
        assert_eq!(props.get("a"), Some(&json!({"x": 1})));
        assert_eq!(ext.get("b"), Some(&json!(true)));
        assert_eq!(storage.get_ext_props().unwrap().len(), 1);

        storage.delete(&PropertyKey::default_ns("a")).unwrap();
        assert!(storage.get(&PropertyKey::default_ns("a")).unwrap_err().is_not_found());
        storage.flush().unwrap();
        assert!(storage.load().unwrap().1.is_empty());
    }

    #[test]
    fn capabilities() {
        let (_, backend) = backend();
        let storage = backend.storage("s");
        assert!(storage.is_concurrency_safe());
        assert!(!storage.is_persistent());
    }
}

//! Document-store storage backend.
//!
//! Each subject is one document identified by its `name` field; each property
//! is a top-level field named by the namespace tag followed by the property
//! name. Fields starting with `_` are internal bookkeeping and never surface
//! as properties.
//!
//! Atomic updates run inside a multi-document transaction that:
//!
//! 1. reads the last operation counter for (subject, field) from a capped
//!    operation log carrying a unique index on (subject, property, counter);
//! 2. locks the subject document by writing `_lock`;
//! 3. computes the new value from the locked document;
//! 4. inserts the next counter into the log, where a duplicate key means a
//!    concurrent writer got there first;
//! 5. writes the field and commits.
//!
//! Conflicts retry the whole transaction. A commit whose outcome is unknown
//! is committed again; other errors propagate.

mod memory;

pub use memory::MemoryDocumentStore;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, error, warn};

use crate::storage::traits::{StorageError, StorageResolver, SubjectStorage};
use crate::subject::property::{Property, PropertyKey, PropertyKind, StoredProperty};
use crate::value::{Payload, PropertyMap};

/// A stored document.
pub type Document = Map<String, Value>;

/// Field identifying a subject's document.
pub const NAME_FIELD: &str = "name";

/// Field written to lock a document inside a transaction.
pub const LOCK_FIELD: &str = "_lock";

/// Client for the subjects collection of a document database.
pub trait DocumentClient: Send + Sync {
    /// Document whose `name` is `name`.
    fn find_one(&self, name: &str) -> Result<Option<Document>, StorageError>;

    /// Set and unset fields of one document, creating it when `upsert`.
    fn update_one(
        &self,
        name: &str,
        set: &Document,
        unset: &[String],
        upsert: bool,
    ) -> Result<(), StorageError>;

    /// Remove one document.
    fn delete_one(&self, name: &str) -> Result<(), StorageError>;

    /// Create the capped operation log if it does not exist yet.
    fn ensure_ops_log(&self, capacity: usize) -> Result<(), StorageError>;

    /// Start a multi-document transaction.
    fn begin(&self) -> Result<Box<dyn DocumentTransaction + '_>, StorageError>;

    /// Whether the database keeps data across restarts.
    fn is_persistent(&self) -> bool {
        true
    }
}

/// One open transaction. Writes become visible on commit.
pub trait DocumentTransaction {
    /// Highest counter logged for (subject, property), or 0.
    fn last_op_counter(&mut self, subject: &str, property: &str) -> Result<u64, StorageError>;

    /// Lock the document for update and return its current content.
    fn lock_for_update(&mut self, name: &str) -> Result<Option<Document>, StorageError>;

    /// Log an operation.
    ///
    /// # Errors
    /// - `DuplicateKey`: if the counter is already logged for (subject, property)
    fn insert_op(&mut self, subject: &str, property: &str, counter: u64) -> Result<(), StorageError>;

    /// Set one field of a document, creating the document if needed.
    fn set_field(&mut self, name: &str, field: &str, value: Value) -> Result<(), StorageError>;

    /// Commit.
    ///
    /// # Errors
    /// - `UnknownCommitResult`: the outcome is unknown; committing again is safe
    /// - `WriteConflict` / `DuplicateKey`: a concurrent transaction won
    fn commit(&mut self) -> Result<(), StorageError>;

    /// Discard the transaction's writes.
    fn abort(&mut self);
}

/// Document backend settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DocumentConfig {
    /// Detect conflicts through the operation log in addition to the
    /// document lock.
    pub use_atomic_ops: bool,
    /// Maximum number of entries kept in the capped operation log.
    pub ops_log_capacity: usize,
}

impl Default for DocumentConfig {
    fn default() -> Self {
        Self {
            use_atomic_ops: true,
            ops_log_capacity: 1000,
        }
    }
}

/// Resolver building [`DocumentStorage`] handles over one shared client.
#[derive(Clone)]
pub struct DocumentBackend {
    client: Arc<dyn DocumentClient>,
    config: DocumentConfig,
}

impl DocumentBackend {
    /// Backend over `client`; creates the operation log when enabled.
    pub fn new(client: Arc<dyn DocumentClient>, config: DocumentConfig) -> Result<Self, StorageError> {
        if config.use_atomic_ops {
            client.ensure_ops_log(config.ops_log_capacity.max(1))?;
        }
        Ok(Self { client, config })
    }

    /// Storage handle for one subject.
    #[must_use]
    pub fn storage(&self, subject: &str) -> DocumentStorage {
        DocumentStorage {
            subject: subject.to_string(),
            client: Arc::clone(&self.client),
            use_atomic_ops: self.config.use_atomic_ops,
        }
    }
}

impl std::fmt::Debug for DocumentBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentBackend")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl StorageResolver for DocumentBackend {
    fn resolve(
        &self,
        subject: &str,
        _event_data: Option<&Payload>,
    ) -> Result<Box<dyn SubjectStorage>, StorageError> {
        Ok(Box::new(self.storage(subject)))
    }
}

/// Storage for one subject document.
pub struct DocumentStorage {
    subject: String,
    client: Arc<dyn DocumentClient>,
    use_atomic_ops: bool,
}

fn is_internal_field(field: &str) -> bool {
    field.starts_with('_') || field == NAME_FIELD
}

fn commit_with_retry(txn: &mut dyn DocumentTransaction) -> Result<(), StorageError> {
    loop {
        match txn.commit() {
            Ok(()) => return Ok(()),
            Err(StorageError::UnknownCommitResult(msg)) => {
                warn!(reason = %msg, "unknown transaction commit result, retrying commit");
            }
            Err(e) => {
                if !e.is_conflict() {
                    error!(error = %e, "transaction commit failed");
                }
                return Err(e);
            }
        }
    }
}

impl DocumentStorage {
    fn set_in_transaction(
        &self,
        txn: &mut dyn DocumentTransaction,
        property: &Property,
        field: &str,
        old_default: &Value,
    ) -> Result<(Value, Value), StorageError> {
        let last_counter = if self.use_atomic_ops {
            txn.last_op_counter(&self.subject, field)?
        } else {
            0
        };

        let current = txn.lock_for_update(&self.subject)?;
        let old = current
            .and_then(|mut doc| doc.remove(field))
            .unwrap_or_else(|| old_default.clone());
        let new = property.value.compute(&old)?;

        if self.use_atomic_ops {
            if let Err(e) = txn.insert_op(&self.subject, field, last_counter + 1) {
                if matches!(e, StorageError::DuplicateKey(_)) {
                    warn!(subject = %self.subject, field, "conflict during atomic operation");
                }
                return Err(e);
            }
        }

        txn.set_field(&self.subject, field, new.clone())?;
        commit_with_retry(txn)?;
        Ok((new, old))
    }
}

impl SubjectStorage for DocumentStorage {
    fn load(&self) -> Result<(PropertyMap, PropertyMap), StorageError> {
        let mut props = PropertyMap::new();
        let mut ext_props = PropertyMap::new();
        for (field, value) in self.client.find_one(&self.subject)?.unwrap_or_default() {
            if is_internal_field(&field) {
                continue;
            }
            match PropertyKey::decode(&field) {
                Some(PropertyKey {
                    kind: PropertyKind::Default,
                    name,
                }) => {
                    props.insert(name, value);
                }
                Some(PropertyKey {
                    kind: PropertyKind::Extended,
                    name,
                }) => {
                    ext_props.insert(name, value);
                }
                None => debug!(subject = %self.subject, field, "skipping untagged field"),
            }
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
        let set: Document = inserts
            .iter()
            .chain(updates)
            .map(|p| (p.key.encoded(), p.value.clone()))
            .collect();
        let unset: Vec<String> = deletes.iter().map(PropertyKey::encoded).collect();
        self.client.update_one(&self.subject, &set, &unset, true)
    }

    fn set(&self, property: &Property, old_default: &Value) -> Result<(Value, Value), StorageError> {
        let field = property.key.encoded();
        let mut attempt: u64 = 0;
        loop {
            attempt += 1;
            let mut txn = self.client.begin()?;
            match self.set_in_transaction(txn.as_mut(), property, &field, old_default) {
                Ok(values) => return Ok(values),
                Err(e) if e.is_conflict() => {
                    txn.abort();
                    debug!(subject = %self.subject, field, attempt, error = %e, "retrying transaction");
                }
                Err(e) => {
                    txn.abort();
                    return Err(e);
                }
            }
        }
    }

    fn get(&self, key: &PropertyKey) -> Result<Value, StorageError> {
        self.client
            .find_one(&self.subject)?
            .and_then(|mut doc| doc.remove(&key.encoded()))
            .ok_or_else(|| StorageError::PropertyNotFound(key.clone()))
    }

    fn delete(&self, key: &PropertyKey) -> Result<(), StorageError> {
        self.client
            .update_one(&self.subject, &Document::new(), &[key.encoded()], false)
    }

    fn get_ext_props(&self) -> Result<PropertyMap, StorageError> {
        let (_, ext_props) = self.load()?;
        Ok(ext_props)
    }

    fn flush(&self) -> Result<(), StorageError> {
        self.client.delete_one(&self.subject)
    }

    fn is_persistent(&self) -> bool {
        self.client.is_persistent()
    }

    fn is_concurrency_safe(&self) -> bool {
        true
    }
}

//! Abstract storage traits for subject state.
//!
//! A backend adapts an external store to the operations a [`Subject`] needs:
//! full loads, batched write-back of the cache, and an atomic single-property
//! read-modify-write. Backends hold no subject state of their own beyond the
//! subject name they were resolved for.
//!
//! [`Subject`]: crate::subject::Subject

use serde_json::Value;
use thiserror::Error;

use crate::subject::property::{Property, PropertyKey, StoredProperty};
use crate::value::{Payload, PropertyMap};

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The property does not exist for this subject.
    #[error("Property not found: {0}")]
    PropertyNotFound(PropertyKey),

    /// Key already exists.
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    /// A concurrent writer won; the operation may be retried.
    #[error("Write conflict: {0}")]
    WriteConflict(String),

    /// The store could not confirm whether a commit was applied.
    #[error("Unknown commit result: {0}")]
    UnknownCommitResult(String),

    /// The remote API answered with a non-success status.
    #[error("HTTP {status}: {body}")]
    Http {
        /// Response status code.
        status: u16,
        /// Response body text.
        body: String,
    },

    /// A subject name could not be mapped to a resource path.
    #[error("Invalid resource path: {0}")]
    InvalidResourcePath(String),

    /// A value could not be used for the requested operation.
    #[error("Invalid value: {0}")]
    InvalidValue(String),

    /// Serialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Backend error.
    #[error("Storage backend error: {0}")]
    BackendError(String),

    /// Connection failed.
    #[error("Connection error: {0}")]
    ConnectionError(String),
}

impl StorageError {
    /// Returns true if this is the missing-property signal.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::PropertyNotFound(_))
    }

    /// Returns true if this error signals a lost optimistic-concurrency race.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        match self {
            Self::WriteConflict(_) | Self::DuplicateKey(_) => true,
            Self::Http { status, .. } => *status == 409,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}

/// Storage backend for the properties of one subject.
///
/// # Concurrency
/// [`SubjectStorage::set`] must behave as if it held an exclusive lock on the
/// property for the whole read-modify-write: two concurrent callers never both
/// observe the same old value. Every other operation is best effort.
pub trait SubjectStorage: Send + Sync {
    /// Read every property. A missing subject yields two empty maps.
    ///
    /// Returns `(default, extended)`.
    fn load(&self) -> Result<(PropertyMap, PropertyMap), StorageError>;

    /// Apply a batch of cached changes. Not atomic across keys; a no-op when
    /// all three slices are empty.
    fn store(
        &self,
        inserts: &[StoredProperty],
        updates: &[StoredProperty],
        deletes: &[PropertyKey],
    ) -> Result<(), StorageError>;

    /// Atomically write one property, computing the value from the current one
    /// when it is a function. `old_default` stands in for a missing value.
    ///
    /// Returns `(new, old)`.
    fn set(&self, property: &Property, old_default: &Value) -> Result<(Value, Value), StorageError>;

    /// Read one property.
    ///
    /// # Errors
    /// - `PropertyNotFound`: if the property does not exist
    fn get(&self, key: &PropertyKey) -> Result<Value, StorageError>;

    /// Remove one property. Removing a missing property succeeds.
    fn delete(&self, key: &PropertyKey) -> Result<(), StorageError>;

    /// Extended properties only.
    fn get_ext_props(&self) -> Result<PropertyMap, StorageError>;

    /// Remove every property of the subject.
    fn flush(&self) -> Result<(), StorageError>;

    /// Whether state survives the process.
    fn is_persistent(&self) -> bool;

    /// Whether `set` is safe against concurrent writers in other processes.
    fn is_concurrency_safe(&self) -> bool;
}

/// Picks the storage backend for a subject.
///
/// `event_data` is the inbound event's data when a subject is built while
/// handling an event; resolvers may use it to avoid a round trip.
pub trait StorageResolver: Send + Sync {
    /// Build a backend handle for `subject`.
    fn resolve(
        &self,
        subject: &str,
        event_data: Option<&Payload>,
    ) -> Result<Box<dyn SubjectStorage>, StorageError>;
}

impl<F> StorageResolver for F
where
    F: Fn(&str, Option<&Payload>) -> Result<Box<dyn SubjectStorage>, StorageError> + Send + Sync,
{
    fn resolve(
        &self,
        subject: &str,
        event_data: Option<&Payload>,
    ) -> Result<Box<dyn SubjectStorage>, StorageError> {
        self(subject, event_data)
    }
}

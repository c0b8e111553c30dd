//! Storage backends for subject state.
//!
//! [`SubjectStorage`] is the contract every backend implements and
//! [`StorageResolver`] picks a backend per subject name. Reference backends:
//!
//! - [`memory`]: in-process, non-persistent
//! - [`kv`]: hash-per-subject key/value store with WATCH/EXEC retries
//! - [`document`]: document store with transactional conflict detection
//! - [`resource`]: REST resource annotations with conditional patches

pub mod document;
pub mod kv;
pub mod memory;
pub mod resource;
mod resolver;
mod traits;

pub use memory::{MemoryStorage, MemoryStore};
pub use resolver::PrefixResolver;
pub use traits::{StorageError, StorageResolver, SubjectStorage};

//! In-process document database with optimistic transactions.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde_json::Value;
use uuid::Uuid;

use crate::storage::document::{Document, DocumentClient, DocumentTransaction, LOCK_FIELD, NAME_FIELD};
use crate::storage::memory::lock_err;
use crate::storage::traits::StorageError;

#[derive(Debug, Clone, PartialEq, Eq)]
struct OpRecord {
    subject: String,
    property: String,
    counter: u64,
}

#[derive(Debug, Default)]
struct DocState {
    docs: HashMap<String, Document>,
    // Clock of the last write, for existing documents only.
    versions: HashMap<String, u64>,
    clock: u64,
    // Clock of the latest delete, reported as the version of any absent document.
    deleted_at: u64,
    ops: VecDeque<OpRecord>,
    ops_capacity: Option<usize>,
    pending_duplicate_ops: u32,
    pending_unknown_commits: u32,
}

impl DocState {
    fn version(&self, name: &str) -> u64 {
        self.versions.get(name).copied().unwrap_or(self.deleted_at)
    }

    fn touch(&mut self, name: &str) {
        self.clock += 1;
        if self.docs.contains_key(name) {
            self.versions.insert(name.to_string(), self.clock);
        } else {
            self.versions.remove(name);
            self.deleted_at = self.clock;
        }
    }

    fn op_exists(&self, op: &OpRecord) -> bool {
        self.ops.iter().any(|o| o == op)
    }

    fn push_op(&mut self, op: OpRecord) {
        self.ops.push_back(op);
        if let Some(cap) = self.ops_capacity {
            while self.ops.len() > cap {
                self.ops.pop_front();
            }
        }
    }

    fn upsert_field(&mut self, name: &str, field: &str, value: Value) {
        let doc = self.docs.entry(name.to_string()).or_insert_with(|| {
            let mut doc = Document::new();
            doc.insert(NAME_FIELD.to_string(), Value::String(name.to_string()));
            doc
        });
        doc.insert(field.to_string(), value);
    }
}

/// Thread-safe emulation of a document database with multi-document
/// transactions and a capped, uniquely indexed operation log.
///
/// Transactions are optimistic: every document locked inside a transaction
/// must be unchanged at commit, otherwise the commit fails with
/// `WriteConflict`. The log's unique index is checked on insert and again at
/// commit.
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    state: Mutex<DocState>,
    transactions_started: AtomicU64,
}

impl MemoryDocumentStore {
    /// Create an empty database.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` operation-log inserts fail with `DuplicateKey`.
    pub fn inject_duplicate_ops(&self, n: u32) {
        if let Ok(mut state) = self.state.lock() {
            state.pending_duplicate_ops += n;
        }
    }

    /// Make the next `n` commits report `UnknownCommitResult`. The first such
    /// commit of a transaction is still applied.
    pub fn inject_unknown_commit_results(&self, n: u32) {
        if let Ok(mut state) = self.state.lock() {
            state.pending_unknown_commits += n;
        }
    }

    /// Number of transactions begun so far.
    #[must_use]
    pub fn transactions_started(&self) -> u64 {
        self.transactions_started.load(Ordering::Relaxed)
    }

    /// Counters currently in the operation log for (subject, property), oldest first.
    #[must_use]
    pub fn ops_logged(&self, subject: &str, property: &str) -> Vec<u64> {
        self.state
            .lock()
            .map(|state| {
                state
                    .ops
                    .iter()
                    .filter(|o| o.subject == subject && o.property == property)
                    .map(|o| o.counter)
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl DocumentClient for MemoryDocumentStore {
    fn find_one(&self, name: &str) -> Result<Option<Document>, StorageError> {
        let state = self.state.lock().map_err(|_| lock_err("document.find_one"))?;
        Ok(state.docs.get(name).cloned())
    }

    fn update_one(
        &self,
        name: &str,
        set: &Document,
        unset: &[String],
        upsert: bool,
    ) -> Result<(), StorageError> {
        let mut state = self.state.lock().map_err(|_| lock_err("document.update_one"))?;
        if !upsert && !state.docs.contains_key(name) {
            return Ok(());
        }
        for (field, value) in set {
            state.upsert_field(name, field, value.clone());
        }
        if let Some(doc) = state.docs.get_mut(name) {
            for field in unset {
                doc.remove(field);
            }
        }
        state.touch(name);
        Ok(())
    }

    fn delete_one(&self, name: &str) -> Result<(), StorageError> {
        let mut state = self.state.lock().map_err(|_| lock_err("document.delete_one"))?;
        if state.docs.remove(name).is_some() {
            state.touch(name);
        }
        Ok(())
    }

    fn ensure_ops_log(&self, capacity: usize) -> Result<(), StorageError> {
        let mut state = self.state.lock().map_err(|_| lock_err("document.ensure_ops_log"))?;
        if state.ops_capacity.is_none() {
            state.ops_capacity = Some(capacity);
        }
        Ok(())
    }

    fn begin(&self) -> Result<Box<dyn DocumentTransaction + '_>, StorageError> {
        self.transactions_started.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(MemoryTransaction {
            store: self,
            locked: HashMap::new(),
            writes: Vec::new(),
            ops: Vec::new(),
            committed: false,
        }))
    }

    fn is_persistent(&self) -> bool {
        false
    }
}

struct MemoryTransaction<'a> {
    store: &'a MemoryDocumentStore,
    locked: HashMap<String, u64>,
    writes: Vec<(String, String, Value)>,
    ops: Vec<OpRecord>,
    committed: bool,
}

impl MemoryTransaction<'_> {
    fn state(&self, context: &'static str) -> Result<std::sync::MutexGuard<'_, DocState>, StorageError> {
        self.store.state.lock().map_err(|_| lock_err(context))
    }
}

impl DocumentTransaction for MemoryTransaction<'_> {
    fn last_op_counter(&mut self, subject: &str, property: &str) -> Result<u64, StorageError> {
        let state = self.state("document.txn.last_op_counter")?;
        Ok(state
            .ops
            .iter()
            .filter(|o| o.subject == subject && o.property == property)
            .map(|o| o.counter)
            .max()
            .unwrap_or(0))
    }

    fn lock_for_update(&mut self, name: &str) -> Result<Option<Document>, StorageError> {
        let (version, doc) = {
            let state = self.state("document.txn.lock_for_update")?;
            (state.version(name), state.docs.get(name).cloned())
        };
        self.locked.entry(name.to_string()).or_insert(version);
        if doc.is_some() {
            self.writes.push((
                name.to_string(),
                LOCK_FIELD.to_string(),
                Value::String(Uuid::new_v4().to_string()),
            ));
        }
        Ok(doc)
    }

    fn insert_op(&mut self, subject: &str, property: &str, counter: u64) -> Result<(), StorageError> {
        let op = OpRecord {
            subject: subject.to_string(),
            property: property.to_string(),
            counter,
        };
        let mut state = self.state("document.txn.insert_op")?;
        if state.pending_duplicate_ops > 0 {
            state.pending_duplicate_ops -= 1;
            return Err(StorageError::DuplicateKey(format!("{subject}/{property}/{counter}")));
        }
        if state.op_exists(&op) || self.ops.contains(&op) {
            return Err(StorageError::DuplicateKey(format!("{subject}/{property}/{counter}")));
        }
        drop(state);
        self.ops.push(op);
        Ok(())
    }

    fn set_field(&mut self, name: &str, field: &str, value: Value) -> Result<(), StorageError> {
        self.writes.push((name.to_string(), field.to_string(), value));
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StorageError> {
        let mut state = self.store.state.lock().map_err(|_| lock_err("document.txn.commit"))?;

        if !self.committed {
            for (name, seen) in &self.locked {
                if state.version(name) != *seen {
                    return Err(StorageError::WriteConflict(format!("document {name} changed")));
                }
            }
            for op in &self.ops {
                if state.op_exists(op) {
                    return Err(StorageError::DuplicateKey(format!(
                        "{}/{}/{}",
                        op.subject, op.property, op.counter
                    )));
                }
            }

            let mut touched: Vec<String> = Vec::new();
            for (name, field, value) in self.writes.drain(..) {
                state.upsert_field(&name, &field, value);
                if !touched.contains(&name) {
                    touched.push(name);
                }
            }
            for name in &touched {
                state.touch(name);
            }
            for op in self.ops.drain(..) {
                state.push_op(op);
            }
            self.committed = true;
        }

        if state.pending_unknown_commits > 0 {
            state.pending_unknown_commits -= 1;
            return Err(StorageError::UnknownCommitResult(
                "commit acknowledgement lost".to_string(),
            ));
        }
        Ok(())
    }

    fn abort(&mut self) {
        self.writes.clear();
        self.ops.clear();
        self.locked.clear();
    }
}

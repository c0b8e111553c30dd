//! In-process key/value server with WATCH/EXEC semantics.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::storage::kv::{ExecOutcome, HashOp, KeyValueClient, WatchToken};
use crate::storage::memory::lock_err;
use crate::storage::traits::StorageError;

#[derive(Debug, Default)]
struct KvState {
    hashes: HashMap<String, HashMap<String, String>>,
    // Clock of the last write, for live keys only.
    versions: HashMap<String, u64>,
    clock: u64,
    // Clock of the latest delete, reported as the version of any absent key.
    deleted_at: u64,
    pending_conflicts: u32,
}

impl KvState {
    fn version(&self, key: &str) -> u64 {
        self.versions.get(key).copied().unwrap_or(self.deleted_at)
    }

    /// Advance the clock past every token handed out so far, so a watch on
    /// `key` aborts whether the key was rewritten or removed.
    fn touch(&mut self, key: &str) {
        self.clock += 1;
        if self.hashes.contains_key(key) {
            self.versions.insert(key.to_string(), self.clock);
        } else {
            self.versions.remove(key);
            self.deleted_at = self.clock;
        }
    }
}

/// Thread-safe emulation of a hash-oriented key/value server.
///
/// Every modification of a key moves its version to a fresh tick of a
/// store-wide clock; a watched EXEC aborts when the version moved. Deleted
/// keys keep no version entry. [`MemoryKeyValueClient::inject_conflicts`] forces the
/// next watched EXECs to abort, simulating concurrent writers.
#[derive(Debug, Default)]
pub struct MemoryKeyValueClient {
    state: Mutex<KvState>,
    exec_attempts: AtomicU64,
}

impl MemoryKeyValueClient {
    /// Create an empty server.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` watched EXEC calls abort as if another client wrote.
    pub fn inject_conflicts(&self, n: u32) {
        if let Ok(mut state) = self.state.lock() {
            state.pending_conflicts += n;
        }
    }

    /// Number of EXEC calls received so far, aborted ones included.
    #[must_use]
    pub fn exec_attempts(&self) -> u64 {
        self.exec_attempts.load(Ordering::Relaxed)
    }
}

impl KeyValueClient for MemoryKeyValueClient {
    fn hgetall(&self, key: &str) -> Result<Vec<(String, String)>, StorageError> {
        let state = self.state.lock().map_err(|_| lock_err("kv.hgetall"))?;
        Ok(state
            .hashes
            .get(key)
            .map(|h| h.iter().map(|(f, v)| (f.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StorageError> {
        let state = self.state.lock().map_err(|_| lock_err("kv.hget"))?;
        Ok(state.hashes.get(key).and_then(|h| h.get(field)).cloned())
    }

    fn hscan(&self, key: &str, field_prefix: &str) -> Result<Vec<(String, String)>, StorageError> {
        let state = self.state.lock().map_err(|_| lock_err("kv.hscan"))?;
        Ok(state
            .hashes
            .get(key)
            .map(|h| {
                h.iter()
                    .filter(|(f, _)| f.starts_with(field_prefix))
                    .map(|(f, v)| (f.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    fn watch(&self, key: &str) -> Result<WatchToken, StorageError> {
        let state = self.state.lock().map_err(|_| lock_err("kv.watch"))?;
        Ok(WatchToken(state.version(key)))
    }

    fn exec(
        &self,
        key: &str,
        watch: Option<WatchToken>,
        ops: &[HashOp],
    ) -> Result<ExecOutcome, StorageError> {
        self.exec_attempts.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock().map_err(|_| lock_err("kv.exec"))?;

        if let Some(WatchToken(seen)) = watch {
            if state.pending_conflicts > 0 {
                state.pending_conflicts -= 1;
                state.touch(key);
                return Ok(ExecOutcome::Aborted);
            }
            if state.version(key) != seen {
                return Ok(ExecOutcome::Aborted);
            }
        }

        let mut replies = Vec::with_capacity(ops.len());
        let mut modified = false;
        for op in ops {
            match op {
                HashOp::Get { field } => {
                    replies.push(state.hashes.get(key).and_then(|h| h.get(field)).cloned());
                }
                HashOp::Set { field, value } => {
                    state
                        .hashes
                        .entry(key.to_string())
                        .or_default()
                        .insert(field.clone(), value.clone());
                    modified = true;
                    replies.push(None);
                }
                HashOp::Del { field } => {
                    if let Some(h) = state.hashes.get_mut(key) {
                        modified |= h.remove(field).is_some();
                        if h.is_empty() {
                            state.hashes.remove(key);
                        }
                    }
                    replies.push(None);
                }
            }
        }
        if modified {
            state.touch(key);
        }
        Ok(ExecOutcome::Committed(replies))
    }

    fn del(&self, key: &str) -> Result<(), StorageError> {
        let mut state = self.state.lock().map_err(|_| lock_err("kv.del"))?;
        if state.hashes.remove(key).is_some() {
            state.touch(key);
        }
        Ok(())
    }

    fn is_persistent(&self) -> bool {
        false
    }
}

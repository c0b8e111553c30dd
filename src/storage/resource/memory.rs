//! In-process resource API server.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde_json::Value;

use crate::storage::memory::lock_err;
use crate::storage::resource::ResourceApi;
use crate::storage::traits::StorageError;

/// Apply an RFC 7386 JSON merge patch in place.
pub(crate) fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(serde_json::Map::new());
    }
    if let Value::Object(target_map) = target {
        for (key, value) in patch_map {
            if value.is_null() {
                target_map.remove(key);
            } else {
                merge_patch(target_map.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

#[derive(Debug, Default)]
struct ApiState {
    objects: HashMap<String, Value>,
    next_version: u64,
    pending_conflicts: u32,
}

impl ApiState {
    fn stamp(&mut self, obj: &mut Value) {
        self.next_version += 1;
        if let Some(meta) = obj.get_mut("metadata").and_then(Value::as_object_mut) {
            meta.insert(
                "resourceVersion".to_string(),
                Value::String(self.next_version.to_string()),
            );
        }
    }
}

/// Thread-safe emulation of a resource API server.
///
/// Objects carry a `metadata.resourceVersion` bumped on every write. A patch
/// naming a different version is rejected with 409.
#[derive(Debug, Default)]
pub struct MemoryResourceApi {
    state: Mutex<ApiState>,
    get_calls: AtomicU64,
}

impl MemoryResourceApi {
    /// Create an empty server.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or replace an object.
    pub fn create(&self, path: &str, mut body: Value) {
        if let Ok(mut state) = self.state.lock() {
            if body.get("metadata").is_none() {
                merge_patch(&mut body, &serde_json::json!({"metadata": {}}));
            }
            state.stamp(&mut body);
            state.objects.insert(path.to_string(), body);
        }
    }

    /// Make the next `n` patches fail with 409 as if another client wrote first.
    pub fn inject_conflicts(&self, n: u32) {
        if let Ok(mut state) = self.state.lock() {
            state.pending_conflicts += n;
        }
    }

    /// Number of GET requests served, failed ones included.
    #[must_use]
    pub fn get_calls(&self) -> u64 {
        self.get_calls.load(Ordering::Relaxed)
    }
}

fn not_found(path: &str) -> StorageError {
    StorageError::Http {
        status: 404,
        body: format!("{path} not found"),
    }
}

impl ResourceApi for MemoryResourceApi {
    fn get(&self, path: &str) -> Result<Value, StorageError> {
        self.get_calls.fetch_add(1, Ordering::Relaxed);
        let state = self.state.lock().map_err(|_| lock_err("resource.get"))?;
        state.objects.get(path).cloned().ok_or_else(|| not_found(path))
    }

    fn patch(&self, path: &str, merge: &Value) -> Result<Value, StorageError> {
        let mut state = self.state.lock().map_err(|_| lock_err("resource.patch"))?;
        let Some(mut obj) = state.objects.get(path).cloned() else {
            return Err(not_found(path));
        };

        if state.pending_conflicts > 0 {
            state.pending_conflicts -= 1;
            state.stamp(&mut obj);
            state.objects.insert(path.to_string(), obj);
            return Err(StorageError::Http {
                status: 409,
                body: "the object has been modified".to_string(),
            });
        }

        let expected = merge.pointer("/metadata/resourceVersion").filter(|v| !v.is_null());
        if let Some(expected) = expected {
            if obj.pointer("/metadata/resourceVersion") != Some(expected) {
                return Err(StorageError::Http {
                    status: 409,
                    body: "the object has been modified".to_string(),
                });
            }
        }

        merge_patch(&mut obj, merge);
        state.stamp(&mut obj);
        state.objects.insert(path.to_string(), obj.clone());
        Ok(obj)
    }
}

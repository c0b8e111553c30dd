//! REST-resource storage backend.
//!
//! Properties of a resource subject live in two annotations on the resource
//! object, one per namespace, each holding a compact JSON object. Mutations
//! read the object (or reuse a held body), change the decoded maps and send a
//! merge patch conditioned on `metadata.resourceVersion`. A 409 Conflict drops
//! the held body and starts over; any other failure propagates.
//!
//! A held body serves exactly one read or the first mutation; every later read
//! goes back to the API.
//!
//! Identity metadata (group, version, namespace, type, name, subresource) is
//! derived from the subject's path and reported as extended properties. Reads
//! of identity keys never touch the API.

mod http;
mod memory;
mod path;

pub use http::{HttpResourceApi, HttpResourceApiConfig};
pub use memory::MemoryResourceApi;
pub use path::{ResourcePath, CORE_GROUP};

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::storage::memory::lock_err;
use crate::storage::traits::{StorageError, StorageResolver, SubjectStorage};
use crate::subject::property::{Property, PropertyKey, PropertyKind, StoredProperty};
use crate::value::{Payload, PropertyMap};

/// Content type of merge patches.
pub const MERGE_PATCH_CONTENT_TYPE: &str = "application/merge-patch+json";

/// Client for a REST resource API.
pub trait ResourceApi: Send + Sync {
    /// Read an object.
    ///
    /// # Errors
    /// - `Http`: non-success status (404 when missing)
    fn get(&self, path: &str) -> Result<Value, StorageError>;

    /// Apply a JSON merge patch and return the updated object.
    ///
    /// # Errors
    /// - `Http` with status 409: `metadata.resourceVersion` is stale
    fn patch(&self, path: &str, merge_patch: &Value) -> Result<Value, StorageError>;
}

/// Resource backend settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    /// Annotation holding default properties.
    pub props_annotation: String,
    /// Annotation holding extended properties.
    pub ext_props_annotation: String,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            props_annotation: "ruleflow.dev/props".to_string(),
            ext_props_annotation: "ruleflow.dev/ext-props".to_string(),
        }
    }
}

/// Resolver building [`ResourceStorage`] handles over one shared client.
#[derive(Clone)]
pub struct ResourceBackend {
    api: Arc<dyn ResourceApi>,
    config: Arc<ResourceConfig>,
}

impl ResourceBackend {
    /// Backend over `api`.
    pub fn new(api: Arc<dyn ResourceApi>, config: ResourceConfig) -> Self {
        Self {
            api,
            config: Arc::new(config),
        }
    }

    /// Storage handle for the resource at `path`.
    ///
    /// A body that looks like a resource object (it has `metadata`) is held and
    /// used instead of the first read.
    pub fn storage(&self, path: &str, body: Option<&Payload>) -> Result<ResourceStorage, StorageError> {
        let path = ResourcePath::parse(path)?;
        let held = body
            .filter(|b| b.get("metadata").is_some_and(Value::is_object))
            .map(|b| Value::Object(b.clone()));
        Ok(ResourceStorage {
            object_path: path.object_path(),
            path,
            api: Arc::clone(&self.api),
            config: Arc::clone(&self.config),
            held: Mutex::new(held),
        })
    }
}

impl std::fmt::Debug for ResourceBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceBackend")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl StorageResolver for ResourceBackend {
    fn resolve(
        &self,
        subject: &str,
        event_data: Option<&Payload>,
    ) -> Result<Box<dyn SubjectStorage>, StorageError> {
        Ok(Box::new(self.storage(subject, event_data)?))
    }
}

/// Storage for one resource object.
pub struct ResourceStorage {
    path: ResourcePath,
    object_path: String,
    api: Arc<dyn ResourceApi>,
    config: Arc<ResourceConfig>,
    held: Mutex<Option<Value>>,
}

fn decode_annotation(annotations: Option<&Map<String, Value>>, name: &str) -> Result<PropertyMap, StorageError> {
    match annotations.and_then(|a| a.get(name)) {
        None | Some(Value::Null) => Ok(PropertyMap::new()),
        Some(Value::String(text)) if text.is_empty() => Ok(PropertyMap::new()),
        Some(Value::String(text)) => match serde_json::from_str(text)? {
            Value::Object(map) => Ok(map),
            other => Err(StorageError::SerializationError(format!(
                "annotation {name} is not an object: {other}"
            ))),
        },
        Some(other) => Err(StorageError::SerializationError(format!(
            "annotation {name} is not a string: {other}"
        ))),
    }
}

fn encode_annotation(map: &PropertyMap) -> Result<Value, StorageError> {
    if map.is_empty() {
        return Ok(Value::Null);
    }
    Ok(Value::String(serde_json::to_string(map)?))
}

impl ResourceStorage {
    /// Parsed path of this subject.
    #[must_use]
    pub const fn path(&self) -> &ResourcePath {
        &self.path
    }

    fn decode(&self, body: &Value) -> Result<(PropertyMap, PropertyMap), StorageError> {
        let annotations = body
            .pointer("/metadata/annotations")
            .and_then(Value::as_object);
        Ok((
            decode_annotation(annotations, &self.config.props_annotation)?,
            decode_annotation(annotations, &self.config.ext_props_annotation)?,
        ))
    }

    fn read(&self) -> Result<Value, StorageError> {
        let held = self.held.lock().map_err(|_| lock_err("resource.read"))?.take();
        match held {
            Some(body) => Ok(body),
            None => self.api.get(&self.object_path),
        }
    }

    fn read_stored(&self) -> Result<(PropertyMap, PropertyMap), StorageError> {
        match self.read() {
            Ok(body) => self.decode(&body),
            Err(StorageError::Http { status: 404, .. }) => Ok((PropertyMap::new(), PropertyMap::new())),
            Err(e) => Err(e),
        }
    }

    fn mutate<R, F>(&self, mut change: F) -> Result<R, StorageError>
    where
        F: FnMut(&mut PropertyMap, &mut PropertyMap) -> Result<R, StorageError>,
    {
        let mut attempt: u64 = 0;
        loop {
            attempt += 1;
            let held = self.held.lock().map_err(|_| lock_err("resource.mutate"))?.take();
            let body = match held {
                Some(body) => body,
                None => self.api.get(&self.object_path)?,
            };

            let (mut props, mut ext_props) = self.decode(&body)?;
            let out = change(&mut props, &mut ext_props)?;

            let mut annotations = Map::new();
            annotations.insert(self.config.props_annotation.clone(), encode_annotation(&props)?);
            annotations.insert(self.config.ext_props_annotation.clone(), encode_annotation(&ext_props)?);
            let patch = json!({
                "metadata": {
                    "resourceVersion": body.pointer("/metadata/resourceVersion").cloned().unwrap_or(Value::Null),
                    "annotations": annotations,
                }
            });

            match self.api.patch(&self.object_path, &patch) {
                Ok(_) => return Ok(out),
                Err(StorageError::Http { status: 409, .. }) => {
                    debug!(path = %self.object_path, attempt, "resource version conflict, re-reading");
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn map_for<'m>(
        kind: PropertyKind,
        props: &'m mut PropertyMap,
        ext_props: &'m mut PropertyMap,
    ) -> &'m mut PropertyMap {
        match kind {
            PropertyKind::Default => props,
            PropertyKind::Extended => ext_props,
        }
    }
}

impl SubjectStorage for ResourceStorage {
    fn load(&self) -> Result<(PropertyMap, PropertyMap), StorageError> {
        let (props, mut ext_props) = self.read_stored()?;
        ext_props.extend(self.path.identity());
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
        self.mutate(|props, ext_props| {
            for prop in inserts.iter().chain(updates) {
                Self::map_for(prop.key.kind, props, ext_props)
                    .insert(prop.key.name.clone(), prop.value.clone());
            }
            for key in deletes {
                Self::map_for(key.kind, props, ext_props).remove(&key.name);
            }
            Ok(())
        })
    }

    fn set(&self, property: &Property, old_default: &Value) -> Result<(Value, Value), StorageError> {
        self.mutate(|props, ext_props| {
            let map = Self::map_for(property.key.kind, props, ext_props);
            let old = map
                .get(&property.key.name)
                .cloned()
                .unwrap_or_else(|| old_default.clone());
            let new = property.value.compute(&old)?;
            map.insert(property.key.name.clone(), new.clone());
            Ok((new, old))
        })
    }

    fn get(&self, key: &PropertyKey) -> Result<Value, StorageError> {
        if key.kind == PropertyKind::Extended {
            if let Some(value) = self.path.identity().remove(&key.name) {
                return Ok(value);
            }
        }
        let (props, ext_props) = self.read_stored()?;
        let map = match key.kind {
            PropertyKind::Default => props,
            PropertyKind::Extended => ext_props,
        };
        map.get(&key.name)
            .cloned()
            .ok_or_else(|| StorageError::PropertyNotFound(key.clone()))
    }

    fn delete(&self, key: &PropertyKey) -> Result<(), StorageError> {
        self.mutate(|props, ext_props| {
            Self::map_for(key.kind, props, ext_props).remove(&key.name);
            Ok(())
        })
    }

    /// Identity derived from the path. Stored extended properties are only
    /// visible through `load` and `get`.
    fn get_ext_props(&self) -> Result<PropertyMap, StorageError> {
        Ok(self.path.identity())
    }

    fn flush(&self) -> Result<(), StorageError> {
        self.mutate(|props, ext_props| {
            props.clear();
            ext_props.clear();
            Ok(())
        })
    }

    fn is_persistent(&self) -> bool {
        true
    }

    fn is_concurrency_safe(&self) -> bool {
        true
    }
}

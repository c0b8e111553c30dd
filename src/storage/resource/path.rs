//! Canonical resource paths.
//!
//! Subjects backed by the resource API are named by their REST path:
//!
//! - `/apis/{group}/{version}[/namespaces/{ns}]/{type}/{name}[/{subresource}]`
//! - `/api/{version}[/namespaces/{ns}]/{type}/{name}[/{subresource}]` (group `core`)

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::storage::traits::StorageError;
use crate::value::PropertyMap;

const PATH_PATTERN: &str =
    r"^/(?:api/(?P<core_version>[^/]+)|apis/(?P<group>[^/]+)/(?P<version>[^/]+))/(?P<rest>[^?#]+?)/?$";

static PATH_REGEX: OnceLock<Option<Regex>> = OnceLock::new();

fn path_regex() -> Result<&'static Regex, StorageError> {
    PATH_REGEX
        .get_or_init(|| Regex::new(PATH_PATTERN).ok())
        .as_ref()
        .ok_or_else(|| StorageError::BackendError("resource path pattern failed to compile".to_string()))
}

/// Group reported for resources under `/api`.
pub const CORE_GROUP: &str = "core";

/// A parsed resource path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourcePath {
    /// API group (`core` for `/api/...`).
    pub group: String,
    /// API version.
    pub version: String,
    /// Namespace, for namespaced resources.
    pub namespace: Option<String>,
    /// Plural resource type, e.g. `pods`.
    pub resource_type: String,
    /// Object name.
    pub name: String,
    /// Subresource such as `status`.
    pub subresource: Option<String>,
    core: bool,
}

impl ResourcePath {
    /// Parse a path.
    ///
    /// # Errors
    /// - `InvalidResourcePath`: if the path does not address a single object
    pub fn parse(path: &str) -> Result<Self, StorageError> {
        let invalid = || StorageError::InvalidResourcePath(path.to_string());
        let caps = path_regex()?.captures(path).ok_or_else(invalid)?;

        let (group, version, core) = match caps.name("core_version") {
            Some(v) => (CORE_GROUP.to_string(), v.as_str().to_string(), true),
            None => (
                caps.name("group").ok_or_else(invalid)?.as_str().to_string(),
                caps.name("version").ok_or_else(invalid)?.as_str().to_string(),
                false,
            ),
        };

        let rest: Vec<&str> = caps.name("rest").ok_or_else(invalid)?.as_str().split('/').collect();
        if rest.iter().any(|s| s.is_empty()) {
            return Err(invalid());
        }

        let (namespace, tail) = if rest.len() >= 4 && rest[0] == "namespaces" {
            (Some(rest[1].to_string()), &rest[2..])
        } else {
            (None, &rest[..])
        };

        let (resource_type, name, subresource) = match tail {
            [t, n] => (*t, *n, None),
            [t, n, s] => (*t, *n, Some((*s).to_string())),
            _ => return Err(invalid()),
        };

        Ok(Self {
            group,
            version,
            namespace,
            resource_type: resource_type.to_string(),
            name: name.to_string(),
            subresource,
            core,
        })
    }

    /// Path of the object itself, without the subresource.
    #[must_use]
    pub fn object_path(&self) -> String {
        let mut out = if self.core {
            format!("/api/{}", self.version)
        } else {
            format!("/apis/{}/{}", self.group, self.version)
        };
        if let Some(ns) = &self.namespace {
            out.push_str("/namespaces/");
            out.push_str(ns);
        }
        out.push('/');
        out.push_str(&self.resource_type);
        out.push('/');
        out.push_str(&self.name);
        out
    }

    /// Identity metadata exposed as extended properties.
    #[must_use]
    pub fn identity(&self) -> PropertyMap {
        let mut map = PropertyMap::new();
        map.insert("group".into(), Value::String(self.group.clone()));
        map.insert("apiversion".into(), Value::String(self.version.clone()));
        if let Some(ns) = &self.namespace {
            map.insert("namespace".into(), Value::String(ns.clone()));
        }
        map.insert("resourcetype".into(), Value::String(self.resource_type.clone()));
        map.insert("name".into(), Value::String(self.name.clone()));
        if let Some(sub) = &self.subresource {
            map.insert("subresource".into(), Value::String(sub.clone()));
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ident(path: &str) -> Value {
        Value::Object(ResourcePath::parse(path).unwrap().identity())
    }

    #[test]
    fn namespaced_group_resource() {
        assert_eq!(
            ident("/apis/apps/v1beta2/namespaces/my-namespace/deployments/my-deployment/status"),
            json!({
                "group": "apps",
                "apiversion": "v1beta2",
                "namespace": "my-namespace",
                "resourcetype": "deployments",
                "name": "my-deployment",
                "subresource": "status",
            })
        );
    }

    #[test]
    fn cluster_scoped_group_resource() {
        assert_eq!(
            ident("/apis/admissionregistration.k8s.io/v1/mutatingwebhookconfigurations/my-webhook"),
            json!({
                "group": "admissionregistration.k8s.io",
                "apiversion": "v1",
                "resourcetype": "mutatingwebhookconfigurations",
                "name": "my-webhook",
            })
        );
    }

    #[test]
    fn core_resources() {
        assert_eq!(
            ident("/api/v1/namespaces/my-namespace/pods/my-pod"),
            json!({
                "group": "core",
                "apiversion": "v1",
                "namespace": "my-namespace",
                "resourcetype": "pods",
                "name": "my-pod",
            })
        );
        assert_eq!(
            ident("/api/v1/nodes/my-node-1234/status"),
            json!({
                "group": "core",
                "apiversion": "v1",
                "resourcetype": "nodes",
                "name": "my-node-1234",
                "subresource": "status",
            })
        );
    }

    #[test]
    fn namespace_objects_are_cluster_scoped() {
        assert_eq!(
            ident("/api/v1/namespaces/my-namespace"),
            json!({
                "group": "core",
                "apiversion": "v1",
                "resourcetype": "namespaces",
                "name": "my-namespace",
            })
        );
        assert_eq!(
            ident("/api/v1/namespaces/my-namespace/status")["subresource"],
            json!("status")
        );
    }

    #[test]
    fn object_path_drops_subresource() {
        let p = ResourcePath::parse("/api/v1/namespaces/ns/pods/web/status").unwrap();
        assert_eq!(p.object_path(), "/api/v1/namespaces/ns/pods/web");
        let p = ResourcePath::parse("/apis/example.dev/v1/widgets/w1").unwrap();
        assert_eq!(p.object_path(), "/apis/example.dev/v1/widgets/w1");
    }

    #[test]
    fn rejects_non_object_paths() {
        for bad in ["pods/web", "/api/v1", "/api/v1/pods", "/apis/apps/v1/a/b/c/d/e/f", "/api/v1//x"] {
            assert!(
                matches!(ResourcePath::parse(bad), Err(StorageError::InvalidResourcePath(_))),
                "{bad}"
            );
        }
    }
}

//! Resolvers that pick a backend per subject name.

use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::storage::traits::{StorageError, StorageResolver, SubjectStorage};
use crate::value::Payload;

struct PrefixRoute {
    prefix: String,
    strip: bool,
    resolver: Arc<dyn StorageResolver>,
}

/// Routes subjects to backends by name prefix.
///
/// Routes are tried in insertion order; the first matching prefix wins.
/// Unmatched names go to the fallback.
///
/// ```
/// use ruleflow::storage::{MemoryStore, PrefixResolver, StorageResolver};
///
/// let cluster = MemoryStore::new();
/// let resolver = PrefixResolver::new(MemoryStore::new())
///     .route_stripped("k8s:", cluster.clone());
/// resolver.resolve("k8s:/api/v1/namespaces/default/pods/web", None).unwrap();
/// assert_eq!(cluster.subjects().unwrap().len(), 0);
/// ```
pub struct PrefixResolver {
    routes: Vec<PrefixRoute>,
    fallback: Arc<dyn StorageResolver>,
}

impl PrefixResolver {
    /// Resolver sending every subject to `fallback` until routes are added.
    pub fn new(fallback: impl StorageResolver + 'static) -> Self {
        Self {
            routes: Vec::new(),
            fallback: Arc::new(fallback),
        }
    }

    /// Send names starting with `prefix` to `resolver`, unchanged.
    #[must_use]
    pub fn route(mut self, prefix: impl Into<String>, resolver: impl StorageResolver + 'static) -> Self {
        self.routes.push(PrefixRoute {
            prefix: prefix.into(),
            strip: false,
            resolver: Arc::new(resolver),
        });
        self
    }

    /// Send names starting with `prefix` to `resolver` with the prefix removed.
    #[must_use]
    pub fn route_stripped(
        mut self,
        prefix: impl Into<String>,
        resolver: impl StorageResolver + 'static,
    ) -> Self {
        self.routes.push(PrefixRoute {
            prefix: prefix.into(),
            strip: true,
            resolver: Arc::new(resolver),
        });
        self
    }
}

impl StorageResolver for PrefixResolver {
    fn resolve(
        &self,
        subject: &str,
        event_data: Option<&Payload>,
    ) -> Result<Box<dyn SubjectStorage>, StorageError> {
        for route in &self.routes {
            if let Some(rest) = subject.strip_prefix(route.prefix.as_str()) {
                debug!(subject, prefix = %route.prefix, "resolved storage by prefix");
                let name = if route.strip { rest } else { subject };
                return route.resolver.resolve(name, event_data);
            }
        }
        self.fallback.resolve(subject, event_data)
    }
}

impl fmt::Debug for PrefixResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefixes: Vec<&str> = self.routes.iter().map(|r| r.prefix.as_str()).collect();
        f.debug_struct("PrefixResolver")
            .field("prefixes", &prefixes)
            .finish_non_exhaustive()
    }
}

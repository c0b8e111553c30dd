//! Subject property types.
//!
//! A property is a named value living in one of two namespaces of a subject:
//! the default (reactive) namespace or the extended (always muted) one. Storage
//! backends key properties by a one-character namespace tag followed by the
//! property name, so `p` + `temp` and `e` + `temp` never collide.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::storage::StorageError;

/// Namespace a property belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyKind {
    /// Reactive properties: changing them routes change events unless muted.
    Default,
    /// Routing/classification metadata: writes never route events.
    Extended,
}

impl PropertyKind {
    /// Storage tag for this namespace.
    #[must_use]
    pub const fn tag(self) -> char {
        match self {
            Self::Default => 'p',
            Self::Extended => 'e',
        }
    }

    /// Parse a storage tag.
    #[must_use]
    pub const fn from_tag(tag: char) -> Option<Self> {
        match tag {
            'p' => Some(Self::Default),
            'e' => Some(Self::Extended),
            _ => None,
        }
    }
}

impl fmt::Display for PropertyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => f.write_str("default"),
            Self::Extended => f.write_str("extended"),
        }
    }
}

/// Identifies a property within a subject: namespace plus name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PropertyKey {
    /// Namespace.
    pub kind: PropertyKind,
    /// Property name, unique within the namespace.
    pub name: String,
}

impl PropertyKey {
    /// Key for a property in the given namespace.
    #[must_use]
    pub fn new(kind: PropertyKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }

    /// Key for a default (reactive) property.
    #[must_use]
    pub fn default_ns(name: impl Into<String>) -> Self {
        Self::new(PropertyKind::Default, name)
    }

    /// Key for an extended property.
    #[must_use]
    pub fn extended(name: impl Into<String>) -> Self {
        Self::new(PropertyKind::Extended, name)
    }

    /// Encoded storage field: namespace tag followed by the name.
    #[must_use]
    pub fn encoded(&self) -> String {
        let mut out = String::with_capacity(self.name.len() + 1);
        out.push(self.kind.tag());
        out.push_str(&self.name);
        out
    }

    /// Decode a storage field produced by [`PropertyKey::encoded`].
    #[must_use]
    pub fn decode(field: &str) -> Option<Self> {
        let mut chars = field.chars();
        let kind = PropertyKind::from_tag(chars.next()?)?;
        Some(Self::new(kind, chars.as_str()))
    }
}

impl fmt::Display for PropertyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.name)
    }
}

/// Function computing a new value from the current one.
///
/// Backends may call it more than once when they retry a conflicting
/// read-modify-write, so it must be pure.
pub type UpdateFn = dyn Fn(&Value) -> Result<Value, StorageError> + Send + Sync;

/// Function producing a value without looking at the current one.
pub type ThunkFn = dyn Fn() -> Value + Send + Sync;

/// Value written to a property.
#[derive(Clone)]
pub enum PropertyValue {
    /// A plain JSON value.
    Value(Value),
    /// Computed without parameters at write time.
    Thunk(Arc<ThunkFn>),
    /// Computed from the current value (or the caller's default when absent).
    Update(Arc<UpdateFn>),
}

impl PropertyValue {
    /// Value computed from the current one.
    ///
    /// ```
    /// use ruleflow::PropertyValue;
    /// use serde_json::json;
    ///
    /// let incr = PropertyValue::update(|old| json!(old.as_i64().unwrap_or(0) + 1));
    /// assert_eq!(incr.compute(&json!(1)).unwrap(), json!(2));
    /// ```
    pub fn update<F>(f: F) -> Self
    where
        F: Fn(&Value) -> Value + Send + Sync + 'static,
    {
        Self::Update(Arc::new(move |old| Ok(f(old))))
    }

    /// Fallible variant of [`PropertyValue::update`].
    pub fn try_update<F>(f: F) -> Self
    where
        F: Fn(&Value) -> Result<Value, StorageError> + Send + Sync + 'static,
    {
        Self::Update(Arc::new(f))
    }

    /// Value computed without parameters.
    pub fn thunk<F>(f: F) -> Self
    where
        F: Fn() -> Value + Send + Sync + 'static,
    {
        Self::Thunk(Arc::new(f))
    }

    /// Resolve the value to write given the current value.
    pub fn compute(&self, old: &Value) -> Result<Value, StorageError> {
        match self {
            Self::Value(v) => Ok(v.clone()),
            Self::Thunk(f) => Ok(f()),
            Self::Update(f) => f(old),
        }
    }

    /// Whether the value depends on a function call.
    #[must_use]
    pub const fn is_computed(&self) -> bool {
        !matches!(self, Self::Value(_))
    }
}

impl fmt::Debug for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(v) => f.debug_tuple("Value").field(v).finish(),
            Self::Thunk(_) => f.write_str("Thunk(..)"),
            Self::Update(_) => f.write_str("Update(..)"),
        }
    }
}

impl From<Value> for PropertyValue {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

macro_rules! property_value_from {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for PropertyValue {
                fn from(value: $ty) -> Self {
                    Self::Value(Value::from(value))
                }
            }
        )*
    };
}

property_value_from!(bool, i32, i64, u32, u64, f64, &str, String);

/// A property together with the value to write.
#[derive(Debug, Clone)]
pub struct Property {
    /// Namespace and name.
    pub key: PropertyKey,
    /// Value (or value function) to write.
    pub value: PropertyValue,
}

impl Property {
    /// Default-namespace property.
    pub fn new(name: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        Self {
            key: PropertyKey::default_ns(name),
            value: value.into(),
        }
    }

    /// Extended-namespace property.
    pub fn ext(name: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        Self {
            key: PropertyKey::extended(name),
            value: value.into(),
        }
    }
}

/// A resolved property value as written by a batched store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredProperty {
    /// Namespace and name.
    pub key: PropertyKey,
    /// Resolved JSON value.
    pub value: Value,
}

impl StoredProperty {
    /// Construct from parts.
    #[must_use]
    pub fn new(key: PropertyKey, value: Value) -> Self {
        Self { key, value }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_encoding_round_trips() {
        let key = PropertyKey::extended("group");
        assert_eq!(key.encoded(), "egroup");
        assert_eq!(PropertyKey::decode("egroup"), Some(key));
        assert_eq!(PropertyKey::decode("ptemp"), Some(PropertyKey::default_ns("temp")));
        assert_eq!(PropertyKey::decode("xtemp"), None);
        assert_eq!(PropertyKey::decode(""), None);
    }

    #[test]
    fn namespaces_do_not_collide() {
        assert_ne!(
            PropertyKey::default_ns("a").encoded(),
            PropertyKey::extended("a").encoded()
        );
    }

    #[test]
    fn plain_and_computed_values() {
        let plain = PropertyValue::from(3);
        assert!(!plain.is_computed());
        assert_eq!(plain.compute(&json!(100)).unwrap(), json!(3));

        let thunk = PropertyValue::thunk(|| json!("fixed"));
        assert!(thunk.is_computed());
        assert_eq!(thunk.compute(&json!(1)).unwrap(), json!("fixed"));

        let update = PropertyValue::update(|old| json!(format!("{}!", old.as_str().unwrap_or(""))));
        assert_eq!(update.compute(&json!("hi")).unwrap(), json!("hi!"));
    }

    #[test]
    fn failing_update_surfaces_error() {
        let v = PropertyValue::try_update(|_| Err(StorageError::InvalidValue("nope".to_string())));
        assert!(matches!(v.compute(&Value::Null), Err(StorageError::InvalidValue(_))));
    }
}

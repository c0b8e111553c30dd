//! Structural payload diffs.
//!
//! Produces JSON-Patch style operations (`add`, `remove`, `replace`) turning one
//! payload into another. Objects are compared key by key; arrays are compared
//! element-wise when their lengths match and replaced whole otherwise.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::value::Payload;

/// One patch operation. `path` is a JSON pointer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PatchOp {
    /// A new member.
    Add {
        /// Pointer to the member.
        path: String,
        /// Added value.
        value: Value,
    },
    /// A removed member.
    Remove {
        /// Pointer to the member.
        path: String,
    },
    /// A changed member.
    Replace {
        /// Pointer to the member.
        path: String,
        /// New value.
        value: Value,
    },
}

impl PatchOp {
    /// Pointer the operation applies to.
    #[must_use]
    pub fn path(&self) -> &str {
        match self {
            Self::Add { path, .. } | Self::Remove { path } | Self::Replace { path, .. } => path,
        }
    }
}

fn escape(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}

/// Diff two payloads.
///
/// ```
/// use ruleflow::proc_event::diff::{diff_payloads, PatchOp};
/// use serde_json::json;
///
/// let old = json!({"a": 1, "b": 2}).as_object().cloned().unwrap();
/// let new = json!({"a": 1, "c": 3}).as_object().cloned().unwrap();
/// let ops = diff_payloads(&old, &new);
/// assert_eq!(ops, vec![
///     PatchOp::Remove { path: "/b".into() },
///     PatchOp::Add { path: "/c".into(), value: json!(3) },
/// ]);
/// ```
#[must_use]
pub fn diff_payloads(old: &Payload, new: &Payload) -> Vec<PatchOp> {
    let mut ops = Vec::new();
    diff_objects("", old, new, &mut ops);
    ops
}

/// Diff two arbitrary values rooted at the empty pointer.
#[must_use]
pub fn diff(old: &Value, new: &Value) -> Vec<PatchOp> {
    let mut ops = Vec::new();
    diff_values(String::new(), old, new, &mut ops);
    ops
}

fn diff_values(path: String, old: &Value, new: &Value, ops: &mut Vec<PatchOp>) {
    if old == new {
        return;
    }
    match (old, new) {
        (Value::Object(a), Value::Object(b)) => diff_objects(&path, a, b, ops),
        (Value::Array(a), Value::Array(b)) if a.len() == b.len() => {
            for (i, (x, y)) in a.iter().zip(b).enumerate() {
                diff_values(format!("{path}/{i}"), x, y, ops);
            }
        }
        _ => ops.push(PatchOp::Replace {
            path,
            value: new.clone(),
        }),
    }
}

fn diff_objects(path: &str, old: &Payload, new: &Payload, ops: &mut Vec<PatchOp>) {
    for (key, old_value) in old {
        let member = format!("{path}/{}", escape(key));
        match new.get(key) {
            Some(new_value) => diff_values(member, old_value, new_value, ops),
            None => ops.push(PatchOp::Remove { path: member }),
        }
    }
    for (key, new_value) in new {
        if !old.contains_key(key) {
            ops.push(PatchOp::Add {
                path: format!("{path}/{}", escape(key)),
                value: new_value.clone(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Value) -> Payload {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn identical_payloads_have_no_ops() {
        let p = obj(json!({"a": [1, 2], "b": {"c": null}}));
        assert!(diff_payloads(&p, &p).is_empty());
    }

    #[test]
    fn nested_changes_use_deep_pointers() {
        let old = obj(json!({"outer": {"inner": 1, "keep": true}}));
        let new = obj(json!({"outer": {"inner": 2, "keep": true}}));
        assert_eq!(
            diff_payloads(&old, &new),
            vec![PatchOp::Replace {
                path: "/outer/inner".into(),
                value: json!(2)
            }]
        );
    }

    #[test]
    fn arrays_of_equal_length_diff_by_index() {
        let ops = diff(&json!([1, 2, 3]), &json!([1, 5, 3]));
        assert_eq!(ops, vec![PatchOp::Replace { path: "/1".into(), value: json!(5) }]);

        let ops = diff(&json!({"l": [1]}), &json!({"l": [1, 2]}));
        assert_eq!(ops, vec![PatchOp::Replace { path: "/l".into(), value: json!([1, 2]) }]);
    }

    #[test]
    fn pointer_tokens_are_escaped() {
        let ops = diff_payloads(&Payload::new(), &obj(json!({"a/b~c": 1})));
        assert_eq!(ops[0].path(), "/a~1b~0c");
    }

    #[test]
    fn ops_serialize_with_op_tag() {
        let op = PatchOp::Add {
            path: "/x".into(),
            value: json!(1),
        };
        assert_eq!(
            serde_json::to_value(&op).unwrap(),
            json!({"op": "add", "path": "/x", "value": 1})
        );
    }
}

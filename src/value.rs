//! JSON value helpers shared by subjects, rules and the router.
//!
//! Property values and event payloads are plain `serde_json` values. This module
//! adds the few operations the engine needs on top of them: truthiness for filter
//! results and numeric arithmetic for counter updates.

use serde_json::{Map, Number, Value};

/// An event payload: a JSON object.
pub type Payload = Map<String, Value>;

/// Property values of one namespace, keyed by property name.
pub type PropertyMap = Map<String, Value>;

/// Returns whether a value counts as "true" when used as a filter result.
///
/// `null`, `false`, zero, the empty string, the empty array and the empty
/// object are falsy; everything else is truthy.
///
/// # Examples
///
/// ```
/// use ruleflow::value::is_truthy;
/// use serde_json::json;
///
/// assert!(is_truthy(&json!(true)));
/// assert!(is_truthy(&json!({"a": 1})));
/// assert!(!is_truthy(&json!(0)));
/// assert!(!is_truthy(&json!("")));
/// assert!(!is_truthy(&json!(null)));
/// ```
#[must_use]
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(true, |f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Adds `amount` to a numeric value, treating `null` as zero.
///
/// Integers stay integers as long as both operands are integers and the sum
/// does not overflow; otherwise the result is a float. Returns `None` when the
/// current value is not a number.
#[must_use]
pub fn add_number(current: &Value, amount: &Number) -> Option<Value> {
    let current = match current {
        Value::Null => Number::from(0),
        Value::Number(n) => n.clone(),
        _ => return None,
    };

    if let (Some(a), Some(b)) = (current.as_i64(), amount.as_i64()) {
        if let Some(sum) = a.checked_add(b) {
            return Some(Value::from(sum));
        }
    }

    let sum = current.as_f64()? + amount.as_f64()?;
    Number::from_f64(sum).map(Value::Number)
}

/// Looks up a JSON pointer (RFC 6901) inside a payload.
///
/// ```
/// use ruleflow::value::payload_pointer;
/// use serde_json::json;
///
/// let payload = json!({"user": {"roles": ["admin"]}}).as_object().cloned().unwrap();
/// assert_eq!(payload_pointer(&payload, "/user/roles/0"), Some(&json!("admin")));
/// assert_eq!(payload_pointer(&payload, "/user/name"), None);
/// ```
#[must_use]
pub fn payload_pointer<'a>(payload: &'a Payload, pointer: &str) -> Option<&'a Value> {
    let rest = pointer.strip_prefix('/')?;
    let (head, tail) = match rest.find('/') {
        Some(i) => rest.split_at(i),
        None => (rest, ""),
    };
    let head = head.replace("~1", "/").replace("~0", "~");
    payload.get(&head)?.pointer(tail)
}

/// Negates a JSON number.
#[must_use]
pub fn negate_number(n: &Number) -> Option<Number> {
    if let Some(i) = n.as_i64() {
        return i.checked_neg().map(Number::from);
    }
    n.as_f64().and_then(|f| Number::from_f64(-f))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn truthiness_matches_filter_semantics() {
        assert!(is_truthy(&json!(1)));
        assert!(is_truthy(&json!(-0.5)));
        assert!(is_truthy(&json!("x")));
        assert!(is_truthy(&json!([0])));
        assert!(!is_truthy(&json!(false)));
        assert!(!is_truthy(&json!(0.0)));
        assert!(!is_truthy(&json!([])));
        assert!(!is_truthy(&json!({})));
    }

    #[test]
    fn add_number_keeps_integers() {
        assert_eq!(add_number(&json!(41), &Number::from(1)), Some(json!(42)));
        assert_eq!(add_number(&Value::Null, &Number::from(3)), Some(json!(3)));
    }

    #[test]
    fn add_number_promotes_to_float() {
        let half = Number::from_f64(0.5).unwrap();
        assert_eq!(add_number(&json!(1), &half), Some(json!(1.5)));
    }

    #[test]
    fn add_number_rejects_non_numbers() {
        assert_eq!(add_number(&json!("1"), &Number::from(1)), None);
    }

    #[test]
    fn payload_pointer_unescapes_first_token() {
        let payload = json!({"a/b": {"c": 1}, "x": 2}).as_object().cloned().unwrap();
        assert_eq!(payload_pointer(&payload, "/a~1b/c"), Some(&json!(1)));
        assert_eq!(payload_pointer(&payload, "/x"), Some(&json!(2)));
        assert_eq!(payload_pointer(&payload, "x"), None);
        assert_eq!(payload_pointer(&payload, ""), None);
    }

    #[test]
    fn negate_number_handles_both_kinds() {
        assert_eq!(negate_number(&Number::from(2)), Some(Number::from(-2)));
        let f = Number::from_f64(1.5).unwrap();
        assert_eq!(negate_number(&f).and_then(|n| n.as_f64()), Some(-1.5));
    }
}

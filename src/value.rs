//! Value helpers shared by resolution, hooks and expectations.
//!
//! Resolved values are plain `serde_json::Value`s. Numbers compare by value
//! across integer widths; an integer compared against a float is widened to
//! `f64` and compared exactly, so `200` equals `200.0` but not `200.0000001`.

use serde_json::{Number, Value};
use std::cmp::Ordering;

use crate::error::ResolveError;

/// Key that yields the length of the container it is applied to
pub const LEN: &str = "LEN";

/// Human readable JSON type name
pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Deep, numeric-aware equality
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => numbers_equal(x, y),
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y.iter()).all(|(l, r)| values_equal(l, r))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x
                    .iter()
                    .all(|(key, l)| y.get(key).is_some_and(|r| values_equal(l, r)))
        }
        _ => a == b,
    }
}

fn numbers_equal(x: &Number, y: &Number) -> bool {
    if let (Some(a), Some(b)) = (x.as_i64(), y.as_i64()) {
        return a == b;
    }
    if let (Some(a), Some(b)) = (x.as_u64(), y.as_u64()) {
        return a == b;
    }
    if x.is_f64() || y.is_f64() {
        return match (x.as_f64(), y.as_f64()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        };
    }
    // One side is a negative i64, the other a u64 above i64::MAX
    false
}

fn compare_numbers(x: &Number, y: &Number) -> Ordering {
    if let (Some(a), Some(b)) = (x.as_i64(), y.as_i64()) {
        return a.cmp(&b);
    }
    if let (Some(a), Some(b)) = (x.as_u64(), y.as_u64()) {
        return a.cmp(&b);
    }
    let a = x.as_f64().unwrap_or(f64::NAN);
    let b = y.as_f64().unwrap_or(f64::NAN);
    a.partial_cmp(&b).unwrap_or(Ordering::Equal)
}

/// Ordering for numbers (by value) and strings (lexicographic)
pub fn compare_values(a: &Value, b: &Value) -> Result<Ordering, ResolveError> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => Ok(compare_numbers(x, y)),
        (Value::String(x), Value::String(y)) => Ok(x.cmp(y)),
        _ => Err(ResolveError::TypeMismatch {
            expected: "two numbers or two strings".to_string(),
            actual: format!("{} and {}", type_name(a), type_name(b)),
        }),
    }
}

/// Uniform stringification used for message payloads, path params and query values
pub fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(_) | Value::Object(_) => value.to_string(),
    }
}

/// Length of an array, object or string
pub fn length_of(value: &Value) -> Result<usize, ResolveError> {
    match value {
        Value::Array(items) => Ok(items.len()),
        Value::Object(map) => Ok(map.len()),
        Value::String(s) => Ok(s.chars().count()),
        other => Err(ResolveError::TypeMismatch {
            expected: "array, object or string".to_string(),
            actual: type_name(other).to_string(),
        }),
    }
}

/// Substring for strings, element for arrays, key for objects
pub fn contains(haystack: &Value, needle: &Value) -> Result<bool, ResolveError> {
    match haystack {
        Value::String(s) => Ok(s.contains(stringify(needle).as_str())),
        Value::Array(items) => Ok(items.iter().any(|item| values_equal(item, needle))),
        Value::Object(map) => Ok(map.contains_key(stringify(needle).as_str())),
        other => Err(ResolveError::TypeMismatch {
            expected: "string, array or object".to_string(),
            actual: type_name(other).to_string(),
        }),
    }
}

/// Descend one level into an already-decoded container.
///
/// Strings are not handled here; callers parse them first so the decoded
/// document can be cached.
pub fn step(container: &Value, key: &str) -> Result<Value, ResolveError> {
    if key == LEN {
        return match container {
            Value::Array(_) | Value::Object(_) => Ok(Value::from(length_of(container)?)),
            other => Err(ResolveError::NotAContainer {
                key: key.to_string(),
                found: type_name(other).to_string(),
            }),
        };
    }

    match container {
        Value::Object(map) => map
            .get(key)
            .cloned()
            .ok_or_else(|| ResolveError::MissingKey(key.to_string())),
        Value::Array(items) => {
            let index: i64 = key.trim().parse().map_err(|_| ResolveError::InvalidIndex {
                key: key.to_string(),
            })?;
            let len = items.len();
            let position = if index < 0 { len as i64 + index } else { index };
            if position < 0 || position >= len as i64 {
                return Err(ResolveError::IndexOutOfRange { index, len });
            }
            Ok(items[position as usize].clone())
        }
        other => Err(ResolveError::NotAContainer {
            key: key.to_string(),
            found: type_name(other).to_string(),
        }),
    }
}

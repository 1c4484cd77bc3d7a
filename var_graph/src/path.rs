//! Extraction of nested values for `.get()` references.
//!
//! A miss at any level yields `Value::Null` instead of an error: a component
//! asking for `user.get("address").get("city")` before the address has loaded
//! should render nothing, not fail.

use serde_json::Value;

/// Walks `keys` into `value`. Object members are looked up by name; array
/// elements by base-10 index.
pub fn extract<'a, I>(value: &Value, keys: I) -> Value
where
    I: IntoIterator<Item = &'a str>,
{
    let mut current = value;
    for key in keys {
        let next = match current {
            Value::Object(map) => map.get(key),
            Value::Array(items) => {
                key.parse::<usize>().ok().and_then(|idx| items.get(idx))
            }
            _ => None,
        };
        match next {
            Some(next) => current = next,
            None => return Value::Null,
        }
    }
    current.clone()
}

/// Converts a resolved dynamic path segment into a key, if it can be used as
/// one.
pub fn value_as_key(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

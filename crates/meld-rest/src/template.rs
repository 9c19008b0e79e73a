//! `${var}` substitution in POST bodies.
//!
//! A string field equal to a single `${var}` is replaced by the parameter's
//! value outright; otherwise occurrences are substituted textually. Every
//! parameter consumed by the body is recorded so the caller can drop it from
//! the query string. A field left holding an unresolved reference becomes
//! null.

use serde_json::Value;

use crate::params::ParamSet;

/// Substitute parameters into a POST body template, returning the new body.
/// Consumed parameter names are appended to `used_keys`.
pub fn interpolate_post_values(node: &Value, params: &ParamSet, used_keys: &mut Vec<String>) -> Value {
    match node {
        Value::String(s) => {
            let mut text = s.clone();
            for (key, value) in params {
                let pattern = format!("${{{key}}}");
                if text == pattern {
                    used_keys.push(key.clone());
                    return Value::String(value.clone());
                } else if text.contains(&pattern) {
                    text = text.replace(&pattern, value);
                    used_keys.push(key.clone());
                }
            }
            if starts_with_reference(&text) {
                tracing::debug!("removing undefined reference: {}", text);
                return Value::Null;
            }
            Value::String(text)
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| interpolate_post_values(v, params, used_keys))
                .collect(),
        ),
        Value::Object(map) => {
            let mut dup = map.clone();
            for (key, value) in map {
                dup.insert(key.clone(), interpolate_post_values(value, params, used_keys));
            }
            Value::Object(dup)
        }
        other => other.clone(),
    }
}

/// True when the text starts with a well-formed `${name}` reference.
fn starts_with_reference(text: &str) -> bool {
    let Some(rest) = text.strip_prefix("${") else {
        return false;
    };
    match rest.find('}') {
        Some(end) if end > 0 => rest[..end]
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-'),
        _ => false,
    }
}

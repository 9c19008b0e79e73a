//! Dotted-path lookups into JSON documents.
//!
//! Adapter specs address response payloads with paths like
//! `"meta.next_token"` or `"data.items"`. Path segments that parse as an
//! integer index into arrays.

use serde_json::Value;

/// Look up a dotted path, returning the value if every segment resolves.
pub fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => {
                let idx: usize = segment.parse().ok()?;
                items.get(idx)?
            }
            _ => return None,
        };
    }
    Some(current)
}

/// Like [`lookup`], but treats JSON `null` as absent.
pub fn lookup_non_null<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    lookup(value, path).filter(|v| !v.is_null())
}

/// Render a looked-up scalar as a plain string (no JSON quoting).
pub fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_lookup_nested_object() {
        let doc = json!({"meta": {"paging": {"next": "abc"}}});
        assert_eq!(
            lookup(&doc, "meta.paging.next"),
            Some(&Value::String("abc".to_string()))
        );
    }

    #[test]
    fn test_lookup_array_index() {
        let doc = json!({"items": [{"id": 1}, {"id": 2}]});
        assert_eq!(lookup(&doc, "items.1.id"), Some(&json!(2)));
    }

    #[test]
    fn test_missing_segment_is_none() {
        let doc = json!({"meta": {}});
        assert!(lookup(&doc, "meta.paging.next").is_none());
    }

    #[test]
    fn test_null_is_absent_for_non_null_lookup() {
        let doc = json!({"next": null});
        assert!(lookup(&doc, "next").is_some());
        assert!(lookup_non_null(&doc, "next").is_none());
    }

    #[test]
    fn test_scalar_to_string_unquoted() {
        assert_eq!(scalar_to_string(&json!("x")), "x");
        assert_eq!(scalar_to_string(&json!(7)), "7");
    }
}

//! Page JSON to tabular rows.
//!
//! A page is unwrapped through the table's configured paths, each record is
//! flattened (nested objects joined with `_`, lists of objects dropped),
//! meta values from the page root are attached to every record, and the
//! `select`/`strip_prefixes` column rules are applied. Parameter merge
//! columns come last and win.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use meld_core::jsonpath;
use meld_rest::TableSpec;

/// Extract the rows of one page.
pub fn page_to_rows(
    page: &Value,
    table: &TableSpec,
    merge_cols: Option<&BTreeMap<String, String>>,
) -> Vec<Map<String, Value>> {
    let records = unwrap_records(page, table);

    let metas: Vec<(String, Value)> = table
        .result_meta_paths
        .iter()
        .filter_map(|path| {
            jsonpath::lookup(page, path).map(|v| (path.replace('.', "_"), v.clone()))
        })
        .collect();

    let mut rows = Vec::with_capacity(records.len());
    for record in records {
        let Value::Object(record) = record else {
            continue;
        };
        let mut row = Map::new();
        flatten_into("", &record, &mut row);

        for (column, value) in &metas {
            row.insert(column.clone(), value.clone());
        }

        if let Some(select) = &table.select {
            row.retain(|name, _| select.iter().any(|s| selected(s, name)));
        }

        if !table.strip_prefixes.is_empty() {
            let mut renamed = Map::new();
            for (name, value) in row {
                let stripped = table
                    .strip_prefixes
                    .iter()
                    .find_map(|prefix| name.strip_prefix(prefix.as_str()))
                    .map(str::to_string)
                    .unwrap_or(name);
                renamed.insert(stripped, value);
            }
            row = renamed;
        }

        if let Some(merge_cols) = merge_cols {
            for (column, value) in merge_cols {
                row.insert(column.clone(), Value::String(value.clone()));
            }
        }

        rows.push(row);
    }
    rows
}

/// Apply the body/object path configuration to get the record list.
fn unwrap_records(page: &Value, table: &TableSpec) -> Vec<Value> {
    let unwrapped = if let Some(path) = &table.result_object_path {
        jsonpath::lookup(page, path)
    } else if let Some(path) = &table.result_body_path {
        jsonpath::lookup(page, path)
    } else {
        Some(page)
    };
    match unwrapped {
        Some(Value::Array(items)) => items.clone(),
        Some(Value::Object(map)) => vec![Value::Object(map.clone())],
        _ => Vec::new(),
    }
}

/// A column survives the select filter on an exact match or a
/// `<name>_`-style parent-property match.
fn selected(select_name: &str, column: &str) -> bool {
    column == select_name || column.starts_with(&format!("{select_name}_"))
}

/// Flatten nested objects with `_`-joined names. Lists survive only when
/// every element is a scalar; lists of objects are dropped.
fn flatten_into(prefix: &str, record: &Map<String, Value>, out: &mut Map<String, Value>) {
    for (key, value) in record {
        let name = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}_{key}")
        };
        match value {
            Value::Object(nested) => flatten_into(&name, nested, out),
            Value::Array(items) => {
                let all_scalars = items
                    .iter()
                    .all(|item| !(item.is_object() || item.is_array() || item.is_null()));
                if all_scalars && !items.is_empty() {
                    out.insert(name, value.clone());
                }
            }
            other => {
                out.insert(name, other.clone());
            }
        }
    }
}

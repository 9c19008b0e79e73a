//! Declared query parameters and their cartesian expansion.
//!
//! A table's `params` map values are one of: a literal scalar, a literal
//! list, or a `sql@(<query>)` reference resolved against the table's own
//! schema at scan time. Multi-valued parameters expand into one concrete
//! parameter set per combination, in declaration order (the first-declared
//! parameter varies slowest).

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::RestError;

/// A declared parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Literal(String),
    LiteralList(Vec<Value>),
    /// A `sql@(<query>)` marker; the query runs against the adapter schema.
    QueryRef(String),
}

/// Declared parameters in declaration order.
pub type Params = Vec<(String, ParamValue)>;

/// One concrete set of API-call parameters.
pub type ParamSet = BTreeMap<String, String>;

/// Executes `sql@(...)` parameter queries for an adapter.
#[async_trait]
pub trait ParamQuerySource: Send + Sync {
    /// Run a query against the adapter's schema, returning stringified rows.
    async fn query_values(&self, schema: &str, sql: &str) -> Result<Vec<Vec<String>>, RestError>;
}

/// Extract the query from a `sql@(...)` marker, if the value is one.
fn sql_query_marker(value: &str) -> Option<&str> {
    value
        .strip_prefix("sql@(")
        .and_then(|rest| rest.strip_suffix(')'))
}

/// Parse a spec `params` object into declaration-ordered parameter values.
pub fn parse_params(value: &Value, table: &str) -> Result<Params, RestError> {
    let map = value
        .as_object()
        .ok_or_else(|| RestError::Config(format!("params for table {table} must be an object")))?;
    let mut params = Params::new();
    for (name, value) in map {
        let parsed = match value {
            Value::String(s) => match sql_query_marker(s) {
                Some(query) => ParamValue::QueryRef(query.to_string()),
                None => ParamValue::Literal(s.clone()),
            },
            Value::Array(items) => ParamValue::LiteralList(items.clone()),
            Value::Number(n) => ParamValue::Literal(n.to_string()),
            Value::Bool(b) => ParamValue::Literal(b.to_string()),
            other => {
                return Err(RestError::Config(format!(
                    "unsupported param value {other} for '{name}' in table {table}"
                )))
            }
        };
        params.push((name.clone(), parsed));
    }
    Ok(params)
}

/// A multi-value element: either a single value or a row of fields to be
/// unpacked into a compound `"colA,colB"` parameter name.
#[derive(Debug, Clone)]
enum MultiValue {
    One(String),
    Row(Vec<String>),
}

#[derive(Debug, Clone)]
enum Resolved {
    Scalar(String),
    Many(Vec<MultiValue>),
}

fn scalar_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Expand declared parameters into concrete parameter sets.
///
/// `sql@(...)` references are resolved first: zero rows drops the parameter,
/// one row binds its first column, and multiple rows become a multi-value.
/// An empty declaration yields exactly one empty set, and an empty value
/// list leaves its parameter silently absent instead of zeroing the product.
pub async fn expand_params(
    params: &Params,
    schema: &str,
    source: &dyn ParamQuerySource,
) -> Result<Vec<ParamSet>, RestError> {
    let mut resolved: Vec<(String, Resolved)> = Vec::with_capacity(params.len());
    for (name, value) in params {
        let entry = match value {
            ParamValue::Literal(s) => Some(Resolved::Scalar(s.clone())),
            ParamValue::LiteralList(items) => {
                let items: Vec<MultiValue> = items
                    .iter()
                    .map(|item| match item {
                        Value::Array(fields) => {
                            MultiValue::Row(fields.iter().map(scalar_string).collect())
                        }
                        other => MultiValue::One(scalar_string(other)),
                    })
                    .collect();
                if items.is_empty() {
                    None
                } else {
                    Some(Resolved::Many(items))
                }
            }
            ParamValue::QueryRef(query) => {
                let rows = source.query_values(schema, query).await?;
                match rows.len() {
                    0 => None,
                    1 => rows[0].first().map(|v| Resolved::Scalar(v.clone())),
                    _ => Some(Resolved::Many(
                        rows.into_iter()
                            .map(|row| {
                                if row.len() == 1 {
                                    MultiValue::One(row.into_iter().next().unwrap())
                                } else {
                                    MultiValue::Row(row)
                                }
                            })
                            .collect(),
                    )),
                }
            }
        };
        if let Some(entry) = entry {
            resolved.push((name.clone(), entry));
        }
    }

    let mut out = Vec::new();
    emit(&mut ParamSet::new(), &resolved, 0, &mut out);
    Ok(out)
}

fn emit(accum: &mut ParamSet, params: &[(String, Resolved)], pos: usize, out: &mut Vec<ParamSet>) {
    if pos >= params.len() {
        out.push(accum.clone());
        return;
    }
    let (name, value) = &params[pos];
    match value {
        Resolved::Scalar(v) => {
            accum.insert(name.clone(), v.clone());
            emit(accum, params, pos + 1, out);
        }
        Resolved::Many(items) => {
            let cols: Vec<&str> = name.split(',').map(str::trim).collect();
            for item in items {
                let mut branch = accum.clone();
                match item {
                    MultiValue::One(v) => {
                        branch.insert(cols[0].to_string(), v.clone());
                    }
                    MultiValue::Row(fields) => {
                        for (col, field) in cols.iter().zip(fields) {
                            branch.insert(col.to_string(), field.clone());
                        }
                    }
                }
                emit(&mut branch, params, pos + 1, out);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Scripted source: maps query text to result rows.
    struct FakeSource(BTreeMap<String, Vec<Vec<String>>>);

    #[async_trait]
    impl ParamQuerySource for FakeSource {
        async fn query_values(
            &self,
            _schema: &str,
            sql: &str,
        ) -> Result<Vec<Vec<String>>, RestError> {
            Ok(self.0.get(sql).cloned().unwrap_or_default())
        }
    }

    fn no_queries() -> FakeSource {
        FakeSource(BTreeMap::new())
    }

    fn params_from(value: Value) -> Params {
        parse_params(&value, "t.test").unwrap()
    }

    #[tokio::test]
    async fn test_empty_params_yield_single_empty_set() {
        let sets = expand_params(&Params::new(), "t", &no_queries()).await.unwrap();
        assert_eq!(sets, vec![ParamSet::new()]);
    }

    #[tokio::test]
    async fn test_cartesian_product_declaration_order() {
        let params = params_from(json!({"a": [1, 2], "b": [3, 4]}));
        let sets = expand_params(&params, "t", &no_queries()).await.unwrap();
        let pairs: Vec<(String, String)> = sets
            .iter()
            .map(|s| (s["a"].clone(), s["b"].clone()))
            .collect();
        // first-declared parameter varies slowest
        assert_eq!(
            pairs,
            vec![
                ("1".into(), "3".into()),
                ("1".into(), "4".into()),
                ("2".into(), "3".into()),
                ("2".into(), "4".into()),
            ]
        );
    }

    #[tokio::test]
    async fn test_scalar_params_single_set() {
        let params = params_from(json!({"region": "east", "limit": 10}));
        let sets = expand_params(&params, "t", &no_queries()).await.unwrap();
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0]["region"], "east");
        assert_eq!(sets[0]["limit"], "10");
    }

    #[tokio::test]
    async fn test_sql_param_zero_rows_drops_key() {
        let params = params_from(json!({"id": "sql@(select id from repos)", "state": "open"}));
        let source = FakeSource(BTreeMap::from([(
            "select id from repos".to_string(),
            vec![],
        )]));
        let sets = expand_params(&params, "t", &source).await.unwrap();
        assert_eq!(sets.len(), 1);
        assert!(!sets[0].contains_key("id"));
        assert_eq!(sets[0]["state"], "open");
    }

    #[tokio::test]
    async fn test_sql_param_single_row_binds_scalar() {
        let params = params_from(json!({"id": "sql@(select id from repos)"}));
        let source = FakeSource(BTreeMap::from([(
            "select id from repos".to_string(),
            vec![vec!["42".to_string()]],
        )]));
        let sets = expand_params(&params, "t", &source).await.unwrap();
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0]["id"], "42");
    }

    #[tokio::test]
    async fn test_sql_param_multiple_rows_expand() {
        let params = params_from(json!({"id": "sql@(select id from repos)"}));
        let source = FakeSource(BTreeMap::from([(
            "select id from repos".to_string(),
            vec![vec!["1".to_string()], vec!["2".to_string()], vec!["3".to_string()]],
        )]));
        let sets = expand_params(&params, "t", &source).await.unwrap();
        assert_eq!(sets.len(), 3);
        assert_eq!(sets[2]["id"], "3");
    }

    #[tokio::test]
    async fn test_compound_name_unpacks_row_fields() {
        let params = params_from(json!({"owner,repo": [["rust-lang", "rust"], ["apache", "arrow"]]}));
        let sets = expand_params(&params, "t", &no_queries()).await.unwrap();
        assert_eq!(sets.len(), 2);
        assert_eq!(sets[0]["owner"], "rust-lang");
        assert_eq!(sets[0]["repo"], "rust");
        assert_eq!(sets[1]["owner"], "apache");
        assert_eq!(sets[1]["repo"], "arrow");
    }

    #[tokio::test]
    async fn test_empty_list_param_absent_not_zeroing() {
        let params = params_from(json!({"tag": [], "state": "open"}));
        let sets = expand_params(&params, "t", &no_queries()).await.unwrap();
        assert_eq!(sets.len(), 1);
        assert!(!sets[0].contains_key("tag"));
    }

    #[test]
    fn test_sql_marker_parse() {
        let params = params_from(json!({"id": "sql@(select 1)"}));
        assert_eq!(
            params[0].1,
            ParamValue::QueryRef("select 1".to_string())
        );
    }
}

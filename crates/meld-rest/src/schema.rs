//! Adapter and table spec parsing.
//!
//! An adapter document describes one connected system: its base URL, auth,
//! default paging options, and the set of queryable tables. Documents are
//! validated eagerly: every configuration problem surfaces at parse time,
//! never at first query.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::auth::AuthConfig;
use crate::error::RestError;
use crate::paging::Pager;
use crate::params::{parse_params, Params};

/// Default cap on pages fetched per table scan.
pub const DEFAULT_MAX_PAGES: u64 = 50_000;

/// HTTP methods a resource spec may name.
const VALID_METHODS: &[&str] = &["GET", "POST", "PATCH", "PUT", "DELETE"];

/// The recognized table-definition keys and their expected value shapes.
/// Anything else in a table entry is a hard error naming the key.
const VALID_TABLE_KEYS: &[(&str, KeyShape)] = &[
    ("name", KeyShape::Str),
    ("description", KeyShape::Str),
    ("resource_path", KeyShape::Str),
    ("result_body_path", KeyShape::StrOrList),
    ("result_object_path", KeyShape::StrOrList),
    ("result_meta_paths", KeyShape::List),
    ("supports_paging", KeyShape::Bool),
    ("paging", KeyShape::Dict),
    ("headers", KeyShape::Dict),
    ("params", KeyShape::Dict),
    ("post", KeyShape::Dict),
    ("select", KeyShape::Str),
    ("copy_params_to_output", KeyShape::List),
    ("key_columns", KeyShape::StrOrList),
    ("refresh", KeyShape::Dict),
    ("strip_prefixes", KeyShape::StrOrList),
];

#[derive(Debug, Clone, Copy, PartialEq)]
enum KeyShape {
    Str,
    StrOrList,
    List,
    Bool,
    Dict,
}

impl KeyShape {
    fn matches(&self, value: &Value) -> bool {
        match self {
            KeyShape::Str => value.is_string(),
            KeyShape::StrOrList => value.is_string() || value.is_array(),
            KeyShape::List => value.is_array(),
            KeyShape::Bool => value.is_boolean(),
            KeyShape::Dict => value.is_object(),
        }
    }

    fn expected(&self) -> &'static str {
        match self {
            KeyShape::Str => "string",
            KeyShape::StrOrList => "string or list",
            KeyShape::List => "list",
            KeyShape::Bool => "boolean",
            KeyShape::Dict => "object",
        }
    }
}

/// Pagination options for one strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct PagingOptions {
    pub strategy: String,
    pub page_size: u64,
    pub page_param: Option<String>,
    pub offset_param: Option<String>,
    pub count_param: Option<String>,
    pub token_param: Option<String>,
    pub pager_token_path: Option<String>,
}

impl PagingOptions {
    pub fn from_value(value: &Value, context: &str) -> Result<Self, RestError> {
        let map = value
            .as_object()
            .ok_or_else(|| RestError::Config(format!("paging options for {context} must be an object")))?;
        let get_str = |key: &str| map.get(key).and_then(Value::as_str).map(str::to_string);
        let strategy = get_str("strategy")
            .ok_or_else(|| RestError::Config(format!("paging strategy not specified for {context}")))?;
        let page_size = match map.get("page_size") {
            Some(v) => v
                .as_u64()
                .or_else(|| v.as_str().and_then(|s| s.parse().ok()))
                .ok_or_else(|| RestError::Config(format!("bad page_size for {context}")))?,
            None => 1,
        };
        Ok(Self {
            strategy,
            page_size,
            page_param: get_str("page_param"),
            offset_param: get_str("offset_param"),
            count_param: get_str("count_param"),
            token_param: get_str("token_param"),
            pager_token_path: get_str("pager_token_path"),
        })
    }
}

/// How a table is re-synced after its initial load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshKind {
    Reload,
    Updates,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RefreshSpec {
    pub strategy: RefreshKind,
    /// Parameter template for the `updates` strategy; values may reference
    /// `${timestamp}`.
    pub params: BTreeMap<String, String>,
}

impl RefreshSpec {
    fn from_value(value: &Value, table: &str) -> Result<Self, RestError> {
        let map = value.as_object().ok_or_else(|| {
            RestError::Config(format!("refresh spec for table {table} must be an object"))
        })?;
        let strategy = match map.get("strategy").and_then(Value::as_str) {
            Some("reload") => RefreshKind::Reload,
            Some("updates") => RefreshKind::Updates,
            Some(other) => {
                return Err(RestError::Config(format!(
                    "invalid refresh strategy '{other}' for table {table}"
                )))
            }
            None => {
                return Err(RestError::Config(format!(
                    "refresh spec for table {table} missing 'strategy'"
                )))
            }
        };
        let mut params = BTreeMap::new();
        if let Some(raw) = map.get("params") {
            let raw = raw.as_object().ok_or_else(|| {
                RestError::Config(format!("refresh params for table {table} must be an object"))
            })?;
            for (k, v) in raw {
                // Both keys and values must be strings for the updates
                // strategy; reject anything else up front.
                let v = v.as_str().ok_or_else(|| {
                    RestError::Config(format!(
                        "invalid refresh strategy parameter '{v}' for table {table}"
                    ))
                })?;
                params.insert(k.clone(), v.to_string());
            }
        }
        if strategy == RefreshKind::Updates && params.is_empty() {
            return Err(RestError::Config(format!(
                "table {table} missing 'params' for 'updates' refresh strategy"
            )));
        }
        Ok(Self { strategy, params })
    }
}

/// A view defined over one or more adapter tables.
#[derive(Debug, Clone)]
pub struct ViewSpec {
    pub name: String,
    pub from_list: Vec<String>,
    /// Either a single query or a map of dialect name to query text.
    pub query: Value,
}

/// Inter-page throttle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Throttle {
    pub sleep_secs: f64,
}

/// One queryable resource of a connected system. Immutable after parse.
#[derive(Debug, Clone)]
pub struct TableSpec {
    pub name: String,
    pub description: Option<String>,
    pub method: String,
    /// Path template with `{name}` placeholders, `*` annotations stripped.
    pub query_path: String,
    /// Placeholder names appearing in the path template.
    pub query_args: Vec<String>,
    pub result_body_path: Option<String>,
    pub result_object_path: Option<String>,
    pub result_meta_paths: Vec<String>,
    pub paging: Option<PagingOptions>,
    pub headers: BTreeMap<String, String>,
    pub params: Params,
    pub post: Option<Value>,
    pub select: Option<Vec<String>>,
    pub copy_params_to_output: Option<Vec<String>>,
    pub key_columns: Vec<String>,
    pub refresh: Option<RefreshSpec>,
    pub strip_prefixes: Vec<String>,
    pub query_date_format: Option<String>,
    pub max_pages: u64,
}

impl TableSpec {
    /// Key column for update-style refreshes.
    pub fn key(&self) -> Option<&str> {
        self.key_columns.first().map(String::as_str)
    }

    pub fn supports_paging(&self) -> bool {
        self.paging.is_some()
    }

    /// True when this table requires multiple API calls per scan, either via
    /// a query-derived parameter or a literal value list.
    pub fn has_multivalue_parameters(&self) -> bool {
        self.params.iter().any(|(_, value)| {
            matches!(
                value,
                crate::params::ParamValue::QueryRef(_) | crate::params::ParamValue::LiteralList(_)
            )
        })
    }

    /// Description of where this table's data comes from.
    pub fn table_source(&self, adapter: &str) -> Value {
        serde_json::json!({
            "api": format!("{} {}", self.method, self.query_path),
            "adapter": adapter,
        })
    }
}

/// A parsed adapter document.
#[derive(Debug, Clone)]
pub struct AdapterSpec {
    pub name: String,
    pub base_url: String,
    pub auth: AuthConfig,
    pub paging: Option<PagingOptions>,
    pub throttle: Option<Throttle>,
    pub query_date_format: Option<String>,
    pub tables: Vec<TableSpec>,
    pub views: Vec<ViewSpec>,
}

impl AdapterSpec {
    /// Parse and validate an adapter document.
    pub fn parse(doc: &Value) -> Result<Self, RestError> {
        let root = doc
            .as_object()
            .ok_or_else(|| RestError::Config("adapter spec must be an object".to_string()))?;
        let name = root
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| RestError::Config("adapter spec missing 'name'".to_string()))?
            .to_string();
        let base_url = root
            .get("base_url")
            .and_then(Value::as_str)
            .ok_or_else(|| RestError::Config(format!("adapter spec {name} missing 'base_url'")))?
            .to_string();

        let auth = match root.get("auth") {
            Some(value) => AuthConfig::from_value(value, &name)?,
            None => AuthConfig::None,
        };

        let paging = root
            .get("paging")
            .map(|v| PagingOptions::from_value(v, &name))
            .transpose()?;
        if let Some(opts) = &paging {
            Pager::build(Some(opts))?;
        }

        let throttle = match root.get("throttle") {
            Some(v) => {
                let sleep_secs = v
                    .get("sleep")
                    .and_then(Value::as_f64)
                    .ok_or_else(|| RestError::Config(format!("throttle for {name} missing 'sleep'")))?;
                Some(Throttle { sleep_secs })
            }
            None => None,
        };

        let query_date_format = root
            .get("queryDateFormat")
            .and_then(Value::as_str)
            .map(str::to_string);

        let mut tables = Vec::new();
        if let Some(entries) = root.get("tables").and_then(Value::as_array) {
            for entry in entries {
                tables.push(parse_table(
                    entry,
                    &name,
                    paging.as_ref(),
                    query_date_format.as_deref(),
                )?);
            }
        } else {
            tracing::warn!("adapter spec '{}' has no tables defined", name);
        }

        let mut views = Vec::new();
        if let Some(entries) = root.get("views").and_then(Value::as_array) {
            for entry in entries {
                views.push(parse_view(entry)?);
            }
        }

        Ok(Self {
            name,
            base_url,
            auth,
            paging,
            throttle,
            query_date_format,
            tables,
            views,
        })
    }

    pub fn lookup_table(&self, name: &str) -> Option<&TableSpec> {
        self.tables.iter().find(|t| t.name == name)
    }
}

fn parse_view(entry: &Value) -> Result<ViewSpec, RestError> {
    let map = entry
        .as_object()
        .ok_or_else(|| RestError::Config("view entry must be an object".to_string()))?;
    let name = map.get("name").and_then(Value::as_str);
    let from = map.get("from").and_then(Value::as_array);
    let query = map.get("query");
    match (name, from, query) {
        (Some(name), Some(from), Some(query)) => Ok(ViewSpec {
            name: name.to_string(),
            from_list: from
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            query: query.clone(),
        }),
        _ => Err(RestError::Config(format!(
            "missing one of name, from or query from view: {entry}"
        ))),
    }
}

fn parse_table(
    entry: &Value,
    adapter_name: &str,
    adapter_paging: Option<&PagingOptions>,
    query_date_format: Option<&str>,
) -> Result<TableSpec, RestError> {
    let map = entry
        .as_object()
        .ok_or_else(|| RestError::Config("table entry must be an object".to_string()))?;
    let name = map
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| RestError::Config(format!("table entry in {adapter_name} missing 'name'")))?
        .to_string();
    let qualified = format!("{adapter_name}.{name}");

    for (key, value) in map {
        match VALID_TABLE_KEYS.iter().find(|(k, _)| *k == key.as_str()) {
            None => {
                return Err(RestError::InvalidKey {
                    key: key.clone(),
                    table: qualified,
                })
            }
            Some((_, shape)) => {
                if !shape.matches(value) {
                    return Err(RestError::InvalidType {
                        key: key.clone(),
                        table: qualified,
                        expected: shape.expected(),
                    });
                }
            }
        }
    }

    let resource = map
        .get("resource_path")
        .and_then(Value::as_str)
        .unwrap_or("");
    let (method_from_path, raw_path) = split_resource(resource, &qualified)?;
    let (query_path, query_args) = parse_path_template(raw_path);

    let post = map.get("post").cloned();
    let method = match method_from_path {
        Some(m) => m,
        None if post.is_some() => "POST".to_string(),
        None => "GET".to_string(),
    };

    let supports_paging = map
        .get("supports_paging")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let paging = if supports_paging {
        let opts = match map.get("paging") {
            // Per-table paging options take precedence over the adapter's
            Some(v) => Some(PagingOptions::from_value(v, &qualified)?),
            None => adapter_paging.cloned(),
        };
        Pager::build(opts.as_ref())?;
        opts
    } else {
        None
    };

    let headers = map
        .get("headers")
        .and_then(Value::as_object)
        .map(|h| {
            h.iter()
                .map(|(k, v)| {
                    (
                        k.clone(),
                        v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()),
                    )
                })
                .collect()
        })
        .unwrap_or_default();

    let params = match map.get("params") {
        Some(value) => parse_params(value, &qualified)?,
        None => Params::default(),
    };

    let select = map.get("select").and_then(Value::as_str).map(|s| {
        s.split(',')
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect()
    });

    let copy_params_to_output = map
        .get("copy_params_to_output")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        });

    let key_columns = str_or_list(map.get("key_columns"));
    let strip_prefixes = str_or_list(map.get("strip_prefixes"));

    let refresh = map
        .get("refresh")
        .map(|v| RefreshSpec::from_value(v, &qualified))
        .transpose()?;

    let result_body_path = path_str_or_list(map.get("result_body_path"));
    let result_object_path = path_str_or_list(map.get("result_object_path"));
    let result_meta_paths = map
        .get("result_meta_paths")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    Ok(TableSpec {
        name,
        description: map.get("description").and_then(Value::as_str).map(str::to_string),
        method,
        query_path,
        query_args,
        result_body_path,
        result_object_path,
        result_meta_paths,
        paging,
        headers,
        params,
        post,
        select,
        copy_params_to_output,
        key_columns,
        refresh,
        strip_prefixes,
        query_date_format: query_date_format.map(str::to_string),
        max_pages: DEFAULT_MAX_PAGES,
    })
}

/// Accept either a bare path or a `"<METHOD> <path>"` resource spec.
fn split_resource<'a>(resource: &'a str, table: &str) -> Result<(Option<String>, &'a str), RestError> {
    match resource.split_once(' ') {
        Some((method, path)) => {
            let method = method.to_uppercase();
            if !VALID_METHODS.contains(&method.as_str()) {
                return Err(RestError::Config(format!(
                    "invalid resource spec method '{method}' for table {table}"
                )));
            }
            Ok((Some(method), path))
        }
        None => Ok((None, resource)),
    }
}

/// Extract `{name}` placeholders from a path template. A `{*name}`
/// annotation marks a required positional parameter; the `*` is stripped
/// from the returned template.
fn parse_path_template(path: &str) -> (String, Vec<String>) {
    let mut clean = String::with_capacity(path.len());
    let mut args = Vec::new();
    let mut rest = path;
    while let Some(open) = rest.find('{') {
        clean.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find('}') {
            Some(close) => {
                let name = after[..close].strip_prefix('*').unwrap_or(&after[..close]);
                args.push(name.to_string());
                clean.push('{');
                clean.push_str(name);
                clean.push('}');
                rest = &after[close + 1..];
            }
            None => {
                clean.push('{');
                rest = after;
            }
        }
    }
    clean.push_str(rest);
    (clean, args)
}

fn str_or_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::String(s)) => vec![s.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

fn path_str_or_list(value: Option<&Value>) -> Option<String> {
    match value {
        Some(Value::String(s)) => Some(s.clone()),
        // A list form names the path segments individually
        Some(Value::Array(items)) => Some(
            items
                .iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .join("."),
        ),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn minimal_spec(table: Value) -> Value {
        json!({
            "name": "shop",
            "base_url": "https://api.example.com",
            "tables": [table],
        })
    }

    #[test]
    fn test_parse_minimal_adapter() {
        let spec = AdapterSpec::parse(&minimal_spec(json!({
            "name": "orders",
            "resource_path": "/v1/orders",
        })))
        .unwrap();
        assert_eq!(spec.name, "shop");
        assert_eq!(spec.tables.len(), 1);
        assert_eq!(spec.tables[0].method, "GET");
        assert_eq!(spec.tables[0].query_path, "/v1/orders");
    }

    #[test]
    fn test_unknown_table_key_names_key_and_table() {
        let err = AdapterSpec::parse(&minimal_spec(json!({
            "name": "orders",
            "resource_path": "/v1/orders",
            "paginate": true,
        })))
        .unwrap_err();
        match err {
            RestError::InvalidKey { key, table } => {
                assert_eq!(key, "paginate");
                assert_eq!(table, "shop.orders");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_wrong_key_type_rejected() {
        let err = AdapterSpec::parse(&minimal_spec(json!({
            "name": "orders",
            "resource_path": "/v1/orders",
            "supports_paging": "yes",
        })))
        .unwrap_err();
        assert!(matches!(err, RestError::InvalidType { .. }));
    }

    #[test]
    fn test_star_placeholders_stripped_and_recorded() {
        let spec = AdapterSpec::parse(&minimal_spec(json!({
            "name": "issues",
            "resource_path": "/repos/{*owner}/{repo}/issues",
        })))
        .unwrap();
        let table = &spec.tables[0];
        assert_eq!(table.query_path, "/repos/{owner}/{repo}/issues");
        assert_eq!(table.query_args, vec!["owner", "repo"]);
    }

    #[test]
    fn test_method_from_resource_spec() {
        let spec = AdapterSpec::parse(&minimal_spec(json!({
            "name": "search",
            "resource_path": "POST /v1/search",
        })))
        .unwrap();
        assert_eq!(spec.tables[0].method, "POST");
        assert_eq!(spec.tables[0].query_path, "/v1/search");
    }

    #[test]
    fn test_bad_resource_method_rejected() {
        let err = AdapterSpec::parse(&minimal_spec(json!({
            "name": "search",
            "resource_path": "FETCH /v1/search",
        })))
        .unwrap_err();
        assert!(matches!(err, RestError::Config(_)));
    }

    #[test]
    fn test_post_body_implies_post_method() {
        let spec = AdapterSpec::parse(&minimal_spec(json!({
            "name": "search",
            "resource_path": "/v1/search",
            "post": {"query": "${q}"},
        })))
        .unwrap();
        assert_eq!(spec.tables[0].method, "POST");
    }

    #[test]
    fn test_table_paging_falls_back_to_adapter() {
        let spec = AdapterSpec::parse(&json!({
            "name": "shop",
            "base_url": "https://api.example.com",
            "paging": {
                "strategy": "offsetAndCount",
                "offset_param": "offset",
                "count_param": "limit",
                "page_size": 100,
            },
            "tables": [{
                "name": "orders",
                "resource_path": "/v1/orders",
                "supports_paging": true,
            }],
        }))
        .unwrap();
        let opts = spec.tables[0].paging.as_ref().unwrap();
        assert_eq!(opts.strategy, "offsetAndCount");
        assert_eq!(opts.page_size, 100);
    }

    #[test]
    fn test_pager_options_validated_at_parse_time() {
        let err = AdapterSpec::parse(&minimal_spec(json!({
            "name": "orders",
            "resource_path": "/v1/orders",
            "supports_paging": true,
            "paging": {"strategy": "pageAndCount", "page_size": 50},
        })))
        .unwrap_err();
        assert!(matches!(err, RestError::Config(_)));
    }

    #[test]
    fn test_refresh_updates_requires_params() {
        let err = AdapterSpec::parse(&minimal_spec(json!({
            "name": "orders",
            "resource_path": "/v1/orders",
            "key_columns": "id",
            "refresh": {"strategy": "updates"},
        })))
        .unwrap_err();
        assert!(matches!(err, RestError::Config(_)));
    }

    #[test]
    fn test_refresh_params_must_be_strings() {
        let err = AdapterSpec::parse(&minimal_spec(json!({
            "name": "orders",
            "resource_path": "/v1/orders",
            "key_columns": "id",
            "refresh": {"strategy": "updates", "params": {"since": 12}},
        })))
        .unwrap_err();
        assert!(matches!(err, RestError::Config(_)));
    }

    #[test]
    fn test_view_requires_name_from_query() {
        let err = AdapterSpec::parse(&json!({
            "name": "shop",
            "base_url": "https://api.example.com",
            "tables": [],
            "views": [{"name": "recent"}],
        }))
        .unwrap_err();
        assert!(matches!(err, RestError::Config(_)));
    }

    #[test]
    fn test_key_columns_accepts_string_or_list() {
        let spec = AdapterSpec::parse(&minimal_spec(json!({
            "name": "orders",
            "resource_path": "/v1/orders",
            "key_columns": "id",
        })))
        .unwrap();
        assert_eq!(spec.tables[0].key(), Some("id"));

        let spec = AdapterSpec::parse(&minimal_spec(json!({
            "name": "orders",
            "resource_path": "/v1/orders",
            "key_columns": ["id", "region"],
        })))
        .unwrap();
        assert_eq!(spec.tables[0].key_columns.len(), 2);
    }
}

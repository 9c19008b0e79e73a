//! A configured REST adapter: one connected system and its tables.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::info;

use crate::auth::AuthConfig;
use crate::engine::{QueryTarget, ResourceQuery};
use crate::error::RestError;
use crate::params::ParamQuerySource;
use crate::schema::{AdapterSpec, TableSpec, ViewSpec};
use crate::transport::RestTransport;

/// An adapter spec bound to resolved credentials.
pub struct RestAdapter {
    spec: AdapterSpec,
    /// Auth as written in the spec, before connection options were applied.
    auth_template: AuthConfig,
    auth: AuthConfig,
}

impl RestAdapter {
    /// Parse an adapter document.
    pub fn new(doc: &Value) -> Result<Self, RestError> {
        let spec = AdapterSpec::parse(doc)?;
        let auth_template = spec.auth.clone();
        let auth = spec.auth.clone();
        Ok(Self {
            spec,
            auth_template,
            auth,
        })
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &AdapterSpec {
        &self.spec
    }

    pub fn list_tables(&self) -> &[TableSpec] {
        &self.spec.tables
    }

    pub fn list_views(&self) -> &[ViewSpec] {
        &self.spec.views
    }

    pub fn lookup_table(&self, name: &str) -> Result<&TableSpec, RestError> {
        self.spec
            .lookup_table(name)
            .ok_or_else(|| RestError::Config(format!("no table '{name}' in adapter {}", self.spec.name)))
    }

    /// Apply connection options (possibly env-var references) to the
    /// spec's auth block.
    pub fn resolve_auth(&mut self, options: &BTreeMap<String, String>) -> Result<(), RestError> {
        self.auth = self.auth_template.resolve(options)?;
        Ok(())
    }

    /// Check that every required auth parameter was actually supplied: a
    /// value still equal to its spec placeholder means the connection never
    /// provided it.
    pub fn validate(&self) -> Result<(), RestError> {
        for (key, placeholder, value) in auth_fields(&self.auth_template, &self.auth) {
            if placeholder == value {
                return Err(RestError::Config(format!(
                    "cannot validate auth for {} adapter, missing required auth parameter: {key}",
                    self.spec.name
                )));
            }
        }
        Ok(())
    }

    /// The per-scan query context for this adapter.
    pub fn query_target(&self) -> QueryTarget<'_> {
        QueryTarget {
            base_url: &self.spec.base_url,
            schema: &self.spec.name,
            auth: self.auth.prepare(),
            throttle_secs: self.spec.throttle.map(|t| t.sleep_secs),
        }
    }

    /// Start a scan of one of this adapter's tables.
    pub async fn query_resource<'a>(
        &'a self,
        table: &'a TableSpec,
        transport: Arc<dyn RestTransport>,
        source: &dyn ParamQuerySource,
    ) -> Result<ResourceQuery<'a>, RestError> {
        ResourceQuery::start(table, self.query_target(), transport, source).await
    }

    /// Verify credentials by fetching a single page of the first table that
    /// needs only one API call. Unlike a normal scan, any page-loop failure
    /// here is a hard error.
    pub async fn test_connection(
        &self,
        transport: Arc<dyn RestTransport>,
        source: &dyn ParamQuerySource,
    ) -> Result<(), RestError> {
        for table in &self.spec.tables {
            if table.has_multivalue_parameters() {
                continue;
            }
            let mut query = self.query_resource(table, transport.clone(), source).await?;
            if let Some(page) = query.next_page().await? {
                page.size_return.set(0);
            }
            if let Some(message) = query.last_error() {
                return Err(RestError::Unauthorized(message.to_string()));
            }
            info!("connection test succeeded against {}", table.name);
            return Ok(());
        }
        Ok(())
    }
}

/// Flatten the configurable fields of an auth pair for validation.
fn auth_fields(template: &AuthConfig, resolved: &AuthConfig) -> Vec<(String, String, String)> {
    match (template, resolved) {
        (
            AuthConfig::Basic {
                username: tu,
                password: tp,
            },
            AuthConfig::Basic {
                username: ru,
                password: rp,
            },
        ) => vec![
            ("username".to_string(), tu.clone(), ru.clone()),
            ("password".to_string(), tp.clone(), rp.clone()),
        ],
        (AuthConfig::Bearer { token: t }, AuthConfig::Bearer { token: r }) => {
            vec![("bearer_token".to_string(), t.clone(), r.clone())]
        }
        (AuthConfig::Headers(t), AuthConfig::Headers(r))
        | (AuthConfig::Params(t), AuthConfig::Params(r)) => t
            .iter()
            .filter_map(|(k, tv)| r.get(k).map(|rv| (k.clone(), tv.clone(), rv.clone())))
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc() -> Value {
        json!({
            "name": "shop",
            "base_url": "https://api.example.com",
            "auth": {"type": "BASIC", "params": {"username": "USERNAME", "password": "PASSWORD"}},
            "tables": [{"name": "orders", "resource_path": "/v1/orders"}],
        })
    }

    #[test]
    fn test_validate_fails_on_unresolved_placeholder() {
        let adapter = RestAdapter::new(&doc()).unwrap();
        let err = adapter.validate().unwrap_err();
        assert!(err.to_string().contains("username"));
    }

    #[test]
    fn test_validate_passes_after_resolution() {
        let mut adapter = RestAdapter::new(&doc()).unwrap();
        let mut opts = BTreeMap::new();
        opts.insert("username".to_string(), "alice".to_string());
        opts.insert("password".to_string(), "s3cret".to_string());
        adapter.resolve_auth(&opts).unwrap();
        adapter.validate().unwrap();
    }

    #[test]
    fn test_no_auth_validates() {
        let adapter = RestAdapter::new(&json!({
            "name": "shop",
            "base_url": "https://api.example.com",
            "tables": [],
        }))
        .unwrap();
        adapter.validate().unwrap();
    }

    #[test]
    fn test_lookup_table() {
        let adapter = RestAdapter::new(&doc()).unwrap();
        assert!(adapter.lookup_table("orders").is_ok());
        assert!(adapter.lookup_table("missing").is_err());
    }
}

//! Refresh strategies for already-loaded tables.
//!
//! The strategy is fixed at table-definition time. `reload` re-runs the
//! normal scan and asks the caller to replace the table contents wholesale;
//! `updates` filters the scan with a watermark timestamp interpolated into
//! the table's refresh parameters.

use chrono::{DateTime, Utc};

use crate::error::RestError;
use crate::params::ParamValue;
use crate::schema::{RefreshKind, TableSpec};

/// Contract for re-syncing an existing table.
pub trait TableUpdater: Send + Sync {
    /// True when results should load into a staging table that replaces the
    /// existing one, rather than being appended/merged in place.
    fn should_replace(&self) -> bool;

    /// The table spec to scan with. For the updates strategy this is a
    /// private copy with the watermark-filtered parameters; the original
    /// spec is never touched.
    fn table(&self) -> &TableSpec;
}

/// Build the updater configured for a table.
pub fn updater_for(
    table: &TableSpec,
    updates_since: DateTime<Utc>,
) -> Result<Box<dyn TableUpdater>, RestError> {
    match table.refresh.as_ref().map(|r| r.strategy) {
        None | Some(RefreshKind::Reload) => Ok(Box::new(ReloadStrategy::new(table))),
        Some(RefreshKind::Updates) => {
            Ok(Box::new(UpdatesStrategy::new(table, updates_since)?))
        }
    }
}

/// Replace-the-whole-table refresh. Delegates to the normal scan verbatim.
pub struct ReloadStrategy {
    table: TableSpec,
}

impl ReloadStrategy {
    pub fn new(table: &TableSpec) -> Self {
        Self {
            table: table.clone(),
        }
    }
}

impl TableUpdater for ReloadStrategy {
    fn should_replace(&self) -> bool {
        true
    }

    fn table(&self) -> &TableSpec {
        &self.table
    }
}

/// Watermark-filtered refresh: scans only records changed since the last
/// sync and merges them by key.
#[derive(Debug)]
pub struct UpdatesStrategy {
    table: TableSpec,
    key: String,
}

impl UpdatesStrategy {
    pub fn new(table: &TableSpec, updates_since: DateTime<Utc>) -> Result<Self, RestError> {
        let key = table
            .key()
            .ok_or_else(|| {
                RestError::Config(format!(
                    "table '{}' needs to define a key to use 'updates' refresh strategy",
                    table.name
                ))
            })?
            .to_string();
        let refresh = table.refresh.as_ref().ok_or_else(|| {
            RestError::Config(format!("table '{}' has no refresh spec", table.name))
        })?;
        if refresh.params.is_empty() {
            return Err(RestError::Config(format!(
                "table '{}' missing 'params' for 'updates' refresh strategy",
                table.name
            )));
        }
        let date_format = table.query_date_format.as_deref().ok_or_else(|| {
            RestError::Config(format!(
                "table '{}' needs a queryDateFormat to use 'updates' refresh strategy",
                table.name
            ))
        })?;
        let timestamp = updates_since.format(date_format).to_string();

        // Query through a copy with the interpolated params; the original
        // spec keeps its static params.
        let mut overridden = table.clone();
        overridden.params = refresh
            .params
            .iter()
            .map(|(name, template)| {
                (
                    name.clone(),
                    ParamValue::Literal(template.replace("${timestamp}", &timestamp)),
                )
            })
            .collect();

        Ok(Self {
            table: overridden,
            key,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl TableUpdater for UpdatesStrategy {
    fn should_replace(&self) -> bool {
        false
    }

    fn table(&self) -> &TableSpec {
        &self.table
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::AdapterSpec;
    use chrono::TimeZone;
    use serde_json::{json, Value};

    fn table(spec: Value) -> TableSpec {
        AdapterSpec::parse(&json!({
            "name": "shop",
            "base_url": "https://api.example.com",
            "queryDateFormat": "%Y-%m-%dT%H:%M:%S",
            "tables": [spec],
        }))
        .unwrap()
        .tables
        .remove(0)
    }

    fn since() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 4, 1, 12, 30, 0).unwrap()
    }

    #[test]
    fn test_default_strategy_is_reload() {
        let spec = table(json!({"name": "orders", "resource_path": "/v1/orders"}));
        let updater = updater_for(&spec, since()).unwrap();
        assert!(updater.should_replace());
    }

    #[test]
    fn test_updates_requires_key() {
        let spec = table(json!({
            "name": "orders",
            "resource_path": "/v1/orders",
            "refresh": {"strategy": "updates", "params": {"since": "${timestamp}"}},
        }));
        let err = UpdatesStrategy::new(&spec, since()).unwrap_err();
        assert!(err.to_string().contains("key"));
    }

    #[test]
    fn test_updates_interpolates_watermark() {
        let spec = table(json!({
            "name": "orders",
            "resource_path": "/v1/orders",
            "key_columns": "id",
            "refresh": {"strategy": "updates",
                        "params": {"updated_since": "${timestamp}", "order": "asc"}},
        }));
        let updater = UpdatesStrategy::new(&spec, since()).unwrap();
        assert!(!updater.should_replace());
        assert_eq!(updater.key(), "id");

        let params = &updater.table().params;
        let updated = params
            .iter()
            .find(|(name, _)| name == "updated_since")
            .unwrap();
        assert_eq!(
            updated.1,
            ParamValue::Literal("2023-04-01T12:30:00".to_string())
        );
    }

    #[test]
    fn test_original_params_untouched() {
        let spec = table(json!({
            "name": "orders",
            "resource_path": "/v1/orders",
            "key_columns": "id",
            "params": {"state": "all"},
            "refresh": {"strategy": "updates", "params": {"since": "${timestamp}"}},
        }));
        let before = spec.params.clone();
        let _updater = UpdatesStrategy::new(&spec, since()).unwrap();
        assert_eq!(spec.params, before);
    }
}

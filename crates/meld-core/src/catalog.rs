//! Catalog rows and the catalog store contract.
//!
//! Two catalog tables back `list_schemas`/`list_tables` on every backend: a
//! `schemata` table and a `tables` table. A third `scans` table records the
//! start/completion of table loads and is the watermark source for
//! incremental refreshes.

use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;
use crate::handle::TableHandle;
use crate::signals::{SignalEvent, SignalHandler};

/// One row of the `schemata` catalog table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemataRow {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub description: Option<String>,
}

impl SchemataRow {
    pub fn new(name: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            kind: "schema".to_string(),
            created: Utc::now(),
            description: None,
        }
    }
}

/// One row of the `tables` catalog table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableRow {
    pub id: String,
    pub table_name: String,
    pub table_schema: String,
    #[serde(default)]
    pub connection: Option<String>,
    #[serde(default)]
    pub refresh_schedule: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    pub created: DateTime<Utc>,
}

impl TableRow {
    /// Build a row for a freshly created table, picking up the optional
    /// metadata carried in the handle's `table_opts`.
    pub fn from_handle(table: &TableHandle) -> Self {
        let opts = table.table_opts();
        Self {
            id: Uuid::new_v4().to_string(),
            table_name: table.table_root().to_string(),
            table_schema: table.schema().to_string(),
            connection: opts.get("connection").cloned(),
            refresh_schedule: opts.get("refresh_schedule").cloned(),
            description: opts.get("description").cloned(),
            source: opts.get("source").cloned(),
            created: Utc::now(),
        }
    }
}

/// One row of the `scans` catalog table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanRow {
    pub id: String,
    pub table_name: String,
    pub table_schema: String,
    #[serde(default)]
    pub connection: Option<String>,
    /// Free-form scan payload, e.g. `{"scan_start": <epoch secs>}`.
    pub values: serde_json::Value,
    pub created: DateTime<Utc>,
}

/// Persistent catalog metadata for one warehouse.
///
/// Mutations mirror the signal semantics: create is delete-then-insert,
/// rename updates the existing row in place, a schema drop cascades to the
/// rows scoped to that schema.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn apply(&self, event: &SignalEvent) -> Result<(), CoreError>;

    async fn list_schemas(&self) -> Result<Vec<String>, CoreError>;

    async fn list_tables(&self, schema: Option<&str>) -> Result<Vec<TableRow>, CoreError>;

    /// Record a scan event for a table.
    async fn record_scan(
        &self,
        table: &TableHandle,
        connection: &str,
        values: serde_json::Value,
    ) -> Result<(), CoreError>;

    /// Most recent scan payloads for a table, newest first.
    async fn last_scans(
        &self,
        table: &TableHandle,
        limit: usize,
    ) -> Result<Vec<serde_json::Value>, CoreError>;
}

/// The built-in signal handler keeping a [`CatalogStore`] in sync.
pub struct CatalogSync<S: CatalogStore> {
    store: std::sync::Arc<S>,
}

impl<S: CatalogStore> CatalogSync<S> {
    pub fn new(store: std::sync::Arc<S>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl<S: CatalogStore> SignalHandler for CatalogSync<S> {
    async fn handle(&self, event: &SignalEvent) -> Result<(), CoreError> {
        self.store.apply(event).await
    }
}

/// In-memory catalog store used by the embedded backend and tests.
#[derive(Default)]
pub struct MemoryCatalog {
    state: RwLock<CatalogState>,
}

#[derive(Default)]
struct CatalogState {
    schemata: Vec<SchemataRow>,
    tables: Vec<TableRow>,
    scans: Vec<ScanRow>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the table rows, for mirroring into an engine.
    pub fn table_rows(&self) -> Vec<TableRow> {
        self.state.read().unwrap().tables.clone()
    }

    /// Snapshot of the schema rows.
    pub fn schema_rows(&self) -> Vec<SchemataRow> {
        self.state.read().unwrap().schemata.clone()
    }
}

#[async_trait]
impl CatalogStore for MemoryCatalog {
    async fn apply(&self, event: &SignalEvent) -> Result<(), CoreError> {
        let mut state = self.state.write().unwrap();
        match event {
            SignalEvent::SchemaCreate { schema } => {
                state.schemata.retain(|row| row.name != *schema);
                state.schemata.push(SchemataRow::new(schema));
            }
            SignalEvent::SchemaDrop { schema } => {
                state.schemata.retain(|row| row.name != *schema);
                state.tables.retain(|row| row.table_schema != *schema);
                state.scans.retain(|row| row.table_schema != *schema);
            }
            SignalEvent::TableCreate { table } => {
                state.tables.retain(|row| {
                    !(row.table_name == table.table_root() && row.table_schema == table.schema())
                });
                state.tables.push(TableRow::from_handle(table));
            }
            SignalEvent::TableDrop { table } => {
                state.tables.retain(|row| {
                    !(row.table_name == table.table_root() && row.table_schema == table.schema())
                });
            }
            SignalEvent::TableRename { old, new } => {
                for row in state.tables.iter_mut() {
                    if row.table_name == old.table_root() && row.table_schema == old.schema() {
                        row.table_name = new.table_root().to_string();
                        row.table_schema = new.schema().to_string();
                    }
                }
            }
            SignalEvent::TableLoaded { .. } => {}
        }
        Ok(())
    }

    async fn list_schemas(&self) -> Result<Vec<String>, CoreError> {
        let state = self.state.read().unwrap();
        let mut names: Vec<String> = state
            .schemata
            .iter()
            .filter(|row| row.kind == "schema")
            .map(|row| row.name.clone())
            .collect();
        names.push("information_schema".to_string());
        names.sort();
        names.dedup();
        Ok(names)
    }

    async fn list_tables(&self, schema: Option<&str>) -> Result<Vec<TableRow>, CoreError> {
        let state = self.state.read().unwrap();
        let mut rows: Vec<TableRow> = state
            .tables
            .iter()
            .filter(|row| schema.is_none_or(|s| row.table_schema == s))
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            (a.table_schema.as_str(), a.table_name.as_str())
                .cmp(&(b.table_schema.as_str(), b.table_name.as_str()))
        });
        Ok(rows)
    }

    async fn record_scan(
        &self,
        table: &TableHandle,
        connection: &str,
        values: serde_json::Value,
    ) -> Result<(), CoreError> {
        let mut state = self.state.write().unwrap();
        state.scans.push(ScanRow {
            id: Uuid::new_v4().to_string(),
            table_name: table.table_root().to_string(),
            table_schema: table.schema().to_string(),
            connection: Some(connection.to_string()),
            values,
            created: Utc::now(),
        });
        Ok(())
    }

    async fn last_scans(
        &self,
        table: &TableHandle,
        limit: usize,
    ) -> Result<Vec<serde_json::Value>, CoreError> {
        let state = self.state.read().unwrap();
        let mut scans: Vec<&ScanRow> = state
            .scans
            .iter()
            .filter(|row| {
                row.table_name == table.table_root() && row.table_schema == table.schema()
            })
            .collect();
        scans.sort_by(|a, b| b.created.cmp(&a.created));
        Ok(scans
            .into_iter()
            .take(limit)
            .map(|row| row.values.clone())
            .collect())
    }
}

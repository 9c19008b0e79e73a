//! The embedded analytical backend, built on a DataFusion session.
//!
//! Physical names equal logical names. Tables are MemTable-backed; appends
//! collect the current contents and re-register the combined batches. The
//! catalog lives in memory and is mirrored into `information_schema` tables
//! so it stays queryable through SQL.

use std::sync::{Arc, Mutex};

use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use datafusion::datasource::MemTable;
use datafusion::prelude::SessionContext;
use serde_json::{Map, Value};
use tracing::debug;

use meld_core::batches::{align_batch, combine_batches, rows_to_batch};
use meld_core::{
    CatalogStore, CatalogSync, ColumnDesc, CoreError, DbManager, MemoryCatalog, NamePolicy,
    SignalBus, SignalEvent, SignalHandler, TableHandle, TableRow,
};

use crate::rewrite::query_intel;
use crate::util::wildcard_match;

/// Process-wide embedded engine state: one DataFusion context and one
/// catalog, shared by every session acquired from the pool.
pub struct EmbeddedPool {
    ctx: SessionContext,
    catalog: Arc<MemoryCatalog>,
}

impl EmbeddedPool {
    pub fn new() -> Self {
        Self {
            ctx: SessionContext::new(),
            catalog: Arc::new(MemoryCatalog::new()),
        }
    }

    /// The pool's catalog store.
    pub fn catalog(&self) -> Arc<MemoryCatalog> {
        self.catalog.clone()
    }

    /// Acquire a session. The session's signal bus carries the built-in
    /// catalog handlers; dropping the session deregisters them.
    pub fn session(&self) -> EmbeddedSession {
        let bus = SignalBus::new();
        bus.on_lifecycle(Arc::new(CatalogSync::new(self.catalog.clone())));
        bus.on_lifecycle(Arc::new(CatalogMirror {
            ctx: self.ctx.clone(),
            catalog: self.catalog.clone(),
        }));
        EmbeddedSession {
            ctx: self.ctx.clone(),
            catalog: self.catalog.clone(),
            naming: NamePolicy::Passthrough,
            bus,
            recent_tables: Mutex::new(Vec::new()),
        }
    }
}

impl Default for EmbeddedPool {
    fn default() -> Self {
        Self::new()
    }
}

/// One session against the embedded engine.
pub struct EmbeddedSession {
    ctx: SessionContext,
    catalog: Arc<MemoryCatalog>,
    naming: NamePolicy,
    bus: SignalBus,
    recent_tables: Mutex<Vec<TableHandle>>,
}

impl EmbeddedSession {
    /// Tables referenced by the most recent `execute` call.
    pub fn recent_tables(&self) -> Vec<TableHandle> {
        self.recent_tables.lock().unwrap().clone()
    }

    fn table_ref(&self, table: &TableHandle) -> datafusion::common::TableReference {
        datafusion::common::TableReference::partial(
            table.schema().to_string(),
            table.table_root().to_string(),
        )
    }

    async fn table_schema(&self, table: &TableHandle) -> Result<SchemaRef, CoreError> {
        let df = self
            .ctx
            .table(self.table_ref(table))
            .await
            .map_err(|e| map_df_error(e, &self.naming))?;
        Ok(Arc::new(Schema::from(df.schema())))
    }

    async fn collect_table(&self, table: &TableHandle) -> Result<Vec<RecordBatch>, CoreError> {
        self.ctx
            .table(self.table_ref(table))
            .await
            .map_err(|e| map_df_error(e, &self.naming))?
            .collect()
            .await
            .map_err(|e| map_df_error(e, &self.naming))
    }

    fn register(
        &self,
        table: &TableHandle,
        schema: SchemaRef,
        batches: Vec<RecordBatch>,
    ) -> Result<(), CoreError> {
        let _ = self.ctx.deregister_table(self.table_ref(table));
        let mem = MemTable::try_new(schema, vec![batches])
            .map_err(|e| map_df_error(e, &self.naming))?;
        self.ctx
            .register_table(self.table_ref(table), Arc::new(mem))
            .map_err(|e| map_df_error(e, &self.naming))?;
        Ok(())
    }
}

#[async_trait]
impl DbManager for EmbeddedSession {
    fn dialect(&self) -> &'static str {
        "datafusion"
    }

    fn naming(&self) -> &NamePolicy {
        &self.naming
    }

    fn bus(&self) -> &SignalBus {
        &self.bus
    }

    async fn execute(&self, query: &str) -> Result<Vec<RecordBatch>, CoreError> {
        let intel = query_intel(query);
        *self.recent_tables.lock().unwrap() = intel.referenced.clone();

        let df = self
            .ctx
            .sql(query)
            .await
            .map_err(|e| map_df_error(e, &self.naming))?;
        let batches = df
            .collect()
            .await
            .map_err(|e| map_df_error(e, &self.naming))?;

        // Creates and drops written as raw SQL still announce themselves
        for ddl in intel.ddl {
            if let Ok(table) = TableHandle::parse(&ddl.table) {
                let event = match ddl.kind {
                    meld_core::SignalKind::TableCreate => SignalEvent::TableCreate { table },
                    _ => SignalEvent::TableDrop { table },
                };
                self.bus.emit(event).await;
            }
        }
        Ok(batches)
    }

    async fn create_schema(&self, schema: &str) -> Result<(), CoreError> {
        self.ctx
            .sql(&format!("CREATE SCHEMA IF NOT EXISTS {schema}"))
            .await
            .map_err(|e| map_df_error(e, &self.naming))?;
        self.bus
            .emit(SignalEvent::SchemaCreate {
                schema: schema.to_string(),
            })
            .await;
        Ok(())
    }

    async fn drop_schema(&self, schema: &str, cascade: bool) -> Result<(), CoreError> {
        let suffix = if cascade { " CASCADE" } else { "" };
        self.ctx
            .sql(&format!("DROP SCHEMA IF EXISTS {schema}{suffix}"))
            .await
            .map_err(|e| map_df_error(e, &self.naming))?;
        self.bus
            .emit(SignalEvent::SchemaDrop {
                schema: schema.to_string(),
            })
            .await;
        Ok(())
    }

    async fn create_table(
        &self,
        table: &TableHandle,
        columns: &[(String, String)],
    ) -> Result<(), CoreError> {
        let mut fields = Vec::new();
        for (name, type_name) in columns {
            // A '*' prefix marks the key column; '__'-prefixed entries are
            // directives for other backends, not columns.
            let name = match name.strip_prefix('*') {
                Some(stripped) => stripped,
                None if name.starts_with("__") => continue,
                None => name,
            };
            fields.push(Field::new(name, sql_type_to_arrow(type_name), true));
        }
        let schema = Arc::new(Schema::new(fields));
        self.register(table, schema, Vec::new())?;
        self.bus
            .emit(SignalEvent::TableCreate {
                table: table.clone(),
            })
            .await;
        Ok(())
    }

    async fn drop_table(&self, table: &TableHandle) -> Result<(), CoreError> {
        let _ = self.ctx.deregister_table(self.table_ref(table));
        self.bus
            .emit(SignalEvent::TableDrop {
                table: table.clone(),
            })
            .await;
        Ok(())
    }

    async fn rename_table(&self, table: &TableHandle, new_name: &str) -> Result<(), CoreError> {
        if new_name.contains('.') {
            return Err(CoreError::QuerySyntax(
                "cannot specify schema when renaming table".to_string(),
            ));
        }
        let schema = self.table_schema(table).await?;
        let batches = self.collect_table(table).await?;
        let new_table = TableHandle::new(new_name, Some(table.schema()))?;
        self.register(&new_table, schema, batches)?;
        let _ = self.ctx.deregister_table(self.table_ref(table));
        self.bus
            .emit(SignalEvent::TableRename {
                old: table.clone(),
                new: new_table,
            })
            .await;
        Ok(())
    }

    async fn table_exists(&self, table: &TableHandle) -> Result<bool, CoreError> {
        self.ctx
            .table_exist(self.table_ref(table))
            .map_err(|e| map_df_error(e, &self.naming))
    }

    async fn write_batches(
        &self,
        table: &TableHandle,
        batches: Vec<RecordBatch>,
    ) -> Result<(), CoreError> {
        let combined = combine_batches(&batches)?;
        self.register(table, combined.schema(), vec![combined])?;
        self.bus
            .emit(SignalEvent::TableCreate {
                table: table.clone(),
            })
            .await;
        Ok(())
    }

    async fn append_batches(
        &self,
        table: &TableHandle,
        batches: Vec<RecordBatch>,
    ) -> Result<(), CoreError> {
        let schema = self.table_schema(table).await?;
        let mut combined = self.collect_table(table).await?;
        for batch in &batches {
            combined.push(align_batch(batch, schema.clone())?);
        }
        self.register(table, schema, combined)?;
        Ok(())
    }

    async fn replace_table(
        &self,
        source: &TableHandle,
        dest: &TableHandle,
    ) -> Result<(), CoreError> {
        let schema = self.table_schema(source).await?;
        let batches = self.collect_table(source).await?;
        self.register(dest, schema, batches)?;
        let _ = self.ctx.deregister_table(self.table_ref(source));
        self.bus
            .emit(SignalEvent::TableDrop {
                table: source.clone(),
            })
            .await;
        self.bus
            .emit(SignalEvent::TableCreate {
                table: dest.clone(),
            })
            .await;
        Ok(())
    }

    async fn delete_rows(&self, table: &TableHandle, where_clause: &str) -> Result<(), CoreError> {
        let schema = self.table_schema(table).await?;
        let remaining = self
            .execute(&format!(
                "SELECT * FROM {} WHERE NOT ({})",
                table, where_clause
            ))
            .await?;
        let aligned: Vec<RecordBatch> = remaining
            .iter()
            .map(|b| align_batch(b, schema.clone()))
            .collect::<Result<_, _>>()?;
        self.register(table, schema, aligned)?;
        Ok(())
    }

    async fn get_table_columns(&self, table: &TableHandle) -> Result<Vec<String>, CoreError> {
        let schema = self.table_schema(table).await?;
        Ok(schema.fields().iter().map(|f| f.name().clone()).collect())
    }

    async fn list_schemas(&self) -> Result<Vec<String>, CoreError> {
        self.catalog.list_schemas().await
    }

    async fn list_tables(&self, schema: Option<&str>) -> Result<Vec<TableRow>, CoreError> {
        self.catalog.list_tables(schema).await
    }

    async fn list_columns(
        &self,
        table: &TableHandle,
        pattern: Option<&str>,
    ) -> Result<Vec<ColumnDesc>, CoreError> {
        let schema = self.table_schema(table).await?;
        let mut columns: Vec<ColumnDesc> = schema
            .fields()
            .iter()
            .filter(|f| pattern.is_none_or(|p| wildcard_match(p, f.name())))
            .map(|f| ColumnDesc {
                column_name: f.name().clone(),
                column_type: f.data_type().to_string(),
            })
            .collect();
        columns.sort_by(|a, b| a.column_name.cmp(&b.column_name));
        Ok(columns)
    }
}

/// Mirrors the in-memory catalog into `information_schema` MemTables after
/// every lifecycle event, so the catalog stays visible to SQL.
struct CatalogMirror {
    ctx: SessionContext,
    catalog: Arc<MemoryCatalog>,
}

impl CatalogMirror {
    fn register_rows(&self, name: &str, rows: Vec<Map<String, Value>>) -> Result<(), CoreError> {
        let table_ref =
            datafusion::common::TableReference::partial("information_schema", name.to_string());
        let _ = self.ctx.deregister_table(table_ref.clone());
        if rows.is_empty() {
            return Ok(());
        }
        let batch = rows_to_batch(&rows)?;
        let mem = MemTable::try_new(batch.schema(), vec![vec![batch]])
            .map_err(|e| CoreError::Backend(e.to_string()))?;
        self.ctx
            .register_table(table_ref, Arc::new(mem))
            .map_err(|e| CoreError::Backend(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl SignalHandler for CatalogMirror {
    async fn handle(&self, _event: &SignalEvent) -> Result<(), CoreError> {
        let _ = self
            .ctx
            .sql("CREATE SCHEMA IF NOT EXISTS information_schema")
            .await;
        let to_rows = |values: Vec<Value>| -> Vec<Map<String, Value>> {
            values
                .into_iter()
                .filter_map(|v| match v {
                    Value::Object(map) => Some(map),
                    _ => None,
                })
                .collect()
        };
        let schema_rows: Vec<Value> = self
            .catalog
            .schema_rows()
            .iter()
            .filter_map(|r| serde_json::to_value(r).ok())
            .collect();
        self.register_rows("schemata", to_rows(schema_rows))?;
        let table_rows: Vec<Value> = self
            .catalog
            .table_rows()
            .iter()
            .filter_map(|r| serde_json::to_value(r).ok())
            .collect();
        self.register_rows("tables", to_rows(table_rows))?;
        debug!("information_schema mirror refreshed");
        Ok(())
    }
}

/// Map a column type name from a table definition onto an Arrow type.
fn sql_type_to_arrow(type_name: &str) -> DataType {
    let lower = type_name.to_lowercase();
    if lower.contains("int") {
        DataType::Int64
    } else if lower.contains("bool") {
        DataType::Boolean
    } else if lower.contains("float") || lower.contains("double") {
        DataType::Float64
    } else if lower.contains("timestamp") || lower.contains("datetime") {
        DataType::Timestamp(TimeUnit::Microsecond, None)
    } else if lower.contains("date") {
        DataType::Date32
    } else {
        // VARCHAR, JSON and anything else stores as text
        DataType::Utf8
    }
}

/// Translate a DataFusion error into the shared taxonomy.
fn map_df_error(e: datafusion::error::DataFusionError, naming: &NamePolicy) -> CoreError {
    let message = e.to_string();
    if (message.contains("not found") || message.contains("No table named"))
        && message.contains("table")
    {
        if let Some(name) = extract_quoted(&message) {
            let logical = logical_from_qualified(&name);
            if let Ok(handle) = naming.logical(&logical) {
                return CoreError::TableMissing {
                    table: handle.user_name(),
                };
            }
            return CoreError::TableMissing { table: logical };
        }
    }
    if message.contains("ParserError") || message.starts_with("SQL error") {
        return CoreError::QuerySyntax(message);
    }
    CoreError::Backend(message)
}

/// First single-quoted token in an error message.
fn extract_quoted(message: &str) -> Option<String> {
    let start = message.find('\'')?;
    let rest = &message[start + 1..];
    let end = rest.find('\'')?;
    Some(rest[..end].to_string())
}

/// Reduce `catalog.schema.table` to `schema.table`.
fn logical_from_qualified(name: &str) -> String {
    let parts: Vec<&str> = name.split('.').collect();
    if parts.len() > 2 {
        parts[parts.len() - 2..].join(".")
    } else {
        name.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Int64Array, StringArray};

    fn orders_handle() -> TableHandle {
        TableHandle::new("orders", Some("sales")).unwrap()
    }

    fn sample_batch(ids: &[i64], regions: &[&str]) -> RecordBatch {
        RecordBatch::try_new(
            Arc::new(Schema::new(vec![
                Field::new("id", DataType::Int64, true),
                Field::new("region", DataType::Utf8, true),
            ])),
            vec![
                Arc::new(Int64Array::from(ids.to_vec())),
                Arc::new(StringArray::from(regions.to_vec())),
            ],
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_write_then_query() {
        let pool = EmbeddedPool::new();
        let session = pool.session();
        session.create_schema("sales").await.unwrap();
        session
            .write_batches(&orders_handle(), vec![sample_batch(&[1, 2], &["e", "w"])])
            .await
            .unwrap();

        let batches = session
            .execute("SELECT id FROM sales.orders ORDER BY id")
            .await
            .unwrap();
        let total: usize = batches.iter().map(|b| b.num_rows()).sum();
        assert_eq!(total, 2);
        assert!(session.table_exists(&orders_handle()).await.unwrap());
    }

    #[tokio::test]
    async fn test_append_combines_rows() {
        let pool = EmbeddedPool::new();
        let session = pool.session();
        session.create_schema("sales").await.unwrap();
        session
            .write_batches(&orders_handle(), vec![sample_batch(&[1], &["e"])])
            .await
            .unwrap();
        session
            .append_batches(&orders_handle(), vec![sample_batch(&[2, 3], &["w", "w"])])
            .await
            .unwrap();

        let batches = session.execute("SELECT * FROM sales.orders").await.unwrap();
        let total: usize = batches.iter().map(|b| b.num_rows()).sum();
        assert_eq!(total, 3);
    }

    #[tokio::test]
    async fn test_missing_table_error_carries_name() {
        let pool = EmbeddedPool::new();
        let session = pool.session();
        session.create_schema("sales").await.unwrap();
        let err = session
            .execute("SELECT * FROM sales.widgets")
            .await
            .unwrap_err();
        match err {
            CoreError::TableMissing { table } => assert!(table.contains("widgets")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_catalog_tracks_writes() {
        let pool = EmbeddedPool::new();
        let session = pool.session();
        session.create_schema("sales").await.unwrap();
        session
            .write_batches(&orders_handle(), vec![sample_batch(&[1], &["e"])])
            .await
            .unwrap();

        let rows = session.list_tables(Some("sales")).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].table_name, "orders");

        session.drop_table(&orders_handle()).await.unwrap();
        assert!(session.list_tables(Some("sales")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_catalog_visible_through_sql() {
        let pool = EmbeddedPool::new();
        let session = pool.session();
        session.create_schema("sales").await.unwrap();
        session
            .write_batches(&orders_handle(), vec![sample_batch(&[1], &["e"])])
            .await
            .unwrap();

        let batches = session
            .execute("SELECT table_name FROM information_schema.tables")
            .await
            .unwrap();
        let total: usize = batches.iter().map(|b| b.num_rows()).sum();
        assert_eq!(total, 1);
    }

    #[tokio::test]
    async fn test_replace_table_swaps_contents() {
        let pool = EmbeddedPool::new();
        let session = pool.session();
        session.create_schema("sales").await.unwrap();
        let staging = TableHandle::new("orders__staging", Some("sales")).unwrap();
        session
            .write_batches(&orders_handle(), vec![sample_batch(&[1], &["e"])])
            .await
            .unwrap();
        session
            .write_batches(&staging, vec![sample_batch(&[7, 8, 9], &["w", "w", "w"])])
            .await
            .unwrap();

        session.replace_table(&staging, &orders_handle()).await.unwrap();

        let batches = session.execute("SELECT * FROM sales.orders").await.unwrap();
        let total: usize = batches.iter().map(|b| b.num_rows()).sum();
        assert_eq!(total, 3);
        assert!(!session.table_exists(&staging).await.unwrap());
        // catalog converges on the surviving table only
        let rows = session.list_tables(Some("sales")).await.unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_rows_filters() {
        let pool = EmbeddedPool::new();
        let session = pool.session();
        session.create_schema("sales").await.unwrap();
        session
            .write_batches(
                &orders_handle(),
                vec![sample_batch(&[1, 2, 3], &["e", "w", "e"])],
            )
            .await
            .unwrap();

        session
            .delete_rows(&orders_handle(), "region = 'e'")
            .await
            .unwrap();

        let batches = session.execute("SELECT * FROM sales.orders").await.unwrap();
        let total: usize = batches.iter().map(|b| b.num_rows()).sum();
        assert_eq!(total, 1);
    }

    #[tokio::test]
    async fn test_rename_updates_catalog_in_place() {
        let pool = EmbeddedPool::new();
        let session = pool.session();
        session.create_schema("sales").await.unwrap();
        session
            .write_batches(&orders_handle(), vec![sample_batch(&[1], &["e"])])
            .await
            .unwrap();

        session
            .rename_table(&orders_handle(), "orders_v2")
            .await
            .unwrap();
        assert!(session
            .rename_table(&orders_handle(), "a.b")
            .await
            .is_err());

        let rows = session.list_tables(Some("sales")).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].table_name, "orders_v2");
    }

    #[tokio::test]
    async fn test_create_table_from_columns() {
        let pool = EmbeddedPool::new();
        let session = pool.session();
        session.create_schema("sales").await.unwrap();
        session
            .create_table(
                &orders_handle(),
                &[
                    ("*id".to_string(), "VARCHAR".to_string()),
                    ("total".to_string(), "INT".to_string()),
                    ("__order".to_string(), "ignored".to_string()),
                ],
            )
            .await
            .unwrap();

        let cols = session.get_table_columns(&orders_handle()).await.unwrap();
        assert_eq!(cols, vec!["id", "total"]);

        let described = session
            .list_columns(&orders_handle(), Some("to*"))
            .await
            .unwrap();
        assert_eq!(described.len(), 1);
        assert_eq!(described[0].column_name, "total");
    }
}

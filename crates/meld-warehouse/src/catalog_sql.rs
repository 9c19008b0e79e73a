//! SQL-backed catalog store for the remote backend.
//!
//! The catalog tables live in the tenant database under their
//! information-schema physical names. Creates are delete-then-insert,
//! renames update the row in place, schema drops cascade.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use uuid::Uuid;

use meld_core::{CatalogStore, CoreError, SignalEvent, TableHandle, TableRow, SCHEMA_SEP};

use crate::remote::HttpSqlClient;
use crate::util::sql_quote;

pub struct SqlCatalog {
    client: HttpSqlClient,
    tenant_db: String,
}

impl SqlCatalog {
    pub fn new(client: HttpSqlClient, tenant_db: String) -> Self {
        Self { client, tenant_db }
    }

    fn schemata(&self) -> String {
        format!("{}.information_schema{}schemata", self.tenant_db, SCHEMA_SEP)
    }

    fn tables(&self) -> String {
        format!("{}.information_schema{}tables", self.tenant_db, SCHEMA_SEP)
    }

    fn scans(&self) -> String {
        format!("{}.information_schema{}scans", self.tenant_db, SCHEMA_SEP)
    }

    /// Create the catalog tables if they are not already there.
    pub async fn ensure(&self) -> Result<(), CoreError> {
        let statements = [
            format!(
                "CREATE TABLE IF NOT EXISTS {} (id String, name String, type String, \
                 created String, description Nullable(String)) \
                 ENGINE = MergeTree() PRIMARY KEY (id)",
                self.schemata()
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (id String, table_name String, \
                 table_schema String, connection Nullable(String), \
                 refresh_schedule Nullable(String), description Nullable(String), \
                 source Nullable(String), created String) \
                 ENGINE = MergeTree() PRIMARY KEY (id)",
                self.tables()
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (id String, table_name String, \
                 table_schema String, connection Nullable(String), \
                 values String, created String) \
                 ENGINE = MergeTree() PRIMARY KEY (id)",
                self.scans()
            ),
        ];
        for statement in &statements {
            self.client.raw(statement).await?;
        }
        Ok(())
    }

    async fn delete_table_row(&self, table: &TableHandle) -> Result<(), CoreError> {
        self.client
            .raw(&format!(
                "ALTER TABLE {} DELETE WHERE table_name = {} AND table_schema = {}",
                self.tables(),
                sql_quote(table.table_root()),
                sql_quote(table.schema())
            ))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl CatalogStore for SqlCatalog {
    async fn apply(&self, event: &SignalEvent) -> Result<(), CoreError> {
        match event {
            SignalEvent::SchemaCreate { schema } => {
                self.client
                    .raw(&format!(
                        "ALTER TABLE {} DELETE WHERE name = {}",
                        self.schemata(),
                        sql_quote(schema)
                    ))
                    .await?;
                let row = row_from_pairs(&[
                    ("id", Value::String(Uuid::new_v4().to_string())),
                    ("name", Value::String(schema.clone())),
                    ("type", Value::String("schema".to_string())),
                    ("created", Value::String(Utc::now().to_rfc3339())),
                    ("description", Value::Null),
                ]);
                self.client.insert_rows(&self.schemata(), &[row]).await
            }
            SignalEvent::SchemaDrop { schema } => {
                self.client
                    .raw(&format!(
                        "ALTER TABLE {} DELETE WHERE name = {}",
                        self.schemata(),
                        sql_quote(schema)
                    ))
                    .await?;
                self.client
                    .raw(&format!(
                        "ALTER TABLE {} DELETE WHERE table_schema = {}",
                        self.tables(),
                        sql_quote(schema)
                    ))
                    .await?;
                self.client
                    .raw(&format!(
                        "ALTER TABLE {} DELETE WHERE table_schema = {}",
                        self.scans(),
                        sql_quote(schema)
                    ))
                    .await?;
                Ok(())
            }
            SignalEvent::TableCreate { table } => {
                self.delete_table_row(table).await?;
                let row_struct = TableRow::from_handle(table);
                let mut row = match serde_json::to_value(&row_struct)? {
                    Value::Object(map) => map,
                    _ => Map::new(),
                };
                row.insert(
                    "created".to_string(),
                    Value::String(row_struct.created.to_rfc3339()),
                );
                self.client.insert_rows(&self.tables(), &[row]).await
            }
            SignalEvent::TableDrop { table } => self.delete_table_row(table).await,
            SignalEvent::TableRename { old, new } => {
                self.client
                    .raw(&format!(
                        "ALTER TABLE {} UPDATE table_name = {}, table_schema = {} \
                         WHERE table_name = {} AND table_schema = {}",
                        self.tables(),
                        sql_quote(new.table_root()),
                        sql_quote(new.schema()),
                        sql_quote(old.table_root()),
                        sql_quote(old.schema())
                    ))
                    .await?;
                Ok(())
            }
            SignalEvent::TableLoaded { .. } => Ok(()),
        }
    }

    async fn list_schemas(&self) -> Result<Vec<String>, CoreError> {
        let rows = self
            .client
            .query_rows(&format!(
                "SELECT name FROM {} WHERE type = 'schema' ORDER BY name",
                self.schemata()
            ))
            .await?;
        let mut names: Vec<String> = rows
            .iter()
            .filter_map(|row| row.get("name").and_then(Value::as_str).map(str::to_string))
            .collect();
        names.push("information_schema".to_string());
        names.sort();
        names.dedup();
        Ok(names)
    }

    async fn list_tables(&self, schema: Option<&str>) -> Result<Vec<TableRow>, CoreError> {
        let filter = schema
            .map(|s| format!(" WHERE table_schema = {}", sql_quote(s)))
            .unwrap_or_default();
        let rows = self
            .client
            .query_rows(&format!(
                "SELECT id, table_name, table_schema, connection, refresh_schedule, \
                 description, source, created FROM {}{} ORDER BY table_schema, table_name",
                self.tables(),
                filter
            ))
            .await?;
        rows.into_iter()
            .map(|row| {
                serde_json::from_value::<TableRow>(Value::Object(row))
                    .map_err(|e| CoreError::Backend(format!("bad catalog row: {e}")))
            })
            .collect()
    }

    async fn record_scan(
        &self,
        table: &TableHandle,
        connection: &str,
        values: Value,
    ) -> Result<(), CoreError> {
        let row = row_from_pairs(&[
            ("id", Value::String(Uuid::new_v4().to_string())),
            ("table_name", Value::String(table.table_root().to_string())),
            ("table_schema", Value::String(table.schema().to_string())),
            ("connection", Value::String(connection.to_string())),
            ("values", Value::String(values.to_string())),
            ("created", Value::String(Utc::now().to_rfc3339())),
        ]);
        self.client.insert_rows(&self.scans(), &[row]).await
    }

    async fn last_scans(
        &self,
        table: &TableHandle,
        limit: usize,
    ) -> Result<Vec<Value>, CoreError> {
        let rows = self
            .client
            .query_rows(&format!(
                "SELECT values FROM {} WHERE table_name = {} AND table_schema = {} \
                 ORDER BY created DESC LIMIT {}",
                self.scans(),
                sql_quote(table.table_root()),
                sql_quote(table.schema()),
                limit
            ))
            .await?;
        Ok(rows
            .iter()
            .filter_map(|row| row.get("values").and_then(Value::as_str))
            .filter_map(|text| serde_json::from_str(text).ok())
            .collect())
    }
}

fn row_from_pairs(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

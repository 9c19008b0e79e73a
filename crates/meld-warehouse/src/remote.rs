//! The remote multi-tenant columnar backend.
//!
//! The store is reached over its HTTP SQL interface. One pool holds the one
//! real client; sessions share it and own their signal bus. Every tenant's
//! tables live in a single `tenant_<id>` database with the logical schema
//! prefixed onto the table name, so incoming SQL goes through the AST
//! rewriter first.

use std::sync::{Arc, Mutex};

use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use meld_core::batches::{batch_to_rows, column_type_for, combine_batches, rows_to_batch};
use meld_core::{
    CatalogStore, CatalogSync, ColumnDesc, CoreError, DbManager, NamePolicy, PhysicalName,
    SignalBus, SignalEvent, TableHandle, TableRow,
};

use crate::catalog_sql::SqlCatalog;
use crate::rewrite::rewrite_for_tenant;
use crate::util::wildcard_match;

/// Connection settings for the remote store.
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub host: String,
    pub user: String,
    pub password: String,
}

impl RemoteConfig {
    pub fn from_env() -> Result<Self, CoreError> {
        let var = |name: &str| {
            std::env::var(name).map_err(|_| CoreError::Config(format!("{name} not set")))
        };
        Ok(Self {
            host: var("DATABASE_HOST")?,
            user: var("DATABASE_USER")?,
            password: var("DATABASE_PASSWORD")?,
        })
    }

    fn endpoint(&self) -> String {
        if self.host.starts_with("http://") || self.host.starts_with("https://") {
            self.host.clone()
        } else {
            format!("http://{}:8123/", self.host)
        }
    }
}

/// Thin SQL-over-HTTP client. Cheap to clone; all clones share the
/// underlying connection pool.
#[derive(Clone)]
pub struct HttpSqlClient {
    http: reqwest::Client,
    endpoint: String,
    user: String,
    password: String,
    naming: NamePolicy,
}

impl HttpSqlClient {
    pub fn new(config: &RemoteConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: config.endpoint(),
            user: config.user.clone(),
            password: config.password.clone(),
            naming: NamePolicy::tenant(&config.user),
        }
    }

    /// Run a statement, returning the raw response body.
    pub async fn raw(&self, sql: &str) -> Result<String, CoreError> {
        debug!("remote sql: {}", sql);
        let response = self
            .http
            .post(&self.endpoint)
            .basic_auth(&self.user, Some(&self.password))
            .body(sql.to_string())
            .send()
            .await
            .map_err(|e| CoreError::Backend(e.to_string()))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| CoreError::Backend(e.to_string()))?;
        if !status.is_success() {
            return Err(map_remote_error(&text, &self.naming));
        }
        Ok(text)
    }

    /// Run a row-returning statement with JSON-lines output.
    pub async fn query_rows(&self, sql: &str) -> Result<Vec<Map<String, Value>>, CoreError> {
        let text = self.raw(&format!("{sql} FORMAT JSONEachRow")).await?;
        text.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str::<Map<String, Value>>(line)
                    .map_err(|e| CoreError::Backend(format!("bad response row: {e}")))
            })
            .collect()
    }

    /// Bulk-insert rows into a physical table.
    pub async fn insert_rows(
        &self,
        physical: &str,
        rows: &[Map<String, Value>],
    ) -> Result<(), CoreError> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut body = format!("INSERT INTO {physical} FORMAT JSONEachRow\n");
        for row in rows {
            body.push_str(&serde_json::to_string(row)?);
            body.push('\n');
        }
        self.raw(&body).await?;
        Ok(())
    }
}

/// Translate remote error text into the shared taxonomy, recovering the
/// logical table name from its physical form when possible.
pub(crate) fn map_remote_error(text: &str, naming: &NamePolicy) -> CoreError {
    if text.contains("doesn't exist") || text.contains("does not exist") {
        if let Some(physical) = token_after(text, "Table ") {
            let table = naming
                .logical(&physical)
                .map(|h| h.user_name())
                .unwrap_or(physical);
            return CoreError::TableMissing { table };
        }
    }
    if text.contains("Syntax error") {
        let message = text.lines().next().unwrap_or(text).to_string();
        return CoreError::QuerySyntax(message);
    }
    let mut message = text.trim().to_string();
    if let Some(pos) = message.find("Stack trace:") {
        message.truncate(pos);
    }
    CoreError::Backend(message)
}

/// The whitespace-delimited token following `marker`, stripped of quoting.
fn token_after(text: &str, marker: &str) -> Option<String> {
    let start = text.find(marker)? + marker.len();
    let token = text[start..].split_whitespace().next()?;
    Some(token.trim_matches(|c| c == '`' || c == '\'' || c == '"').to_string())
}

/// Process-wide remote backend state: the shared client and catalog, plus
/// the lock serializing batch appends.
pub struct RemotePool {
    client: HttpSqlClient,
    tenant_db: String,
    catalog: Arc<SqlCatalog>,
    append_lock: Arc<tokio::sync::Mutex<()>>,
}

impl RemotePool {
    /// Connect and make sure the tenant database and catalog tables exist.
    pub async fn connect(config: RemoteConfig) -> Result<Self, CoreError> {
        let client = HttpSqlClient::new(&config);
        let tenant_db = format!("tenant_{}", config.user);
        client
            .raw(&format!("CREATE DATABASE IF NOT EXISTS {tenant_db}"))
            .await?;
        let catalog = Arc::new(SqlCatalog::new(client.clone(), tenant_db.clone()));
        catalog.ensure().await?;
        Ok(Self {
            client,
            tenant_db,
            catalog,
            append_lock: Arc::new(tokio::sync::Mutex::new(())),
        })
    }

    pub fn session(&self) -> RemoteSession {
        let bus = SignalBus::new();
        bus.on_lifecycle(Arc::new(CatalogSync::new(self.catalog.clone())));
        RemoteSession {
            client: self.client.clone(),
            tenant_db: self.tenant_db.clone(),
            naming: NamePolicy::TenantPrefixed {
                tenant_db: self.tenant_db.clone(),
            },
            catalog: self.catalog.clone(),
            bus,
            append_lock: self.append_lock.clone(),
            recent_tables: Mutex::new(Vec::new()),
        }
    }
}

/// One session against the remote store.
pub struct RemoteSession {
    client: HttpSqlClient,
    tenant_db: String,
    naming: NamePolicy,
    catalog: Arc<SqlCatalog>,
    bus: SignalBus,
    append_lock: Arc<tokio::sync::Mutex<()>>,
    recent_tables: Mutex<Vec<TableHandle>>,
}

impl RemoteSession {
    pub fn recent_tables(&self) -> Vec<TableHandle> {
        self.recent_tables.lock().unwrap().clone()
    }

    fn physical(&self, table: &TableHandle) -> PhysicalName {
        self.naming.physical(table)
    }

    async fn emit_ddl(&self, ddl: Vec<crate::rewrite::CapturedDdl>) {
        for captured in ddl {
            let handle = if captured.table.contains('.') {
                TableHandle::parse(&captured.table)
            } else {
                TableHandle::new(&captured.table, Some("default"))
            };
            if let Ok(table) = handle {
                let event = match captured.kind {
                    meld_core::SignalKind::TableCreate => SignalEvent::TableCreate { table },
                    _ => SignalEvent::TableDrop { table },
                };
                self.bus.emit(event).await;
            }
        }
    }
}

fn returns_rows(sql: &str) -> bool {
    let head = sql.trim_start().to_lowercase();
    ["select", "with", "show", "describe", "desc", "exists"]
        .iter()
        .any(|kw| head.starts_with(kw))
}

#[async_trait]
impl DbManager for RemoteSession {
    fn dialect(&self) -> &'static str {
        "clickhouse"
    }

    fn naming(&self) -> &NamePolicy {
        &self.naming
    }

    fn bus(&self) -> &SignalBus {
        &self.bus
    }

    async fn execute(&self, query: &str) -> Result<Vec<RecordBatch>, CoreError> {
        let outcome = rewrite_for_tenant(query, &self.tenant_db);
        if outcome.sql.starts_with("/* sql rewrite failed") {
            warn!("running query without tenant rewriting: {}", outcome.sql);
        }
        *self.recent_tables.lock().unwrap() = outcome.referenced.clone();

        let batches = if returns_rows(&outcome.sql) {
            let rows = self.client.query_rows(&outcome.sql).await?;
            if rows.is_empty() {
                Vec::new()
            } else {
                vec![rows_to_batch(&rows)?]
            }
        } else {
            self.client.raw(&outcome.sql).await?;
            Vec::new()
        };
        self.emit_ddl(outcome.ddl).await;
        Ok(batches)
    }

    async fn create_schema(&self, schema: &str) -> Result<(), CoreError> {
        // Schemas are purely logical here: registering the schema in the
        // catalog is what "creates" it.
        self.bus
            .emit(SignalEvent::SchemaCreate {
                schema: schema.to_string(),
            })
            .await;
        Ok(())
    }

    async fn drop_schema(&self, schema: &str, cascade: bool) -> Result<(), CoreError> {
        if cascade {
            for row in self.catalog.list_tables(Some(schema)).await? {
                let table = TableHandle::new(&row.table_name, Some(schema))?;
                self.drop_table(&table).await?;
            }
        }
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
        let physical = self.physical(table);
        let mut specs = Vec::new();
        let mut primary_key = String::new();
        let mut ordering = String::new();
        for (name, type_name) in columns {
            let mut name = name.as_str();
            if let Some(stripped) = name.strip_prefix('*') {
                name = stripped;
                primary_key = format!("PRIMARY KEY ({name})");
            } else if name == "__order" {
                ordering = format!("ORDER BY ({type_name})");
                primary_key.clear();
                continue;
            }
            // JSON columns store as plain strings
            let type_name = if type_name.eq_ignore_ascii_case("json") {
                "VARCHAR"
            } else {
                type_name
            };
            specs.push(format!("{name} {type_name}"));
        }
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {physical} ({}) ENGINE = MergeTree() {primary_key} {ordering}",
            specs.join(", ")
        );
        self.client.raw(ddl.trim()).await?;
        self.bus
            .emit(SignalEvent::TableCreate {
                table: table.clone(),
            })
            .await;
        Ok(())
    }

    async fn drop_table(&self, table: &TableHandle) -> Result<(), CoreError> {
        let physical = self.physical(table);
        self.client
            .raw(&format!("DROP TABLE IF EXISTS {physical}"))
            .await?;
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
        let new_table = TableHandle::new(new_name, Some(table.schema()))?;
        let old_physical = self.physical(table);
        let new_physical = self.physical(&new_table);
        self.client
            .raw(&format!("RENAME TABLE {old_physical} TO {new_physical}"))
            .await?;
        self.bus
            .emit(SignalEvent::TableRename {
                old: table.clone(),
                new: new_table,
            })
            .await;
        Ok(())
    }

    async fn table_exists(&self, table: &TableHandle) -> Result<bool, CoreError> {
        let physical = self.physical(table);
        let rows = self
            .client
            .query_rows(&format!("EXISTS TABLE {physical}"))
            .await?;
        Ok(rows
            .first()
            .and_then(|row| row.get("result"))
            .and_then(Value::as_u64)
            .unwrap_or(0)
            == 1)
    }

    async fn write_batches(
        &self,
        table: &TableHandle,
        batches: Vec<RecordBatch>,
    ) -> Result<(), CoreError> {
        let combined = combine_batches(&batches)?;
        let physical = self.physical(table);

        let mut specs = Vec::new();
        for field in combined.schema().fields() {
            specs.push(format!(
                "\"{}\" {}",
                field.name(),
                column_type_for(field.data_type())?
            ));
        }
        let primary_key = combined
            .schema()
            .fields()
            .first()
            .map(|f| format!("PRIMARY KEY (\"{}\")", f.name()))
            .unwrap_or_default();

        self.client
            .raw(&format!("DROP TABLE IF EXISTS {physical}"))
            .await?;
        self.client
            .raw(&format!(
                "CREATE TABLE {physical} ({}) ENGINE = MergeTree() {primary_key}",
                specs.join(", ")
            ))
            .await?;
        self.bus
            .emit(SignalEvent::TableCreate {
                table: table.clone(),
            })
            .await;

        let rows = batch_to_rows(&combined)?;
        self.client.insert_rows(&physical.to_string(), &rows).await
    }

    async fn append_batches(
        &self,
        table: &TableHandle,
        batches: Vec<RecordBatch>,
    ) -> Result<(), CoreError> {
        let _guard = self.append_lock.lock().await;
        let physical = self.physical(table);

        // A page of all-null booleans may have typed the column as String
        // at create time; stringify such values instead of failing the
        // insert.
        let described = self
            .client
            .query_rows(&format!("DESCRIBE TABLE {physical}"))
            .await?;
        let string_columns: Vec<String> = described
            .iter()
            .filter(|row| {
                row.get("type")
                    .and_then(Value::as_str)
                    .is_some_and(|t| t.contains("String") || t.to_lowercase().contains("varchar"))
            })
            .filter_map(|row| row.get("name").and_then(Value::as_str).map(str::to_string))
            .collect();

        for batch in &batches {
            let mut rows = batch_to_rows(batch)?;
            for row in rows.iter_mut() {
                for column in &string_columns {
                    if let Some(value) = row.get_mut(column) {
                        if value.is_boolean() || value.is_number() {
                            *value = Value::String(value.to_string());
                        }
                    }
                }
            }
            self.client.insert_rows(&physical.to_string(), &rows).await?;
        }
        Ok(())
    }

    async fn replace_table(
        &self,
        source: &TableHandle,
        dest: &TableHandle,
    ) -> Result<(), CoreError> {
        let src_physical = self.physical(source);
        let dest_physical = self.physical(dest);
        self.client
            .raw(&format!(
                "EXCHANGE TABLES {src_physical} AND {dest_physical}"
            ))
            .await?;
        self.client
            .raw(&format!("DROP TABLE {src_physical}"))
            .await?;
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
        let physical = self.physical(table);
        self.client
            .raw(&format!("ALTER TABLE {physical} DELETE WHERE {where_clause}"))
            .await?;
        Ok(())
    }

    async fn get_table_columns(&self, table: &TableHandle) -> Result<Vec<String>, CoreError> {
        let physical = self.physical(table);
        let rows = self
            .client
            .query_rows(&format!("DESCRIBE TABLE {physical}"))
            .await?;
        Ok(rows
            .iter()
            .filter_map(|row| row.get("name").and_then(Value::as_str).map(str::to_string))
            .collect())
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
        let physical = self.physical(table);
        let rows = self
            .client
            .query_rows(&format!("DESCRIBE TABLE {physical}"))
            .await?;
        let mut columns: Vec<ColumnDesc> = rows
            .iter()
            .filter_map(|row| {
                let name = row.get("name").and_then(Value::as_str)?;
                let type_name = row.get("type").and_then(Value::as_str)?;
                Some(ColumnDesc {
                    column_name: name.to_string(),
                    column_type: type_name.to_string(),
                })
            })
            .filter(|c| pattern.is_none_or(|p| wildcard_match(p, &c.column_name)))
            .collect();
        columns.sort_by(|a, b| a.column_name.cmp(&b.column_name));
        Ok(columns)
    }
}

//! The table loader: scans, flushes, refreshes.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use meld_core::batches::{batch_to_rows, rows_to_batch};
use meld_core::jsonpath::scalar_to_string;
use meld_core::{CatalogStore, DbManager, SignalEvent, TableHandle};
use meld_rest::{
    updater_for, ParamQuerySource, RestAdapter, RestError, RestTransport, TableSpec,
};
use meld_warehouse::qualify_adapter_query;
use meld_warehouse::util::sql_quote;

use crate::extract::page_to_rows;

/// Flush buffered rows to the backend every this many non-empty pages.
const PAGE_FLUSH_COUNT: u64 = 5;

/// Watermark slop: refresh scans reach back this far before the last scan
/// start, so clock skew against the source system cannot drop records.
const WATERMARK_SLOP_HOURS: i64 = 24;

enum FlushMode {
    /// Initial load (or staging load): first flush creates the table.
    Create,
    /// Update-in-place: delete downloaded keys, then append.
    Update { key: String },
}

/// Loads and refreshes tables for a set of connected adapters.
pub struct TableLoader {
    db: Arc<dyn DbManager>,
    catalog: Arc<dyn CatalogStore>,
    transport: Arc<dyn RestTransport>,
    adapters: RwLock<HashMap<String, Arc<RestAdapter>>>,
}

impl TableLoader {
    pub fn new(
        db: Arc<dyn DbManager>,
        catalog: Arc<dyn CatalogStore>,
        transport: Arc<dyn RestTransport>,
    ) -> Self {
        Self {
            db,
            catalog,
            transport,
            adapters: RwLock::new(HashMap::new()),
        }
    }

    /// Register a connection: the adapter's schema is created in the
    /// warehouse and its tables become loadable.
    pub async fn add_connection(&self, schema: &str, adapter: RestAdapter) -> Result<()> {
        adapter.validate()?;
        self.db
            .create_schema(schema)
            .await
            .with_context(|| format!("creating schema {schema}"))?;
        self.adapters
            .write()
            .unwrap()
            .insert(schema.to_string(), Arc::new(adapter));
        Ok(())
    }

    fn adapter(&self, schema: &str) -> Result<Arc<RestAdapter>> {
        self.adapters
            .read()
            .unwrap()
            .get(schema)
            .cloned()
            .ok_or_else(|| anyhow!("no adapter connected for schema '{schema}'"))
    }

    /// Load a table from its source API into the warehouse.
    pub async fn load_table(&self, table: &TableHandle) -> Result<()> {
        let adapter = self.adapter(table.schema())?;
        let spec = adapter.lookup_table(table.table_root())?.clone();

        let scan_start = Utc::now().timestamp();
        self.catalog
            .record_scan(table, table.schema(), json!({"scan_start": scan_start}))
            .await?;

        self.run_scan(
            &adapter,
            &spec,
            table.schema(),
            table.table_root(),
            FlushMode::Create,
        )
        .await?;
        self.create_views(&adapter, table.schema(), table.table_root())
            .await?;

        self.catalog
            .record_scan(table, table.schema(), json!({"scan_complete": scan_start}))
            .await?;
        self.db
            .bus()
            .emit(SignalEvent::TableLoaded {
                table: table.clone(),
            })
            .await;
        debug!("finished table scan for {}", table);
        Ok(())
    }

    /// Re-sync an already-loaded table per its refresh strategy.
    pub async fn refresh_table(&self, table: &TableHandle) -> Result<()> {
        let adapter = self.adapter(table.schema())?;
        let spec = adapter.lookup_table(table.table_root())?.clone();

        let watermark = self.last_scan_watermark(table).await?;
        let updater = updater_for(&spec, watermark)?;

        let scan_start = Utc::now().timestamp();
        self.catalog
            .record_scan(table, table.schema(), json!({"scan_start": scan_start}))
            .await?;

        if updater.should_replace() {
            // Download into a staging table and swap it in when complete
            let staging_root = format!("{}__staging", spec.name);
            let staging = TableHandle::new(&staging_root, Some(table.schema()))?;
            if self.db.table_exists(&staging).await? {
                self.db.drop_table(&staging).await?;
            }
            self.run_scan(
                &adapter,
                updater.table(),
                table.schema(),
                &staging_root,
                FlushMode::Create,
            )
            .await?;
            self.db.replace_table(&staging, table).await?;
        } else {
            let key = spec
                .key()
                .map(str::to_string)
                .ok_or_else(|| anyhow!("updates refresh without a key column"))?;
            self.run_scan(
                &adapter,
                updater.table(),
                table.schema(),
                table.table_root(),
                FlushMode::Update { key },
            )
            .await?;
        }

        self.catalog
            .record_scan(table, table.schema(), json!({"scan_complete": scan_start}))
            .await?;
        self.db
            .bus()
            .emit(SignalEvent::TableLoaded {
                table: table.clone(),
            })
            .await;
        Ok(())
    }

    /// The timestamp an updates-style refresh should filter from: the most
    /// recent scan start, minus slop. Without any scan record the scan
    /// reaches all the way back.
    async fn last_scan_watermark(&self, table: &TableHandle) -> Result<DateTime<Utc>> {
        let scans = self.catalog.last_scans(table, 3).await?;
        let started = scans
            .iter()
            .find_map(|values| values.get("scan_start").and_then(Value::as_i64));
        Ok(match started {
            Some(secs) => {
                let start = Utc
                    .timestamp_opt(secs, 0)
                    .single()
                    .unwrap_or_else(Utc::now);
                start - chrono::Duration::hours(WATERMARK_SLOP_HOURS)
            }
            None => DateTime::<Utc>::UNIX_EPOCH,
        })
    }

    /// (Re)create the adapter views that depend on the given table.
    async fn create_views(
        &self,
        adapter: &RestAdapter,
        schema: &str,
        table_root: &str,
    ) -> Result<()> {
        for view in adapter.list_views() {
            if !view.from_list.iter().any(|from| from == table_root) {
                continue;
            }
            let query = match &view.query {
                Value::String(query) => query.clone(),
                Value::Object(by_dialect) => {
                    match by_dialect.get(self.db.dialect()).and_then(Value::as_str) {
                        Some(query) => query.to_string(),
                        None => {
                            info!(
                                "skipping view {} with no query for dialect {}",
                                view.name,
                                self.db.dialect()
                            );
                            continue;
                        }
                    }
                }
                _ => continue,
            };
            let qualified = qualify_adapter_query(&query, schema)?;
            self.db
                .execute(&format!("DROP VIEW IF EXISTS {schema}.{}", view.name))
                .await?;
            self.db
                .execute(&format!(
                    "CREATE VIEW {schema}.{} AS {}",
                    view.name, qualified.sql
                ))
                .await?;
        }
        Ok(())
    }

    async fn run_scan(
        &self,
        adapter: &RestAdapter,
        spec: &TableSpec,
        schema: &str,
        target_root: &str,
        mode: FlushMode,
    ) -> Result<()> {
        info!("loading data for table {}.{}", schema, target_root);
        let mut query = adapter
            .query_resource(spec, self.transport.clone(), self)
            .await?;

        let mut buffer: Vec<Map<String, Value>> = Vec::new();
        let mut pages: u64 = 0;
        let mut table_cols: Option<Vec<String>> = None;
        let mut rows_loaded: usize = 0;

        while let Some(page) = query.next_page().await? {
            let mut rows = page_to_rows(&page.json, spec, page.merge_cols.as_ref());
            page.size_return.set(rows.len());
            rows_loaded += rows.len();
            if rows.is_empty() {
                continue;
            }
            // After the first flush fixes the column set, later pages are
            // trimmed to it
            if let Some(cols) = &table_cols {
                for row in &mut rows {
                    row.retain(|name, _| cols.contains(name));
                }
            }
            buffer.extend(rows);
            pages += 1;
            if pages % PAGE_FLUSH_COUNT == 0 {
                self.flush(&mut buffer, adapter, spec, schema, target_root, &mode, &mut table_cols)
                    .await?;
            }
        }
        self.flush(&mut buffer, adapter, spec, schema, target_root, &mode, &mut table_cols)
            .await?;
        info!(
            "saved {} rows into {}.{}",
            rows_loaded, schema, target_root
        );
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn flush(
        &self,
        buffer: &mut Vec<Map<String, Value>>,
        adapter: &RestAdapter,
        spec: &TableSpec,
        schema: &str,
        target_root: &str,
        mode: &FlushMode,
        table_cols: &mut Option<Vec<String>>,
    ) -> Result<()> {
        if buffer.is_empty() {
            return Ok(());
        }
        match mode {
            FlushMode::Create => {
                let batch = rows_to_batch(buffer)?;
                if table_cols.is_none() {
                    let mut opts = BTreeMap::new();
                    opts.insert("connection".to_string(), schema.to_string());
                    if let Some(description) = &spec.description {
                        opts.insert("description".to_string(), description.clone());
                    }
                    opts.insert(
                        "source".to_string(),
                        spec.table_source(adapter.name()).to_string(),
                    );
                    let handle = TableHandle::new(target_root, Some(schema))?.with_opts(opts);
                    if self.db.table_exists(&handle).await? {
                        // table already exists, so assume we are updating
                        self.db.append_batches(&handle, vec![batch.clone()]).await?;
                    } else {
                        self.db.write_batches(&handle, vec![batch.clone()]).await?;
                    }
                    *table_cols = Some(
                        batch
                            .schema()
                            .fields()
                            .iter()
                            .map(|f| f.name().clone())
                            .collect(),
                    );
                } else {
                    let handle = TableHandle::new(target_root, Some(schema))?;
                    self.db.append_batches(&handle, vec![batch]).await?;
                }
            }
            FlushMode::Update { key } => {
                let handle = TableHandle::new(target_root, Some(schema))?;
                let cols = self.db.get_table_columns(&handle).await?;
                for row in buffer.iter_mut() {
                    row.retain(|name, _| cols.contains(name));
                }
                // Remove existing copies of the downloaded rows first
                let keys: Vec<String> = buffer
                    .iter()
                    .filter_map(|row| row.get(key.as_str()))
                    .map(|value| sql_quote(&scalar_to_string(value)))
                    .collect();
                if !keys.is_empty() {
                    self.db
                        .delete_rows(&handle, &format!("{key} IN ({})", keys.join(", ")))
                        .await?;
                }
                let batch = rows_to_batch(buffer)?;
                self.db.append_batches(&handle, vec![batch]).await?;
                if table_cols.is_none() {
                    *table_cols = Some(cols);
                }
            }
        }
        buffer.clear();
        Ok(())
    }
}

#[async_trait::async_trait]
impl ParamQuerySource for TableLoader {
    /// Answer a `sql@(...)` parameter query against the adapter's own
    /// schema, loading any referenced table that is not in the warehouse
    /// yet.
    async fn query_values(&self, schema: &str, sql: &str) -> Result<Vec<Vec<String>>, RestError> {
        let outcome = qualify_adapter_query(sql, schema)
            .map_err(|e| RestError::ParamQuery(e.to_string()))?;

        for handle in &outcome.referenced {
            let exists = self
                .db
                .table_exists(handle)
                .await
                .map_err(|e| RestError::ParamQuery(e.to_string()))?;
            if !exists {
                self.load_table(handle)
                    .await
                    .map_err(|e| RestError::ParamQuery(e.to_string()))?;
            }
        }

        let batches = self
            .db
            .execute(&outcome.sql)
            .await
            .map_err(|e| RestError::ParamQuery(e.to_string()))?;

        let mut rows = Vec::new();
        for batch in &batches {
            for row in batch_to_rows(batch).map_err(|e| RestError::ParamQuery(e.to_string()))? {
                rows.push(row.values().map(scalar_to_string).collect());
            }
        }
        Ok(rows)
    }
}

//! The warehouse backend contract.

use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::catalog::TableRow;
use crate::error::CoreError;
use crate::handle::{NamePolicy, TableHandle};
use crate::signals::SignalBus;

/// Description of one table column, as returned by `list_columns`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnDesc {
    pub column_name: String,
    pub column_type: String,
}

/// A session against one warehouse backend.
///
/// Unlike a raw DBAPI-style wrapper this trait exposes explicit operations
/// for the statements whose syntax diverges between engines (create/drop,
/// bulk batch writes, listings); free-form SQL still goes through `execute`,
/// where the backend may rewrite table references to physical names.
///
/// Sessions are cheap: they share the pool's single real connection and own
/// their signal bus, whose built-in handlers keep the catalog in sync.
#[async_trait]
pub trait DbManager: Send + Sync {
    /// SQL dialect name, for callers that adjust their SQL per backend.
    fn dialect(&self) -> &'static str;

    /// How this backend maps logical names to physical storage names.
    fn naming(&self) -> &NamePolicy;

    /// The session's signal bus.
    fn bus(&self) -> &SignalBus;

    /// Execute SQL, returning result batches (empty for DDL/DML).
    async fn execute(&self, query: &str) -> Result<Vec<RecordBatch>, CoreError>;

    async fn create_schema(&self, schema: &str) -> Result<(), CoreError>;

    async fn drop_schema(&self, schema: &str, cascade: bool) -> Result<(), CoreError>;

    /// Create a table from (column name, column type) pairs. A `*` prefix on
    /// a column name marks the primary key; names starting with `__` are
    /// directives, not columns.
    async fn create_table(
        &self,
        table: &TableHandle,
        columns: &[(String, String)],
    ) -> Result<(), CoreError>;

    async fn drop_table(&self, table: &TableHandle) -> Result<(), CoreError>;

    /// Rename within the same schema; `new_name` must be unqualified.
    async fn rename_table(&self, table: &TableHandle, new_name: &str) -> Result<(), CoreError>;

    async fn table_exists(&self, table: &TableHandle) -> Result<bool, CoreError>;

    /// Create (or replace) a table from record batches.
    async fn write_batches(
        &self,
        table: &TableHandle,
        batches: Vec<RecordBatch>,
    ) -> Result<(), CoreError>;

    /// Append record batches to an existing table.
    async fn append_batches(
        &self,
        table: &TableHandle,
        batches: Vec<RecordBatch>,
    ) -> Result<(), CoreError>;

    /// Atomically swap `source` into `dest`'s place and drop `source`.
    async fn replace_table(
        &self,
        source: &TableHandle,
        dest: &TableHandle,
    ) -> Result<(), CoreError>;

    async fn delete_rows(&self, table: &TableHandle, where_clause: &str) -> Result<(), CoreError>;

    /// Column names in insert order.
    async fn get_table_columns(&self, table: &TableHandle) -> Result<Vec<String>, CoreError>;

    async fn list_schemas(&self) -> Result<Vec<String>, CoreError>;

    async fn list_tables(&self, schema: Option<&str>) -> Result<Vec<TableRow>, CoreError>;

    /// Describe a table's columns, optionally filtered by a `*`/`%` pattern.
    async fn list_columns(
        &self,
        table: &TableHandle,
        pattern: Option<&str>,
    ) -> Result<Vec<ColumnDesc>, CoreError>;
}

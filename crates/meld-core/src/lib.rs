//! Meld Core - shared warehouse contracts
//!
//! This crate defines the pieces the rest of the workspace agrees on:
//! - logical/physical table naming (`TableHandle`, `NamePolicy`)
//! - the signal bus and typed catalog events
//! - catalog row types and the `CatalogStore` contract
//! - the `DbManager` trait implemented by each backend
//! - JSON row <-> Arrow batch conversion helpers

pub mod batches;
pub mod catalog;
pub mod error;
pub mod handle;
pub mod jsonpath;
pub mod manager;
pub mod signals;

pub use catalog::{CatalogStore, CatalogSync, MemoryCatalog, ScanRow, SchemataRow, TableRow};
pub use error::CoreError;
pub use handle::{NamePolicy, PhysicalName, TableHandle, PROTECTED_SCHEMAS, SCHEMA_SEP};
pub use manager::{ColumnDesc, DbManager};
pub use signals::{SignalBus, SignalEvent, SignalHandler, SignalKind};

//! Meld Loader - drives REST adapters into the warehouse
//!
//! The loader owns the full load/refresh cycle: it pulls pages from a
//! table's resource query, extracts tabular rows, flushes them to a backend
//! in buffered batches, keeps scan records for refresh watermarks, and
//! answers the `sql@(...)` parameter queries adapters embed in their specs.

pub mod extract;
pub mod loader;

pub use loader::TableLoader;

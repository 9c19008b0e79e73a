//! Typed errors shared across the warehouse crates.

use thiserror::Error;

/// Errors surfaced by backends and catalog stores.
///
/// Backend wrappers translate raw engine errors into this taxonomy; nothing
/// below that boundary should leak engine-specific error types to callers.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A query referenced a table the backend does not have. Carries the
    /// logical table name so callers can trigger a load and retry.
    #[error("table {table} does not exist")]
    TableMissing { table: String },

    /// The backend rejected the query text.
    #[error("query syntax error: {0}")]
    QuerySyntax(String),

    /// Invalid or missing configuration. Raised at construction time,
    /// never deferred to query time.
    #[error("config error: {0}")]
    Config(String),

    /// Any other backend failure.
    #[error("backend error: {0}")]
    Backend(String),
}

impl From<arrow::error::ArrowError> for CoreError {
    fn from(e: arrow::error::ArrowError) -> Self {
        CoreError::Backend(e.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::Backend(e.to_string())
    }
}

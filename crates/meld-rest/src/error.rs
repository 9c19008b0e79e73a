//! Typed errors for the REST adapter crate.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RestError {
    /// Bad or missing key in an adapter/table spec. Names the offending key
    /// and the table it belongs to.
    #[error("invalid key '{key}' for table definition {table}")]
    InvalidKey { key: String, table: String },

    /// A spec key carries the wrong value type.
    #[error("invalid type for key '{key}' in table definition {table}, expected {expected}")]
    InvalidType {
        key: String,
        table: String,
        expected: &'static str,
    },

    /// Any other configuration problem (paging options, refresh spec, auth).
    #[error("config error: {0}")]
    Config(String),

    /// A resource path placeholder had no value in the merged parameter set.
    #[error("cannot query API resource '{url}': missing API param '{param}' from {params:?}")]
    MissingPathParam {
        url: String,
        param: String,
        params: Vec<String>,
    },

    /// The remote rejected our credentials during connection validation.
    #[error("API call unauthorized: {0}")]
    Unauthorized(String),

    /// Transport-level failure (connect, TLS, body decode).
    #[error("transport error: {0}")]
    Transport(String),

    /// A `sql@(...)` parameter query failed in the backing warehouse.
    #[error("parameter query failed: {0}")]
    ParamQuery(String),
}

impl From<reqwest::Error> for RestError {
    fn from(e: reqwest::Error) -> Self {
        RestError::Transport(e.to_string())
    }
}

impl From<url::ParseError> for RestError {
    fn from(e: url::ParseError) -> Self {
        RestError::Config(format!("bad url: {e}"))
    }
}

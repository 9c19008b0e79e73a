//! Meld Warehouse - backend implementations
//!
//! Two `DbManager` backends share the contracts from `meld-core`:
//! - `embedded`: an in-process DataFusion session, physical names equal
//!   logical names
//! - `remote`: a multi-tenant columnar store reached over its HTTP SQL
//!   interface, with tenant-prefixed physical names and AST-level query
//!   rewriting

pub mod catalog_sql;
pub mod embedded;
pub mod remote;
pub mod rewrite;
pub mod util;

pub use embedded::{EmbeddedPool, EmbeddedSession};
pub use remote::{HttpSqlClient, RemoteConfig, RemotePool, RemoteSession};
pub use rewrite::{
    qualify_adapter_query, query_intel, rewrite_for_tenant, CapturedDdl, RewriteOutcome,
};

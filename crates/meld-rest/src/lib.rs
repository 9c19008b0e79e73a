//! Meld REST - declarative REST API adapters
//!
//! This crate turns a declarative adapter document into table loads:
//! - `schema` parses and validates adapter/table specs
//! - `params` expands declared parameters into concrete API-call sets
//! - `paging` implements the pagination strategies
//! - `engine` drives a table's page loop over HTTP
//! - `refresh` decides how an already-loaded table is re-synced

pub mod adapter;
pub mod auth;
pub mod engine;
pub mod error;
pub mod paging;
pub mod params;
pub mod refresh;
pub mod schema;
pub mod template;
pub mod transport;

pub use adapter::RestAdapter;
pub use engine::{AdapterQueryResult, QueryTarget, ResourceQuery, SizeReturn};
pub use error::RestError;
pub use paging::Pager;
pub use params::{expand_params, ParamQuerySource, ParamSet, ParamValue};
pub use refresh::{updater_for, ReloadStrategy, TableUpdater, UpdatesStrategy};
pub use schema::{AdapterSpec, PagingOptions, RefreshKind, RefreshSpec, TableSpec, ViewSpec};
pub use transport::{HttpTransport, RestRequest, RestResponse, RestTransport};

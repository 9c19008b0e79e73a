//! The resource query engine: drives one table's page loop.
//!
//! A [`ResourceQuery`] is created fresh per scan and pulled page by page.
//! Each parameter set from the expander gets its own pager; the caller must
//! report how many records it extracted from a page through the
//! [`SizeReturn`] slot before pulling the next one, since the pager's
//! continuation decision depends on it.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, error, warn};

use crate::auth::PreparedAuth;
use crate::error::RestError;
use crate::paging::Pager;
use crate::params::{expand_params, ParamQuerySource, ParamSet};
use crate::schema::TableSpec;
use crate::template::interpolate_post_values;
use crate::transport::{RestRequest, RestTransport};

/// Hard bound on the page loop, independent of any strategy's own
/// termination logic.
const SAFETY_MAX_PAGES: u64 = 200_000;

/// Single-slot, set-once channel carrying the record count of the last page
/// back to the pager.
#[derive(Debug, Clone, Default)]
pub struct SizeReturn(Arc<OnceLock<usize>>);

impl SizeReturn {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report the page's record count. Only the first call takes effect.
    pub fn set(&self, size: usize) {
        let _ = self.0.set(size);
    }

    pub fn get(&self) -> Option<usize> {
        self.0.get().copied()
    }
}

/// One page of API results.
#[derive(Debug, Clone)]
pub struct AdapterQueryResult {
    pub json: Value,
    pub size_return: SizeReturn,
    /// Parameter values to merge onto every row of this page.
    pub merge_cols: Option<BTreeMap<String, String>>,
}

/// Where and how to reach the connected system for one scan.
#[derive(Debug, Clone)]
pub struct QueryTarget<'a> {
    pub base_url: &'a str,
    pub schema: &'a str,
    pub auth: PreparedAuth,
    pub throttle_secs: Option<f64>,
}

struct ActiveSet {
    params: ParamSet,
    merge_cols: Option<BTreeMap<String, String>>,
    pager: Pager,
    pages: u64,
    /// Size slot and body of the page most recently yielded for this set.
    last: Option<(SizeReturn, Value)>,
}

/// A running table scan. Finite, not restartable: resumption across scans is
/// the refresh strategy's job.
pub struct ResourceQuery<'a> {
    table: &'a TableSpec,
    target: QueryTarget<'a>,
    transport: Arc<dyn RestTransport>,
    pending: VecDeque<ParamSet>,
    active: Option<ActiveSet>,
    yielded_any: bool,
    last_error: Option<String>,
}

impl<'a> ResourceQuery<'a> {
    /// Expand the table's parameters and prepare the scan.
    pub async fn start(
        table: &'a TableSpec,
        target: QueryTarget<'a>,
        transport: Arc<dyn RestTransport>,
        source: &dyn ParamQuerySource,
    ) -> Result<ResourceQuery<'a>, RestError> {
        let sets = expand_params(&table.params, target.schema, source).await?;
        Ok(Self {
            table,
            target,
            transport,
            pending: sets.into(),
            active: None,
            yielded_any: false,
            last_error: None,
        })
    }

    /// Message of the most recent non-fatal page-loop failure, if any.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Pull the next page. `Ok(None)` means the scan is complete.
    ///
    /// HTTP failures terminate the current parameter set and the scan moves
    /// on to the next one; only configuration problems (a missing path
    /// placeholder) and transport-level failures propagate.
    pub async fn next_page(&mut self) -> Result<Option<AdapterQueryResult>, RestError> {
        loop {
            if self.active.is_none() {
                let Some(params) = self.pending.pop_front() else {
                    return Ok(None);
                };
                let merge_cols = self.table.copy_params_to_output.as_ref().map(|keys| {
                    keys.iter()
                        .filter_map(|k| params.get(k).map(|v| (k.clone(), v.clone())))
                        .collect()
                });
                self.active = Some(ActiveSet {
                    params,
                    merge_cols,
                    pager: Pager::build(self.table.paging.as_ref())?,
                    pages: 0,
                    last: None,
                });
            }

            let exhausted = {
                let active = self.active.as_mut().unwrap();
                match active.last.take() {
                    Some((size_return, last_json)) => match size_return.get() {
                        // Caller never reported the page size; stop this set.
                        None => true,
                        Some(size) => {
                            if !active.pager.next_page(size, &last_json) {
                                true
                            } else if active.pages >= self.table.max_pages {
                                warn!("aborting table scan after {} pages", active.pages);
                                true
                            } else {
                                active.pages >= SAFETY_MAX_PAGES
                            }
                        }
                    },
                    None => false,
                }
            };
            if exhausted {
                self.active = None;
                continue;
            }

            if self.yielded_any {
                if let Some(secs) = self.target.throttle_secs {
                    tokio::time::sleep(Duration::from_secs_f64(secs)).await;
                }
            }

            let (request, url, merge_cols) = {
                let active = self.active.as_ref().unwrap();
                let url =
                    format_url(self.target.base_url, &self.table.query_path, &active.params)?;

                // Pager params join the query after URL templating, so they
                // can never satisfy a path placeholder.
                let mut merged: ParamSet = active.params.clone();
                for (k, v) in active.pager.request_params() {
                    merged.insert(k, v);
                }

                let body = match &self.table.post {
                    Some(post) => {
                        let mut used = Vec::new();
                        let body = interpolate_post_values(post, &merged, &mut used);
                        for key in used {
                            merged.remove(&key);
                        }
                        Some(body)
                    }
                    None => None,
                };

                let query: Vec<(String, String)> =
                    merged.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
                let headers: Vec<(String, String)> = self
                    .table
                    .headers
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                debug!("{} {} {:?}", self.table.method, url, query);

                let request = RestRequest::new(
                    &self.table.method,
                    url.clone(),
                    query,
                    headers,
                    &self.target.auth,
                    body,
                );
                (request, url, active.merge_cols.clone())
            };
            let response = self.transport.execute(request).await?;

            if response.status == 404 {
                let msg = format!("{} 404 returned from {}", self.table.name, url);
                error!("{}", msg);
                self.last_error = Some(msg);
                self.active = None;
                continue;
            }
            if response.status == 401 {
                // Terminates this parameter set only; connection validation
                // is where a 401 becomes a hard failure.
                let msg = format!(
                    "{} 401 returned from {}: {}",
                    self.table.name, url, response.text
                );
                error!("{}", msg);
                self.last_error = Some(msg);
                self.active = None;
                continue;
            }
            if response.status >= 400 {
                let msg = format!(
                    "{} HTTP error {} returned from {}",
                    self.table.name, response.status, url
                );
                error!("{}", msg);
                self.last_error = Some(msg);
                self.active = None;
                continue;
            }

            let size_return = SizeReturn::new();
            {
                let active = self.active.as_mut().unwrap();
                active.last = Some((size_return.clone(), response.body.clone()));
                active.pages += 1;
            }
            self.yielded_any = true;
            return Ok(Some(AdapterQueryResult {
                json: response.body,
                size_return,
                merge_cols,
            }));
        }
    }
}

/// Format the path template against the parameter set. Placeholders without
/// a value raise a descriptive error, not a bare lookup failure.
fn format_url(base: &str, path: &str, params: &ParamSet) -> Result<String, RestError> {
    let template = format!("{base}{path}");
    let mut out = String::with_capacity(template.len());
    let mut rest = template.as_str();
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find('}') {
            Some(close) => {
                let name = &after[..close];
                match params.get(name) {
                    Some(value) => out.push_str(value),
                    None => {
                        return Err(RestError::MissingPathParam {
                            url: template.clone(),
                            param: name.to_string(),
                            params: params.keys().cloned().collect(),
                        })
                    }
                }
                rest = &after[close + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    Ok(out)
}

//! REST pagination strategies.
//!
//! A pager is created fresh for every parameter set of a scan and never
//! shared. `request_params` contributes to the next HTTP request;
//! `next_page` consumes the size of the page just fetched (and its JSON
//! body) and reports whether to keep going, advancing the cursor first.
//!
//! PageAndCount and OffsetAndCount continue while the last page was full.
//! That heuristic can issue one extra empty request when the total is an
//! exact multiple of the page size; upstream APIs treat the empty page as
//! a no-op, so it is kept as-is.

use serde_json::Value;

use crate::error::RestError;
use crate::schema::PagingOptions;

#[derive(Debug, Clone)]
pub enum Pager {
    /// The API returns everything in one call.
    Null,
    PageAndCount {
        page_param: String,
        count_param: String,
        page_size: u64,
        current_page: u64,
    },
    OffsetAndCount {
        offset_param: String,
        count_param: String,
        page_size: u64,
        current_offset: u64,
    },
    PagerToken {
        token_param: String,
        count_param: String,
        token_path: String,
        page_size: u64,
        current_token: Option<String>,
    },
}

impl Pager {
    /// Build a pager from paging options, validating required keys.
    pub fn build(options: Option<&PagingOptions>) -> Result<Self, RestError> {
        let Some(options) = options else {
            return Ok(Pager::Null);
        };
        let require = |key: &'static str, value: &Option<String>| {
            value
                .clone()
                .ok_or_else(|| RestError::Config(format!("{key} not specified in paging options")))
        };
        match options.strategy.as_str() {
            "pageAndCount" => Ok(Pager::PageAndCount {
                page_param: require("page_param", &options.page_param)?,
                count_param: require("count_param", &options.count_param)?,
                page_size: options.page_size,
                current_page: 1,
            }),
            "offsetAndCount" => Ok(Pager::OffsetAndCount {
                offset_param: require("offset_param", &options.offset_param)?,
                count_param: require("count_param", &options.count_param)?,
                page_size: options.page_size,
                current_offset: 0,
            }),
            "pagerToken" => Ok(Pager::PagerToken {
                token_param: require("token_param", &options.token_param)?,
                count_param: require("count_param", &options.count_param)?,
                token_path: require("pager_token_path", &options.pager_token_path)?,
                page_size: options.page_size,
                current_token: None,
            }),
            other => Err(RestError::Config(format!("unknown paging strategy: {other}"))),
        }
    }

    pub fn page_size(&self) -> u64 {
        match self {
            Pager::Null => 1,
            Pager::PageAndCount { page_size, .. }
            | Pager::OffsetAndCount { page_size, .. }
            | Pager::PagerToken { page_size, .. } => *page_size,
        }
    }

    /// Parameters to merge into the next request.
    pub fn request_params(&self) -> Vec<(String, String)> {
        match self {
            Pager::Null => Vec::new(),
            Pager::PageAndCount {
                page_param,
                count_param,
                page_size,
                current_page,
            } => vec![
                (page_param.clone(), current_page.to_string()),
                (count_param.clone(), page_size.to_string()),
            ],
            Pager::OffsetAndCount {
                offset_param,
                count_param,
                page_size,
                current_offset,
            } => vec![
                (offset_param.clone(), current_offset.to_string()),
                (count_param.clone(), page_size.to_string()),
            ],
            Pager::PagerToken {
                token_param,
                count_param,
                page_size,
                current_token,
                ..
            } => {
                let mut params = Vec::new();
                // The token param is only sent once a token has been observed
                if let Some(token) = current_token {
                    params.push((token_param.clone(), token.clone()));
                }
                params.push((count_param.clone(), page_size.to_string()));
                params
            }
        }
    }

    /// Advance the cursor past the page just fetched and report whether
    /// another page should be requested.
    pub fn next_page(&mut self, last_page_size: usize, json_result: &Value) -> bool {
        match self {
            Pager::Null => false,
            Pager::PageAndCount {
                page_size,
                current_page,
                ..
            } => {
                *current_page += 1;
                last_page_size as u64 >= *page_size
            }
            Pager::OffsetAndCount {
                page_size,
                current_offset,
                ..
            } => {
                *current_offset += last_page_size as u64;
                last_page_size as u64 >= *page_size
            }
            Pager::PagerToken {
                token_path,
                current_token,
                ..
            } => match meld_core::jsonpath::lookup_non_null(json_result, token_path) {
                Some(token) => {
                    *current_token = Some(meld_core::jsonpath::scalar_to_string(token));
                    true
                }
                None => false,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn options(strategy: &str) -> PagingOptions {
        PagingOptions {
            strategy: strategy.to_string(),
            page_size: 2,
            page_param: Some("page".to_string()),
            offset_param: Some("offset".to_string()),
            count_param: Some("limit".to_string()),
            token_param: Some("cursor".to_string()),
            pager_token_path: Some("meta.next".to_string()),
        }
    }

    fn param(params: &[(String, String)], key: &str) -> Option<String> {
        params.iter().find(|(k, _)| k == key).map(|(_, v)| v.clone())
    }

    #[test]
    fn test_null_pager_never_continues() {
        let mut pager = Pager::build(None).unwrap();
        assert!(pager.request_params().is_empty());
        assert!(!pager.next_page(100, &json!({})));
    }

    #[test]
    fn test_missing_required_key_rejected() {
        let mut opts = options("pageAndCount");
        opts.count_param = None;
        assert!(Pager::build(Some(&opts)).is_err());
        let mut opts = options("pagerToken");
        opts.pager_token_path = None;
        assert!(Pager::build(Some(&opts)).is_err());
    }

    #[test]
    fn test_unknown_strategy_rejected() {
        assert!(Pager::build(Some(&options("scrollToken"))).is_err());
    }

    #[test]
    fn test_page_and_count_termination() {
        let mut pager = Pager::build(Some(&options("pageAndCount"))).unwrap();

        // page sizes [2, 2, 1] with page_size 2: current_page on the three
        // requests must be 1, 2, 3 and next_page must answer true,true,false
        let mut pages = Vec::new();
        let mut continues = Vec::new();
        for size in [2usize, 2, 1] {
            pages.push(param(&pager.request_params(), "page").unwrap());
            continues.push(pager.next_page(size, &json!({})));
        }
        assert_eq!(pages, vec!["1", "2", "3"]);
        assert_eq!(continues, vec![true, true, false]);
    }

    #[test]
    fn test_offset_and_count_monotonic() {
        let mut opts = options("offsetAndCount");
        opts.page_size = 5;
        let mut pager = Pager::build(Some(&opts)).unwrap();

        let mut offsets = Vec::new();
        let mut continues = Vec::new();
        for size in [5usize, 5, 3] {
            offsets.push(param(&pager.request_params(), "offset").unwrap());
            continues.push(pager.next_page(size, &json!({})));
        }
        assert_eq!(offsets, vec!["0", "5", "10"]);
        assert_eq!(continues, vec![true, true, false]);
    }

    #[test]
    fn test_pager_token_first_request_omits_token() {
        let mut pager = Pager::build(Some(&options("pagerToken"))).unwrap();
        assert!(param(&pager.request_params(), "cursor").is_none());
        assert_eq!(param(&pager.request_params(), "limit").unwrap(), "2");

        assert!(pager.next_page(2, &json!({"meta": {"next": "abc"}})));
        assert_eq!(param(&pager.request_params(), "cursor").unwrap(), "abc");
    }

    #[test]
    fn test_pager_token_stops_without_token() {
        let mut pager = Pager::build(Some(&options("pagerToken"))).unwrap();
        assert!(!pager.next_page(2, &json!({"meta": {}})));
        assert!(!pager.next_page(2, &json!({"meta": {"next": null}})));
    }

    #[test]
    fn test_full_page_heuristic_continues_on_exact_boundary() {
        let mut pager = Pager::build(Some(&options("offsetAndCount"))).unwrap();
        // a full final page still asks for one more (known-extra-call case)
        assert!(pager.next_page(2, &json!({})));
        assert!(!pager.next_page(0, &json!({})));
    }
}

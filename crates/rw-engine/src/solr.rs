//! Blocking Solr client.

use serde_json::Value;
use std::collections::HashSet;
use std::time::{Duration, Instant};
use tracing::debug;

use rw_types::{BackendError, RwResult, SearchResultSet};

use crate::client::{http_client, id_to_string, parse_error, send_json, url_join, SearchClient, TermCount};
use crate::request::SearchRequest;

const BACKEND: &str = "solr";
const DEFAULT_HANDLER: &str = "select";

#[derive(Debug, Clone)]
pub struct SolrClient {
    base_url: String,
    http: reqwest::blocking::Client,
}

impl SolrClient {
    /// `base_url` is the collection URL, e.g. `http://localhost:8983/solr/products`.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> RwResult<Self> {
        Ok(Self {
            base_url: base_url.into(),
            http: http_client(BACKEND, timeout)?,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Query-string pairs for a search request.
    pub fn search_params(request: &SearchRequest) -> Vec<(String, String)> {
        let mut params = vec![
            ("q".to_string(), request.query.clone()),
            ("rows".to_string(), request.rows.to_string()),
            ("fl".to_string(), request.id_field.clone()),
            ("wt".to_string(), "json".to_string()),
        ];
        params.extend(request.filter_queries.iter().map(|fq| ("fq".to_string(), fq.clone())));
        params.extend(request.params.iter().cloned());
        params
    }

    pub fn parse_search_response(body: &Value, id_field: &str) -> Result<SearchResultSet, BackendError> {
        let response = body
            .get("response")
            .ok_or_else(|| parse_error(BACKEND, "missing 'response'"))?;
        let total_hits = response
            .get("numFound")
            .and_then(Value::as_u64)
            .ok_or_else(|| parse_error(BACKEND, "missing 'response.numFound'"))?;
        let ids = response
            .get("docs")
            .and_then(Value::as_array)
            .map(|docs| {
                docs.iter()
                    .filter_map(|doc| doc.get(id_field).and_then(id_to_string))
                    .collect()
            })
            .unwrap_or_default();
        let query_time = body
            .pointer("/responseHeader/QTime")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        Ok(SearchResultSet::new(ids, total_hits).with_timings(query_time, 0))
    }

    /// Tokens of the last analysis stage of the index-time chain.
    pub fn parse_analysis_response(body: &Value, field: &str) -> Result<Vec<String>, BackendError> {
        let stages = body
            .pointer(&format!("/analysis/field_names/{field}/index"))
            .or_else(|| body.pointer(&format!("/analysis/field_types/{field}/index")))
            .and_then(Value::as_array)
            .ok_or_else(|| parse_error(BACKEND, format!("no analysis for field {field}")))?;
        let last = stages
            .iter()
            .rev()
            .find_map(Value::as_array)
            .ok_or_else(|| parse_error(BACKEND, "analysis has no token stage"))?;
        Ok(last
            .iter()
            .filter_map(|token| token.get("text").and_then(Value::as_str).map(str::to_string))
            .collect())
    }

    /// `json.nl=arrarr` shape: `[[token, count], ...]`.
    pub fn parse_terms_response(body: &Value, field: &str) -> Result<Vec<TermCount>, BackendError> {
        let pairs = body
            .pointer(&format!("/terms/{field}"))
            .and_then(Value::as_array)
            .ok_or_else(|| parse_error(BACKEND, format!("no terms for field {field}")))?;
        pairs
            .iter()
            .map(|pair| {
                let token = pair.get(0).and_then(Value::as_str);
                let count = pair.get(1).and_then(Value::as_u64);
                match (token, count) {
                    (Some(token), Some(count)) => Ok(TermCount::new(token, count)),
                    _ => Err(parse_error(BACKEND, format!("malformed term entry {pair}"))),
                }
            })
            .collect()
    }
}

impl SearchClient for SolrClient {
    fn name(&self) -> &str {
        BACKEND
    }

    fn search(&self, request: &SearchRequest) -> Result<SearchResultSet, BackendError> {
        let handler = request.handler.as_deref().unwrap_or(DEFAULT_HANDLER);
        let url = url_join(&self.base_url, handler);
        let start = Instant::now();
        let body = send_json(BACKEND, self.http.get(&url).query(&Self::search_params(request)))?;
        let elapsed = start.elapsed().as_millis() as u64;
        let results = Self::parse_search_response(&body, &request.id_field)?;
        debug!("solr {} returned {} of {} hits", request.query, results.len(), results.total_hits);
        Ok(SearchResultSet {
            elapsed_ms: elapsed,
            ..results
        })
    }

    fn analyze(&self, field: &str, text: &str) -> Result<Vec<String>, BackendError> {
        let url = url_join(&self.base_url, "analysis/field");
        let body = send_json(
            BACKEND,
            self.http.get(&url).query(&[
                ("analysis.fieldname", field),
                ("analysis.fieldvalue", text),
                ("wt", "json"),
            ]),
        )?;
        Self::parse_analysis_response(&body, field)
    }

    fn get_terms(
        &self,
        field: &str,
        lower_bound: &str,
        limit: usize,
        min_doc_freq: u64,
    ) -> Result<Vec<TermCount>, BackendError> {
        let url = url_join(&self.base_url, "terms");
        let limit = limit.to_string();
        let min_count = min_doc_freq.to_string();
        let body = send_json(
            BACKEND,
            self.http.get(&url).query(&[
                ("terms.fl", field),
                ("terms.lower", lower_bound),
                ("terms.lower.incl", "false"),
                ("terms.limit", limit.as_str()),
                ("terms.mincount", min_count.as_str()),
                ("terms.sort", "index"),
                ("json.nl", "arrarr"),
                ("wt", "json"),
            ]),
        )?;
        Self::parse_terms_response(&body, field)
    }

    fn lookup_ids(&self, id_field: &str, ids: &[String]) -> Result<HashSet<String>, BackendError> {
        if ids.is_empty() {
            return Ok(HashSet::new());
        }
        let request = SearchRequest::new("*:*", ids.len(), id_field)
            .with_filter_query(format!("{{!terms f={id_field}}}{}", ids.join(",")));
        Ok(self.search(&request)?.ids.into_iter().collect())
    }
}

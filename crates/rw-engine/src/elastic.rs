//! Blocking Elasticsearch client and the query union it renders.
//!
//! Queries are templates: string fields may hold `${name}` placeholders
//! bound from the request (`${q}` is the query text, every other name is an
//! experiment parameter). Optional settings whose placeholder stays unbound
//! are omitted from the rendered body.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tracing::debug;

use rw_types::{BackendError, RwResult, SearchResultSet};

use crate::client::{http_client, id_to_string, parse_error, send_json, url_join, SearchClient, TermCount};
use crate::request::SearchRequest;

const BACKEND: &str = "elastic";
const QUERY_PLACEHOLDER: &str = "q";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EsQuery {
    MultiMatch {
        query: String,
        fields: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        match_type: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tie_breaker: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        minimum_should_match: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        operator: Option<String>,
    },
    MatchPhrase {
        field: String,
        query: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        slop: Option<String>,
    },
    QueryString {
        query: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default_field: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        fields: Vec<String>,
    },
    Bool {
        #[serde(default)]
        must: Vec<EsQuery>,
        #[serde(default)]
        should: Vec<EsQuery>,
        #[serde(default)]
        filter: Vec<EsQuery>,
        #[serde(default)]
        must_not: Vec<EsQuery>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        minimum_should_match: Option<String>,
    },
    Term {
        field: String,
        value: String,
    },
    Terms {
        field: String,
        values: Vec<String>,
    },
    Boosting {
        positive: Box<EsQuery>,
        negative: Box<EsQuery>,
        negative_boost: String,
    },
}

/// Replace placeholders left to right in one pass; bound values are never
/// rescanned. The flag is false when some placeholder had no binding.
fn render(text: &str, bindings: &HashMap<&str, &str>) -> (String, bool) {
    let mut bound = String::with_capacity(text.len());
    let mut complete = true;
    let mut rest = text;
    while let Some(start) = rest.find("${") {
        bound.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            complete = false;
            bound.push_str(&rest[start..]);
            return (bound, complete);
        };
        match bindings.get(&after[..end]) {
            Some(value) => bound.push_str(value),
            None => {
                complete = false;
                bound.push_str(&rest[start..start + end + 3]);
            }
        }
        rest = &after[end + 1..];
    }
    bound.push_str(rest);
    (bound, complete)
}

fn substitute(text: &str, bindings: &HashMap<&str, &str>) -> String {
    render(text, bindings).0
}

fn bind_opt(value: &Option<String>, bindings: &HashMap<&str, &str>) -> Option<String> {
    value
        .as_ref()
        .map(|v| render(v, bindings))
        .filter(|(v, complete)| *complete && !v.is_empty())
        .map(|(v, _)| v)
}

/// Bind a field list; a bound entry holding a rendered weighted list
/// (`"title^2 body"`) expands into several fields.
fn bind_fields(fields: &[String], bindings: &HashMap<&str, &str>) -> Vec<String> {
    fields
        .iter()
        .map(|f| render(f, bindings))
        .filter(|(_, complete)| *complete)
        .flat_map(|(f, _)| f.split_whitespace().map(str::to_string).collect::<Vec<_>>())
        .collect()
}

/// Numeric-looking settings are sent as JSON numbers.
fn scalar(value: &str) -> Value {
    match value.parse::<f64>() {
        Ok(number) if number.is_finite() => json!(number),
        _ => json!(value),
    }
}

fn insert_opt(map: &mut Map<String, Value>, key: &str, value: &Option<String>) {
    if let Some(value) = value {
        map.insert(key.to_string(), scalar(value));
    }
}

impl EsQuery {
    pub fn multi_match(query: impl Into<String>, fields: Vec<String>) -> Self {
        EsQuery::MultiMatch {
            query: query.into(),
            fields,
            match_type: None,
            tie_breaker: None,
            minimum_should_match: None,
            operator: None,
        }
    }

    /// Default template: a multi-match over `${qf}` tuned by `${tie}`,
    /// `${mm}`, `${q.op}` and `${type}`.
    pub fn default_template() -> Self {
        EsQuery::MultiMatch {
            query: "${q}".to_string(),
            fields: vec!["${qf}".to_string()],
            match_type: Some("${type}".to_string()),
            tie_breaker: Some("${tie}".to_string()),
            minimum_should_match: Some("${mm}".to_string()),
            operator: Some("${q.op}".to_string()),
        }
    }

    /// Copy of this query with every placeholder bound.
    pub fn bind(&self, bindings: &HashMap<&str, &str>) -> EsQuery {
        let bind_all = |queries: &[EsQuery]| queries.iter().map(|q| q.bind(bindings)).collect::<Vec<_>>();
        match self {
            EsQuery::MultiMatch {
                query,
                fields,
                match_type,
                tie_breaker,
                minimum_should_match,
                operator,
            } => EsQuery::MultiMatch {
                query: substitute(query, bindings),
                fields: bind_fields(fields, bindings),
                match_type: bind_opt(match_type, bindings),
                tie_breaker: bind_opt(tie_breaker, bindings),
                minimum_should_match: bind_opt(minimum_should_match, bindings),
                operator: bind_opt(operator, bindings),
            },
            EsQuery::MatchPhrase { field, query, slop } => EsQuery::MatchPhrase {
                field: substitute(field, bindings),
                query: substitute(query, bindings),
                slop: bind_opt(slop, bindings),
            },
            EsQuery::QueryString {
                query,
                default_field,
                fields,
            } => EsQuery::QueryString {
                query: substitute(query, bindings),
                default_field: bind_opt(default_field, bindings),
                fields: bind_fields(fields, bindings),
            },
            EsQuery::Bool {
                must,
                should,
                filter,
                must_not,
                minimum_should_match,
            } => EsQuery::Bool {
                must: bind_all(must),
                should: bind_all(should),
                filter: bind_all(filter),
                must_not: bind_all(must_not),
                minimum_should_match: bind_opt(minimum_should_match, bindings),
            },
            EsQuery::Term { field, value } => EsQuery::Term {
                field: substitute(field, bindings),
                value: substitute(value, bindings),
            },
            EsQuery::Terms { field, values } => EsQuery::Terms {
                field: substitute(field, bindings),
                values: values.iter().map(|v| substitute(v, bindings)).collect(),
            },
            EsQuery::Boosting {
                positive,
                negative,
                negative_boost,
            } => EsQuery::Boosting {
                positive: Box::new(positive.bind(bindings)),
                negative: Box::new(negative.bind(bindings)),
                negative_boost: substitute(negative_boost, bindings),
            },
        }
    }

    /// Elasticsearch query DSL.
    pub fn to_dsl(&self) -> Value {
        match self {
            EsQuery::MultiMatch {
                query,
                fields,
                match_type,
                tie_breaker,
                minimum_should_match,
                operator,
            } => {
                let mut body = Map::new();
                body.insert("query".into(), json!(query));
                if !fields.is_empty() {
                    body.insert("fields".into(), json!(fields));
                }
                if let Some(match_type) = match_type {
                    body.insert("type".into(), json!(match_type));
                }
                insert_opt(&mut body, "tie_breaker", tie_breaker);
                if let Some(msm) = minimum_should_match {
                    body.insert("minimum_should_match".into(), json!(msm));
                }
                if let Some(operator) = operator {
                    body.insert("operator".into(), json!(operator.to_lowercase()));
                }
                json!({ "multi_match": body })
            }
            EsQuery::MatchPhrase { field, query, slop } => {
                let mut inner = Map::new();
                inner.insert("query".into(), json!(query));
                insert_opt(&mut inner, "slop", slop);
                json!({ "match_phrase": { field.clone(): inner } })
            }
            EsQuery::QueryString {
                query,
                default_field,
                fields,
            } => {
                let mut body = Map::new();
                body.insert("query".into(), json!(query));
                if let Some(default_field) = default_field {
                    body.insert("default_field".into(), json!(default_field));
                }
                if !fields.is_empty() {
                    body.insert("fields".into(), json!(fields));
                }
                json!({ "query_string": body })
            }
            EsQuery::Bool {
                must,
                should,
                filter,
                must_not,
                minimum_should_match,
            } => {
                let mut body = Map::new();
                for (key, clauses) in [("must", must), ("should", should), ("filter", filter), ("must_not", must_not)] {
                    if !clauses.is_empty() {
                        body.insert(key.into(), Value::Array(clauses.iter().map(EsQuery::to_dsl).collect()));
                    }
                }
                if let Some(msm) = minimum_should_match {
                    body.insert("minimum_should_match".into(), json!(msm));
                }
                json!({ "bool": body })
            }
            EsQuery::Term { field, value } => json!({ "term": { field.clone(): value } }),
            EsQuery::Terms { field, values } => json!({ "terms": { field.clone(): values } }),
            EsQuery::Boosting {
                positive,
                negative,
                negative_boost,
            } => json!({
                "boosting": {
                    "positive": positive.to_dsl(),
                    "negative": negative.to_dsl(),
                    "negative_boost": scalar(negative_boost),
                }
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ElasticClient {
    base_url: String,
    template: EsQuery,
    http: reqwest::blocking::Client,
}

impl ElasticClient {
    /// `base_url` is the index URL, e.g. `http://localhost:9200/products`.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> RwResult<Self> {
        Ok(Self {
            base_url: base_url.into(),
            template: EsQuery::default_template(),
            http: http_client(BACKEND, timeout)?,
        })
    }

    pub fn with_template(mut self, template: EsQuery) -> Self {
        self.template = template;
        self
    }

    /// Full `_search` body for a request.
    pub fn search_body(&self, request: &SearchRequest) -> Value {
        let mut bindings: HashMap<&str, &str> = request
            .params
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        bindings.insert(QUERY_PLACEHOLDER, request.query.as_str());

        let bound = self.template.bind(&bindings);
        let query = if request.filter_queries.is_empty() {
            bound
        } else {
            EsQuery::Bool {
                must: vec![bound],
                should: Vec::new(),
                filter: request
                    .filter_queries
                    .iter()
                    .map(|fq| EsQuery::QueryString {
                        query: fq.clone(),
                        default_field: None,
                        fields: Vec::new(),
                    })
                    .collect(),
                must_not: Vec::new(),
                minimum_should_match: None,
            }
        };

        let mut body = json!({
            "query": query.to_dsl(),
            "size": request.rows,
        });
        if request.id_field != "_id" {
            body["_source"] = json!([request.id_field]);
        } else {
            body["_source"] = json!(false);
        }
        body
    }

    pub fn parse_search_response(body: &Value, id_field: &str) -> Result<SearchResultSet, BackendError> {
        let hits = body
            .get("hits")
            .ok_or_else(|| parse_error(BACKEND, "missing 'hits'"))?;
        let total_hits = match hits.get("total") {
            Some(Value::Number(n)) => n.as_u64(),
            Some(total) => total.get("value").and_then(Value::as_u64),
            None => None,
        }
        .ok_or_else(|| parse_error(BACKEND, "missing 'hits.total'"))?;
        let ids = hits
            .get("hits")
            .and_then(Value::as_array)
            .map(|docs| {
                docs.iter()
                    .filter_map(|hit| {
                        if id_field == "_id" {
                            hit.get("_id").and_then(id_to_string)
                        } else {
                            hit.pointer(&format!("/_source/{id_field}"))
                                .and_then(id_to_string)
                                .or_else(|| hit.get("_id").and_then(id_to_string))
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();
        let took = body.get("took").and_then(Value::as_u64).unwrap_or(0);
        Ok(SearchResultSet::new(ids, total_hits).with_timings(took, 0))
    }

    fn post(&self, path: &str, body: &Value) -> Result<Value, BackendError> {
        let url = url_join(&self.base_url, path);
        send_json(BACKEND, self.http.post(&url).json(body))
    }
}

impl SearchClient for ElasticClient {
    fn name(&self) -> &str {
        BACKEND
    }

    fn search(&self, request: &SearchRequest) -> Result<SearchResultSet, BackendError> {
        let path = request.handler.as_deref().unwrap_or("_search");
        let start = Instant::now();
        let response = self.post(path, &self.search_body(request))?;
        let elapsed = start.elapsed().as_millis() as u64;
        let results = Self::parse_search_response(&response, &request.id_field)?;
        debug!("elastic {} returned {} of {} hits", request.query, results.len(), results.total_hits);
        Ok(SearchResultSet {
            elapsed_ms: elapsed,
            ..results
        })
    }

    fn analyze(&self, field: &str, text: &str) -> Result<Vec<String>, BackendError> {
        let response = self.post("_analyze", &json!({ "field": field, "text": text }))?;
        let tokens = response
            .get("tokens")
            .and_then(Value::as_array)
            .ok_or_else(|| parse_error(BACKEND, "missing 'tokens'"))?;
        Ok(tokens
            .iter()
            .filter_map(|t| t.get("token").and_then(Value::as_str).map(str::to_string))
            .collect())
    }

    fn get_terms(&self, _field: &str, _lower_bound: &str, _limit: usize, _min_doc_freq: u64) -> Result<Vec<TermCount>, BackendError> {
        Err(BackendError::Unsupported {
            backend: BACKEND.to_string(),
            operation: "get_terms".to_string(),
        })
    }

    fn lookup_ids(&self, id_field: &str, ids: &[String]) -> Result<HashSet<String>, BackendError> {
        if ids.is_empty() {
            return Ok(HashSet::new());
        }
        let query = EsQuery::Terms {
            field: id_field.to_string(),
            values: ids.to_vec(),
        };
        let mut body = json!({ "query": query.to_dsl(), "size": ids.len() });
        body["_source"] = if id_field == "_id" { json!(false) } else { json!([id_field]) };
        let response = self.post("_search", &body)?;
        Ok(Self::parse_search_response(&response, id_field)?.ids.into_iter().collect())
    }
}

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

use rw_types::{BackendError, RwResult, SearchResultSet};

use crate::request::SearchRequest;

/// Default request timeout of the bundled HTTP clients.
pub const DEFAULT_BACKEND_TIMEOUT: Duration = Duration::from_secs(30);

/// A term and its document frequency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermCount {
    pub token: String,
    pub doc_freq: u64,
}

impl TermCount {
    pub fn new(token: impl Into<String>, doc_freq: u64) -> Self {
        Self {
            token: token.into(),
            doc_freq,
        }
    }
}

/// Blocking search backend.
pub trait SearchClient: Send + Sync {
    fn name(&self) -> &str;

    fn search(&self, request: &SearchRequest) -> Result<SearchResultSet, BackendError>;

    /// Tokens produced by the analyzer of `field` for `text`.
    fn analyze(&self, field: &str, text: &str) -> Result<Vec<String>, BackendError>;

    fn get_terms(
        &self,
        field: &str,
        lower_bound: &str,
        limit: usize,
        min_doc_freq: u64,
    ) -> Result<Vec<TermCount>, BackendError>;

    /// Which of `ids` exist in the index.
    fn lookup_ids(&self, id_field: &str, ids: &[String]) -> Result<HashSet<String>, BackendError>;
}

pub(crate) fn http_client(backend: &str, timeout: Duration) -> RwResult<reqwest::blocking::Client> {
    reqwest::blocking::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| {
            BackendError::Transport {
                backend: backend.to_string(),
                message: e.to_string(),
            }
            .into()
        })
}

pub(crate) fn transport_error(backend: &str, error: reqwest::Error) -> BackendError {
    BackendError::Transport {
        backend: backend.to_string(),
        message: error.to_string(),
    }
}

pub(crate) fn parse_error(backend: &str, message: impl Into<String>) -> BackendError {
    BackendError::Parse {
        backend: backend.to_string(),
        message: message.into(),
    }
}

/// Send a prepared request and decode its JSON body, mapping every failure
/// to a [`BackendError`].
pub(crate) fn send_json(
    backend: &str,
    request: reqwest::blocking::RequestBuilder,
) -> Result<serde_json::Value, BackendError> {
    let response = request.send().map_err(|e| transport_error(backend, e))?;
    let status = response.status();
    if !status.is_success() {
        let message = response.text().unwrap_or_default();
        return Err(BackendError::Status {
            backend: backend.to_string(),
            status: status.as_u16(),
            message,
        });
    }
    response
        .json::<serde_json::Value>()
        .map_err(|e| parse_error(backend, e.to_string()))
}

/// Document ids may be strings or numbers in backend responses.
pub(crate) fn id_to_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Array(values) => values.first().and_then(id_to_string),
        _ => None,
    }
}

pub(crate) fn url_join(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

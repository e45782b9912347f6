use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::errors::RwResult;
use crate::factories::is_reserved;
use crate::features::Feature;
use crate::config_error;

/// A fully specified candidate ranking configuration.
///
/// Parameters are keyed by name; each name is both the request parameter sent
/// to the backend and the name of the factory that governs the value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Experiment {
    pub name: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_handler: Option<String>,
    #[serde(default)]
    pub params: BTreeMap<String, Feature>,
    #[serde(default)]
    pub filter_queries: BTreeSet<String>,
}

impl Experiment {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            custom_handler: None,
            params: BTreeMap::new(),
            filter_queries: BTreeSet::new(),
        }
    }

    pub fn with_handler(mut self, handler: impl Into<String>) -> Self {
        self.custom_handler = Some(handler.into());
        self
    }

    pub fn with_param(mut self, name: impl Into<String>, value: Feature) -> Self {
        self.params.insert(name.into(), value);
        self
    }

    pub fn with_params(mut self, params: BTreeMap<String, Feature>) -> Self {
        self.params = params;
        self
    }

    pub fn with_filter_queries<I, S>(mut self, filter_queries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.filter_queries = filter_queries.into_iter().map(Into::into).collect();
        self
    }

    pub fn param(&self, name: &str) -> Option<&Feature> {
        self.params.get(name)
    }

    /// Names must be unique per run and no parameter may shadow `q` or `fq`.
    pub fn validate(&self) -> RwResult<()> {
        if self.name.trim().is_empty() {
            return Err(config_error!("experiment name must not be empty"));
        }
        if let Some(name) = self.params.keys().find(|k| is_reserved(k)) {
            return Err(config_error!(
                "experiment {} sets reserved parameter '{name}'",
                self.name
            ));
        }
        Ok(())
    }

    /// Rendered `(name, value)` pairs for the backend.
    pub fn rendered_params(&self) -> Vec<(String, String)> {
        self.params
            .iter()
            .map(|(name, value)| (name.clone(), value.render()))
            .collect()
    }
}

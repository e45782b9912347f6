//! Tuning configuration loaded from JSON.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use tracing::info;

use rw_engine::RunnerConfig;
use rw_scoring::{validate_scorer_configs, ScorerConfig};
use rw_types::{config_error, Experiment, FeatureFactories, RwResult};

use crate::genetic::GaConfig;

/// Everything a tuning run needs besides judgments and a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TuningConfig {
    pub feature_factories: FeatureFactories,
    pub scorers: Vec<ScorerConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ga: Option<GaConfig>,
    /// Explicit experiments to evaluate instead of searching.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experiments: Option<Vec<Experiment>>,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_handler: Option<String>,
    #[serde(default)]
    pub filter_queries: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,
}

impl TuningConfig {
    pub fn from_path<P: AsRef<Path>>(path: P) -> RwResult<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)?;
        let config = Self::from_json(&raw)?;
        info!(
            "Loaded tuning config from {}: {} features, {} scorers",
            path.display(),
            config.feature_factories.len(),
            config.scorers.len()
        );
        Ok(config)
    }

    pub fn from_json(raw: &str) -> RwResult<Self> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|e| config_error!("invalid tuning config: {e}"))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> RwResult<()> {
        if self.url.trim().is_empty() {
            return Err(config_error!("url must not be empty"));
        }
        if self.scorers.is_empty() {
            return Err(config_error!("at least one scorer is required"));
        }
        self.feature_factories.validate()?;
        validate_scorer_configs(&self.scorers, self.ga.is_some())?;
        if let Some(ga) = &self.ga {
            ga.validate()?;
        }
        if let Some(experiments) = &self.experiments {
            let mut names = BTreeSet::new();
            for experiment in experiments {
                experiment.validate()?;
                if !names.insert(experiment.name.as_str()) {
                    return Err(config_error!("duplicate experiment name {}", experiment.name));
                }
            }
        }
        self.runner_config().validate()
    }

    /// Fixed settings shared by every generated experiment.
    pub fn base_experiment(&self, name: impl Into<String>) -> Experiment {
        let mut experiment =
            Experiment::new(name, self.url.clone()).with_filter_queries(self.filter_queries.iter().cloned());
        experiment.custom_handler = self.custom_handler.clone();
        experiment
    }

    pub fn runner_config(&self) -> RunnerConfig {
        let mut config = RunnerConfig::default();
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(id_field) = &self.id_field {
            config.id_field = id_field.clone();
        }
        config
    }

    /// Scorer driving selection, or the first scorer.
    pub fn objective_scorer(&self) -> Option<String> {
        self.scorers
            .iter()
            .find(|s| s.params.use_for_train)
            .or_else(|| self.scorers.first())
            .map(ScorerConfig::name)
    }
}

//! Storage of experiments, judgments and scores.
//!
//! [`Repository`] is the seam the runner and optimizers write through.
//! [`InMemoryRepository`] keeps everything behind one lock and optionally
//! snapshots to a JSON file after each write.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use rw_scoring::{SummaryStatistics, ALL_QUERY_SETS};
use rw_types::{Experiment, JudgmentList, PersistenceError, QueryInfo, RwError, RwResult};

/// Per-scorer statistics keyed by query set, then scorer name.
pub type AggregatedScores = BTreeMap<String, BTreeMap<String, SummaryStatistics>>;

/// Per-scorer values recorded for one query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryScores {
    pub query_info: QueryInfo,
    pub values: BTreeMap<String, f64>,
}

/// Everything one evaluation writes, stored in a single pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScoreBatch {
    pub experiment: String,
    pub scorer_names: Vec<String>,
    pub query_scores: Vec<QueryScores>,
    pub aggregated: AggregatedScores,
}

pub trait Repository: Send + Sync {
    fn get_judgments(&self) -> RwResult<JudgmentList>;

    fn add_judgments(&self, judgments: &JudgmentList) -> RwResult<()>;

    fn get_experiments(&self) -> RwResult<BTreeMap<String, Experiment>>;

    /// Unknown names are a [`RwError::NotFound`].
    fn get_experiment(&self, name: &str) -> RwResult<Experiment>;

    fn add_experiment(&self, experiment: &Experiment) -> RwResult<()>;

    fn has_scores(&self, experiment: &str) -> RwResult<bool>;

    fn insert_scores(&self, query_info: &QueryInfo, experiment: &str, values: &BTreeMap<String, f64>) -> RwResult<()>;

    fn insert_scores_aggregated(&self, experiment: &str, aggregated: &AggregatedScores) -> RwResult<()>;

    /// Best `n` experiments whose name starts with `prefix`, ranked by the
    /// scorer's primary statistic over all query sets, descending.
    fn get_n_best_experiments(&self, prefix: &str, n: usize, scorer: &str) -> RwResult<Vec<(Experiment, f64)>>;

    fn store_batch(&self, batch: &ScoreBatch) -> RwResult<()> {
        for row in &batch.query_scores {
            self.insert_scores(&row.query_info, &batch.experiment, &row.values)?;
        }
        self.insert_scores_aggregated(&batch.experiment, &batch.aggregated)
    }
}

/// Score rows of one experiment keyed by `{query_set}/{query_id}`.
type ScoreRows = BTreeMap<String, QueryScores>;

fn row_key(query_info: &QueryInfo) -> String {
    format!("{}/{}", query_info.query_set, query_info.query_id)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RepositoryState {
    #[serde(default)]
    judgments: JudgmentList,
    #[serde(default)]
    experiments: BTreeMap<String, Experiment>,
    /// Scorer names of the scores table; empty until the first insert.
    #[serde(default)]
    score_columns: Vec<String>,
    #[serde(default)]
    scores: BTreeMap<String, ScoreRows>,
    #[serde(default)]
    aggregated: BTreeMap<String, AggregatedScores>,
}

impl RepositoryState {
    /// Check the incoming columns against the scores table; on mismatch the
    /// table is recreated.
    fn ensure_columns(&mut self, columns: Vec<String>) {
        if self.score_columns.is_empty() {
            self.score_columns = columns;
            return;
        }
        if self.score_columns != columns {
            let mismatch = PersistenceError::SchemaMismatch {
                expected: self.score_columns.clone(),
                actual: columns.clone(),
            };
            warn!("{}; recreating scores table", mismatch);
            self.scores.clear();
            self.aggregated.clear();
            self.score_columns = columns;
        }
    }

    /// A row may omit columns (a scorer with no value for the query) but
    /// may not introduce new ones.
    fn insert_query_scores(&mut self, experiment: &str, row: QueryScores) {
        if !row.values.keys().all(|k| self.score_columns.contains(k)) {
            self.ensure_columns(row.values.keys().cloned().collect());
        }
        let key = row_key(&row.query_info);
        let rows = self.scores.entry(experiment.to_string()).or_default();
        if let Some(replaced) = rows.insert(key, row) {
            warn!(
                "Replacing scores of query {} for experiment {}",
                replaced.query_info.query_id, experiment
            );
        }
    }

    fn insert_aggregated(&mut self, experiment: &str, aggregated: &AggregatedScores) {
        if let Some(per_scorer) = aggregated.values().next() {
            self.ensure_columns(per_scorer.keys().cloned().collect());
        }
        self.aggregated.insert(experiment.to_string(), aggregated.clone());
    }
}

/// Repository held in memory with an optional JSON snapshot on disk.
#[derive(Debug, Default)]
pub struct InMemoryRepository {
    state: RwLock<RepositoryState>,
    path: Option<PathBuf>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a snapshot-backed repository, loading the file when it exists.
    pub fn open<P: AsRef<Path>>(path: P) -> RwResult<Self> {
        let path = path.as_ref().to_path_buf();
        let state = if path.exists() {
            let raw = fs::read_to_string(&path).map_err(|e| PersistenceError::Io {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;
            let state: RepositoryState = serde_json::from_str(&raw).map_err(|e| PersistenceError::Corrupt {
                message: format!("{}: {}", path.display(), e),
            })?;
            info!(
                "Opened repository {} with {} experiments and {} judged queries",
                path.display(),
                state.experiments.len(),
                state.judgments.len()
            );
            state
        } else {
            info!("Creating new repository at {}", path.display());
            RepositoryState::default()
        };

        Ok(Self {
            state: RwLock::new(state),
            path: Some(path),
        })
    }

    /// Default snapshot location under the user's data directory.
    pub fn default_path() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("rankwise")
            .join("repository.json")
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Scores recorded for one experiment, ordered by query set then query id.
    pub fn get_scores(&self, experiment: &str) -> Vec<QueryScores> {
        self.state
            .read()
            .scores
            .get(experiment)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get_aggregated(&self, experiment: &str) -> Option<AggregatedScores> {
        self.state.read().aggregated.get(experiment).cloned()
    }

    pub fn score_columns(&self) -> Vec<String> {
        self.state.read().score_columns.clone()
    }

    /// Write the snapshot, if this repository has one.
    pub fn flush(&self) -> RwResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let io_error = |e: std::io::Error| PersistenceError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        };

        let json = serde_json::to_string_pretty(&*self.state.read())?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(io_error)?;
            }
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(io_error)?;
        fs::rename(&tmp, path).map_err(io_error)?;
        debug!("Flushed repository to {}", path.display());
        Ok(())
    }
}

impl Repository for InMemoryRepository {
    fn get_judgments(&self) -> RwResult<JudgmentList> {
        Ok(self.state.read().judgments.clone())
    }

    fn add_judgments(&self, judgments: &JudgmentList) -> RwResult<()> {
        {
            let mut state = self.state.write();
            for j in judgments {
                state.judgments.add(j.clone());
            }
        }
        self.flush()
    }

    fn get_experiments(&self) -> RwResult<BTreeMap<String, Experiment>> {
        Ok(self.state.read().experiments.clone())
    }

    fn get_experiment(&self, name: &str) -> RwResult<Experiment> {
        self.state
            .read()
            .experiments
            .get(name)
            .cloned()
            .ok_or_else(|| RwError::NotFound(format!("experiment '{name}'")))
    }

    fn add_experiment(&self, experiment: &Experiment) -> RwResult<()> {
        experiment.validate()?;
        self.state
            .write()
            .experiments
            .insert(experiment.name.clone(), experiment.clone());
        self.flush()
    }

    fn has_scores(&self, experiment: &str) -> RwResult<bool> {
        let state = self.state.read();
        Ok(state.scores.get(experiment).is_some_and(|rows| !rows.is_empty())
            || state.aggregated.contains_key(experiment))
    }

    fn insert_scores(&self, query_info: &QueryInfo, experiment: &str, values: &BTreeMap<String, f64>) -> RwResult<()> {
        self.state.write().insert_query_scores(
            experiment,
            QueryScores {
                query_info: query_info.clone(),
                values: values.clone(),
            },
        );
        self.flush()
    }

    fn insert_scores_aggregated(&self, experiment: &str, aggregated: &AggregatedScores) -> RwResult<()> {
        self.state.write().insert_aggregated(experiment, aggregated);
        self.flush()
    }

    fn get_n_best_experiments(&self, prefix: &str, n: usize, scorer: &str) -> RwResult<Vec<(Experiment, f64)>> {
        let state = self.state.read();
        let mut ranked: Vec<(Experiment, f64)> = state
            .experiments
            .iter()
            .filter(|(name, _)| name.starts_with(prefix))
            .filter_map(|(name, experiment)| {
                let score = state
                    .aggregated
                    .get(name)?
                    .get(ALL_QUERY_SETS)?
                    .get(scorer)?
                    .primary();
                Some((experiment.clone(), score))
            })
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.name.cmp(&b.0.name)));
        ranked.truncate(n);
        Ok(ranked)
    }

    fn store_batch(&self, batch: &ScoreBatch) -> RwResult<()> {
        {
            let mut state = self.state.write();
            state.ensure_columns(batch.scorer_names.clone());
            for row in &batch.query_scores {
                state.insert_query_scores(&batch.experiment, row.clone());
            }
            state.insert_aggregated(&batch.experiment, &batch.aggregated);
        }
        info!(
            "Stored {} query scores for experiment {}",
            batch.query_scores.len(),
            batch.experiment
        );
        self.flush()
    }
}

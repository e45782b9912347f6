//! Rank metrics and the closed registry that builds them from config.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

use rw_types::{config_error, Judgments, QueryInfo, RwError, RwResult, SearchResultSet};

use crate::aggregator::{ScoreAggregator, StatisticsKind, SummaryStatistics};

const DEFAULT_MAX_GRADE: f64 = 3.0;

/// Known scorer classes, as named in persisted scorer config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScorerClass {
    Ndcg,
    Err,
    RreErr,
    Precision,
    Recall,
    AtLeastOneHit,
    HighestRank,
    ReciprocalRank,
    TotalDocsReturned,
    ZeroResults,
    QueryTime,
}

impl ScorerClass {
    pub const ALL: [ScorerClass; 11] = [
        ScorerClass::Ndcg,
        ScorerClass::Err,
        ScorerClass::RreErr,
        ScorerClass::Precision,
        ScorerClass::Recall,
        ScorerClass::AtLeastOneHit,
        ScorerClass::HighestRank,
        ScorerClass::ReciprocalRank,
        ScorerClass::TotalDocsReturned,
        ScorerClass::ZeroResults,
        ScorerClass::QueryTime,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ScorerClass::Ndcg => "NDCG",
            ScorerClass::Err => "ERR",
            ScorerClass::RreErr => "RREERR",
            ScorerClass::Precision => "Precision",
            ScorerClass::Recall => "Recall",
            ScorerClass::AtLeastOneHit => "AtLeastOneHit",
            ScorerClass::HighestRank => "HighestRank",
            ScorerClass::ReciprocalRank => "ReciprocalRank",
            ScorerClass::TotalDocsReturned => "TotalDocsReturned",
            ScorerClass::ZeroResults => "ZeroResults",
            ScorerClass::QueryTime => "QueryTime",
        }
    }

    pub fn statistics_kind(&self) -> StatisticsKind {
        match self {
            ScorerClass::TotalDocsReturned | ScorerClass::ZeroResults => StatisticsKind::Counting,
            _ => StatisticsKind::Distributional,
        }
    }
}

impl fmt::Display for ScorerClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScorerClass {
    type Err = RwError;

    fn from_str(s: &str) -> Result<Self, RwError> {
        ScorerClass::ALL
            .iter()
            .copied()
            .find(|class| class.as_str() == s)
            .ok_or_else(|| config_error!("unknown scorer class '{s}'"))
    }
}

/// Gain formula of the NDCG family.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum NdcgType {
    /// gain = grade
    #[default]
    #[serde(rename = "2002")]
    Ndcg2002,
    /// gain = 2^grade - 1
    #[serde(rename = "2005")]
    Ndcg2005,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScorerParams {
    #[serde(rename = "atK")]
    pub at_k: usize,
    #[serde(default)]
    pub use_for_train: bool,
    #[serde(default)]
    pub use_for_test: bool,
    #[serde(default, rename = "exportPMatrix")]
    pub export_p_matrix: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ndcg_type: Option<NdcgType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_grade: Option<f64>,
}

/// Persisted scorer configuration: `{class, params: {atK, ...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScorerConfig {
    pub class: String,
    pub params: ScorerParams,
}

impl ScorerConfig {
    pub fn new(class: ScorerClass, at_k: usize) -> Self {
        Self {
            class: class.as_str().to_string(),
            params: ScorerParams {
                at_k,
                use_for_train: false,
                use_for_test: false,
                export_p_matrix: false,
                ndcg_type: None,
                max_grade: None,
            },
        }
    }

    pub fn for_train(mut self) -> Self {
        self.params.use_for_train = true;
        self
    }

    pub fn for_test(mut self) -> Self {
        self.params.use_for_test = true;
        self
    }

    pub fn with_ndcg_type(mut self, ndcg_type: NdcgType) -> Self {
        self.params.ndcg_type = Some(ndcg_type);
        self
    }

    pub fn with_max_grade(mut self, max_grade: f64) -> Self {
        self.params.max_grade = Some(max_grade);
        self
    }

    pub fn scorer_class(&self) -> RwResult<ScorerClass> {
        self.class.parse()
    }

    /// Column name, e.g. `NDCG@10` or `NDCG2005@10`.
    pub fn name(&self) -> String {
        match self.params.ndcg_type {
            Some(NdcgType::Ndcg2005) => format!("{}2005@{}", self.class, self.params.at_k),
            _ => format!("{}@{}", self.class, self.params.at_k),
        }
    }

    pub fn build(&self) -> RwResult<Scorer> {
        Scorer::from_config(self)
    }
}

/// Check a scorer list: known classes, unique names, and at most one train
/// scorer (exactly one when `require_train`).
pub fn validate_scorer_configs(configs: &[ScorerConfig], require_train: bool) -> RwResult<()> {
    let mut names = HashSet::new();
    for config in configs {
        config.scorer_class()?;
        if !names.insert(config.name()) {
            return Err(config_error!("duplicate scorer {}", config.name()));
        }
    }
    let train = configs.iter().filter(|c| c.params.use_for_train).count();
    if train > 1 {
        return Err(config_error!("{train} scorers are flagged useForTrain; at most one is allowed"));
    }
    if require_train && train == 0 {
        return Err(config_error!("exactly one scorer must be flagged useForTrain"));
    }
    Ok(())
}

/// One rank metric plus its own accumulator.
#[derive(Debug)]
pub struct Scorer {
    config: ScorerConfig,
    class: ScorerClass,
    name: String,
    aggregator: ScoreAggregator,
}

impl Scorer {
    pub fn from_config(config: &ScorerConfig) -> RwResult<Self> {
        let class = config.scorer_class()?;
        if config.params.at_k == 0 {
            return Err(config_error!("{}: atK must be at least 1", config.class));
        }
        if let Some(max_grade) = config.params.max_grade {
            if !(max_grade.is_finite() && max_grade > 0.0) {
                return Err(config_error!("{}: maxGrade must be positive", config.class));
            }
        }
        if config.params.ndcg_type.is_some() && class != ScorerClass::Ndcg {
            return Err(config_error!("{}: ndcgType only applies to NDCG", config.class));
        }
        Ok(Self {
            config: config.clone(),
            class,
            name: config.name(),
            aggregator: ScoreAggregator::new(class.statistics_kind()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn class(&self) -> ScorerClass {
        self.class
    }

    pub fn config(&self) -> &ScorerConfig {
        &self.config
    }

    pub fn at_k(&self) -> usize {
        self.config.params.at_k
    }

    pub fn use_for_train(&self) -> bool {
        self.config.params.use_for_train
    }

    pub fn use_for_test(&self) -> bool {
        self.config.params.use_for_test
    }

    pub fn export_p_matrix(&self) -> bool {
        self.config.params.export_p_matrix
    }

    pub fn aggregator(&self) -> &ScoreAggregator {
        &self.aggregator
    }

    fn max_grade(&self) -> f64 {
        self.config.params.max_grade.unwrap_or(DEFAULT_MAX_GRADE)
    }

    /// Compute the metric without recording it. `None` means "no score",
    /// which only `HighestRank` produces.
    pub fn compute(&self, judgments: &Judgments, results: &SearchResultSet) -> Option<f64> {
        let k = self.at_k();
        match self.class {
            ScorerClass::Ndcg => Some(ndcg(
                judgments,
                &results.ids,
                k,
                self.config.params.ndcg_type.unwrap_or_default(),
            )),
            ScorerClass::Err => Some(err(judgments, &results.ids, k, self.max_grade(), false)),
            ScorerClass::RreErr => Some(err(judgments, &results.ids, k, self.max_grade(), true)),
            ScorerClass::Precision => Some(relevant_in_top(judgments, &results.ids, k) as f64 / k as f64),
            ScorerClass::Recall => {
                let relevant = judgments.relevant_count();
                if relevant == 0 {
                    Some(0.0)
                } else {
                    Some(relevant_in_top(judgments, &results.ids, k) as f64 / relevant as f64)
                }
            }
            ScorerClass::AtLeastOneHit => Some(if relevant_in_top(judgments, &results.ids, k) > 0 {
                1.0
            } else {
                0.0
            }),
            ScorerClass::HighestRank => highest_rank(judgments, &results.ids, k).map(|r| r as f64),
            ScorerClass::ReciprocalRank => {
                Some(highest_rank(judgments, &results.ids, k).map_or(0.0, |r| 1.0 / r as f64))
            }
            ScorerClass::TotalDocsReturned => Some(results.total_hits as f64),
            ScorerClass::ZeroResults => Some(if results.total_hits == 0 { 1.0 } else { 0.0 }),
            ScorerClass::QueryTime => Some(results.query_time_ms as f64),
        }
    }

    /// Compute and record into this scorer's aggregator.
    pub fn score(&self, judgments: &Judgments, results: &SearchResultSet) -> Option<f64> {
        let value = self.compute(judgments, results)?;
        debug!("{} {} = {}", self.name, judgments.query_info.query_id, value);
        self.aggregator.add(&judgments.query_info, value);
        Some(value)
    }

    pub fn summary(&self, query_set: &str) -> SummaryStatistics {
        self.aggregator.summary(query_set)
    }
}

/// Result ids truncated to `depth`, each paired with its 1-based rank; an id
/// repeated in the list only counts at its first rank.
fn ranked_unique<'a>(ids: &'a [String], depth: usize) -> impl Iterator<Item = (usize, &'a str)> {
    let mut seen = HashSet::new();
    ids.iter()
        .take(depth)
        .enumerate()
        .filter_map(move |(i, id)| seen.insert(id.as_str()).then_some((i + 1, id.as_str())))
}

fn gain(grade: f64, ndcg_type: NdcgType) -> f64 {
    if grade <= 0.0 {
        return 0.0;
    }
    match ndcg_type {
        NdcgType::Ndcg2002 => grade,
        NdcgType::Ndcg2005 => 2f64.powf(grade) - 1.0,
    }
}

fn discount(rank: usize) -> f64 {
    ((rank + 1) as f64).log2()
}

pub fn dcg(judgments: &Judgments, ids: &[String], at_n: usize, ndcg_type: NdcgType) -> f64 {
    ranked_unique(ids, at_n)
        .map(|(rank, id)| gain(judgments.get_judgment(id), ndcg_type) / discount(rank))
        .sum()
}

/// DCG of the ideal ordering truncated to `depth`.
pub fn ideal_dcg(judgments: &Judgments, depth: usize, ndcg_type: NdcgType) -> f64 {
    judgments
        .sorted()
        .iter()
        .take(depth)
        .enumerate()
        .map(|(i, (_, grade))| gain(*grade, ndcg_type) / discount(i + 1))
        .sum()
}

pub fn ndcg(judgments: &Judgments, ids: &[String], at_n: usize, ndcg_type: NdcgType) -> f64 {
    let depth = at_n.min(ids.len());
    let ideal = ideal_dcg(judgments, depth, ndcg_type);
    if ideal <= 0.0 {
        return 0.0;
    }
    dcg(judgments, ids, depth, ndcg_type) / ideal
}

/// Expected reciprocal rank. With `impute_unjudged`, unjudged documents get
/// the grade `round(max_grade / 2)` instead of being skipped.
pub fn err(judgments: &Judgments, ids: &[String], at_n: usize, max_grade: f64, impute_unjudged: bool) -> f64 {
    let denominator = 2f64.powf(max_grade);
    let mut p_looking = 1.0;
    let mut score = 0.0;
    for (rank, id) in ranked_unique(ids, at_n) {
        let grade = if judgments.is_judged(id) {
            judgments.get_judgment(id)
        } else if impute_unjudged {
            (max_grade / 2.0).round()
        } else {
            continue;
        };
        if grade <= 0.0 {
            continue;
        }
        let relevance = (2f64.powf(grade.min(max_grade)) - 1.0) / denominator;
        score += p_looking * relevance / rank as f64;
        p_looking *= 1.0 - relevance;
    }
    score
}

fn relevant_in_top(judgments: &Judgments, ids: &[String], k: usize) -> usize {
    ranked_unique(ids, k)
        .filter(|(_, id)| judgments.get_judgment(id) > 0.0)
        .count()
}

/// Rank of the first relevant document within the top `k`.
pub fn highest_rank(judgments: &Judgments, ids: &[String], k: usize) -> Option<usize> {
    ranked_unique(ids, k)
        .find(|(_, id)| judgments.get_judgment(id) > 0.0)
        .map(|(rank, _)| rank)
}

/// The scorers of one evaluation, each with a fresh accumulator.
#[derive(Debug, Default)]
pub struct ScorerSet {
    scorers: Vec<Scorer>,
}

impl ScorerSet {
    pub fn from_configs(configs: &[ScorerConfig]) -> RwResult<Self> {
        validate_scorer_configs(configs, false)?;
        let scorers = configs.iter().map(Scorer::from_config).collect::<RwResult<Vec<_>>>()?;
        Ok(Self { scorers })
    }

    /// Score one query with every scorer.
    pub fn score_all(&self, judgments: &Judgments, results: &SearchResultSet) {
        for scorer in &self.scorers {
            scorer.score(judgments, results);
        }
    }

    /// Rows to request from the backend: the deepest cutoff, at least one.
    pub fn rows(&self) -> usize {
        self.scorers.iter().map(Scorer::at_k).max().unwrap_or(1).max(1)
    }

    pub fn get(&self, name: &str) -> Option<&Scorer> {
        self.scorers.iter().find(|s| s.name() == name)
    }

    pub fn train_scorer(&self) -> Option<&Scorer> {
        self.scorers.iter().find(|s| s.use_for_train())
    }

    pub fn test_scorer(&self) -> Option<&Scorer> {
        self.scorers.iter().find(|s| s.use_for_test())
    }

    pub fn names(&self) -> Vec<String> {
        self.scorers.iter().map(|s| s.name().to_string()).collect()
    }

    /// Every query scored by at least one scorer.
    pub fn scored_queries(&self) -> Vec<QueryInfo> {
        let mut queries: Vec<QueryInfo> = self
            .scorers
            .iter()
            .flat_map(|s| s.aggregator().get_scores().into_keys())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        queries.sort();
        queries
    }

    /// Per-scorer values recorded for one query.
    pub fn query_scores(&self, query_info: &QueryInfo) -> BTreeMap<String, f64> {
        self.scorers
            .iter()
            .filter_map(|s| s.aggregator().get_score(query_info).map(|v| (s.name().to_string(), v)))
            .collect()
    }

    /// Per-scorer statistics for one query set.
    pub fn summaries(&self, query_set: &str) -> BTreeMap<String, SummaryStatistics> {
        self.scorers
            .iter()
            .map(|s| (s.name().to_string(), s.summary(query_set)))
            .collect()
    }

    /// Every query set recorded by any scorer.
    pub fn query_sets(&self) -> Vec<String> {
        let mut sets: Vec<String> = self
            .scorers
            .iter()
            .flat_map(|s| s.aggregator().query_sets())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        sets.sort();
        sets
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Scorer> {
        self.scorers.iter()
    }

    pub fn len(&self) -> usize {
        self.scorers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scorers.is_empty()
    }
}

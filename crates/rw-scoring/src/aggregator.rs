//! Thread-safe score accumulation and per-query-set summary statistics.
//!
//! Every score is recorded under its own query set and under
//! [`ALL_QUERY_SETS`], so the summary over everything needs no re-scan.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::warn;

use rw_types::QueryInfo;

/// Pseudo query set holding every recorded query.
pub const ALL_QUERY_SETS: &str = "__all__";

/// How a scorer's per-query values are summarized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatisticsKind {
    /// mean / median / population standard deviation
    Distributional,
    /// sum, e.g. zero-result queries
    Counting,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SummaryStatistics {
    Distributional {
        mean: f64,
        median: f64,
        stdev: f64,
        count: usize,
    },
    Counting {
        sum: f64,
        count: usize,
    },
}

impl SummaryStatistics {
    pub fn compute(kind: StatisticsKind, values: &[f64]) -> Self {
        match kind {
            StatisticsKind::Counting => SummaryStatistics::Counting {
                sum: values.iter().sum(),
                count: values.len(),
            },
            StatisticsKind::Distributional => {
                if values.is_empty() {
                    return SummaryStatistics::Distributional {
                        mean: 0.0,
                        median: 0.0,
                        stdev: 0.0,
                        count: 0,
                    };
                }
                let n = values.len() as f64;
                let mean = values.iter().sum::<f64>() / n;
                let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;

                let mut sorted = values.to_vec();
                sorted.sort_by(|a, b| a.total_cmp(b));
                let mid = sorted.len() / 2;
                let median = if sorted.len() % 2 == 0 {
                    (sorted[mid - 1] + sorted[mid]) / 2.0
                } else {
                    sorted[mid]
                };

                SummaryStatistics::Distributional {
                    mean,
                    median,
                    stdev: variance.sqrt(),
                    count: values.len(),
                }
            }
        }
    }

    /// Mean for distributional scorers, sum for counting scorers.
    pub fn primary(&self) -> f64 {
        match self {
            SummaryStatistics::Distributional { mean, .. } => *mean,
            SummaryStatistics::Counting { sum, .. } => *sum,
        }
    }

    pub fn count(&self) -> usize {
        match self {
            SummaryStatistics::Distributional { count, .. } | SummaryStatistics::Counting { count, .. } => {
                *count
            }
        }
    }
}

/// Concurrent accumulator of one scorer's per-query scores.
#[derive(Debug)]
pub struct ScoreAggregator {
    kind: StatisticsKind,
    scores: DashMap<QueryInfo, f64>,
    query_sets: DashMap<String, HashSet<QueryInfo>>,
}

impl ScoreAggregator {
    pub fn new(kind: StatisticsKind) -> Self {
        Self {
            kind,
            scores: DashMap::new(),
            query_sets: DashMap::new(),
        }
    }

    pub fn kind(&self) -> StatisticsKind {
        self.kind
    }

    /// Record a score. Safe to call from many workers at once. Recording the
    /// same query twice is a caller error; the later score wins.
    pub fn add(&self, query_info: &QueryInfo, score: f64) {
        if let Some(previous) = self.scores.insert(query_info.clone(), score) {
            warn!(
                "Duplicate score for query {} in set {}: replacing {} with {}",
                query_info.query_id, query_info.query_set, previous, score
            );
        }
        self.query_sets
            .entry(query_info.query_set.clone())
            .or_default()
            .insert(query_info.clone());
        self.query_sets
            .entry(ALL_QUERY_SETS.to_string())
            .or_default()
            .insert(query_info.clone());
    }

    pub fn get_score(&self, query_info: &QueryInfo) -> Option<f64> {
        self.scores.get(query_info).map(|entry| *entry.value())
    }

    /// Snapshot of every recorded score.
    pub fn get_scores(&self) -> HashMap<QueryInfo, f64> {
        self.scores
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }

    /// Names of the query sets seen so far, without the global pseudo-set.
    pub fn query_sets(&self) -> Vec<String> {
        let mut sets: Vec<String> = self
            .query_sets
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|name| name != ALL_QUERY_SETS)
            .collect();
        sets.sort();
        sets
    }

    /// Statistics over the scores recorded for `query_set`; zeros when the
    /// set is unknown or empty.
    pub fn summary(&self, query_set: &str) -> SummaryStatistics {
        let values: Vec<f64> = match self.query_sets.get(query_set) {
            Some(members) => members
                .iter()
                .filter_map(|query| self.scores.get(query).map(|s| *s.value()))
                .collect(),
            None => Vec::new(),
        };
        SummaryStatistics::compute(self.kind, &values)
    }

    pub fn summary_all(&self) -> SummaryStatistics {
        self.summary(ALL_QUERY_SETS)
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    pub fn clear(&self) {
        self.scores.clear();
        self.query_sets.clear();
    }
}

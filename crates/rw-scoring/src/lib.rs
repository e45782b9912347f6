//! Rank metrics and thread-safe score aggregation for Rankwise.
//!
//! Provides:
//! - A closed registry of scorers (NDCG, ERR, precision/recall, rank-based and counting metrics)
//! - A concurrent per-query accumulator with per-query-set summary statistics

pub mod aggregator;
pub mod scorers;

pub use aggregator::{ScoreAggregator, StatisticsKind, SummaryStatistics, ALL_QUERY_SETS};
pub use scorers::{
    dcg, err, highest_rank, ideal_dcg, ndcg, validate_scorer_configs, NdcgType, Scorer, ScorerClass,
    ScorerConfig, ScorerParams, ScorerSet,
};

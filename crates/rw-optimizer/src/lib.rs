//! # rw-optimizer
//!
//! Parameter search and genetic tuning for Rankwise.
//!
//! Provides bounded enumeration and random search strategies, run tracking,
//! k-fold partitioning of judged queries, the generational genetic optimizer
//! and the JSON tuning configuration consumed by the `rw-tune` binary.

mod config;
mod folds;
mod genetic;
mod search;
mod trial;

pub use config::TuningConfig;
pub use folds::Folds;
pub use genetic::{crossover, fitness_proportion, GaConfig, GaOptimizer, GaReport, GenerationStats};
pub use search::{instantiate, GridSearch, RandomSearch, SearchStrategy, Tuner};
pub use trial::{ObjectiveDirection, RunId, RunState, RunStatus, TrialResult};

//! Run tracking for search and tuning drivers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Unique tuning run identifier.
pub type RunId = Uuid;

/// Whether we are maximizing or minimizing the objective.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectiveDirection {
    #[default]
    Maximize,
    Minimize,
}

impl ObjectiveDirection {
    /// True when `candidate` beats `incumbent`.
    pub fn improves(&self, candidate: f64, incumbent: f64) -> bool {
        match self {
            Self::Maximize => candidate > incumbent,
            Self::Minimize => candidate < incumbent,
        }
    }
}

/// Lifecycle state for a tuning run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Result of evaluating one experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialResult {
    pub experiment: String,
    pub objective: f64,
    /// Primary statistic of every scorer over all queries.
    pub metrics: BTreeMap<String, f64>,
    pub duration_ms: Option<u64>,
}

/// Aggregate status of a tuning run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStatus {
    pub id: RunId,
    pub strategy: String,
    pub objective_scorer: String,
    pub direction: ObjectiveDirection,
    pub state: RunState,
    pub completed: usize,
    /// Experiments the repository had already scored.
    pub skipped: usize,
    pub failed: usize,
    pub best: Option<TrialResult>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl RunStatus {
    pub fn new(strategy: impl Into<String>, objective_scorer: impl Into<String>, direction: ObjectiveDirection) -> Self {
        Self {
            id: Uuid::new_v4(),
            strategy: strategy.into(),
            objective_scorer: objective_scorer.into(),
            direction,
            state: RunState::Pending,
            completed: 0,
            skipped: 0,
            failed: 0,
            best: None,
            started_at: None,
            finished_at: None,
            error: None,
        }
    }

    pub fn mark_running(&mut self) {
        self.state = RunState::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn mark_completed(&mut self) {
        self.state = RunState::Completed;
        self.finished_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, error: String) {
        self.state = RunState::Failed;
        self.finished_at = Some(Utc::now());
        self.error = Some(error);
    }

    /// Record a finished evaluation and keep it if it beats the current best.
    pub fn record(&mut self, result: TrialResult) {
        self.completed += 1;
        self.update_best(result);
    }

    pub fn update_best(&mut self, result: TrialResult) {
        let better = match &self.best {
            None => true,
            Some(best) => self.direction.improves(result.objective, best.objective),
        };
        if better {
            self.best = Some(result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(name: &str, objective: f64) -> TrialResult {
        TrialResult {
            experiment: name.to_string(),
            objective,
            metrics: BTreeMap::new(),
            duration_ms: Some(10),
        }
    }

    #[test]
    fn status_lifecycle() {
        let mut status = RunStatus::new("grid", "NDCG@10", ObjectiveDirection::Maximize);
        assert_eq!(status.state, RunState::Pending);
        assert!(status.started_at.is_none());

        status.mark_running();
        assert_eq!(status.state, RunState::Running);
        assert!(status.started_at.is_some());

        status.mark_completed();
        assert_eq!(status.state, RunState::Completed);
        assert!(status.finished_at.is_some());
    }

    #[test]
    fn best_tracking_maximize() {
        let mut status = RunStatus::new("random", "NDCG@10", ObjectiveDirection::Maximize);
        status.record(result("a", 0.5));
        status.record(result("b", 0.7));
        // worse result does not replace
        status.record(result("c", 0.6));
        assert_eq!(status.completed, 3);
        assert_eq!(status.best.as_ref().unwrap().experiment, "b");
    }

    #[test]
    fn best_tracking_minimize() {
        let mut status = RunStatus::new("random", "ZeroResults@10", ObjectiveDirection::Minimize);
        status.record(result("a", 4.0));
        status.record(result("b", 1.0));
        assert_eq!(status.best.as_ref().unwrap().objective, 1.0);
    }

    #[test]
    fn failure_keeps_message() {
        let mut status = RunStatus::new("grid", "P@5", ObjectiveDirection::Maximize);
        status.mark_running();
        status.mark_failed("repository unavailable".into());
        assert_eq!(status.state, RunState::Failed);
        assert_eq!(status.error.as_deref(), Some("repository unavailable"));
    }
}

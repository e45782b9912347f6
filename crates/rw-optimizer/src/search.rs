//! Bounded enumeration and random sampling of experiments, and the driver
//! that evaluates their suggestions.

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{error, info, warn};

use rw_data::Repository;
use rw_engine::{ExperimentRunner, RunOutcome};
use rw_scoring::{ScorerConfig, ALL_QUERY_SETS};
use rw_types::{config_error, Experiment, Feature, FeatureFactories, JudgmentList, RwResult};

use crate::trial::{ObjectiveDirection, RunStatus, TrialResult};

/// A strategy that proposes experiments to evaluate.
pub trait SearchStrategy: Send + Sync {
    /// Up to `count` new experiments. An empty batch means exhausted.
    fn suggest(&mut self, count: usize) -> RwResult<Vec<Experiment>>;

    /// Feed back the objective of an evaluated experiment.
    fn report(&mut self, _experiment: &Experiment, _objective: f64) {}

    fn name(&self) -> &str;
}

/// Copy of `base` carrying `name` and `params`; fixed settings are kept.
pub fn instantiate(base: &Experiment, name: String, params: BTreeMap<String, Feature>) -> Experiment {
    Experiment {
        name,
        params,
        ..base.clone()
    }
}

// ---- Grid search ----

/// Cartesian product of every factory's bounded permutations.
#[derive(Debug, Clone)]
pub struct GridSearch {
    base: Experiment,
    prefix: String,
    cursor: usize,
    combos: Vec<BTreeMap<String, Feature>>,
}

impl GridSearch {
    pub fn new(
        factories: &FeatureFactories,
        base: Experiment,
        max_per_feature: usize,
        max_experiments: usize,
        prefix: impl Into<String>,
    ) -> Self {
        let combos = Self::build_grid(factories, max_per_feature, max_experiments);
        info!(
            "Grid over {} parameters holds {} experiments",
            factories.len(),
            combos.len()
        );
        Self {
            base,
            prefix: prefix.into(),
            cursor: 0,
            combos,
        }
    }

    pub fn len(&self) -> usize {
        self.combos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.combos.is_empty()
    }

    fn build_grid(
        factories: &FeatureFactories,
        max_per_feature: usize,
        max_experiments: usize,
    ) -> Vec<BTreeMap<String, Feature>> {
        let mut result: Vec<BTreeMap<String, Feature>> = vec![BTreeMap::new()];
        for (name, factory) in factories.iter() {
            let axis = factory.permute(max_per_feature);
            if axis.is_empty() {
                warn!("Feature {} has no values to enumerate; leaving it out of the grid", name);
                continue;
            }
            let mut next = Vec::with_capacity((result.len() * axis.len()).min(max_experiments));
            'outer: for existing in &result {
                for value in &axis {
                    if next.len() >= max_experiments {
                        break 'outer;
                    }
                    let mut combo = existing.clone();
                    combo.insert(name.to_string(), value.clone());
                    next.push(combo);
                }
            }
            result = next;
        }
        result.truncate(max_experiments);
        result
    }
}

impl SearchStrategy for GridSearch {
    fn suggest(&mut self, count: usize) -> RwResult<Vec<Experiment>> {
        let end = (self.cursor + count).min(self.combos.len());
        let batch = (self.cursor..end)
            .map(|i| instantiate(&self.base, format!("{}_{}", self.prefix, i), self.combos[i].clone()))
            .collect();
        self.cursor = end;
        Ok(batch)
    }

    fn name(&self) -> &str {
        "grid"
    }
}

// ---- Random search ----

/// Independent random sampling from every factory with a seeded generator.
#[derive(Debug, Clone)]
pub struct RandomSearch {
    factories: FeatureFactories,
    base: Experiment,
    prefix: String,
    rng: ChaCha8Rng,
    drawn: usize,
}

impl RandomSearch {
    pub fn new(factories: FeatureFactories, base: Experiment, seed: u64, prefix: impl Into<String>) -> Self {
        Self {
            factories,
            base,
            prefix: prefix.into(),
            rng: ChaCha8Rng::seed_from_u64(seed),
            drawn: 0,
        }
    }
}

impl SearchStrategy for RandomSearch {
    fn suggest(&mut self, count: usize) -> RwResult<Vec<Experiment>> {
        let mut batch = Vec::with_capacity(count);
        for _ in 0..count {
            let params = self.factories.random_params(&mut self.rng)?;
            batch.push(instantiate(&self.base, format!("{}_{}", self.prefix, self.drawn), params));
            self.drawn += 1;
        }
        Ok(batch)
    }

    fn name(&self) -> &str {
        "random"
    }
}

// ---- Driver ----

/// Evaluates strategy suggestions and tracks the run.
pub struct Tuner<'a> {
    runner: &'a ExperimentRunner,
    repository: &'a dyn Repository,
    judgments: &'a JudgmentList,
    scorers: &'a [ScorerConfig],
    objective: String,
    direction: ObjectiveDirection,
}

impl<'a> Tuner<'a> {
    /// `objective` names the scorer whose primary statistic over all queries
    /// is reported back to the strategy.
    pub fn new(
        runner: &'a ExperimentRunner,
        repository: &'a dyn Repository,
        judgments: &'a JudgmentList,
        scorers: &'a [ScorerConfig],
        objective: impl Into<String>,
        direction: ObjectiveDirection,
    ) -> RwResult<Self> {
        let objective = objective.into();
        if !scorers.iter().any(|s| s.name() == objective) {
            return Err(config_error!("objective scorer {objective} is not configured"));
        }
        Ok(Self {
            runner,
            repository,
            judgments,
            scorers,
            objective,
            direction,
        })
    }

    /// Evaluate at most `max_experiments` suggestions, asking for
    /// `batch_size` at a time. A run-level failure aborts the run.
    pub fn run(
        &self,
        strategy: &mut dyn SearchStrategy,
        max_experiments: usize,
        batch_size: usize,
    ) -> RwResult<RunStatus> {
        let mut status = RunStatus::new(strategy.name(), self.objective.clone(), self.direction);
        status.mark_running();
        info!(
            "Starting {} search over at most {} experiments, objective {}",
            strategy.name(),
            max_experiments,
            self.objective
        );

        let mut evaluated = 0;
        while evaluated < max_experiments {
            let wanted = batch_size.max(1).min(max_experiments - evaluated);
            let batch = match strategy.suggest(wanted) {
                Ok(batch) => batch,
                Err(e) => return Err(self.fail(&mut status, e)),
            };
            if batch.is_empty() {
                break;
            }
            for experiment in batch {
                evaluated += 1;
                match self.evaluate(&experiment) {
                    Ok(Some(result)) => {
                        strategy.report(&experiment, result.objective);
                        status.record(result);
                    }
                    Ok(None) => status.skipped += 1,
                    Err(e) => {
                        status.failed += 1;
                        return Err(self.fail(&mut status, e));
                    }
                }
            }
        }

        status.mark_completed();
        match &status.best {
            Some(best) => info!(
                "{} search finished: {} evaluated, {} skipped, best {} with {} = {:.4}",
                status.strategy, status.completed, status.skipped, best.experiment, self.objective, best.objective
            ),
            None => info!(
                "{} search finished: {} evaluated, {} skipped",
                status.strategy, status.completed, status.skipped
            ),
        }
        Ok(status)
    }

    /// `None` when the repository already holds scores for the experiment.
    pub fn evaluate(&self, experiment: &Experiment) -> RwResult<Option<TrialResult>> {
        let start = Instant::now();
        let outcome = self
            .runner
            .run_and_store(experiment, self.judgments, self.scorers, self.repository)?;
        let scorers = match outcome {
            RunOutcome::Skipped => return Ok(None),
            RunOutcome::Completed { scorers, .. } => scorers,
        };
        let metrics: BTreeMap<String, f64> = scorers
            .summaries(ALL_QUERY_SETS)
            .into_iter()
            .map(|(name, stats)| (name, stats.primary()))
            .collect();
        let objective = metrics.get(&self.objective).copied().unwrap_or(0.0);
        Ok(Some(TrialResult {
            experiment: experiment.name.clone(),
            objective,
            metrics,
            duration_ms: Some(start.elapsed().as_millis() as u64),
        }))
    }

    fn fail(&self, status: &mut RunStatus, e: rw_types::RwError) -> rw_types::RwError {
        error!("{} search aborted: {}", status.strategy, e);
        status.mark_failed(e.to_string());
        e
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rw_types::{ChoiceFactory, FeatureFactory, FloatFactory};

    fn factories() -> FeatureFactories {
        FeatureFactories::new()
            .with(
                "tie",
                FeatureFactory::Float(FloatFactory::new(0.0, 1.0).with_values(vec![0.0, 0.1, 0.3])),
            )
            .unwrap()
            .with(
                "q.op",
                FeatureFactory::Choice(ChoiceFactory::new(vec!["AND".into(), "OR".into()])),
            )
            .unwrap()
    }

    fn base() -> Experiment {
        Experiment::new("base", "http://localhost:8983/solr/products")
            .with_handler("select")
            .with_filter_queries(["inStock:true"])
    }

    #[test]
    fn grid_is_cartesian_product_in_name_order() {
        let mut grid = GridSearch::new(&factories(), base(), 10, 100, "grid");
        assert_eq!(grid.len(), 6);

        let first = grid.suggest(4).unwrap();
        assert_eq!(first.len(), 4);
        assert_eq!(first[0].name, "grid_0");
        assert_eq!(first[0].param("q.op"), Some(&Feature::Choice("AND".into())));
        assert_eq!(first[0].param("tie"), Some(&Feature::Float(0.0)));
        assert_eq!(first[1].param("tie"), Some(&Feature::Float(0.1)));
        assert_eq!(first[3].param("q.op"), Some(&Feature::Choice("OR".into())));
        assert!(first.iter().all(|e| e.custom_handler.as_deref() == Some("select")));

        let rest = grid.suggest(4).unwrap();
        assert_eq!(rest.len(), 2);
        assert_eq!(rest[1].name, "grid_5");
        assert!(grid.suggest(4).unwrap().is_empty());
    }

    #[test]
    fn grid_respects_caps() {
        let grid = GridSearch::new(&factories(), base(), 2, 100, "g");
        assert_eq!(grid.len(), 4);
        let grid = GridSearch::new(&factories(), base(), 10, 5, "g");
        assert_eq!(grid.len(), 5);
    }

    #[test]
    fn random_search_is_reproducible() {
        let mut a = RandomSearch::new(factories(), base(), 7, "rnd");
        let mut b = RandomSearch::new(factories(), base(), 7, "rnd");
        let first = a.suggest(5).unwrap();
        assert_eq!(first, b.suggest(5).unwrap());
        assert_eq!(first[4].name, "rnd_4");
        assert_eq!(a.suggest(1).unwrap()[0].name, "rnd_5");
        assert!(first.iter().all(|e| e.params.len() == 2));
    }
}

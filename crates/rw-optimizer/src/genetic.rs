//! Generational genetic optimizer with k-fold cross-validation.
//!
//! Each generation holds out one fold of judged queries. Individuals are
//! scored on the remaining folds with the train scorer; that score is the
//! fitness used for selection. The generation's best individual is then
//! scored on the held-out fold.

use rand::distributions::{Distribution, WeightedIndex};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, info};

use rw_engine::ExperimentRunner;
use rw_scoring::{validate_scorer_configs, ScorerConfig, ScorerSet, ALL_QUERY_SETS};
use rw_types::{config_error, invariant_error, Experiment, FeatureFactories, Judgments, RwResult};

use crate::folds::Folds;
use crate::search::instantiate;

/// Genetic optimizer settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GaConfig {
    pub population_size: usize,
    pub generations: usize,
    pub n_folds: usize,
    /// Chance that a child is produced by mutation.
    pub mutation_probability: f64,
    pub mutation_amplitude: f64,
    /// Chance that a child is produced by crossover. The remainder reproduces.
    pub crossover_probability: f64,
    /// Chance that each parameter of a mutated child changes.
    pub feature_mutation_probability: f64,
    /// Drawn at random and logged when unset.
    pub seed: Option<u64>,
    pub fitness_epsilon: f64,
    /// Evaluate the individuals of a generation in parallel.
    pub parallel_individuals: bool,
    pub name_prefix: String,
}

impl Default for GaConfig {
    fn default() -> Self {
        Self {
            population_size: 20,
            generations: 10,
            n_folds: 3,
            mutation_probability: 0.3,
            mutation_amplitude: 0.2,
            crossover_probability: 0.5,
            feature_mutation_probability: 0.5,
            seed: None,
            fitness_epsilon: 1e-3,
            parallel_individuals: false,
            name_prefix: "ga".to_string(),
        }
    }
}

impl GaConfig {
    pub fn new(population_size: usize, generations: usize) -> Self {
        Self {
            population_size,
            generations,
            ..Self::default()
        }
    }

    pub fn with_folds(mut self, n_folds: usize) -> Self {
        self.n_folds = n_folds;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_probabilities(mut self, crossover: f64, mutation: f64) -> Self {
        self.crossover_probability = crossover;
        self.mutation_probability = mutation;
        self
    }

    pub fn with_mutation(mut self, feature_probability: f64, amplitude: f64) -> Self {
        self.feature_mutation_probability = feature_probability;
        self.mutation_amplitude = amplitude;
        self
    }

    pub fn with_parallel_individuals(mut self, parallel: bool) -> Self {
        self.parallel_individuals = parallel;
        self
    }

    pub fn with_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = prefix.into();
        self
    }

    pub fn validate(&self) -> RwResult<()> {
        if self.population_size == 0 {
            return Err(config_error!("populationSize must be at least 1"));
        }
        if self.generations == 0 {
            return Err(config_error!("generations must be at least 1"));
        }
        if self.n_folds < 2 {
            return Err(config_error!("nFolds must be at least 2, got {}", self.n_folds));
        }
        for (name, p) in [
            ("mutationProbability", self.mutation_probability),
            ("crossoverProbability", self.crossover_probability),
            ("featureMutationProbability", self.feature_mutation_probability),
        ] {
            if !(0.0..=1.0).contains(&p) {
                return Err(config_error!("{name} must be within [0, 1], got {p}"));
            }
        }
        if self.crossover_probability + self.mutation_probability > 1.0 + 1e-9 {
            return Err(config_error!(
                "crossoverProbability + mutationProbability must not exceed 1"
            ));
        }
        if !(self.mutation_amplitude >= 0.0 && self.mutation_amplitude.is_finite()) {
            return Err(config_error!("mutationAmplitude must be a non-negative number"));
        }
        if !(self.fitness_epsilon > 0.0 && self.fitness_epsilon.is_finite()) {
            return Err(config_error!("fitnessEpsilon must be positive"));
        }
        if self.name_prefix.is_empty() {
            return Err(config_error!("namePrefix must not be empty"));
        }
        Ok(())
    }
}

/// Selection weights `(s - min + epsilon) / sum(s - min + epsilon)`.
///
/// Every weight is positive. Negative or non-finite fitness is rejected.
pub fn fitness_proportion(scores: &[f64], epsilon: f64) -> RwResult<Vec<f64>> {
    if let Some(bad) = scores.iter().find(|s| !s.is_finite() || **s < 0.0) {
        return Err(invariant_error!("fitness must be a non-negative number, got {bad}"));
    }
    let Some(min) = scores.iter().copied().reduce(f64::min) else {
        return Ok(Vec::new());
    };
    let shifted: Vec<f64> = scores.iter().map(|s| s - min + epsilon).collect();
    let total: f64 = shifted.iter().sum();
    Ok(shifted.into_iter().map(|s| s / total).collect())
}

/// Swap whole parameters at one random split over the sorted union of both
/// parents' names. The first child keeps `a`'s fixed settings and the second
/// keeps `b`'s; a parameter only one parent has stays with that parent's child.
pub fn crossover<R: Rng + ?Sized>(a: &Experiment, b: &Experiment, rng: &mut R) -> (Experiment, Experiment) {
    let names: BTreeSet<&String> = a.params.keys().chain(b.params.keys()).collect();
    let split = rng.gen_range(0..=names.len());
    let mut first = a.clone();
    let mut second = b.clone();

    for name in names.into_iter().skip(split) {
        if let (Some(from_a), Some(from_b)) = (a.params.get(name), b.params.get(name)) {
            first.params.insert(name.clone(), from_b.clone());
            second.params.insert(name.clone(), from_a.clone());
        }
    }
    (first, second)
}

/// `run_prefix` is `{name_prefix}_{seed}`.
fn individual_name(run_prefix: &str, generation: usize, index: usize) -> String {
    format!("{run_prefix}_{generation}_{index}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    Crossover,
    Mutate,
    Reproduce,
}

/// Scores of one generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationStats {
    pub generation: usize,
    pub held_out_fold: usize,
    pub best_experiment: String,
    pub best_train: f64,
    pub mean_train: f64,
    /// Train scorer on the held-out fold.
    pub test: f64,
    /// Test scorer on the held-out fold, when one is configured.
    pub test_metric: Option<f64>,
}

/// Outcome of a genetic run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GaReport {
    pub seed: u64,
    pub train_scorer: String,
    pub test_scorer: Option<String>,
    pub generations: Vec<GenerationStats>,
    /// Highest train fitness across generations.
    pub best: Experiment,
    pub best_train: f64,
    pub best_test: f64,
    pub best_test_metric: Option<f64>,
}

struct Evaluation {
    train: f64,
    test_metric: Option<f64>,
}

pub struct GaOptimizer<'a> {
    runner: &'a ExperimentRunner,
    factories: &'a FeatureFactories,
    scorers: &'a [ScorerConfig],
    base: Experiment,
    config: GaConfig,
    seeds: Vec<Experiment>,
}

impl<'a> GaOptimizer<'a> {
    /// `base` supplies the fixed settings (target, handler, filters) of every
    /// individual. Exactly one scorer must be flagged for training.
    pub fn new(
        runner: &'a ExperimentRunner,
        factories: &'a FeatureFactories,
        scorers: &'a [ScorerConfig],
        base: Experiment,
        config: GaConfig,
    ) -> RwResult<Self> {
        config.validate()?;
        factories.validate()?;
        validate_scorer_configs(scorers, true)?;
        Ok(Self {
            runner,
            factories,
            scorers,
            base,
            config,
            seeds: Vec::new(),
        })
    }

    /// Start from these experiments; remaining slots are random.
    pub fn with_seed_population(mut self, seeds: Vec<Experiment>) -> RwResult<Self> {
        for seed in &seeds {
            self.factories.check_params(seed.params.keys())?;
        }
        self.seeds = seeds;
        Ok(self)
    }

    pub fn config(&self) -> &GaConfig {
        &self.config
    }

    pub fn run(&self, judgments: &[Judgments]) -> RwResult<GaReport> {
        let seed = self.config.seed.unwrap_or_else(rand::random);
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let folds = Folds::partition(judgments, self.config.n_folds, &mut rng)?;
        let probe = ScorerSet::from_configs(self.scorers)?;
        let train_scorer = probe
            .train_scorer()
            .map(|s| s.name().to_string())
            .ok_or_else(|| config_error!("exactly one scorer must be flagged useForTrain"))?;
        let test_scorer = probe.test_scorer().map(|s| s.name().to_string());

        info!(
            "Starting GA: population {}, {} generations, {} folds over {} queries, seed {}",
            self.config.population_size,
            self.config.generations,
            folds.len(),
            judgments.len(),
            seed
        );

        let run_prefix = format!("{}_{}", self.config.name_prefix, seed);
        let mut population = self.initial_population(&run_prefix, &mut rng)?;
        let mut history = Vec::with_capacity(self.config.generations);
        let mut overall: Option<(Experiment, f64, Evaluation)> = None;

        for generation in 0..self.config.generations {
            let fold = folds.held_out(generation);
            let train = folds.train(fold);
            let fitness = self.evaluate_population(&population, &train, &train_scorer)?;

            let (best_index, best_train) = fitness
                .iter()
                .copied()
                .enumerate()
                .fold((0, f64::NEG_INFINITY), |best, (i, f)| if f > best.1 { (i, f) } else { best });
            let mean_train = fitness.iter().sum::<f64>() / fitness.len() as f64;
            let best = &population[best_index];
            let held_out = self.evaluate(best, folds.test(fold), &train_scorer, test_scorer.as_deref())?;

            info!(
                "Generation {}: best {} train {:.4} (mean {:.4}), held-out fold {} test {:.4}",
                generation, best.name, best_train, mean_train, fold, held_out.train
            );
            history.push(GenerationStats {
                generation,
                held_out_fold: fold,
                best_experiment: best.name.clone(),
                best_train,
                mean_train,
                test: held_out.train,
                test_metric: held_out.test_metric,
            });
            if overall.as_ref().map_or(true, |(_, train, _)| best_train > *train) {
                overall = Some((best.clone(), best_train, held_out));
            }

            if generation + 1 < self.config.generations {
                population = self.breed(&population, &fitness, &run_prefix, generation + 1, &mut rng)?;
            }
        }

        let (best, best_train, held_out) =
            overall.ok_or_else(|| invariant_error!("GA finished without evaluating a generation"))?;
        info!(
            "GA finished: best {} train {:.4} test {:.4}",
            best.name, best_train, held_out.train
        );
        Ok(GaReport {
            seed,
            train_scorer,
            test_scorer,
            generations: history,
            best,
            best_train,
            best_test: held_out.train,
            best_test_metric: held_out.test_metric,
        })
    }

    fn initial_population(&self, run_prefix: &str, rng: &mut ChaCha8Rng) -> RwResult<Vec<Experiment>> {
        let size = self.config.population_size;
        let mut population: Vec<Experiment> = self
            .seeds
            .iter()
            .take(size)
            .enumerate()
            .map(|(i, seed)| Experiment {
                name: individual_name(run_prefix, 0, i),
                ..seed.clone()
            })
            .collect();
        if !population.is_empty() {
            info!("Seeded {} of {} individuals", population.len(), size);
        }
        while population.len() < size {
            let params = self.factories.random_params(rng)?;
            population.push(instantiate(&self.base, individual_name(run_prefix, 0, population.len()), params));
        }
        Ok(population)
    }

    fn evaluate_population(
        &self,
        population: &[Experiment],
        queries: &[&Judgments],
        train_scorer: &str,
    ) -> RwResult<Vec<f64>> {
        let evaluate = |individual: &Experiment| {
            self.evaluate(individual, queries, train_scorer, None)
                .map(|e| e.train)
        };
        if self.config.parallel_individuals {
            population.par_iter().map(evaluate).collect()
        } else {
            population.iter().map(evaluate).collect()
        }
    }

    fn evaluate(
        &self,
        experiment: &Experiment,
        queries: &[&Judgments],
        train_scorer: &str,
        test_scorer: Option<&str>,
    ) -> RwResult<Evaluation> {
        let scorers = ScorerSet::from_configs(self.scorers)?;
        self.runner.evaluate(experiment, queries, &scorers);
        let primary = |name: &str| scorers.get(name).map(|s| s.summary(ALL_QUERY_SETS).primary());
        let train = primary(train_scorer)
            .ok_or_else(|| invariant_error!("train scorer {train_scorer} missing from scorer set"))?;
        debug!("Individual {} scored {:.4}", experiment.name, train);
        Ok(Evaluation {
            train,
            test_metric: test_scorer.and_then(primary),
        })
    }

    fn breed(
        &self,
        population: &[Experiment],
        fitness: &[f64],
        run_prefix: &str,
        generation: usize,
        rng: &mut ChaCha8Rng,
    ) -> RwResult<Vec<Experiment>> {
        let proportions = fitness_proportion(fitness, self.config.fitness_epsilon)?;
        let selector = WeightedIndex::new(&proportions).map_err(|e| invariant_error!("fitness selection: {e}"))?;
        let size = self.config.population_size;
        let mut children = Vec::with_capacity(size);

        while children.len() < size {
            let operation = match self.sample_operation(rng) {
                Operation::Crossover if population.len() < 2 => Operation::Reproduce,
                operation => operation,
            };
            match operation {
                Operation::Crossover => {
                    let a = &population[selector.sample(rng)];
                    let b = &population[selector.sample(rng)];
                    let (first, second) = crossover(a, b, rng);
                    children.push(first);
                    if children.len() < size {
                        children.push(second);
                    }
                }
                Operation::Mutate => {
                    let parent = &population[selector.sample(rng)];
                    let params = self.factories.mutate_params(
                        &parent.params,
                        self.config.feature_mutation_probability,
                        self.config.mutation_amplitude,
                        rng,
                    )?;
                    children.push(Experiment {
                        params,
                        ..parent.clone()
                    });
                }
                Operation::Reproduce => children.push(population[selector.sample(rng)].clone()),
            }
        }

        for (i, child) in children.iter_mut().enumerate() {
            child.name = individual_name(run_prefix, generation, i);
        }
        Ok(children)
    }

    fn sample_operation<R: Rng + ?Sized>(&self, rng: &mut R) -> Operation {
        let r: f64 = rng.gen();
        if r < self.config.crossover_probability {
            Operation::Crossover
        } else if r < self.config.crossover_probability + self.config.mutation_probability {
            Operation::Mutate
        } else {
            Operation::Reproduce
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rw_types::{Feature, RwError};

    #[test]
    fn default_config_is_valid() {
        assert!(GaConfig::default().validate().is_ok());
    }

    #[test]
    fn config_rejects_bad_values() {
        assert!(GaConfig::new(0, 1).validate().is_err());
        assert!(GaConfig::new(4, 0).validate().is_err());
        assert!(GaConfig::new(4, 2).with_folds(1).validate().is_err());
        assert!(GaConfig::new(4, 2).with_probabilities(0.7, 0.5).validate().is_err());
        assert!(GaConfig::new(4, 2).with_probabilities(0.5, 0.5).validate().is_ok());
        assert!(GaConfig::new(4, 2).with_mutation(1.5, 0.1).validate().is_err());
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let config: GaConfig = serde_json::from_str(r#"{"populationSize": 8, "seed": 5}"#).unwrap();
        assert_eq!(config.population_size, 8);
        assert_eq!(config.seed, Some(5));
        assert_eq!(config.n_folds, 3);
        assert_eq!(config.name_prefix, "ga");
    }

    #[test]
    fn fitness_proportion_handles_ties_and_singletons() {
        let single = fitness_proportion(&[0.4], 1e-3).unwrap();
        assert_eq!(single, vec![1.0]);

        let ties = fitness_proportion(&[0.2, 0.2, 0.2, 0.2], 1e-3).unwrap();
        assert!(ties.iter().all(|p| (p - 0.25).abs() < 1e-12));

        let spread = fitness_proportion(&[0.0, 0.5, 1.0], 1e-3).unwrap();
        assert!(spread[0] > 0.0);
        assert!(spread[2] > spread[1]);
        assert!((spread.iter().sum::<f64>() - 1.0).abs() < 1e-9);

        assert!(fitness_proportion(&[], 1e-3).unwrap().is_empty());
    }

    #[test]
    fn negative_fitness_fails_fast() {
        assert!(matches!(
            fitness_proportion(&[0.3, -0.1], 1e-3),
            Err(RwError::Invariant(_))
        ));
    }

    #[test]
    fn crossover_keeps_exclusive_parameters_with_their_parent() {
        let a = Experiment::new("a", "http://a")
            .with_handler("select")
            .with_param("mm", Feature::Choice("2".into()))
            .with_param("tie", Feature::Float(0.1));
        let b = Experiment::new("b", "http://b")
            .with_param("pf", Feature::Choice("title".into()))
            .with_param("tie", Feature::Float(0.9));

        let mut rng = ChaCha8Rng::seed_from_u64(1);
        for _ in 0..20 {
            let (first, second) = crossover(&a, &b, &mut rng);
            assert_eq!(first.url, "http://a");
            assert_eq!(first.custom_handler.as_deref(), Some("select"));
            assert_eq!(second.url, "http://b");
            assert!(first.params.contains_key("mm") && !first.params.contains_key("pf"));
            assert!(second.params.contains_key("pf") && !second.params.contains_key("mm"));

            let ties = [first.param("tie"), second.param("tie")];
            assert!(ties.contains(&Some(&Feature::Float(0.1))));
            assert!(ties.contains(&Some(&Feature::Float(0.9))));
        }
    }
}

//! Genetic optimizer and search driver against an in-process backend.

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rw_data::{InMemoryRepository, Repository};
use rw_engine::{ExperimentRunner, RunnerConfig, SearchClient, SearchRequest, TermCount};
use rw_optimizer::*;
use rw_scoring::{ScorerClass, ScorerConfig, ScorerSet, ALL_QUERY_SETS};
use rw_types::{
    BackendError, ChoiceFactory, Experiment, FeatureFactories, FeatureFactory, FloatFactory, JudgmentList, Judgments,
    QueryInfo, SearchResultSet,
};

/// Returns the strong document first when `order=good`.
#[derive(Default)]
struct OrderingBackend {
    searches: AtomicUsize,
}

impl SearchClient for OrderingBackend {
    fn name(&self) -> &str {
        "ordering"
    }

    fn search(&self, request: &SearchRequest) -> Result<SearchResultSet, BackendError> {
        self.searches.fetch_add(1, Ordering::SeqCst);
        let strong = format!("{}_a", request.query);
        let weak = format!("{}_b", request.query);
        let ids = if request.param("order") == Some("good") {
            vec![strong, weak]
        } else {
            vec![weak, strong]
        };
        Ok(SearchResultSet::new(ids, 2))
    }

    fn analyze(&self, _field: &str, text: &str) -> Result<Vec<String>, BackendError> {
        Ok(vec![text.to_string()])
    }

    fn get_terms(&self, _: &str, _: &str, _: usize, _: u64) -> Result<Vec<TermCount>, BackendError> {
        Ok(Vec::new())
    }

    fn lookup_ids(&self, _: &str, ids: &[String]) -> Result<HashSet<String>, BackendError> {
        Ok(ids.iter().cloned().collect())
    }
}

fn judgments(n: usize) -> JudgmentList {
    (0..n)
        .map(|i| {
            let query = format!("q{i}");
            Judgments::new(QueryInfo::for_query(query.clone()))
                .with_judgment(format!("{query}_a"), 3.0)
                .with_judgment(format!("{query}_b"), 1.0)
        })
        .collect()
}

fn factories() -> FeatureFactories {
    FeatureFactories::new()
        .with(
            "order",
            FeatureFactory::Choice(ChoiceFactory::new(vec!["good".into(), "bad".into()])),
        )
        .unwrap()
        .with(
            "tie",
            FeatureFactory::Float(FloatFactory::new(0.0, 1.0).with_values(vec![0.0, 0.5])),
        )
        .unwrap()
}

fn scorers() -> Vec<ScorerConfig> {
    vec![
        ScorerConfig::new(ScorerClass::Ndcg, 10).for_train(),
        ScorerConfig::new(ScorerClass::Precision, 1).for_test(),
    ]
}

fn base() -> Experiment {
    Experiment::new("base", "http://fake").with_filter_queries(["inStock:true"])
}

fn runner(backend: Arc<OrderingBackend>) -> ExperimentRunner {
    ExperimentRunner::new(backend, RunnerConfig::new(2)).unwrap()
}

#[test]
fn single_individual_single_generation_never_breeds() {
    let backend = Arc::new(OrderingBackend::default());
    let runner = runner(backend.clone());
    let all = judgments(9);
    let factories = factories();
    let scorers = scorers();
    let config = GaConfig::new(1, 1).with_folds(3).with_seed(17);

    let optimizer = GaOptimizer::new(&runner, &factories, &scorers, base(), config).unwrap();
    let report = optimizer.run(all.as_slice()).unwrap();

    assert_eq!(report.generations.len(), 1);
    assert_eq!(report.best.name, "ga_17_0_0");
    assert_eq!(report.generations[0].held_out_fold, 0);
    assert_eq!(report.train_scorer, "NDCG@10");
    assert_eq!(report.test_scorer.as_deref(), Some("Precision@1"));
    // one train pass and one held-out pass
    assert_eq!(backend.searches.load(Ordering::SeqCst), 9);

    let mut rng = ChaCha8Rng::seed_from_u64(17);
    let folds = Folds::partition(all.as_slice(), 3, &mut rng).unwrap();
    let held_out = ScorerSet::from_configs(&scorers).unwrap();
    runner.evaluate(&report.best, folds.test(0), &held_out);
    let expected = held_out.get("NDCG@10").unwrap().summary(ALL_QUERY_SETS).primary();
    assert!((report.best_test - expected).abs() < 1e-12);

    let precision = held_out.get("Precision@1").unwrap().summary(ALL_QUERY_SETS).primary();
    assert_eq!(report.best_test_metric, Some(precision));
}

#[test]
fn seeded_runs_are_reproducible_and_parallel_matches_sequential() {
    let all = judgments(12);
    let factories = factories();
    let scorers = scorers();
    let config = GaConfig::new(6, 4).with_folds(3).with_seed(5);

    let run = |config: GaConfig| {
        let runner = runner(Arc::new(OrderingBackend::default()));
        GaOptimizer::new(&runner, &factories, &scorers, base(), config)
            .unwrap()
            .run(all.as_slice())
            .unwrap()
    };

    let first = run(config.clone());
    let second = run(config.clone());
    let parallel = run(config.with_parallel_individuals(true));
    assert_eq!(first, second);
    assert_eq!(first, parallel);

    let folds: Vec<usize> = first.generations.iter().map(|g| g.held_out_fold).collect();
    assert_eq!(folds, vec![0, 1, 2, 0]);
    assert!(first.generations[3].best_experiment.starts_with("ga_5_3_"));

    let top = first
        .generations
        .iter()
        .map(|g| g.best_train)
        .fold(f64::NEG_INFINITY, f64::max);
    assert_eq!(first.best_train, top);
    assert!(first.generations.iter().all(|g| g.mean_train <= g.best_train + 1e-12));
    assert_eq!(first.best.filter_queries, base().filter_queries);
}

#[test]
fn seed_population_is_used_first() {
    let runner = runner(Arc::new(OrderingBackend::default()));
    let all = judgments(6);
    let factories = factories();
    let scorers = scorers();
    let seed = base()
        .with_param("order", rw_types::Feature::Choice("good".into()))
        .with_param("tie", rw_types::Feature::Float(0.5));

    let report = GaOptimizer::new(&runner, &factories, &scorers, base(), GaConfig::new(1, 1).with_seed(3))
        .unwrap()
        .with_seed_population(vec![seed.clone()])
        .unwrap()
        .run(all.as_slice())
        .unwrap();
    assert_eq!(report.best.params, seed.params);
    assert_eq!(report.best_train, 1.0);

    let stray = base().with_param("boost", rw_types::Feature::Float(1.0));
    assert!(GaOptimizer::new(&runner, &factories, &scorers, base(), GaConfig::new(1, 1))
        .unwrap()
        .with_seed_population(vec![stray])
        .is_err());
}

#[test]
fn bests_of_differently_seeded_runs_are_both_stored() {
    let runner = runner(Arc::new(OrderingBackend::default()));
    let all = judgments(6);
    let factories = factories();
    let scorers = scorers();
    let repository = InMemoryRepository::new();

    let mut names = Vec::new();
    for seed in [1, 2] {
        let report = GaOptimizer::new(&runner, &factories, &scorers, base(), GaConfig::new(1, 1).with_seed(seed))
            .unwrap()
            .run(all.as_slice())
            .unwrap();
        let outcome = runner
            .run_and_store(&report.best, &all, &scorers, &repository)
            .unwrap();
        assert!(matches!(outcome, rw_engine::RunOutcome::Completed { .. }));
        assert_eq!(repository.get_experiment(&report.best.name).unwrap().params, report.best.params);
        names.push(report.best.name);
    }
    assert_eq!(names, vec!["ga_1_0_0".to_string(), "ga_2_0_0".to_string()]);
    assert_eq!(repository.get_experiments().unwrap().len(), 2);
}

#[test]
fn ga_requires_a_train_scorer() {
    let runner = runner(Arc::new(OrderingBackend::default()));
    let factories = factories();
    let scorers = vec![ScorerConfig::new(ScorerClass::Ndcg, 10)];
    assert!(GaOptimizer::new(&runner, &factories, &scorers, base(), GaConfig::default()).is_err());
}

#[test]
fn grid_tuning_stores_scores_and_skips_on_rerun() {
    let backend = Arc::new(OrderingBackend::default());
    let runner = runner(backend.clone());
    let all = judgments(4);
    let factories = factories();
    let scorers = scorers();
    let repository = InMemoryRepository::new();
    let tuner = Tuner::new(&runner, &repository, &all, &scorers, "NDCG@10", ObjectiveDirection::Maximize).unwrap();

    let mut grid = GridSearch::new(&factories, base(), 5, 10, "grid");
    let status = tuner.run(&mut grid, 10, 3).unwrap();
    assert_eq!(status.state, RunState::Completed);
    assert_eq!(status.completed, 4);
    assert_eq!(status.skipped, 0);
    let best = status.best.unwrap();
    assert_eq!(best.objective, 1.0);
    assert_eq!(best.metrics.get("Precision@1"), Some(&1.0));
    assert_eq!(repository.get_experiments().unwrap().len(), 4);
    assert_eq!(backend.searches.load(Ordering::SeqCst), 16);

    let mut again = GridSearch::new(&factories, base(), 5, 10, "grid");
    let status = tuner.run(&mut again, 10, 3).unwrap();
    assert_eq!(status.completed, 0);
    assert_eq!(status.skipped, 4);
    assert!(status.best.is_none());
    assert_eq!(backend.searches.load(Ordering::SeqCst), 16);

    let best = repository.get_n_best_experiments("grid", 2, "NDCG@10").unwrap();
    assert_eq!(best.len(), 2);
    assert!(best.iter().all(|(_, score)| *score == 1.0));
}

#[test]
fn tuner_rejects_unknown_objective() {
    let runner = runner(Arc::new(OrderingBackend::default()));
    let all = judgments(1);
    let scorers = scorers();
    let repository = InMemoryRepository::new();
    assert!(Tuner::new(&runner, &repository, &all, &scorers, "ERR@10", ObjectiveDirection::Maximize).is_err());
}

#[test]
fn random_tuning_respects_budget() {
    let runner = runner(Arc::new(OrderingBackend::default()));
    let all = judgments(3);
    let scorers = scorers();
    let repository = InMemoryRepository::new();
    let tuner = Tuner::new(&runner, &repository, &all, &scorers, "NDCG@10", ObjectiveDirection::Maximize).unwrap();

    let mut random = RandomSearch::new(factories(), base(), 99, "rnd");
    let status = tuner.run(&mut random, 5, 2).unwrap();
    assert_eq!(status.completed, 5);
    assert_eq!(status.strategy, "random");
}

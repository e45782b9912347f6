use anyhow::{anyhow, bail, Context};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use rw_data::{load_judgments_csv, InMemoryRepository, Repository};
use rw_engine::{
    validate_judgment_ids, ElasticClient, ExperimentRunner, RunOutcome, SearchClient, SolrClient,
    DEFAULT_BACKEND_TIMEOUT,
};
use rw_optimizer::{GaOptimizer, GridSearch, ObjectiveDirection, RandomSearch, SearchStrategy, Tuner, TuningConfig};

const USAGE: &str = "usage: RW_CONFIG=<tuning.json> RW_JUDGMENTS=<judgments.csv> \
[RW_MODE=ga|grid|random] [RW_BACKEND=solr|elastic] [RW_REPOSITORY=<repository.json>] \
[RW_BACKEND_TIMEOUT_SECS=30] [RW_MAX_EXPERIMENTS=100] [RW_MAX_PER_FEATURE=5] [RW_SEED=<u64>] rw-tune";

const ID_LOOKUP_BATCH: usize = 100;

fn required(name: &str) -> anyhow::Result<String> {
    env::var(name).map_err(|_| anyhow!("{name} is not set\n{USAGE}"))
}

fn parsed<T: std::str::FromStr>(name: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw.parse().map_err(|e| anyhow!("{name}={raw}: {e}")),
        Err(_) => Ok(default),
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config_path = required("RW_CONFIG")?;
    let judgments_path = required("RW_JUDGMENTS")?;
    let mode = env::var("RW_MODE").unwrap_or_else(|_| "ga".to_string());
    if !matches!(mode.as_str(), "ga" | "grid" | "random") {
        bail!("unknown RW_MODE {mode}\n{USAGE}");
    }
    let backend = env::var("RW_BACKEND").unwrap_or_else(|_| "solr".to_string());
    let repository_path = env::var("RW_REPOSITORY")
        .map(PathBuf::from)
        .unwrap_or_else(|_| InMemoryRepository::default_path());
    let timeout = parsed("RW_BACKEND_TIMEOUT_SECS", DEFAULT_BACKEND_TIMEOUT.as_secs()).map(Duration::from_secs)?;
    let max_experiments: usize = parsed("RW_MAX_EXPERIMENTS", 100)?;
    let max_per_feature: usize = parsed("RW_MAX_PER_FEATURE", 5)?;

    let config = TuningConfig::from_path(&config_path).with_context(|| format!("loading {config_path}"))?;
    let judgments = load_judgments_csv(&judgments_path).with_context(|| format!("loading {judgments_path}"))?;

    let client: Arc<dyn SearchClient> = match backend.as_str() {
        "solr" => Arc::new(SolrClient::new(config.url.clone(), timeout)?),
        "elastic" => Arc::new(ElasticClient::new(config.url.clone(), timeout)?),
        other => bail!("unknown RW_BACKEND {other}\n{USAGE}"),
    };
    let repository = InMemoryRepository::open(&repository_path)
        .with_context(|| format!("opening repository {}", repository_path.display()))?;

    let runner_config = config.runner_config();
    let (judgments, report) = validate_judgment_ids(client.as_ref(), &judgments, &runner_config.id_field, ID_LOOKUP_BATCH)?;
    if !report.dropped_queries.is_empty() {
        warn!("{} queries dropped after id validation", report.dropped_queries.len());
    }
    repository.add_judgments(&judgments)?;
    let runner = ExperimentRunner::new(client, runner_config)?;

    for experiment in config.experiments.iter().flatten() {
        if let RunOutcome::Completed { summary, .. } =
            runner.run_and_store(experiment, &judgments, &config.scorers, &repository)?
        {
            info!("Baseline {} scored {} queries", experiment.name, summary.scored);
        }
    }

    let objective = config
        .objective_scorer()
        .ok_or_else(|| anyhow!("no scorer configured"))?;

    match mode.as_str() {
        "ga" => {
            let ga = config.ga.clone().unwrap_or_default();
            let seeds: Vec<_> = repository
                .get_n_best_experiments("", ga.population_size / 2, &objective)?
                .into_iter()
                .map(|(experiment, _)| experiment)
                .filter(|e| e.params.keys().all(|k| config.feature_factories.get(k).is_some()))
                .collect();
            let optimizer = GaOptimizer::new(
                &runner,
                &config.feature_factories,
                &config.scorers,
                config.base_experiment("ga"),
                ga,
            )?
            .with_seed_population(seeds)?;
            let report = optimizer.run(judgments.as_slice())?;
            info!(
                "Best individual {} (seed {}): {} train {:.4}, test {:.4}",
                report.best.name, report.seed, report.train_scorer, report.best_train, report.best_test
            );
            match runner.run_and_store(&report.best, &judgments, &config.scorers, &repository)? {
                RunOutcome::Completed { scorers, .. } => {
                    for (name, stats) in scorers.summaries(rw_scoring::ALL_QUERY_SETS) {
                        info!("{} over all queries: {:.4}", name, stats.primary());
                    }
                }
                RunOutcome::Skipped => warn!(
                    "Repository already holds scores for {}; this run's best was not stored",
                    report.best.name
                ),
            }
        }
        search => {
            let mut strategy: Box<dyn SearchStrategy> = if search == "grid" {
                Box::new(GridSearch::new(
                    &config.feature_factories,
                    config.base_experiment("grid"),
                    max_per_feature,
                    max_experiments,
                    "grid",
                ))
            } else {
                let seed = parsed("RW_SEED", rand::random::<u64>())?;
                info!("Random search seed {}", seed);
                Box::new(RandomSearch::new(
                    config.feature_factories.clone(),
                    config.base_experiment("random"),
                    seed,
                    format!("random_{seed}"),
                ))
            };
            let tuner = Tuner::new(
                &runner,
                &repository,
                &judgments,
                &config.scorers,
                objective,
                ObjectiveDirection::Maximize,
            )?;
            let status = tuner.run(strategy.as_mut(), max_experiments, runner.config().workers)?;
            if let Some(best) = &status.best {
                info!("Best experiment {}: {:.4}", best.experiment, best.objective);
            }
        }
    }

    Ok(())
}

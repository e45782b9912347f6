//! Concurrent evaluation of one experiment against the backend.
//!
//! One producer feeds judged queries into a bounded channel followed by one
//! stop signal per worker. Workers search, score into the shared scorer set
//! and exit on a stop signal or when the channel closes.

use crossbeam_channel::{bounded, Receiver, SendTimeoutError, Sender};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use rw_data::{QueryScores, Repository, ScoreBatch};
use rw_scoring::{ScorerConfig, ScorerSet, ALL_QUERY_SETS};
use rw_types::{config_error, Experiment, Judgments, RwResult, SearchResultSet};

use crate::client::SearchClient;
use crate::request::SearchRequest;

/// Runner configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerConfig {
    pub workers: usize,
    /// Wait per enqueue attempt before retrying.
    pub enqueue_timeout_ms: u64,
    pub id_field: String,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            workers: thread::available_parallelism().map(|n| n.get()).unwrap_or(4),
            enqueue_timeout_ms: 100,
            id_field: "id".to_string(),
        }
    }
}

impl RunnerConfig {
    pub fn new(workers: usize) -> Self {
        Self {
            workers,
            ..Self::default()
        }
    }

    pub fn with_id_field(mut self, id_field: impl Into<String>) -> Self {
        self.id_field = id_field.into();
        self
    }

    pub fn with_enqueue_timeout(mut self, timeout: Duration) -> Self {
        self.enqueue_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn validate(&self) -> RwResult<()> {
        if self.workers == 0 {
            return Err(config_error!("workers must be at least 1"));
        }
        if self.id_field.is_empty() {
            return Err(config_error!("idField must not be empty"));
        }
        Ok(())
    }
}

/// Counts of one evaluation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub experiment: String,
    pub dispatched: usize,
    pub scored: usize,
    pub stop_signals: usize,
    pub backend_failures: usize,
    pub worker_failures: usize,
    pub elapsed: Duration,
}

/// Outcome of [`ExperimentRunner::run_and_store`].
#[derive(Debug)]
pub enum RunOutcome {
    /// The repository already held scores for the experiment.
    Skipped,
    Completed { summary: RunSummary, scorers: ScorerSet },
}

enum Task<'a> {
    Score(&'a Judgments),
    Stop,
}

#[derive(Default)]
struct Counters {
    scored: AtomicUsize,
    backend_failures: AtomicUsize,
}

pub struct ExperimentRunner {
    client: Arc<dyn SearchClient>,
    config: RunnerConfig,
}

impl ExperimentRunner {
    pub fn new(client: Arc<dyn SearchClient>, config: RunnerConfig) -> RwResult<Self> {
        config.validate()?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn client(&self) -> &Arc<dyn SearchClient> {
        &self.client
    }

    /// Run every query of `queries` for `experiment`, scoring into `scorers`.
    pub fn evaluate(&self, experiment: &Experiment, queries: &[&Judgments], scorers: &ScorerSet) -> RunSummary {
        let workers = self.config.workers.max(1);
        let rows = scorers.rows();
        let start = Instant::now();
        let counters = Counters::default();
        let (tx, rx) = bounded::<Task<'_>>(queries.len() + workers);

        info!(
            "Evaluating experiment {} over {} queries with {} workers",
            experiment.name,
            queries.len(),
            workers
        );

        let (dispatched, stop_signals, worker_failures) = thread::scope(|scope| {
            let counters = &counters;
            let handles: Vec<_> = (0..workers)
                .map(|worker| {
                    let rx = rx.clone();
                    scope.spawn(move || self.work(worker, rx, experiment, rows, scorers, counters))
                })
                .collect();
            drop(rx);

            let (dispatched, stop_signals) = self.dispatch(&tx, &experiment.name, queries, workers);
            drop(tx);

            let mut worker_failures = 0;
            for (worker, handle) in handles.into_iter().enumerate() {
                if handle.join().is_err() {
                    error!("Worker {} of experiment {} panicked", worker, experiment.name);
                    worker_failures += 1;
                }
            }
            (dispatched, stop_signals, worker_failures)
        });

        let summary = RunSummary {
            experiment: experiment.name.clone(),
            dispatched,
            scored: counters.scored.load(Ordering::Relaxed),
            stop_signals,
            backend_failures: counters.backend_failures.load(Ordering::Relaxed),
            worker_failures,
            elapsed: start.elapsed(),
        };
        if summary.backend_failures > 0 {
            warn!(
                "Experiment {}: {} of {} queries failed at the backend and were scored as empty",
                experiment.name, summary.backend_failures, summary.dispatched
            );
        }
        info!(
            "Experiment {} scored {} queries in {:?}",
            experiment.name, summary.scored, summary.elapsed
        );
        summary
    }

    /// Evaluate `experiment` over the whole judgment list and store the
    /// scores, unless the repository already holds scores for it.
    pub fn run_and_store<'a>(
        &self,
        experiment: &Experiment,
        judgments: impl IntoIterator<Item = &'a Judgments>,
        scorer_configs: &[ScorerConfig],
        repository: &dyn Repository,
    ) -> RwResult<RunOutcome> {
        if repository.has_scores(&experiment.name)? {
            info!("Experiment {} already scored; skipping", experiment.name);
            return Ok(RunOutcome::Skipped);
        }
        experiment.validate()?;

        let scorers = ScorerSet::from_configs(scorer_configs)?;
        let queries: Vec<&Judgments> = judgments.into_iter().collect();
        let summary = self.evaluate(experiment, &queries, &scorers);

        repository.add_experiment(experiment)?;
        repository.store_batch(&score_batch(&experiment.name, &scorers))?;
        Ok(RunOutcome::Completed { summary, scorers })
    }

    /// Enqueue every query then one stop signal per worker. Returns how many
    /// of each were sent; sending ends early once no worker is receiving.
    fn dispatch<'a>(
        &self,
        tx: &Sender<Task<'a>>,
        experiment: &str,
        queries: &[&'a Judgments],
        workers: usize,
    ) -> (usize, usize) {
        let mut dispatched = 0;
        for &judgments in queries {
            if !self.enqueue(tx, Task::Score(judgments)) {
                error!(
                    "All workers for experiment {} have stopped; {} queries not dispatched",
                    experiment,
                    queries.len() - dispatched
                );
                return (dispatched, 0);
            }
            dispatched += 1;
        }

        let mut stop_signals = 0;
        for _ in 0..workers {
            if !self.enqueue(tx, Task::Stop) {
                break;
            }
            stop_signals += 1;
        }
        (dispatched, stop_signals)
    }

    fn enqueue<'a>(&self, tx: &Sender<Task<'a>>, task: Task<'a>) -> bool {
        let timeout = Duration::from_millis(self.config.enqueue_timeout_ms.max(1));
        let mut task = task;
        loop {
            match tx.send_timeout(task, timeout) {
                Ok(()) => return true,
                Err(SendTimeoutError::Timeout(returned)) => {
                    debug!("Work queue full; retrying");
                    task = returned;
                }
                Err(SendTimeoutError::Disconnected(_)) => return false,
            }
        }
    }

    fn work(
        &self,
        worker: usize,
        rx: Receiver<Task<'_>>,
        experiment: &Experiment,
        rows: usize,
        scorers: &ScorerSet,
        counters: &Counters,
    ) {
        while let Ok(Task::Score(judgments)) = rx.recv() {
            let query = &judgments.query_info;
            let request = SearchRequest::for_experiment(experiment, &query.query, rows, &self.config.id_field);
            let results = match self.client.search(&request) {
                Ok(results) => results,
                Err(e) => {
                    warn!(
                        "Worker {}: query {} failed for experiment {}: {}",
                        worker, query.query_id, experiment.name, e
                    );
                    counters.backend_failures.fetch_add(1, Ordering::Relaxed);
                    SearchResultSet::empty()
                }
            };
            scorers.score_all(judgments, &results);
            counters.scored.fetch_add(1, Ordering::Relaxed);
        }
        debug!("Worker {} for experiment {} exiting", worker, experiment.name);
    }
}

/// Per-query scores and per-query-set aggregates of a finished evaluation.
pub fn score_batch(experiment: &str, scorers: &ScorerSet) -> ScoreBatch {
    let query_scores = scorers
        .scored_queries()
        .into_iter()
        .map(|query_info| {
            let values = scorers.query_scores(&query_info);
            QueryScores { query_info, values }
        })
        .collect();

    let mut aggregated = BTreeMap::new();
    for set in scorers.query_sets() {
        aggregated.insert(set.clone(), scorers.summaries(&set));
    }
    aggregated.insert(ALL_QUERY_SETS.to_string(), scorers.summaries(ALL_QUERY_SETS));

    ScoreBatch {
        experiment: experiment.to_string(),
        scorer_names: scorers.names(),
        query_scores,
        aggregated,
    }
}

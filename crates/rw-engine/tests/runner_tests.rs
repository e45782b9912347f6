//! Runner, id validation and analyzer comparison against an in-process backend.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rw_data::{InMemoryRepository, Repository};
use rw_engine::*;
use rw_scoring::{ScorerClass, ScorerConfig, ScorerSet, ALL_QUERY_SETS};
use rw_types::{BackendError, Experiment, Feature, JudgmentList, Judgments, QueryInfo, SearchResultSet};

#[derive(Default)]
struct FakeBackend {
    results: HashMap<String, Vec<String>>,
    failing: HashSet<String>,
    panicking: HashSet<String>,
    known_ids: HashSet<String>,
    analyzed: HashMap<String, Vec<String>>,
    terms: Vec<TermCount>,
    searches: AtomicUsize,
    requests: Mutex<Vec<SearchRequest>>,
}

impl FakeBackend {
    fn with_results(mut self, query: &str, ids: &[&str]) -> Self {
        self.results
            .insert(query.to_string(), ids.iter().map(|s| s.to_string()).collect());
        self
    }
}

impl SearchClient for FakeBackend {
    fn name(&self) -> &str {
        "fake"
    }

    fn search(&self, request: &SearchRequest) -> Result<SearchResultSet, BackendError> {
        self.searches.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request.clone());
        if self.panicking.contains(&request.query) {
            panic!("backend exploded on {}", request.query);
        }
        if self.failing.contains(&request.query) {
            return Err(BackendError::Status {
                backend: "fake".into(),
                status: 500,
                message: "boom".into(),
            });
        }
        let ids = self.results.get(&request.query).cloned().unwrap_or_default();
        let total = ids.len() as u64;
        Ok(SearchResultSet::new(ids.into_iter().take(request.rows).collect(), total).with_timings(3, 5))
    }

    fn analyze(&self, _field: &str, text: &str) -> Result<Vec<String>, BackendError> {
        Ok(self.analyzed.get(text).cloned().unwrap_or_else(|| vec![text.to_string()]))
    }

    fn get_terms(&self, _field: &str, _lower: &str, limit: usize, _min: u64) -> Result<Vec<TermCount>, BackendError> {
        Ok(self.terms.iter().take(limit).cloned().collect())
    }

    fn lookup_ids(&self, _id_field: &str, ids: &[String]) -> Result<HashSet<String>, BackendError> {
        Ok(ids.iter().filter(|id| self.known_ids.contains(*id)).cloned().collect())
    }
}

fn judged(query: &str, grades: &[(&str, f64)]) -> Judgments {
    grades
        .iter()
        .fold(Judgments::new(QueryInfo::for_query(query)), |j, (id, g)| j.with_judgment(*id, *g))
}

fn experiment() -> Experiment {
    Experiment::new("baseline", "http://fake")
        .with_param("tie", Feature::Float(0.1))
        .with_filter_queries(["inStock:true"])
}

fn scorer_configs() -> Vec<ScorerConfig> {
    vec![
        ScorerConfig::new(ScorerClass::Ndcg, 10).for_train(),
        ScorerConfig::new(ScorerClass::Precision, 3),
        ScorerConfig::new(ScorerClass::ZeroResults, 10),
    ]
}

fn runner(backend: Arc<FakeBackend>, workers: usize) -> ExperimentRunner {
    ExperimentRunner::new(backend, RunnerConfig::new(workers)).unwrap()
}

#[test]
fn zero_queries_sends_one_stop_per_worker() {
    let backend = Arc::new(FakeBackend::default());
    let scorers = ScorerSet::from_configs(&scorer_configs()).unwrap();
    let summary = runner(backend.clone(), 4).evaluate(&experiment(), &[], &scorers);

    assert_eq!(summary.dispatched, 0);
    assert_eq!(summary.stop_signals, 4);
    assert_eq!(summary.scored, 0);
    assert_eq!(summary.worker_failures, 0);
    assert!(scorers.scored_queries().is_empty());
    assert_eq!(backend.searches.load(Ordering::SeqCst), 0);
}

#[test]
fn every_query_is_scored_by_every_scorer() {
    let backend = Arc::new(
        FakeBackend::default()
            .with_results("laptop", &["doc1", "doc2", "doc3", "doc4", "doc5", "doc6"])
            .with_results("tv", &["t1"]),
    );
    let queries = [
        judged(
            "laptop",
            &[
                ("doc1", 3.0),
                ("doc2", 2.0),
                ("doc3", 3.0),
                ("doc5", 1.0),
                ("doc6", 2.0),
                ("doc7", 3.0),
                ("doc8", 2.0),
            ],
        ),
        judged("tv", &[("t1", 1.0)]),
        judged("radio", &[("r1", 2.0)]),
    ];
    let refs: Vec<&Judgments> = queries.iter().collect();
    let scorers = ScorerSet::from_configs(&scorer_configs()).unwrap();
    let summary = runner(backend.clone(), 3).evaluate(&experiment(), &refs, &scorers);

    assert_eq!(summary.dispatched, 3);
    assert_eq!(summary.scored, 3);
    assert_eq!(summary.stop_signals, 3);
    assert_eq!(summary.backend_failures, 0);

    let ndcg = scorers.get("NDCG@10").unwrap();
    let laptop = ndcg.aggregator().get_score(&QueryInfo::for_query("laptop")).unwrap();
    assert!((laptop - 0.785).abs() < 1e-3);
    assert_eq!(ndcg.aggregator().get_score(&QueryInfo::for_query("tv")), Some(1.0));
    assert_eq!(scorers.get("ZeroResults@10").unwrap().summary(ALL_QUERY_SETS).primary(), 1.0);

    let requests = backend.requests.lock();
    assert!(requests.iter().all(|r| r.rows == 10));
    assert!(requests.iter().all(|r| r.param("tie") == Some("0.1")));
    assert!(requests.iter().all(|r| r.filter_queries == vec!["inStock:true".to_string()]));
}

#[test]
fn backend_failure_scores_empty_and_is_counted() {
    let mut backend = FakeBackend::default().with_results("tv", &["t1"]);
    backend.failing.insert("laptop".to_string());
    let backend = Arc::new(backend);
    let queries = [judged("laptop", &[("l1", 2.0)]), judged("tv", &[("t1", 2.0)])];
    let refs: Vec<&Judgments> = queries.iter().collect();
    let scorers = ScorerSet::from_configs(&scorer_configs()).unwrap();
    let summary = runner(backend, 2).evaluate(&experiment(), &refs, &scorers);

    assert_eq!(summary.backend_failures, 1);
    assert_eq!(summary.scored, 2);
    let ndcg = scorers.get("NDCG@10").unwrap();
    assert_eq!(ndcg.aggregator().get_score(&QueryInfo::for_query("laptop")), Some(0.0));
    assert_eq!(scorers.get("ZeroResults@10").unwrap().summary(ALL_QUERY_SETS).primary(), 1.0);
}

#[test]
fn panicking_worker_only_reduces_parallelism() {
    let mut backend = FakeBackend::default();
    for i in 0..20 {
        backend.results.insert(format!("q{i}"), vec![format!("d{i}")]);
    }
    backend.panicking.insert("q7".to_string());
    let backend = Arc::new(backend);
    let queries: Vec<Judgments> = (0..20)
        .map(|i| {
            let doc = format!("d{i}");
            judged(&format!("q{i}"), &[(doc.as_str(), 1.0)])
        })
        .collect();
    let refs: Vec<&Judgments> = queries.iter().collect();
    let scorers = ScorerSet::from_configs(&scorer_configs()).unwrap();
    let summary = runner(backend, 3).evaluate(&experiment(), &refs, &scorers);

    assert_eq!(summary.worker_failures, 1);
    assert_eq!(summary.dispatched, 20);
    assert_eq!(summary.scored, 19);
    assert_eq!(scorers.get("NDCG@10").unwrap().aggregator().len(), 19);
}

#[test]
fn evaluation_returns_when_every_worker_panics() {
    let mut backend = FakeBackend::default();
    for i in 0..6 {
        backend.panicking.insert(format!("q{i}"));
    }
    let backend = Arc::new(backend);
    let queries: Vec<Judgments> = (0..6).map(|i| judged(&format!("q{i}"), &[("d", 1.0)])).collect();
    let refs: Vec<&Judgments> = queries.iter().collect();
    let scorers = ScorerSet::from_configs(&scorer_configs()).unwrap();
    let summary = runner(backend, 2).evaluate(&experiment(), &refs, &scorers);

    assert_eq!(summary.worker_failures, 2);
    assert_eq!(summary.scored, 0);
    assert!(summary.dispatched <= 6);
    assert!(summary.stop_signals <= 2);
    if summary.dispatched < 6 {
        assert_eq!(summary.stop_signals, 0);
    }
    assert!(scorers.get("NDCG@10").unwrap().aggregator().is_empty());
}

#[test]
fn run_and_store_skips_scored_experiments() {
    let backend = Arc::new(FakeBackend::default().with_results("tv", &["t1", "t2"]));
    let judgments: JudgmentList = vec![judged("tv", &[("t1", 1.0), ("t2", 3.0)])].into_iter().collect();
    let repository = InMemoryRepository::new();
    let runner = runner(backend.clone(), 2);

    let outcome = runner
        .run_and_store(&experiment(), &judgments, &scorer_configs(), &repository)
        .unwrap();
    match outcome {
        RunOutcome::Completed { summary, .. } => assert_eq!(summary.scored, 1),
        RunOutcome::Skipped => panic!("first run must evaluate"),
    }
    assert!(repository.has_scores("baseline").unwrap());
    let aggregated = repository.get_aggregated("baseline").unwrap();
    assert!(aggregated.contains_key(ALL_QUERY_SETS));
    assert!(aggregated.contains_key("default"));
    assert_eq!(repository.get_scores("baseline").len(), 1);

    let again = runner
        .run_and_store(&experiment(), &judgments, &scorer_configs(), &repository)
        .unwrap();
    assert!(matches!(again, RunOutcome::Skipped));
    assert_eq!(backend.searches.load(Ordering::SeqCst), 1);

    let best = repository.get_n_best_experiments("base", 1, "NDCG@10").unwrap();
    assert_eq!(best.len(), 1);
}

#[test]
fn id_validation_drops_unknown_documents_and_empty_queries() {
    let mut backend = FakeBackend::default();
    backend.known_ids = ["a", "b"].iter().map(|s| s.to_string()).collect();
    let judgments: JudgmentList = vec![
        judged("q1", &[("a", 1.0), ("x", 2.0)]),
        judged("q2", &[("y", 3.0)]),
        judged("q3", &[("b", 0.0)]),
    ]
    .into_iter()
    .collect();

    let (validated, report) = validate_judgment_ids(&backend, &judgments, "id", 2).unwrap();
    assert_eq!(report.checked, 4);
    assert_eq!(
        report.missing_ids.into_iter().collect::<Vec<_>>(),
        vec!["x".to_string(), "y".to_string()]
    );
    assert_eq!(report.dropped_queries, vec![QueryInfo::for_query("q2")]);
    assert_eq!(validated.len(), 2);
    assert_eq!(validated.get("q1").map(Judgments::len), Some(1));
}

#[test]
fn analyzer_comparison_groups_conflated_terms() {
    let mut backend = FakeBackend::default();
    backend.terms = vec![
        TermCount::new("run", 10),
        TermCount::new("runner", 4),
        TermCount::new("running", 7),
        TermCount::new("tv", 3),
        TermCount::new("the", 50),
    ];
    backend.analyzed.insert("running".into(), vec!["run".into()]);
    backend.analyzed.insert("runner".into(), vec!["run".into()]);
    backend.analyzed.insert("the".into(), vec![]);

    let groups = compare_analyzers(&backend, "title", "title_stem", "", 100, 1).unwrap();
    assert_eq!(groups.len(), 2);
    assert_eq!(groups[0].token, "run");
    assert_eq!(groups[0].base_terms.len(), 3);
    assert_eq!(groups[1].token, "tv");
}

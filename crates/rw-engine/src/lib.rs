//! Evaluation engine for Rankwise
//!
//! Search-backend clients and the concurrent runner that scores one
//! experiment against a judged query set.

pub mod analysis;
pub mod client;
pub mod elastic;
pub mod request;
pub mod runner;
pub mod solr;
pub mod validation;

pub use analysis::{compare_analyzers, ConflatedTerms};
pub use client::{SearchClient, TermCount, DEFAULT_BACKEND_TIMEOUT};
pub use elastic::{ElasticClient, EsQuery};
pub use request::SearchRequest;
pub use runner::{score_batch, ExperimentRunner, RunOutcome, RunSummary, RunnerConfig};
pub use solr::SolrClient;
pub use validation::{validate_judgment_ids, IdValidationReport};

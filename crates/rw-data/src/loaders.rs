use serde::Deserialize;
use std::collections::BTreeSet;
use std::fs;
use std::io::Read;
use std::path::Path;
use tracing::info;

use rw_types::{config_error, Experiment, JudgmentList, Judgments, QueryInfo, RwResult, DEFAULT_QUERY_SET};

/// One row of a judgments CSV file.
#[derive(Debug, Deserialize)]
struct JudgmentRecord {
    #[serde(default, alias = "querySet")]
    query_set: Option<String>,
    #[serde(default, alias = "queryId")]
    query_id: Option<String>,
    #[serde(alias = "Query")]
    query: String,
    #[serde(default)]
    count: Option<u32>,
    #[serde(alias = "docId")]
    doc_id: String,
    #[serde(alias = "judgment", alias = "grade")]
    relevance: f64,
}

impl JudgmentRecord {
    fn query_info(&self) -> QueryInfo {
        let query_set = self
            .query_set
            .as_deref()
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_QUERY_SET);
        let query_id = self
            .query_id
            .as_deref()
            .filter(|s| !s.is_empty())
            .unwrap_or(self.query.as_str());
        QueryInfo::new(query_set, query_id, self.query.clone()).with_count(self.count.unwrap_or(1))
    }
}

/// Read judgments from CSV. Rows for the same query are merged.
pub fn read_judgments_csv<R: Read>(reader: R) -> RwResult<JudgmentList> {
    let mut csv_reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
    let mut list = JudgmentList::new();

    for (i, result) in csv_reader.deserialize::<JudgmentRecord>().enumerate() {
        // header is line 1
        let line = i + 2;
        let record = result.map_err(|e| config_error!("judgments line {line}: {e}"))?;
        if record.query.is_empty() || record.doc_id.is_empty() {
            return Err(config_error!("judgments line {line}: query and doc_id are required"));
        }
        if !record.relevance.is_finite() {
            return Err(config_error!("judgments line {line}: relevance must be a number"));
        }
        list.add(Judgments::new(record.query_info()).with_judgment(record.doc_id, record.relevance));
    }
    Ok(list)
}

pub fn load_judgments_csv<P: AsRef<Path>>(path: P) -> RwResult<JudgmentList> {
    let path = path.as_ref();
    let file = fs::File::open(path)?;
    let list = read_judgments_csv(file)?;
    info!(
        "Loaded {} judged queries across {} query sets from {}",
        list.len(),
        list.query_sets().len(),
        path.display()
    );
    Ok(list)
}

/// Load a JSON array of experiments; names must be unique.
pub fn load_experiments_json<P: AsRef<Path>>(path: P) -> RwResult<Vec<Experiment>> {
    let raw = fs::read_to_string(path.as_ref())?;
    parse_experiments_json(&raw)
}

pub fn parse_experiments_json(raw: &str) -> RwResult<Vec<Experiment>> {
    let experiments: Vec<Experiment> = serde_json::from_str(raw)?;
    let mut names = BTreeSet::new();
    for experiment in &experiments {
        experiment.validate()?;
        if !names.insert(experiment.name.as_str()) {
            return Err(config_error!("duplicate experiment name {}", experiment.name));
        }
    }
    Ok(experiments)
}

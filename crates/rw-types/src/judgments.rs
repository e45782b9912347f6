//! Judged queries and the result sets returned for them.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::OnceLock;

/// Query set used when a judgment row names none.
pub const DEFAULT_QUERY_SET: &str = "default";

/// Grade reported for documents nobody judged.
pub const NO_JUDGMENT: f64 = -1.0;

/// Immutable key under which every score is indexed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryInfo {
    pub query_set: String,
    pub query_id: String,
    pub query: String,
    pub count: u32,
}

impl QueryInfo {
    pub fn new(query_set: impl Into<String>, query_id: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            query_set: query_set.into(),
            query_id: query_id.into(),
            query: query.into(),
            count: 1,
        }
    }

    /// A query keyed by its own text in the default query set.
    pub fn for_query(query: impl Into<String>) -> Self {
        let query = query.into();
        Self::new(DEFAULT_QUERY_SET, query.clone(), query)
    }

    pub fn with_count(mut self, count: u32) -> Self {
        self.count = count;
        self
    }
}

/// Graded relevance of documents for one query.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Judgments {
    pub query_info: QueryInfo,
    grades: HashMap<String, f64>,
    #[serde(skip)]
    sorted: OnceLock<Vec<(String, f64)>>,
}

impl PartialEq for Judgments {
    fn eq(&self, other: &Self) -> bool {
        self.query_info == other.query_info && self.grades == other.grades
    }
}

impl Judgments {
    pub fn new(query_info: QueryInfo) -> Self {
        Self {
            query_info,
            grades: HashMap::new(),
            sorted: OnceLock::new(),
        }
    }

    pub fn with_judgment(mut self, doc_id: impl Into<String>, grade: f64) -> Self {
        self.add_judgment(doc_id, grade);
        self
    }

    /// Set (or overwrite) the grade of a document.
    pub fn add_judgment(&mut self, doc_id: impl Into<String>, grade: f64) {
        self.grades.insert(doc_id.into(), grade);
        self.sorted = OnceLock::new();
    }

    pub fn remove_judgment(&mut self, doc_id: &str) -> Option<f64> {
        let removed = self.grades.remove(doc_id);
        if removed.is_some() {
            self.sorted = OnceLock::new();
        }
        removed
    }

    /// Grade of `doc_id`, or [`NO_JUDGMENT`].
    pub fn get_judgment(&self, doc_id: &str) -> f64 {
        self.grades.get(doc_id).copied().unwrap_or(NO_JUDGMENT)
    }

    pub fn is_judged(&self, doc_id: &str) -> bool {
        self.grades.contains_key(doc_id)
    }

    /// Judgments ordered by grade descending, ties by document id.
    /// Computed on first use and reset by every mutation.
    pub fn sorted(&self) -> &[(String, f64)] {
        self.sorted.get_or_init(|| {
            let mut sorted: Vec<(String, f64)> =
                self.grades.iter().map(|(id, grade)| (id.clone(), *grade)).collect();
            sorted.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
            sorted
        })
    }

    pub fn doc_ids(&self) -> impl Iterator<Item = &str> {
        self.grades.keys().map(String::as_str)
    }

    /// Number of documents with a positive grade.
    pub fn relevant_count(&self) -> usize {
        self.grades.values().filter(|g| **g > 0.0).count()
    }

    pub fn len(&self) -> usize {
        self.grades.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grades.is_empty()
    }
}

/// Ordered collection of judged queries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JudgmentList {
    judgments: Vec<Judgments>,
}

impl JudgmentList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append, merging into an existing entry with the same query key.
    pub fn add(&mut self, judgments: Judgments) {
        match self
            .judgments
            .iter_mut()
            .find(|j| j.query_info == judgments.query_info)
        {
            Some(existing) => {
                for (doc, grade) in judgments.grades {
                    existing.add_judgment(doc, grade);
                }
            }
            None => self.judgments.push(judgments),
        }
    }

    pub fn get(&self, query_id: &str) -> Option<&Judgments> {
        self.judgments.iter().find(|j| j.query_info.query_id == query_id)
    }

    pub fn query_sets(&self) -> BTreeSet<String> {
        self.judgments
            .iter()
            .map(|j| j.query_info.query_set.clone())
            .collect()
    }

    pub fn retain<F: FnMut(&Judgments) -> bool>(&mut self, keep: F) {
        self.judgments.retain(keep);
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Judgments> {
        self.judgments.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Judgments> {
        self.judgments.iter_mut()
    }

    pub fn as_slice(&self) -> &[Judgments] {
        &self.judgments
    }

    pub fn len(&self) -> usize {
        self.judgments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.judgments.is_empty()
    }
}

impl FromIterator<Judgments> for JudgmentList {
    fn from_iter<I: IntoIterator<Item = Judgments>>(iter: I) -> Self {
        let mut list = JudgmentList::new();
        for judgments in iter {
            list.add(judgments);
        }
        list
    }
}

impl<'a> IntoIterator for &'a JudgmentList {
    type Item = &'a Judgments;
    type IntoIter = std::slice::Iter<'a, Judgments>;

    fn into_iter(self) -> Self::IntoIter {
        self.judgments.iter()
    }
}

/// Ids returned by the backend for one (query, experiment) pair.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResultSet {
    pub ids: Vec<String>,
    pub total_hits: u64,
    pub query_time_ms: u64,
    pub elapsed_ms: u64,
}

impl SearchResultSet {
    pub fn new(ids: Vec<String>, total_hits: u64) -> Self {
        Self {
            ids,
            total_hits,
            query_time_ms: 0,
            elapsed_ms: 0,
        }
    }

    /// What a failed backend call is scored as.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_timings(mut self, query_time_ms: u64, elapsed_ms: u64) -> Self {
        self.query_time_ms = query_time_ms;
        self.elapsed_ms = elapsed_ms;
        self
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sorted_view_resets_on_mutation() {
        let mut judgments = Judgments::new(QueryInfo::for_query("laptop"))
            .with_judgment("b", 2.0)
            .with_judgment("a", 2.0)
            .with_judgment("c", 3.0);
        let ids: Vec<&str> = judgments.sorted().iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);

        judgments.add_judgment("d", 5.0);
        assert_eq!(judgments.sorted()[0].0, "d");
        judgments.remove_judgment("d");
        assert_eq!(judgments.sorted()[0].0, "c");
    }

    #[test]
    fn unjudged_sentinel() {
        let judgments = Judgments::new(QueryInfo::for_query("tv")).with_judgment("x", 0.0);
        assert_eq!(judgments.get_judgment("x"), 0.0);
        assert_eq!(judgments.get_judgment("y"), NO_JUDGMENT);
        assert_eq!(judgments.relevant_count(), 0);
    }

    #[test]
    fn list_merges_same_query_and_reports_sets() {
        let list: JudgmentList = vec![
            Judgments::new(QueryInfo::new("head", "q1", "phone")).with_judgment("a", 1.0),
            Judgments::new(QueryInfo::new("head", "q1", "phone")).with_judgment("b", 2.0),
            Judgments::new(QueryInfo::new("tail", "q2", "phone case")).with_judgment("c", 3.0),
        ]
        .into_iter()
        .collect();

        assert_eq!(list.len(), 2);
        assert_eq!(list.get("q1").map(Judgments::len), Some(2));
        assert_eq!(
            list.query_sets().into_iter().collect::<Vec<_>>(),
            vec!["head".to_string(), "tail".to_string()]
        );
    }

    #[test]
    fn judgments_serialize_without_cache() {
        let judgments = Judgments::new(QueryInfo::for_query("tv")).with_judgment("x", 1.0);
        let _ = judgments.sorted();
        let json = serde_json::to_string(&judgments).unwrap();
        let back: Judgments = serde_json::from_str(&json).unwrap();
        assert_eq!(back, judgments);
    }
}

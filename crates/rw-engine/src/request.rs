use serde::{Deserialize, Serialize};

use rw_types::Experiment;

/// Backend-neutral search request built from an experiment and one query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    pub handler: Option<String>,
    /// Rendered experiment parameters, in parameter-name order.
    pub params: Vec<(String, String)>,
    pub filter_queries: Vec<String>,
    pub rows: usize,
    pub id_field: String,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>, rows: usize, id_field: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            handler: None,
            params: Vec::new(),
            filter_queries: Vec::new(),
            rows: rows.max(1),
            id_field: id_field.into(),
        }
    }

    pub fn for_experiment(experiment: &Experiment, query: &str, rows: usize, id_field: &str) -> Self {
        Self {
            query: query.to_string(),
            handler: experiment.custom_handler.clone(),
            params: experiment.rendered_params(),
            filter_queries: experiment.filter_queries.iter().cloned().collect(),
            rows: rows.max(1),
            id_field: id_field.to_string(),
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((name.into(), value.into()));
        self
    }

    pub fn with_filter_query(mut self, filter: impl Into<String>) -> Self {
        self.filter_queries.push(filter.into());
        self
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rw_types::{Feature, WeightedField};

    #[test]
    fn built_from_experiment() {
        let experiment = Experiment::new("e", "http://solr/core")
            .with_handler("edismax")
            .with_param(
                "qf",
                Feature::WeightedFields(vec![
                    WeightedField::weighted("title", 2.0),
                    WeightedField::weighted("body", 0.5),
                ]),
            )
            .with_param("mm", Feature::Choice("2<75%".into()))
            .with_filter_queries(["inStock:true"]);

        let request = SearchRequest::for_experiment(&experiment, "usb hub", 0, "sku");
        assert_eq!(request.rows, 1);
        assert_eq!(request.handler.as_deref(), Some("edismax"));
        assert_eq!(request.param("qf"), Some("title^2 body^0.5"));
        assert_eq!(request.param("mm"), Some("2<75%"));
        assert_eq!(request.filter_queries, vec!["inStock:true".to_string()]);
        assert_eq!(request.id_field, "sku");
    }
}

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

use rw_types::RwResult;

use crate::client::{SearchClient, TermCount};

/// Base-field terms that one analyzer conflates into the same token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflatedTerms {
    pub token: String,
    pub base_terms: Vec<TermCount>,
}

/// Group the terms of `base_field` by how the analyzer of `filtered_field`
/// renders them. Largest groups first, then by token.
pub fn compare_analyzers(
    client: &dyn SearchClient,
    base_field: &str,
    filtered_field: &str,
    lower_bound: &str,
    limit: usize,
    min_doc_freq: u64,
) -> RwResult<Vec<ConflatedTerms>> {
    let terms = client.get_terms(base_field, lower_bound, limit, min_doc_freq)?;
    info!("Comparing {} terms of {} against {}", terms.len(), base_field, filtered_field);

    let mut groups: BTreeMap<String, Vec<TermCount>> = BTreeMap::new();
    for term in terms {
        let tokens = client.analyze(filtered_field, &term.token)?;
        if tokens.is_empty() {
            debug!("{} analyzes to nothing in {}", term.token, filtered_field);
            continue;
        }
        groups.entry(tokens.join(" ")).or_default().push(term);
    }

    let mut conflated: Vec<ConflatedTerms> = groups
        .into_iter()
        .map(|(token, base_terms)| ConflatedTerms { token, base_terms })
        .collect();
    conflated.sort_by(|a, b| {
        b.base_terms
            .len()
            .cmp(&a.base_terms.len())
            .then_with(|| a.token.cmp(&b.token))
    });
    Ok(conflated)
}

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use tracing::{info, warn};

use rw_types::{config_error, JudgmentList, QueryInfo, RwResult};

use crate::client::SearchClient;

/// What judgment-id validation removed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IdValidationReport {
    pub checked: usize,
    pub missing_ids: BTreeSet<String>,
    pub dropped_queries: Vec<QueryInfo>,
}

/// Drop judged documents the backend does not know, then drop queries left
/// with no judged documents. Lookups are done `batch_size` ids at a time.
pub fn validate_judgment_ids(
    client: &dyn SearchClient,
    judgments: &JudgmentList,
    id_field: &str,
    batch_size: usize,
) -> RwResult<(JudgmentList, IdValidationReport)> {
    if batch_size == 0 {
        return Err(config_error!("id validation batch size must be at least 1"));
    }

    let all_ids: Vec<String> = judgments
        .iter()
        .flat_map(|j| j.doc_ids().map(str::to_string))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    let mut known = HashSet::with_capacity(all_ids.len());
    for batch in all_ids.chunks(batch_size) {
        known.extend(client.lookup_ids(id_field, batch)?);
    }

    let mut report = IdValidationReport {
        checked: all_ids.len(),
        ..IdValidationReport::default()
    };
    let mut validated = judgments.clone();
    for j in validated.iter_mut() {
        let missing: Vec<String> = j.doc_ids().filter(|id| !known.contains(*id)).map(str::to_string).collect();
        for id in missing {
            warn!("Judged document {} for query {} not found in index", id, j.query_info.query_id);
            j.remove_judgment(&id);
            report.missing_ids.insert(id);
        }
    }
    validated.retain(|j| {
        if j.is_empty() {
            warn!("Query {} has no valid judged documents; dropping it", j.query_info.query_id);
            report.dropped_queries.push(j.query_info.clone());
            false
        } else {
            true
        }
    });

    info!(
        "Validated {} judged ids: {} missing, {} queries dropped",
        report.checked,
        report.missing_ids.len(),
        report.dropped_queries.len()
    );
    Ok((validated, report))
}

//! Concurrent per-type similarity search.
//!
//! One task per requested source type runs against a shared
//! [`VectorIndex`], each with that type's `max_results` and
//! `similarity_threshold`. Results are merged only after every branch
//! finished or the deadline fired.
//!
//! # Merge order
//!
//! Similarity descending, then [`SourceType`] declaration order, then id.
//! Task completion order never shows in the output. Records are identified by
//! source type and id together: the same id under two types is two records,
//! and a record returned more than once is kept with its highest similarity.
//!
//! # Failure handling
//!
//! A failing branch is logged, contributes nothing and adds a warning. A
//! branch still running at the deadline is aborted and the result is
//! flagged `partial`.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use tokio::task::JoinSet;
use tokio::time::Instant;

use qe_context_core::models::{DateFilter, RecordKey, SourceRecord, SourceType};
use qe_context_core::params::{RetrievalParams, TypeLimits};
use qe_context_core::store::{SearchQuery, VectorIndex};

/// Merged output of a fan-out search.
#[derive(Debug, Clone, Default)]
pub struct FanOutResult {
    pub records: Vec<SourceRecord>,
    /// Hits per source type after contract enforcement, before merging.
    pub per_type: BTreeMap<SourceType, usize>,
    pub warnings: Vec<String>,
    /// The deadline fired before every branch finished.
    pub partial: bool,
}

/// Search every type in `source_types` concurrently and merge the hits.
pub async fn fan_out_search(
    index: Arc<dyn VectorIndex>,
    query: &str,
    source_types: &[SourceType],
    params: &RetrievalParams,
    date_filter: Option<DateFilter>,
    deadline: Instant,
) -> FanOutResult {
    let mut out = FanOutResult::default();
    let types: BTreeSet<SourceType> = source_types.iter().copied().collect();
    let query: Arc<str> = Arc::from(query);

    let mut set = JoinSet::new();
    for source_type in &types {
        let source_type = *source_type;
        let limits = params.limits(source_type);
        let index = index.clone();
        let query = query.clone();
        set.spawn(async move {
            let types = [source_type];
            let search = SearchQuery {
                text: &query,
                source_types: &types,
                limit: limits.max_results,
                threshold: limits.similarity_threshold,
                date_filter: date_filter.as_ref(),
            };
            (source_type, index.search(&search).await)
        });
    }

    let mut pending = types.clone();
    let mut hits: BTreeMap<SourceType, Vec<SourceRecord>> = BTreeMap::new();

    loop {
        match tokio::time::timeout_at(deadline, set.join_next()).await {
            Ok(None) => break,
            Ok(Some(Ok((source_type, result)))) => {
                pending.remove(&source_type);
                match result {
                    Ok(records) => {
                        let records = enforce_contract(records, source_type, params.limits(source_type));
                        tracing::debug!(source_type = %source_type, hits = records.len(), "type search done");
                        out.per_type.insert(source_type, records.len());
                        hits.insert(source_type, records);
                    }
                    Err(e) => {
                        tracing::warn!(source_type = %source_type, error = %e, "type search failed");
                        out.warnings
                            .push(format!("{source_type} search failed: {e:#}"));
                    }
                }
            }
            Ok(Some(Err(join_err))) => {
                tracing::warn!(error = %join_err, "search task aborted");
                out.warnings.push(format!("search task failed: {join_err}"));
            }
            Err(_) => {
                out.partial = true;
                for source_type in &pending {
                    tracing::warn!(source_type = %source_type, "type search hit the deadline");
                    out.warnings
                        .push(format!("{source_type} search did not finish before the deadline"));
                }
                set.abort_all();
                break;
            }
        }
    }

    out.records = merge(hits);
    out
}

/// Hold collaborator output to the search contract: only the requested
/// type, similarity at or above threshold, descending order, at most
/// `max_results`.
pub fn enforce_contract(
    records: Vec<SourceRecord>,
    source_type: SourceType,
    limits: TypeLimits,
) -> Vec<SourceRecord> {
    let mut kept: Vec<SourceRecord> = records
        .into_iter()
        .filter(|r| r.source_type == source_type)
        .filter(|r| r.similarity.is_some_and(|s| s >= limits.similarity_threshold))
        .collect();
    kept.sort_by(compare_ranked);
    kept.truncate(limits.max_results);
    kept
}

/// Similarity descending, then source type order, then id.
fn compare_ranked(a: &SourceRecord, b: &SourceRecord) -> Ordering {
    let sa = a.similarity.unwrap_or(0.0);
    let sb = b.similarity.unwrap_or(0.0);
    sb.partial_cmp(&sa)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.source_type.cmp(&b.source_type))
        .then_with(|| a.id.cmp(&b.id))
}

/// Deterministic fan-in of per-type hit lists.
pub fn merge(per_type: BTreeMap<SourceType, Vec<SourceRecord>>) -> Vec<SourceRecord> {
    let mut best: HashMap<RecordKey, SourceRecord> = HashMap::new();
    for record in per_type.into_values().flatten() {
        let key = record.key();
        match best.get(&key) {
            Some(existing) if compare_ranked(existing, &record) != Ordering::Greater => {}
            _ => {
                best.insert(key, record);
            }
        }
    }
    let mut merged: Vec<SourceRecord> = best.into_values().collect();
    merged.sort_by(compare_ranked);
    merged
}

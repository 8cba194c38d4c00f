//! Collaborator contracts for the context engine.
//!
//! The engine never owns storage. It reads from three external
//! collaborators, each behind a trait so that backends are pluggable
//! (SQLite in the application crate, [`memory::InMemoryStore`] for tests and
//! embedded use):
//!
//! | Trait | Used by | Purpose |
//! |-------|---------|---------|
//! | [`VectorIndex`] | similarity search adapter | ranked nearest-neighbour search |
//! | [`RecordStore`] | stratified sampler | filtered counts, grouped counts, ordered paginated fetches with id exclusion |
//! | [`TitleResolver`] | formatter (via the engine) | best-effort id → human label |
//!
//! Implementations must be `Send + Sync` to work with async runtimes, and
//! every operation is a plain read.

pub mod memory;

use std::collections::HashSet;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use crate::filter::{matches_all, ScopeFilter};
use crate::models::{DateFilter, RecordKey, Severity, SourceRecord, SourceType};

/// Inputs for one vector-index search.
#[derive(Debug, Clone)]
pub struct SearchQuery<'a> {
    pub text: &'a str,
    pub source_types: &'a [SourceType],
    pub limit: usize,
    /// Minimum similarity to return.
    pub threshold: f64,
    pub date_filter: Option<&'a DateFilter>,
}

/// Ranked similarity search over stored records.
///
/// Returns records with `similarity` set, in descending similarity order,
/// each at or above `threshold`, at most `limit` of them. An empty result is
/// a valid answer, not an error.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn search(&self, query: &SearchQuery<'_>) -> Result<Vec<SourceRecord>>;
}

/// Extra per-stage predicate applied on top of the scope filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stratum<'a> {
    Any,
    Severity(Severity),
    Component(&'a str),
}

/// Ordering for bulk fetches. Ties break on id, then source type, ascending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOrder {
    NewestFirst,
    OldestFirst,
}

/// Grouping dimension for [`RecordStore::count_by`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupKey {
    Severity,
    Component,
}

/// A bulk query: scope filters + stage stratum + ids to skip.
#[derive(Debug, Clone, Copy)]
pub struct RecordQuery<'a> {
    pub source_types: &'a [SourceType],
    pub filters: &'a [ScopeFilter],
    /// Records already selected by earlier stages.
    pub exclude: &'a HashSet<RecordKey>,
    pub stratum: Stratum<'a>,
}

impl<'a> RecordQuery<'a> {
    pub fn new(
        source_types: &'a [SourceType],
        filters: &'a [ScopeFilter],
        exclude: &'a HashSet<RecordKey>,
    ) -> Self {
        Self {
            source_types,
            filters,
            exclude,
            stratum: Stratum::Any,
        }
    }

    pub fn with_stratum(mut self, stratum: Stratum<'a>) -> Self {
        self.stratum = stratum;
        self
    }

    /// Reference predicate for backends that filter in memory.
    pub fn matches(&self, record: &SourceRecord) -> bool {
        if !self.source_types.contains(&record.source_type) {
            return false;
        }
        if !self.exclude.is_empty() && self.exclude.contains(&record.key()) {
            return false;
        }
        let in_stratum = match self.stratum {
            Stratum::Any => true,
            Stratum::Severity(s) => record.metadata.severity == Some(s),
            Stratum::Component(c) => record.metadata.component.as_deref() == Some(c),
        };
        in_stratum && matches_all(self.filters, record)
    }
}

/// One bucket of a grouped count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupCount {
    pub key: String,
    pub count: usize,
}

/// Sort buckets by count (desc), then key (asc).
pub fn sort_group_counts(groups: &mut [GroupCount]) {
    groups.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.key.cmp(&b.key)));
}

/// Bulk record access required by the stratified sampler.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`count`](RecordStore::count) | number of records matching a query |
/// | [`count_by`](RecordStore::count_by) | grouped counts (records without the key are skipped), sorted by [`sort_group_counts`] |
/// | [`fetch`](RecordStore::fetch) | one ordered page of matching records |
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn count(&self, query: &RecordQuery<'_>) -> Result<usize>;

    async fn count_by(&self, query: &RecordQuery<'_>, key: GroupKey) -> Result<Vec<GroupCount>>;

    async fn fetch(
        &self,
        query: &RecordQuery<'_>,
        order: FetchOrder,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<SourceRecord>>;
}

/// Best-effort mapping from a record id to a human label.
///
/// `Ok(None)` and `Err(_)` are both treated as "unknown" by callers, which
/// fall back to [`SourceRecord::fallback_title`].
#[async_trait]
pub trait TitleResolver: Send + Sync {
    async fn display_title(&self, source_type: SourceType, id: &str) -> Result<Option<String>>;
}

//! In-memory implementation of every collaborator trait, for tests and
//! embedded use.
//!
//! Records live in a `Vec` behind `std::sync::RwLock`. Vector search is
//! brute-force cosine similarity over [`HashingEmbedder`] vectors computed at
//! insert time; bulk queries filter with [`RecordQuery::matches`].

use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard};

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::embedding::{cosine_similarity, HashingEmbedder};
use crate::models::{SourceRecord, SourceType};

use super::{
    sort_group_counts, FetchOrder, GroupCount, GroupKey, RecordQuery, RecordStore, SearchQuery,
    TitleResolver, VectorIndex,
};

struct StoredRecord {
    record: SourceRecord,
    vector: Vec<f32>,
}

/// In-memory record store, vector index, and title resolver.
pub struct InMemoryStore {
    records: RwLock<Vec<StoredRecord>>,
    titles: RwLock<HashMap<(SourceType, String), String>>,
    embedder: HashingEmbedder,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_embedder(HashingEmbedder::default())
    }

    pub fn with_embedder(embedder: HashingEmbedder) -> Self {
        Self {
            records: RwLock::new(Vec::new()),
            titles: RwLock::new(HashMap::new()),
            embedder,
        }
    }

    /// Insert or replace a record (matched by source type and id).
    pub fn insert(&self, record: SourceRecord) {
        let vector = self.embedder.vectorize(&record.content);
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        records.retain(|s| !(s.record.id == record.id && s.record.source_type == record.source_type));
        records.push(StoredRecord { record, vector });
    }

    /// Insert a record together with its display title.
    pub fn insert_titled(&self, record: SourceRecord, title: impl Into<String>) {
        self.titles
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert((record.source_type, record.id.clone()), title.into());
        self.insert(record);
    }

    pub fn extend(&self, records: impl IntoIterator<Item = SourceRecord>) {
        for r in records {
            self.insert(r);
        }
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Vec<StoredRecord>>> {
        self.records
            .read()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VectorIndex for InMemoryStore {
    async fn search(&self, query: &SearchQuery<'_>) -> Result<Vec<SourceRecord>> {
        let query_vec = self.embedder.vectorize(query.text);
        let records = self.read()?;
        let mut hits: Vec<SourceRecord> = records
            .iter()
            .filter(|s| query.source_types.contains(&s.record.source_type))
            .filter(|s| {
                query
                    .date_filter
                    .map_or(true, |f| f.contains(s.record.metadata.created_at))
            })
            .filter_map(|s| {
                let sim = cosine_similarity(&query_vec, &s.vector) as f64;
                (sim >= query.threshold).then(|| s.record.clone().with_similarity(sim))
            })
            .collect();
        hits.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        hits.truncate(query.limit);
        Ok(hits)
    }
}

#[async_trait]
impl RecordStore for InMemoryStore {
    async fn count(&self, query: &RecordQuery<'_>) -> Result<usize> {
        Ok(self.read()?.iter().filter(|s| query.matches(&s.record)).count())
    }

    async fn count_by(&self, query: &RecordQuery<'_>, key: GroupKey) -> Result<Vec<GroupCount>> {
        let records = self.read()?;
        let mut buckets: BTreeMap<String, usize> = BTreeMap::new();
        for s in records.iter().filter(|s| query.matches(&s.record)) {
            let k = match key {
                GroupKey::Severity => s.record.metadata.severity.map(|v| v.as_str().to_string()),
                GroupKey::Component => s.record.metadata.component.clone(),
            };
            if let Some(k) = k {
                *buckets.entry(k).or_insert(0) += 1;
            }
        }
        let mut groups: Vec<GroupCount> = buckets
            .into_iter()
            .map(|(key, count)| GroupCount { key, count })
            .collect();
        sort_group_counts(&mut groups);
        Ok(groups)
    }

    async fn fetch(
        &self,
        query: &RecordQuery<'_>,
        order: FetchOrder,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<SourceRecord>> {
        let records = self.read()?;
        let mut matched: Vec<&SourceRecord> = records
            .iter()
            .map(|s| &s.record)
            .filter(|r| query.matches(r))
            .collect();
        matched.sort_by(|a, b| {
            let by_time = a.metadata.created_at.cmp(&b.metadata.created_at);
            let by_time = match order {
                FetchOrder::NewestFirst => by_time.reverse(),
                FetchOrder::OldestFirst => by_time,
            };
            by_time
                .then_with(|| a.id.cmp(&b.id))
                .then_with(|| a.source_type.cmp(&b.source_type))
        });
        Ok(matched
            .into_iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl TitleResolver for InMemoryStore {
    async fn display_title(&self, source_type: SourceType, id: &str) -> Result<Option<String>> {
        let titles = self
            .titles
            .read()
            .map_err(|_| anyhow!("in-memory title lock poisoned"))?;
        Ok(titles.get(&(source_type, id.to_string())).cloned())
    }
}

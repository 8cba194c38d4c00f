//! SQLite-backed collaborators.
//!
//! [`SqliteStore`] plays the role of the external record store and vector
//! index for local use and tests. It implements [`VectorIndex`] (brute-force
//! cosine over stored vectors), [`RecordStore`] (filtered counts, grouped
//! counts and ordered pages built with [`QueryBuilder`]) and
//! [`TitleResolver`].
//!
//! Sampling exclusion is a `(source_type, id) NOT IN (VALUES (?, ?), ...)`
//! predicate with one bound pair per already-selected record.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};

use qe_context_core::embedding::{blob_to_vec, cosine_similarity, vec_to_blob, Embedder};
use qe_context_core::filter::ScopeFilter;
use qe_context_core::models::{RecordKey, RecordMetadata, Severity, SourceRecord, SourceType};
use qe_context_core::store::{
    sort_group_counts, FetchOrder, GroupCount, GroupKey, RecordQuery, RecordStore, SearchQuery,
    Stratum, TitleResolver, VectorIndex,
};

use crate::embedding::embed_query;

const RECORD_COLUMNS: &str = "r.source_type, r.id, r.content, r.severity, r.component, r.status, r.created_at, r.updated_at";

pub struct SqliteStore {
    pool: SqlitePool,
    embedder: Arc<dyn Embedder>,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool, embedder: Arc<dyn Embedder>) -> Self {
        Self { pool, embedder }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    /// Insert or replace a record, its title, and (optionally) its vector.
    pub async fn upsert(
        &self,
        record: &SourceRecord,
        title: Option<&str>,
        vector: Option<&[f32]>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO source_records (source_type, id, title, content, severity, component,
                                        status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(source_type, id) DO UPDATE SET
                title = excluded.title,
                content = excluded.content,
                severity = excluded.severity,
                component = excluded.component,
                status = excluded.status,
                created_at = excluded.created_at,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(record.source_type.as_str())
        .bind(&record.id)
        .bind(title)
        .bind(&record.content)
        .bind(record.metadata.severity.map(|s| s.as_str()))
        .bind(&record.metadata.component)
        .bind(&record.metadata.status)
        .bind(record.metadata.created_at.timestamp_millis())
        .bind(record.metadata.updated_at.timestamp_millis())
        .execute(&mut *tx)
        .await?;

        if let Some(vec) = vector {
            sqlx::query(
                r#"
                INSERT INTO record_vectors (source_type, id, model, dims, embedding)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(source_type, id) DO UPDATE SET
                    model = excluded.model,
                    dims = excluded.dims,
                    embedding = excluded.embedding
                "#,
            )
            .bind(record.source_type.as_str())
            .bind(&record.id)
            .bind(self.embedder.model_name())
            .bind(vec.len() as i64)
            .bind(vec_to_blob(vec))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn record_count(&self) -> Result<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM source_records")
            .fetch_one(&self.pool)
            .await?)
    }
}

fn ts(millis: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis).ok_or_else(|| anyhow!("invalid timestamp {millis}"))
}

fn row_to_record(row: &SqliteRow) -> Result<SourceRecord> {
    let source_type: String = row.try_get("source_type")?;
    let severity: Option<String> = row.try_get("severity")?;
    Ok(SourceRecord {
        id: row.try_get("id")?,
        source_type: source_type.parse()?,
        content: row.try_get("content")?,
        metadata: RecordMetadata {
            severity: severity.as_deref().and_then(Severity::parse),
            component: row.try_get("component")?,
            status: row.try_get("status")?,
            created_at: ts(row.try_get("created_at")?)?,
            updated_at: ts(row.try_get("updated_at")?)?,
        },
        similarity: None,
        representativeness: None,
    })
}

fn push_source_types(qb: &mut QueryBuilder<'_, Sqlite>, types: &[SourceType]) {
    if types.is_empty() {
        qb.push(" AND 1 = 0");
        return;
    }
    qb.push(" AND r.source_type IN (");
    let mut sep = qb.separated(", ");
    for t in types {
        sep.push_bind(t.as_str());
    }
    sep.push_unseparated(")");
}

/// `AND LOWER(col) IN (?, ...)` with lowercased bound values.
fn push_in_ci(qb: &mut QueryBuilder<'_, Sqlite>, column: &str, values: &[String]) {
    qb.push(format!(" AND LOWER({column}) IN ("));
    let mut sep = qb.separated(", ");
    for v in values {
        sep.push_bind(v.to_ascii_lowercase());
    }
    sep.push_unseparated(")");
}

fn push_filters(qb: &mut QueryBuilder<'_, Sqlite>, filters: &[ScopeFilter]) {
    for f in filters {
        match f {
            ScopeFilter::SeverityIn { values } => {
                qb.push(" AND r.severity IN (");
                let mut sep = qb.separated(", ");
                for s in values {
                    sep.push_bind(s.as_str());
                }
                sep.push_unseparated(")");
            }
            ScopeFilter::ComponentIn { values } => push_in_ci(qb, "r.component", values),
            ScopeFilter::StatusIn { values } => push_in_ci(qb, "r.status", values),
            ScopeFilter::DateRange { from, to } => {
                if let Some(from) = from {
                    qb.push(" AND r.created_at >= ")
                        .push_bind(from.timestamp_millis());
                }
                if let Some(to) = to {
                    qb.push(" AND r.created_at <= ").push_bind(to.timestamp_millis());
                }
            }
        }
    }
}

/// Scope + stratum + exclusion predicate for a [`RecordQuery`].
fn push_record_query(qb: &mut QueryBuilder<'_, Sqlite>, query: &RecordQuery<'_>) {
    push_source_types(qb, query.source_types);
    push_filters(qb, query.filters);
    match query.stratum {
        Stratum::Any => {}
        Stratum::Severity(s) => {
            qb.push(" AND r.severity = ").push_bind(s.as_str());
        }
        Stratum::Component(c) => {
            qb.push(" AND r.component = ").push_bind(c.to_string());
        }
    }
    if !query.exclude.is_empty() {
        tracing::debug!(excluded = query.exclude.len(), "record exclusion list");
        let mut keys: Vec<&RecordKey> = query.exclude.iter().collect();
        keys.sort();
        qb.push(" AND (r.source_type, r.id) NOT IN (VALUES ");
        for (i, key) in keys.into_iter().enumerate() {
            if i > 0 {
                qb.push(", ");
            }
            qb.push("(")
                .push_bind(key.source_type.as_str())
                .push(", ")
                .push_bind(key.id.clone())
                .push(")");
        }
        qb.push(")");
    }
}

#[async_trait]
impl VectorIndex for SqliteStore {
    async fn search(&self, query: &SearchQuery<'_>) -> Result<Vec<SourceRecord>> {
        let query_vec = embed_query(self.embedder.as_ref(), query.text).await?;

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {RECORD_COLUMNS}, v.embedding FROM source_records r \
             JOIN record_vectors v ON v.source_type = r.source_type AND v.id = r.id WHERE 1 = 1"
        ));
        push_source_types(&mut qb, query.source_types);
        if let Some(window) = query.date_filter {
            push_filters(
                &mut qb,
                &[ScopeFilter::DateRange {
                    from: window.from,
                    to: window.to,
                }],
            );
        }

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .context("vector search query failed")?;

        let mut hits = Vec::new();
        for row in &rows {
            let blob: Vec<u8> = row.try_get("embedding")?;
            let similarity = cosine_similarity(&query_vec, &blob_to_vec(&blob)) as f64;
            if similarity >= query.threshold {
                hits.push(row_to_record(row)?.with_similarity(similarity));
            }
        }

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
impl RecordStore for SqliteStore {
    async fn count(&self, query: &RecordQuery<'_>) -> Result<usize> {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT COUNT(*) FROM source_records r WHERE 1 = 1");
        push_record_query(&mut qb, query);
        let n: i64 = qb.build_query_scalar().fetch_one(&self.pool).await?;
        Ok(n as usize)
    }

    async fn count_by(&self, query: &RecordQuery<'_>, key: GroupKey) -> Result<Vec<GroupCount>> {
        let column = match key {
            GroupKey::Severity => "r.severity",
            GroupKey::Component => "r.component",
        };
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {column} AS k, COUNT(*) AS n FROM source_records r WHERE {column} IS NOT NULL"
        ));
        push_record_query(&mut qb, query);
        qb.push(" GROUP BY k");

        let rows = qb.build().fetch_all(&self.pool).await?;
        let mut groups = rows
            .iter()
            .map(|row| -> Result<GroupCount> {
                let n: i64 = row.try_get("n")?;
                Ok(GroupCount {
                    key: row.try_get("k")?,
                    count: n as usize,
                })
            })
            .collect::<Result<Vec<_>>>()?;
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
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {RECORD_COLUMNS} FROM source_records r WHERE 1 = 1"
        ));
        push_record_query(&mut qb, query);
        qb.push(match order {
            FetchOrder::NewestFirst => " ORDER BY r.created_at DESC, r.id ASC, r.source_type ASC",
            FetchOrder::OldestFirst => " ORDER BY r.created_at ASC, r.id ASC, r.source_type ASC",
        });
        qb.push(" LIMIT ")
            .push_bind(limit.min(i64::MAX as usize) as i64)
            .push(" OFFSET ")
            .push_bind(offset as i64);

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(row_to_record).collect()
    }
}

#[async_trait]
impl TitleResolver for SqliteStore {
    async fn display_title(&self, source_type: SourceType, id: &str) -> Result<Option<String>> {
        let title: Option<Option<String>> =
            sqlx::query_scalar("SELECT title FROM source_records WHERE source_type = ? AND id = ?")
                .bind(source_type.as_str())
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(title.flatten().filter(|t| !t.trim().is_empty()))
    }
}

//! Local record import.
//!
//! Loads a JSON array or JSON-Lines file of records, embeds their content in
//! batches, and upserts records plus vectors into the SQLite store. This is a
//! convenience for local use and tests; production records arrive through
//! the dashboard's own import pipeline.
//!
//! Input shape (camelCase or snake_case keys):
//!
//! ```json
//! {"id": "D-17", "sourceType": "defect", "title": "Login timeout",
//!  "content": "...", "severity": "major", "component": "auth",
//!  "status": "open", "createdAt": "2024-03-01T10:00:00Z"}
//! ```
//!
//! Records without an `id` get a UUID v4; without `createdAt`, the import
//! time. Unknown severities are dropped with a warning rather than failing
//! the record.

use std::path::Path;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

use qe_context_core::models::{RecordMetadata, Severity, SourceRecord, SourceType};

use crate::config::Config;
use crate::db;
use crate::embedding::create_embedder;
use crate::migrate;
use crate::sqlite_store::SqliteStore;

/// One record as it appears in an import file.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportRecord {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default, alias = "source_type", alias = "type")]
    pub source_type: Option<SourceType>,
    #[serde(default)]
    pub title: Option<String>,
    pub content: String,
    #[serde(default)]
    pub severity: Option<String>,
    #[serde(default)]
    pub component: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default, alias = "created_at")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, alias = "updated_at")]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ImportStats {
    pub imported: usize,
    pub embedded: usize,
    pub warnings: Vec<String>,
}

/// Parse a JSON array, or JSON Lines when the text does not start with `[`.
pub fn parse_import(text: &str) -> Result<Vec<ImportRecord>> {
    let trimmed = text.trim_start();
    if trimmed.starts_with('[') {
        return serde_json::from_str(trimmed).context("Failed to parse JSON array of records");
    }
    trimmed
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            serde_json::from_str(line).with_context(|| format!("Invalid record on line {}", i + 1))
        })
        .collect()
}

impl ImportRecord {
    /// Normalize into a record plus display title.
    pub fn into_record(
        self,
        default_type: Option<SourceType>,
        now: DateTime<Utc>,
        warnings: &mut Vec<String>,
    ) -> Result<(SourceRecord, Option<String>)> {
        let id = self
            .id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let Some(source_type) = self.source_type.or(default_type) else {
            bail!("record '{}' has no sourceType and no --type was given", id);
        };
        let severity = match self.severity.as_deref() {
            None => None,
            Some(raw) => {
                let parsed = Severity::parse(raw);
                if parsed.is_none() {
                    warnings.push(format!("record '{id}': unknown severity '{raw}' ignored"));
                }
                parsed
            }
        };
        let created_at = self.created_at.unwrap_or(now);
        let record = SourceRecord {
            id,
            source_type,
            content: self.content,
            metadata: RecordMetadata {
                severity,
                component: self.component.filter(|c| !c.trim().is_empty()),
                status: self.status.filter(|s| !s.trim().is_empty()),
                created_at,
                updated_at: self.updated_at.unwrap_or(created_at),
            },
            similarity: None,
            representativeness: None,
        };
        Ok((record, self.title))
    }
}

/// Embed and upsert `records` through `store`.
///
/// Embedding failure is not fatal: records are stored without vectors (they
/// stay visible to sampling but not to semantic search) and a warning is
/// reported.
pub async fn import_records(
    store: &SqliteStore,
    records: Vec<ImportRecord>,
    default_type: Option<SourceType>,
    batch_size: usize,
) -> Result<ImportStats> {
    let now = Utc::now();
    let mut stats = ImportStats::default();

    let mut normalized = Vec::with_capacity(records.len());
    for r in records {
        normalized.push(r.into_record(default_type, now, &mut stats.warnings)?);
    }

    for batch in normalized.chunks(batch_size.max(1)) {
        let texts: Vec<String> = batch.iter().map(|(r, _)| r.content.clone()).collect();
        let vectors = match store.embedder().embed(&texts).await {
            Ok(v) if v.len() == texts.len() => Some(v),
            Ok(v) => {
                stats.warnings.push(format!(
                    "embedder returned {} vectors for {} records; stored without vectors",
                    v.len(),
                    texts.len()
                ));
                None
            }
            Err(e) => {
                tracing::warn!(error = %e, "embedding failed during import");
                stats
                    .warnings
                    .push(format!("embedding failed, stored without vectors: {e:#}"));
                None
            }
        };

        for (i, (record, title)) in batch.iter().enumerate() {
            let vector = vectors.as_ref().map(|v| v[i].as_slice());
            store.upsert(record, title.as_deref(), vector).await?;
            stats.imported += 1;
            if vector.is_some() {
                stats.embedded += 1;
            }
        }
    }

    tracing::info!(
        imported = stats.imported,
        embedded = stats.embedded,
        "import complete"
    );
    Ok(stats)
}

/// CLI entry: `qectx import <file> [--type T]`.
pub async fn run_import(config: &Config, path: &Path, default_type: Option<SourceType>) -> Result<()> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read import file: {}", path.display()))?;
    let records = parse_import(&text)?;

    let pool = db::connect(config).await?;
    migrate::migrate_pool(&pool).await?;
    let store = SqliteStore::new(pool.clone(), create_embedder(&config.embedding)?);

    let stats = import_records(&store, records, default_type, config.embedding.batch_size).await?;
    for w in &stats.warnings {
        println!("warning: {}", w);
    }
    println!(
        "Imported {} records ({} embedded) from {}",
        stats.imported,
        stats.embedded,
        path.display()
    );

    pool.close().await;
    Ok(())
}

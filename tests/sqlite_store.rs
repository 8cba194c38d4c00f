//! SQLite collaborator behaviour against a real database file.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use tempfile::TempDir;

use qe_context::db;
use qe_context::ingest::{import_records, parse_import};
use qe_context::migrate;
use qe_context::sqlite_store::SqliteStore;
use qe_context_core::embedding::{Embedder, HashingEmbedder};
use qe_context_core::filter::ScopeFilter;
use qe_context_core::models::{RecordKey, Severity, SourceRecord, SourceType};
use qe_context_core::params::SamplingParams;
use qe_context_core::sampler::{SamplingStrategy, StratifiedSampler};
use qe_context_core::store::{
    FetchOrder, GroupKey, RecordQuery, RecordStore, SearchQuery, Stratum, TitleResolver,
    VectorIndex,
};

async fn open_store(tmp: &TempDir) -> SqliteStore {
    let pool = db::connect_path(&tmp.path().join("qectx.sqlite")).await.unwrap();
    migrate::migrate_pool(&pool).await.unwrap();
    SqliteStore::new(pool, Arc::new(HashingEmbedder::default()))
}

async fn put(store: &SqliteStore, record: SourceRecord, title: Option<&str>) {
    let vector = HashingEmbedder::default().vectorize(&record.content);
    store.upsert(&record, title, Some(&vector)).await.unwrap();
}

fn defect(i: usize) -> SourceRecord {
    let severity = match i % 10 {
        0 => Severity::Critical,
        1 | 2 => Severity::High,
        3..=6 => Severity::Medium,
        _ => Severity::Low,
    };
    let created = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::hours(i as i64 * 7);
    SourceRecord::new(
        format!("D-{i:04}"),
        SourceType::Defect,
        format!("defect number {i} in component {}", i % 8),
        created,
    )
    .with_severity(severity)
    .with_component(format!("comp-{}", i % 8))
    .with_status(if i % 3 == 0 { "closed" } else { "open" })
}

#[tokio::test]
async fn test_upsert_replaces_and_counts() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp).await;

    put(&store, defect(1), None).await;
    put(&store, defect(1), Some("renamed")).await;
    put(&store, defect(2), None).await;
    assert_eq!(store.record_count().await.unwrap(), 2);

    assert_eq!(
        store.display_title(SourceType::Defect, "D-0001").await.unwrap().as_deref(),
        Some("renamed")
    );
    assert_eq!(store.display_title(SourceType::Defect, "D-0002").await.unwrap(), None);
    assert_eq!(store.display_title(SourceType::Requirement, "D-0001").await.unwrap(), None);
}

#[tokio::test]
async fn test_counts_and_fetch_honour_filters() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp).await;
    for i in 0..40 {
        put(&store, defect(i), None).await;
    }

    let types = [SourceType::Defect];
    let none = HashSet::new();
    let all = RecordQuery::new(&types, &[], &none);
    assert_eq!(store.count(&all).await.unwrap(), 40);

    let filters = [ScopeFilter::SeverityIn {
        values: vec![Severity::Critical, Severity::High],
    }];
    let severe = RecordQuery::new(&types, &filters, &none);
    assert_eq!(store.count(&severe).await.unwrap(), 12);

    let filters = [ScopeFilter::ComponentIn {
        values: vec!["COMP-1".into()],
    }];
    assert_eq!(
        store.count(&RecordQuery::new(&types, &filters, &none)).await.unwrap(),
        5
    );

    let by_severity = store.count_by(&all, GroupKey::Severity).await.unwrap();
    assert_eq!(by_severity[0].key, "medium");
    assert_eq!(by_severity[0].count, 16);

    let newest = store.fetch(&all, FetchOrder::NewestFirst, 0, 3).await.unwrap();
    let ids: Vec<&str> = newest.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["D-0039", "D-0038", "D-0037"]);

    let exclude: HashSet<RecordKey> = [
        RecordKey::new(SourceType::Defect, "D-0000"),
        RecordKey::new(SourceType::Defect, "D-0001"),
    ]
    .into();
    let oldest = store
        .fetch(&RecordQuery::new(&types, &[], &exclude), FetchOrder::OldestFirst, 0, 2)
        .await
        .unwrap();
    let ids: Vec<&str> = oldest.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["D-0002", "D-0003"]);

    let critical = RecordQuery::new(&types, &[], &none).with_stratum(Stratum::Severity(Severity::Critical));
    let page = store.fetch(&critical, FetchOrder::NewestFirst, 1, 10).await.unwrap();
    assert_eq!(page.len(), 3);
    assert!(page.iter().all(|r| r.metadata.severity == Some(Severity::Critical)));
}

#[tokio::test]
async fn test_vector_search_ranks_by_similarity() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp).await;
    let ts = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
    put(
        &store,
        SourceRecord::new("REQ-1", SourceType::Requirement, "User can pay at checkout with a saved card", ts),
        Some("Saved card checkout"),
    )
    .await;
    put(
        &store,
        SourceRecord::new("REQ-2", SourceType::Requirement, "Password reset email is sent within one minute", ts),
        None,
    )
    .await;
    put(
        &store,
        SourceRecord::new("D-1", SourceType::Defect, "checkout with saved card fails", ts),
        None,
    )
    .await;

    let types = [SourceType::Requirement];
    let hits = store
        .search(&SearchQuery {
            text: "checkout saved card",
            source_types: &types,
            limit: 5,
            threshold: 0.3,
            date_filter: None,
        })
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, "REQ-1");
    assert!(hits[0].similarity.unwrap() > 0.3);
}

#[tokio::test]
async fn test_sampler_over_sqlite() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp).await;
    for i in 0..400 {
        put(&store, defect(i), None).await;
    }

    let sampler = StratifiedSampler::new(SamplingParams::default());
    let result = sampler
        .sample(&store, &[SourceType::Defect], &[])
        .await
        .unwrap();
    assert_eq!(result.strategy, SamplingStrategy::Stratified);
    assert_eq!(result.total_in_scope, 400);
    assert_eq!(result.records.len(), 100);
    let ids: HashSet<&str> = result.records.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids.len(), 100);
    assert_eq!(result.breakdown.total_components_in_scope, 8);

    let filters = [ScopeFilter::StatusIn {
        values: vec!["CLOSED".into()],
    }];
    let closed = sampler
        .sample(&store, &[SourceType::Defect], &filters)
        .await
        .unwrap();
    assert_eq!(closed.total_in_scope, 134);
    assert!(closed.records.iter().all(|r| r.metadata.status.as_deref() == Some("closed")));
}

#[tokio::test]
async fn test_shared_id_across_types_is_two_records() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp).await;
    let ts = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
    put(&store, SourceRecord::new("1", SourceType::Requirement, "login works", ts), None).await;
    put(
        &store,
        SourceRecord::new("1", SourceType::Defect, "login fails", ts - Duration::days(2)),
        None,
    )
    .await;
    put(
        &store,
        SourceRecord::new("2", SourceType::Defect, "logout fails", ts - Duration::days(1)),
        None,
    )
    .await;

    let types = [SourceType::Requirement, SourceType::Defect];
    let exclude: HashSet<RecordKey> = [RecordKey::new(SourceType::Defect, "1")].into();
    let query = RecordQuery::new(&types, &[], &exclude);
    assert_eq!(store.count(&query).await.unwrap(), 2);
    let rows = store.fetch(&query, FetchOrder::NewestFirst, 0, 10).await.unwrap();
    let keys: Vec<RecordKey> = rows.iter().map(SourceRecord::key).collect();
    assert_eq!(
        keys,
        vec![
            RecordKey::new(SourceType::Requirement, "1"),
            RecordKey::new(SourceType::Defect, "2"),
        ]
    );

    let result = StratifiedSampler::new(SamplingParams::default())
        .sample(&store, &types, &[])
        .await
        .unwrap();
    assert_eq!(result.strategy, SamplingStrategy::Complete);
    assert_eq!(result.total_in_scope, 3);
    assert_eq!(result.records.len(), 3);
    assert_eq!(result.representativeness_score, 1.0);
}

#[tokio::test]
async fn test_import_stores_titles_and_vectors() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp).await;
    let records = parse_import(
        r#"[
            {"id": "TC-1", "title": "Checkout smoke", "content": "Add item, pay, see confirmation"},
            {"content": "Login with expired password shows reset prompt", "severity": "p0"}
        ]"#,
    )
    .unwrap();

    let stats = import_records(&store, records, Some(SourceType::TestCase), 8)
        .await
        .unwrap();
    assert_eq!(stats.imported, 2);
    assert_eq!(stats.embedded, 2);
    assert_eq!(stats.warnings.len(), 1);
    assert_eq!(store.record_count().await.unwrap(), 2);
    assert_eq!(
        store.display_title(SourceType::TestCase, "TC-1").await.unwrap().as_deref(),
        Some("Checkout smoke")
    );

    let embedder = store.embedder().clone();
    assert_eq!(embedder.model_name(), "hashing");
    let types = [SourceType::TestCase];
    let hits = store
        .search(&SearchQuery {
            text: "login expired password",
            source_types: &types,
            limit: 5,
            threshold: 0.4,
            date_filter: None,
        })
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert!(hits[0].content.starts_with("Login with expired password"));
}

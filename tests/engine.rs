//! End-to-end engine behaviour over in-memory and scripted collaborators.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use proptest::prelude::*;

use qe_context::config::{Config, ResolvedSettings};
use qe_context::engine::{
    ContextEngine, ContextRequest, ContextStatus, ContextStrategy, RequestOverrides,
};
use qe_context_core::filter::ScopeFilter;
use qe_context_core::models::{Severity, SourceRecord, SourceType};
use qe_context_core::params::TypeLimitsOverride;
use qe_context_core::store::memory::InMemoryStore;
use qe_context_core::store::{SearchQuery, VectorIndex};

fn ts(day: i64) -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + ChronoDuration::days(day)
}

fn settings_without_relevance() -> ResolvedSettings {
    let mut config = Config::default();
    config.relevance.enabled = false;
    config.resolve()
}

/// Requirements answer with three hits; documents fail; the rest are empty.
struct DocumentsDown {
    delay: Duration,
}

#[async_trait]
impl VectorIndex for DocumentsDown {
    async fn search(&self, query: &SearchQuery<'_>) -> Result<Vec<SourceRecord>> {
        tokio::time::sleep(self.delay).await;
        match query.source_types[0] {
            SourceType::Document => bail!("vector service returned 503"),
            SourceType::Requirement => Ok((1..=3)
                .map(|i| {
                    SourceRecord::new(
                        format!("REQ-{i}"),
                        SourceType::Requirement,
                        format!("Requirement {i} about checkout"),
                        ts(i),
                    )
                    .with_similarity(0.95 - i as f64 * 0.05)
                })
                .collect()),
            _ => Ok(Vec::new()),
        }
    }
}

fn engine_with_index(index: impl VectorIndex + 'static) -> ContextEngine {
    let store = Arc::new(InMemoryStore::new());
    ContextEngine::new(
        Arc::new(index),
        store.clone(),
        store,
        settings_without_relevance(),
    )
}

#[tokio::test]
async fn failing_document_search_keeps_requirement_hits() {
    let engine = engine_with_index(DocumentsDown {
        delay: Duration::ZERO,
    });
    let request = ContextRequest::query("checkout")
        .with_source_types(vec![SourceType::Document, SourceType::Requirement]);
    let resp = engine.retrieve(&request).await.unwrap();

    let ids: Vec<&str> = resp.sources.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(ids, vec!["REQ-1", "REQ-2", "REQ-3"]);
    assert_eq!(resp.meta.status, ContextStatus::Ready);
    assert_eq!(resp.meta.items_found, 3);
    assert_eq!(resp.meta.warnings.len(), 1);
    assert!(resp.meta.warnings[0].contains("document"));
    assert!(!resp.meta.partial);
    assert!(resp.context_text.contains("[Source: REQUIREMENT: REQ-1 | Type: REQUIREMENT | Similarity: 0.90]"));
}

#[tokio::test]
async fn deadline_returns_partial_no_context() {
    let engine = engine_with_index(DocumentsDown {
        delay: Duration::from_secs(5),
    });
    let request = ContextRequest::query("checkout").with_overrides(RequestOverrides {
        deadline_ms: Some(50),
        ..Default::default()
    });
    let started = std::time::Instant::now();
    let resp = engine.retrieve(&request).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(resp.meta.partial);
    assert_eq!(resp.meta.status, ContextStatus::NoContext);
    assert!(resp.context_text.starts_with("[No stored context found]"));
}

#[tokio::test]
async fn budget_800_three_items_of_400() {
    let store = Arc::new(InMemoryStore::new());
    for i in 0..3 {
        store.insert(SourceRecord::new(
            format!("D-{i}"),
            SourceType::Defect,
            "checkout ".repeat(50).chars().take(400).collect::<String>(),
            ts(i),
        ));
    }
    let mut settings = settings_without_relevance();
    settings.retrieval = settings
        .retrieval
        .with_overrides(&qe_context_core::params::RetrievalOverrides {
            types: BTreeMap::from([(
                SourceType::Defect,
                TypeLimitsOverride {
                    similarity_threshold: Some(0.01),
                    ..Default::default()
                },
            )]),
            max_total_context_length: Some(800),
        })
        .0;
    let engine = ContextEngine::from_store(store, settings);
    let resp = engine
        .retrieve(&ContextRequest::query("checkout").with_source_types(vec![SourceType::Defect]))
        .await
        .unwrap();
    // Rendered blocks are a little over 400 chars each, so only one fits in 800.
    assert_eq!(resp.meta.items_found, 3);
    assert_eq!(resp.meta.items_used, 1);
    assert!(resp.context_text.chars().count() <= 800);
}

#[tokio::test]
async fn sampling_large_defect_corpus() {
    let store = Arc::new(InMemoryStore::new());
    for i in 0..1000 {
        let severity = if i % 25 == 0 {
            Severity::Critical
        } else if i % 3 == 0 {
            Severity::High
        } else if i % 3 == 1 {
            Severity::Medium
        } else {
            Severity::Low
        };
        store.insert(
            SourceRecord::new(format!("D-{i:04}"), SourceType::Defect, format!("defect {i}"), ts(i % 365))
                .with_severity(severity)
                .with_component(format!("comp-{}", i % 12)),
        );
    }
    let engine = ContextEngine::from_store(store, settings_without_relevance());
    let budget = engine.settings().retrieval.max_total_context_length;
    let resp = engine
        .retrieve(&ContextRequest::filters(Vec::new()).with_source_types(vec![SourceType::Defect]))
        .await
        .unwrap();

    assert_eq!(resp.meta.strategy, ContextStrategy::Stratified);
    assert_eq!(resp.meta.total_in_scope, 1000);
    let breakdown = resp.meta.breakdown.as_ref().unwrap();
    assert_eq!(breakdown.sample_size, 100);
    assert!(breakdown.by_severity[&Severity::Critical] >= 20);
    assert!(resp.context_text.starts_with("[Sampled context | Total in scope: 1000 | Strategy: stratified"));
    assert!(resp.context_text.chars().count() <= budget);
    let score = resp.meta.representativeness_score.unwrap();
    assert!((0.0..=1.0).contains(&score));
}

#[tokio::test]
async fn sampling_empty_scope_scores_zero() {
    let engine = engine_with_index(DocumentsDown {
        delay: Duration::ZERO,
    });
    let request = ContextRequest::filters(vec![ScopeFilter::ComponentIn {
        values: vec!["nowhere".into()],
    }]);
    let resp = engine.retrieve(&request).await.unwrap();
    assert_eq!(resp.meta.total_in_scope, 0);
    assert_eq!(resp.meta.representativeness_score, Some(0.0));
    assert_eq!(resp.meta.status, ContextStatus::NoContext);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn context_text_never_exceeds_budget(
        budget in 1i64..3000,
        lengths in prop::collection::vec(1usize..1500, 0..12),
        sampling in any::<bool>(),
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let store = Arc::new(InMemoryStore::new());
        for (i, len) in lengths.iter().enumerate() {
            store.insert(SourceRecord::new(
                format!("R-{i}"),
                SourceType::Requirement,
                "login ".repeat(*len / 6 + 1),
                ts(i as i64),
            ));
        }
        let mut settings = settings_without_relevance();
        settings.retrieval = settings
            .retrieval
            .with_overrides(&qe_context_core::params::RetrievalOverrides {
                types: BTreeMap::from([(
                    SourceType::Requirement,
                    TypeLimitsOverride {
                        similarity_threshold: Some(0.0),
                        max_results: Some(20),
                        ..Default::default()
                    },
                )]),
                max_total_context_length: None,
            })
            .0;
        let engine = ContextEngine::from_store(store, settings);
        let overrides = RequestOverrides {
            max_total_context_length: Some(budget),
            ..Default::default()
        };
        let request = if sampling {
            ContextRequest::filters(Vec::new())
        } else {
            ContextRequest::query("login")
        }
        .with_source_types(vec![SourceType::Requirement])
        .with_overrides(overrides);

        let resp = rt.block_on(engine.retrieve(&request)).unwrap();
        prop_assert!(resp.context_text.chars().count() <= budget as usize);
        let mut ids: Vec<&str> = resp.sources.iter().map(|s| s.id.as_str()).collect();
        let n = ids.len();
        ids.sort();
        ids.dedup();
        prop_assert_eq!(ids.len(), n);
    }
}

//! The context engine façade.
//!
//! [`ContextEngine::retrieve`] is the single entry point for both retrieval
//! modes:
//!
//! - **semantic** (`scope` is free text): fan-out similarity search per
//!   source type, keyword relevance filter, budget packing, formatting.
//! - **sampling** (`scope` is a list of typed filters): stratified sampling
//!   of the matching corpus, budget packing, formatting with a preamble.
//!
//! Every call runs under one overall deadline. When it fires, whatever was
//! assembled so far is returned with `meta.partial = true`. Per-type search
//! failures, sampler stage failures and title lookup failures are reported
//! in `meta.warnings`; none of them fail the call. The only error is an
//! invalid request ([`ScopeError`]).
//!
//! ```rust
//! # use std::sync::Arc;
//! # use qe_context::config::Config;
//! # use qe_context::engine::{ContextEngine, ContextRequest, ContextStatus};
//! # use qe_context_core::store::memory::InMemoryStore;
//! # tokio_test_block(async {
//! let engine = ContextEngine::from_store(Arc::new(InMemoryStore::new()), Config::default().resolve());
//! let request: ContextRequest = serde_json::from_str(r#"{"scope": "checkout errors"}"#).unwrap();
//! let response = engine.retrieve(&request).await.unwrap();
//! assert_eq!(response.meta.status, ContextStatus::NoContext);
//! # });
//! # fn tokio_test_block<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Runtime::new().unwrap().block_on(f)
//! # }
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio::time::Instant;

use qe_context_core::budget::{truncate_chars, Assembler, BudgetReport, Candidate, ContextEntry};
use qe_context_core::filter::{parse_filters, validate_filters, ScopeError, ScopeFilter};
use qe_context_core::format::{self, RenderedLength, SamplingPreamble, NO_CONTEXT_NOTICE};
use qe_context_core::models::{DateFilter, SourceRecord, SourceType};
use qe_context_core::params::{
    positive_or_default, RetrievalOverrides, RetrievalParams, TypeLimitsOverride,
};
use qe_context_core::sampler::{
    SamplingBreakdown, SamplingProgress, SamplingResult, SamplingStrategy, StratifiedSampler,
};
use qe_context_core::store::{RecordStore, TitleResolver, VectorIndex};

use crate::config::{ResolvedSettings, DEFAULT_DEADLINE_MS};
use crate::search::fan_out_search;

/// Source types searched when a request names none.
pub const DEFAULT_SOURCE_TYPES: [SourceType; 4] = [
    SourceType::Requirement,
    SourceType::Defect,
    SourceType::TestCase,
    SourceType::Document,
];

// ============ Request ============

/// What to retrieve: a free-text query or a filter list.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Scope {
    Query(String),
    Filters(Vec<ScopeFilter>),
}

impl<'de> Deserialize<'de> for Scope {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::Error;
        match serde_json::Value::deserialize(deserializer)? {
            serde_json::Value::String(s) => Ok(Scope::Query(s)),
            v @ serde_json::Value::Array(_) => parse_filters(v)
                .map(Scope::Filters)
                .map_err(D::Error::custom),
            other => Err(D::Error::custom(format!(
                "scope must be a query string or an array of filters, got {other}"
            ))),
        }
    }
}

/// Per-request overrides. Invalid values fall back to defaults with a
/// warning.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RequestOverrides {
    #[serde(default)]
    pub types: BTreeMap<SourceType, TypeLimitsOverride>,
    #[serde(default)]
    pub max_total_context_length: Option<i64>,
    #[serde(default)]
    pub deadline_ms: Option<i64>,
    #[serde(default)]
    pub boosted_keywords: Option<Vec<String>>,
}

impl RequestOverrides {
    fn retrieval(&self) -> RetrievalOverrides {
        RetrievalOverrides {
            types: self.types.clone(),
            max_total_context_length: self.max_total_context_length,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ContextRequest {
    #[serde(alias = "query")]
    pub scope: Scope,
    #[serde(default = "default_source_types")]
    pub source_types: Vec<SourceType>,
    #[serde(default)]
    pub overrides: RequestOverrides,
    /// Creation-date window for semantic mode. Rejected on a filter scope,
    /// which takes a `date_range` filter instead.
    #[serde(default)]
    pub date_filter: Option<DateFilter>,
}

fn default_source_types() -> Vec<SourceType> {
    DEFAULT_SOURCE_TYPES.to_vec()
}

impl ContextRequest {
    pub fn query(query: impl Into<String>) -> Self {
        Self {
            scope: Scope::Query(query.into()),
            source_types: default_source_types(),
            overrides: RequestOverrides::default(),
            date_filter: None,
        }
    }

    pub fn filters(filters: Vec<ScopeFilter>) -> Self {
        Self {
            scope: Scope::Filters(filters),
            ..Self::query("")
        }
    }

    pub fn with_source_types(mut self, types: impl Into<Vec<SourceType>>) -> Self {
        self.source_types = types.into();
        self
    }

    pub fn with_overrides(mut self, overrides: RequestOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn with_date_filter(mut self, date_filter: DateFilter) -> Self {
        self.date_filter = Some(date_filter);
        self
    }

    fn validate(&self) -> Result<(), ScopeError> {
        if let Scope::Filters(filters) = &self.scope {
            if self.date_filter.is_some() {
                return Err(ScopeError::DateFilterWithFilters);
            }
            validate_filters(filters)?;
        }
        if let Some(DateFilter {
            from: Some(from),
            to: Some(to),
        }) = self.date_filter
        {
            if from > to {
                return Err(ScopeError::InvertedDateRange { from, to });
            }
        }
        Ok(())
    }
}

// ============ Response ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextStrategy {
    Semantic,
    Complete,
    Stratified,
}

impl From<SamplingStrategy> for ContextStrategy {
    fn from(s: SamplingStrategy) -> Self {
        match s {
            SamplingStrategy::Complete => ContextStrategy::Complete,
            SamplingStrategy::Stratified => ContextStrategy::Stratified,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextStatus {
    Ready,
    NoContext,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextMeta {
    pub strategy: ContextStrategy,
    /// Merged search hits (semantic) or matching records (sampling).
    pub total_in_scope: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub representativeness_score: Option<f64>,
    pub status: ContextStatus,
    pub partial: bool,
    pub items_found: usize,
    pub items_used: usize,
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub breakdown: Option<SamplingBreakdown>,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextResponse {
    pub context_text: String,
    pub sources: Vec<ContextEntry>,
    pub meta: ContextMeta,
}

// ============ Engine ============

/// Stateless retrieval façade over the three read collaborators.
pub struct ContextEngine {
    index: Arc<dyn VectorIndex>,
    records: Arc<dyn RecordStore>,
    titles: Arc<dyn TitleResolver>,
    settings: ResolvedSettings,
}

impl ContextEngine {
    pub fn new(
        index: Arc<dyn VectorIndex>,
        records: Arc<dyn RecordStore>,
        titles: Arc<dyn TitleResolver>,
        settings: ResolvedSettings,
    ) -> Self {
        Self {
            index,
            records,
            titles,
            settings,
        }
    }

    /// Use one backend for every collaborator.
    pub fn from_store<S>(store: Arc<S>, settings: ResolvedSettings) -> Self
    where
        S: VectorIndex + RecordStore + TitleResolver + 'static,
    {
        Self::new(store.clone(), store.clone(), store, settings)
    }

    pub fn settings(&self) -> &ResolvedSettings {
        &self.settings
    }

    /// Retrieve and assemble context for one request.
    pub async fn retrieve(&self, request: &ContextRequest) -> Result<ContextResponse, ScopeError> {
        request.validate()?;
        let started = Instant::now();
        let mut warnings = Vec::new();
        let deadline = started + self.deadline_for(&request.overrides, &mut warnings);

        let (params, w) = self
            .settings
            .retrieval
            .with_overrides(&request.overrides.retrieval());
        for message in &w {
            tracing::warn!("request override: {message}");
        }
        warnings.extend(w);

        let source_types = if request.source_types.is_empty() {
            default_source_types()
        } else {
            request.source_types.clone()
        };

        let mut response = match &request.scope {
            Scope::Query(query) => {
                self.semantic(query, &source_types, request, &params, deadline, warnings)
                    .await
            }
            Scope::Filters(filters) => {
                self.sampled(filters, &source_types, &params, deadline, warnings)
                    .await
            }
        };
        response.meta.elapsed_ms = started.elapsed().as_millis() as u64;

        tracing::info!(
            strategy = ?response.meta.strategy,
            items_found = response.meta.items_found,
            items_used = response.meta.items_used,
            partial = response.meta.partial,
            warnings = response.meta.warnings.len(),
            elapsed_ms = response.meta.elapsed_ms,
            "context assembled"
        );
        Ok(response)
    }

    /// Run the stratified sampler alone, under the configured deadline.
    pub async fn sample(
        &self,
        source_types: &[SourceType],
        filters: &[ScopeFilter],
    ) -> Result<SamplingResult, ScopeError> {
        validate_filters(filters)?;
        let deadline = Instant::now() + self.settings.deadline;
        Ok(self.run_sampler(source_types, filters, deadline).await)
    }

    fn deadline_for(&self, overrides: &RequestOverrides, warnings: &mut Vec<String>) -> Duration {
        match overrides.deadline_ms {
            None => self.settings.deadline,
            raw => Duration::from_millis(positive_or_default(
                raw,
                DEFAULT_DEADLINE_MS as usize,
                "deadline_ms",
                warnings,
            ) as u64),
        }
    }

    async fn semantic(
        &self,
        query: &str,
        source_types: &[SourceType],
        request: &ContextRequest,
        params: &RetrievalParams,
        deadline: Instant,
        mut warnings: Vec<String>,
    ) -> ContextResponse {
        let search = fan_out_search(
            self.index.clone(),
            query,
            source_types,
            params,
            request.date_filter,
            deadline,
        )
        .await;
        warnings.extend(search.warnings);
        let total_in_scope = search.records.len();

        let records = match &self.settings.relevance {
            Some(filter) => {
                let filter = match &request.overrides.boosted_keywords {
                    Some(keywords) => filter.with_keywords(keywords),
                    None => filter.clone(),
                };
                let kept = filter.retain(search.records, query, |r| r.content.as_str());
                tracing::debug!(before = total_in_scope, after = kept.len(), "relevance filter");
                kept
            }
            None => search.records,
        };

        let candidates = self.resolve_titles(records, deadline, &mut warnings).await;
        let report = pack(params, &candidates, params.max_total_context_length);
        let context_text = format::render(&report.entries, None);

        finish(
            context_text,
            report,
            params.max_total_context_length,
            ContextMeta {
                strategy: ContextStrategy::Semantic,
                total_in_scope,
                representativeness_score: None,
                status: ContextStatus::Ready,
                partial: search.partial,
                items_found: 0,
                items_used: 0,
                warnings,
                breakdown: None,
                elapsed_ms: 0,
            },
        )
    }

    async fn sampled(
        &self,
        filters: &[ScopeFilter],
        source_types: &[SourceType],
        params: &RetrievalParams,
        deadline: Instant,
        mut warnings: Vec<String>,
    ) -> ContextResponse {
        let result = self.run_sampler(source_types, filters, deadline).await;
        warnings.extend(result.warnings);

        let budget = params.max_total_context_length;
        let preamble = SamplingPreamble {
            total_in_scope: result.total_in_scope,
            strategy: result.strategy,
            representativeness_score: result.representativeness_score,
        };
        let reserved = format::preamble_len(&preamble);
        let (preamble, entry_budget) = if result.records.is_empty() || reserved > budget {
            (None, budget)
        } else {
            (Some(preamble), budget - reserved)
        };

        let candidates = self
            .resolve_titles(result.records, deadline, &mut warnings)
            .await;
        let report = pack(params, &candidates, entry_budget);
        let preamble = preamble.filter(|_| !report.entries.is_empty());
        let context_text = format::render(&report.entries, preamble.as_ref());

        finish(
            context_text,
            report,
            budget,
            ContextMeta {
                strategy: result.strategy.into(),
                total_in_scope: result.total_in_scope,
                representativeness_score: Some(result.representativeness_score),
                status: ContextStatus::Ready,
                partial: result.partial,
                items_found: 0,
                items_used: 0,
                warnings,
                breakdown: Some(result.breakdown),
                elapsed_ms: 0,
            },
        )
    }

    async fn run_sampler(
        &self,
        source_types: &[SourceType],
        filters: &[ScopeFilter],
        deadline: Instant,
    ) -> SamplingResult {
        let sampler = StratifiedSampler::new(self.settings.sampling.clone());
        let mut progress = SamplingProgress::new();
        let run = sampler.run(self.records.as_ref(), source_types, filters, &mut progress);
        let outcome = tokio::time::timeout_at(deadline, run).await;
        let partial = match outcome {
            Ok(Ok(())) => false,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "sampling failed");
                progress.warn(format!("sampling failed: {e:#}"));
                false
            }
            Err(_) => {
                let stage = progress.current_stage().unwrap_or("unknown");
                tracing::warn!(stage, selected = progress.selected_len(), "sampling hit the deadline");
                progress.warn(format!(
                    "sampling stopped at the deadline during stage '{stage}'"
                ));
                true
            }
        };
        progress.into_result(sampler.params().max_sample_size, partial)
    }

    /// Look up display titles concurrently. Lookups that fail, return
    /// nothing, or are still running at the deadline use the fallback title.
    async fn resolve_titles(
        &self,
        records: Vec<SourceRecord>,
        deadline: Instant,
        warnings: &mut Vec<String>,
    ) -> Vec<Candidate> {
        let mut titles: Vec<Option<String>> = vec![None; records.len()];
        let mut set = JoinSet::new();
        for (i, record) in records.iter().enumerate() {
            let resolver = self.titles.clone();
            let source_type = record.source_type;
            let id = record.id.clone();
            set.spawn(async move { (i, resolver.display_title(source_type, &id).await) });
        }

        let mut failed = 0usize;
        loop {
            match tokio::time::timeout_at(deadline, set.join_next()).await {
                Ok(None) => break,
                Ok(Some(Ok((i, Ok(title))))) => titles[i] = title,
                Ok(Some(Ok((_, Err(e))))) => {
                    tracing::debug!(error = %e, "title lookup failed");
                    failed += 1;
                }
                Ok(Some(Err(_))) => failed += 1,
                Err(_) => {
                    let unresolved = set.len();
                    set.abort_all();
                    warnings.push(format!(
                        "{unresolved} title lookups did not finish before the deadline"
                    ));
                    break;
                }
            }
        }
        if failed > 0 {
            tracing::warn!(failed, "title lookups failed; using fallback titles");
        }

        records
            .into_iter()
            .zip(titles)
            .map(|(record, display_title)| Candidate {
                record,
                display_title,
            })
            .collect()
    }
}

fn pack(params: &RetrievalParams, candidates: &[Candidate], budget: usize) -> BudgetReport {
    Assembler::new(budget)
        .with_mark_truncation(params.mark_truncation)
        .pack(
            candidates,
            |t| params.limits(t).max_item_length,
            &RenderedLength,
        )
}

fn finish(
    context_text: String,
    report: BudgetReport,
    budget: usize,
    mut meta: ContextMeta,
) -> ContextResponse {
    meta.items_found = report.items_found;
    meta.items_used = report.items_used;
    if report.entries.is_empty() {
        meta.status = ContextStatus::NoContext;
        let (notice, _) = truncate_chars(NO_CONTEXT_NOTICE, budget, false);
        return ContextResponse {
            context_text: notice,
            sources: Vec::new(),
            meta,
        };
    }
    if report.budget_exhausted {
        tracing::debug!(
            items_found = report.items_found,
            items_used = report.items_used,
            "context budget exhausted"
        );
    }
    ContextResponse {
        context_text,
        sources: report.entries,
        meta,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};
    use qe_context_core::models::Severity;
    use qe_context_core::store::memory::InMemoryStore;

    fn store() -> Arc<InMemoryStore> {
        let store = InMemoryStore::new();
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        store.insert_titled(
            SourceRecord::new(
                "R-1",
                SourceType::Requirement,
                "The checkout page must validate payment card numbers before submission",
                base,
            ),
            "Checkout card validation",
        );
        store.insert(SourceRecord::new(
            "D-1",
            SourceType::Defect,
            "Checkout payment fails when card number contains spaces",
            base + ChronoDuration::days(1),
        )
        .with_severity(Severity::High)
        .with_component("checkout"));
        store.insert(SourceRecord::new(
            "T-1",
            SourceType::TestCase,
            "Verify login with expired password shows reset prompt",
            base + ChronoDuration::days(2),
        ));
        Arc::new(store)
    }

    fn permissive() -> ResolvedSettings {
        let mut config = Config::default();
        config.relevance.enabled = false;
        let mut settings = config.resolve();
        for t in SourceType::ALL {
            settings.retrieval = settings
                .retrieval
                .with_overrides(&RetrievalOverrides {
                    types: BTreeMap::from([(
                        t,
                        TypeLimitsOverride {
                            similarity_threshold: Some(0.01),
                            ..Default::default()
                        },
                    )]),
                    max_total_context_length: None,
                })
                .0;
        }
        settings
    }

    #[test]
    fn test_scope_deserializes_both_modes() {
        let q: ContextRequest = serde_json::from_str(r#"{"scope":"checkout"}"#).unwrap();
        assert_eq!(q.scope, Scope::Query("checkout".into()));
        assert_eq!(q.source_types, DEFAULT_SOURCE_TYPES.to_vec());

        let f: ContextRequest = serde_json::from_str(
            r#"{"scope":[{"kind":"severity_in","values":["critical"]}],"sourceTypes":["defect"]}"#,
        )
        .unwrap();
        assert!(matches!(f.scope, Scope::Filters(ref v) if v.len() == 1));
    }

    #[test]
    fn test_scope_rejects_unknown_filter_and_shape() {
        assert!(serde_json::from_str::<ContextRequest>(r#"{"scope":[{"kind":"owner_in","values":["x"]}]}"#).is_err());
        assert!(serde_json::from_str::<ContextRequest>(r#"{"scope":42}"#).is_err());
        assert!(serde_json::from_str::<ContextRequest>(r#"{"scope":"x","bogus":1}"#).is_err());
    }

    #[tokio::test]
    async fn test_semantic_ready_with_sources() {
        let engine = ContextEngine::from_store(store(), permissive());
        let resp = engine
            .retrieve(&ContextRequest::query("checkout payment card"))
            .await
            .unwrap();
        assert_eq!(resp.meta.status, ContextStatus::Ready);
        assert_eq!(resp.meta.strategy, ContextStrategy::Semantic);
        assert!(resp.context_text.contains("[Source: Checkout card validation | Type: REQUIREMENT"));
        assert!(resp
            .sources
            .windows(2)
            .all(|w| w[0].similarity >= w[1].similarity));
    }

    #[tokio::test]
    async fn test_no_context_notice_within_budget() {
        let engine = ContextEngine::from_store(Arc::new(InMemoryStore::new()), permissive());
        let request = ContextRequest::query("anything").with_overrides(RequestOverrides {
            max_total_context_length: Some(20),
            ..Default::default()
        });
        let resp = engine.retrieve(&request).await.unwrap();
        assert_eq!(resp.meta.status, ContextStatus::NoContext);
        assert!(resp.sources.is_empty());
        assert_eq!(resp.context_text.chars().count(), 20);
    }

    #[tokio::test]
    async fn test_sampling_mode_has_preamble_and_score() {
        let engine = ContextEngine::from_store(store(), permissive());
        let resp = engine
            .retrieve(&ContextRequest::filters(Vec::new()).with_source_types(SourceType::ALL.to_vec()))
            .await
            .unwrap();
        assert_eq!(resp.meta.strategy, ContextStrategy::Complete);
        assert_eq!(resp.meta.total_in_scope, 3);
        assert_eq!(resp.meta.representativeness_score, Some(1.0));
        assert!(resp.context_text.starts_with("[Sampled context | Total in scope: 3"));
        assert!(resp.context_text.contains("Similarity: sampled"));
    }

    #[tokio::test]
    async fn test_inverted_date_filter_rejected() {
        let engine = ContextEngine::from_store(store(), permissive());
        let now = Utc::now();
        let request = ContextRequest::query("x").with_date_filter(DateFilter {
            from: Some(now),
            to: Some(now - ChronoDuration::days(1)),
        });
        assert!(matches!(
            engine.retrieve(&request).await,
            Err(ScopeError::InvertedDateRange { .. })
        ));
    }

    #[tokio::test]
    async fn test_date_filter_on_filter_scope_rejected() {
        let engine = ContextEngine::from_store(store(), permissive());
        let now = Utc::now();
        let request = ContextRequest::filters(Vec::new()).with_date_filter(DateFilter {
            from: Some(now - ChronoDuration::days(30)),
            to: Some(now),
        });
        assert_eq!(
            engine.retrieve(&request).await.unwrap_err(),
            ScopeError::DateFilterWithFilters
        );
    }

    #[tokio::test]
    async fn test_bad_override_warns_and_defaults() {
        let engine = ContextEngine::from_store(store(), permissive());
        let request = ContextRequest::query("checkout").with_overrides(RequestOverrides {
            max_total_context_length: Some(-5),
            deadline_ms: Some(0),
            ..Default::default()
        });
        let resp = engine.retrieve(&request).await.unwrap();
        assert_eq!(resp.meta.warnings.len(), 2);
        assert!(!resp.meta.partial);
    }
}

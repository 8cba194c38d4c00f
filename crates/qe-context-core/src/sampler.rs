//! Stratified sampler for corpora too large to analyze whole.
//!
//! A scope at or under the sample cap is returned whole (`complete`). Larger
//! scopes go through sequential stages, each excluding records already chosen and
//! never taking more than the remaining budget:
//!
//! | Stage | Selects |
//! |-------|---------|
//! | `recent` | newest records (a larger quota for wide time ranges) |
//! | `oldest` | oldest records |
//! | `severity` | per band, newest records until the band's target is met |
//! | `components` | up to `component_cap` newest records from each of the largest components |
//! | `fill` | newest remaining records up to the cap |
//!
//! A failing stage is logged, recorded as a warning and contributes nothing;
//! later stages still run.
//!
//! Progress is written into a caller-owned [`SamplingProgress`] so a caller
//! that abandons [`StratifiedSampler::run`] at a deadline keeps whatever was
//! selected before it fired.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::filter::{date_window, ScopeFilter};
use crate::models::{RecordKey, Severity, SourceRecord, SourceType};
use crate::params::{SamplingCaps, SamplingParams};
use crate::store::{FetchOrder, GroupKey, RecordQuery, RecordStore, Stratum};

/// Page size used when a complete scope is fetched.
const COMPLETE_PAGE_SIZE: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplingStrategy {
    Complete,
    Stratified,
}

impl SamplingStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SamplingStrategy::Complete => "complete",
            SamplingStrategy::Stratified => "stratified",
        }
    }
}

/// Creation-time extent of a sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeSpan {
    pub earliest: DateTime<Utc>,
    pub latest: DateTime<Utc>,
    pub days: i64,
}

/// What the sample contains, with enough detail to recompute the score.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SamplingBreakdown {
    pub by_severity: BTreeMap<Severity, usize>,
    pub components_covered: usize,
    pub total_components_in_scope: usize,
    pub sample_size: usize,
    pub max_sample_size: usize,
    pub distinct_severity_bands: usize,
    pub time_span: Option<TimeSpan>,
}

impl SamplingBreakdown {
    fn from_records(
        records: &[SourceRecord],
        total_components_in_scope: usize,
        max_sample_size: usize,
    ) -> Self {
        let mut by_severity = BTreeMap::new();
        let mut components = BTreeSet::new();
        for r in records {
            if let Some(s) = r.metadata.severity {
                *by_severity.entry(s).or_insert(0) += 1;
            }
            if let Some(c) = r.metadata.component.as_deref() {
                components.insert(c);
            }
        }
        let earliest = records.iter().map(|r| r.metadata.created_at).min();
        let latest = records.iter().map(|r| r.metadata.created_at).max();
        let time_span = earliest.zip(latest).map(|(earliest, latest)| TimeSpan {
            earliest,
            latest,
            days: (latest - earliest).num_days(),
        });
        Self {
            distinct_severity_bands: by_severity.len(),
            by_severity,
            components_covered: components.len(),
            total_components_in_scope,
            sample_size: records.len(),
            max_sample_size,
            time_span,
        }
    }
}

/// Representativeness heuristic:
///
/// ```text
/// 0.4 × componentsCovered / totalComponentsInScope
///   + 0.3 × sampleSize / min(maxSampleSize, totalInScope)
///   + 0.3 × distinctSeverityBands / 4
/// ```
///
/// clamped to `[0, 1]`. Each term with a zero denominator contributes 0.
pub fn representativeness_score(total_in_scope: usize, breakdown: &SamplingBreakdown) -> f64 {
    let coverage = ratio(
        breakdown.components_covered,
        breakdown.total_components_in_scope,
    );
    let size = ratio(
        breakdown.sample_size,
        breakdown.max_sample_size.min(total_in_scope),
    );
    let bands = ratio(breakdown.distinct_severity_bands, Severity::ALL.len());
    (0.4 * coverage + 0.3 * size + 0.3 * bands).clamp(0.0, 1.0)
}

fn ratio(n: usize, d: usize) -> f64 {
    if d == 0 {
        0.0
    } else {
        n as f64 / d as f64
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SamplingResult {
    pub records: Vec<SourceRecord>,
    pub strategy: SamplingStrategy,
    pub total_in_scope: usize,
    pub representativeness_score: f64,
    pub breakdown: SamplingBreakdown,
    pub warnings: Vec<String>,
    pub partial: bool,
}

/// Selection state shared between the sampler and its caller.
#[derive(Debug, Default)]
pub struct SamplingProgress {
    total_in_scope: Option<usize>,
    total_components: usize,
    caps: Option<SamplingCaps>,
    strategy: Option<SamplingStrategy>,
    selected: Vec<SourceRecord>,
    selected_ids: HashSet<RecordKey>,
    warnings: Vec<String>,
    current_stage: Option<&'static str>,
}

impl SamplingProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn selected_len(&self) -> usize {
        self.selected.len()
    }

    /// Stage that was running when the caller stopped awaiting, if any.
    pub fn current_stage(&self) -> Option<&'static str> {
        self.current_stage
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    /// Add `records` not already selected, up to `limit`. Returns how many
    /// were added.
    fn admit(&mut self, records: Vec<SourceRecord>, limit: usize) -> usize {
        let mut added = 0;
        for r in records {
            if added == limit {
                break;
            }
            if self.selected_ids.insert(r.key()) {
                self.selected.push(r);
                added += 1;
            }
        }
        added
    }

    fn remaining(&self) -> usize {
        self.caps
            .map_or(0, |c| c.max_sample_size.saturating_sub(self.selected.len()))
    }

    /// Finalize into a result. `partial` marks a run cut short by a deadline.
    ///
    /// An empty scope scores `0`. A complete strategy scores `1.0` only when
    /// it finished and holds every record in scope; anything short of that
    /// uses [`representativeness_score`].
    pub fn into_result(self, default_cap: usize, partial: bool) -> SamplingResult {
        let total_in_scope = self.total_in_scope.unwrap_or(0);
        let strategy = self.strategy.unwrap_or(SamplingStrategy::Complete);
        let max_sample_size = self.caps.map_or(default_cap, |c| c.max_sample_size);
        let breakdown =
            SamplingBreakdown::from_records(&self.selected, self.total_components, max_sample_size);
        let score = if total_in_scope == 0 {
            0.0
        } else if strategy == SamplingStrategy::Complete
            && !partial
            && self.selected.len() == total_in_scope
        {
            1.0
        } else {
            representativeness_score(total_in_scope, &breakdown)
        };
        let records = self
            .selected
            .into_iter()
            .map(|mut r| {
                r.representativeness = Some(score);
                r
            })
            .collect();
        SamplingResult {
            records,
            strategy,
            total_in_scope,
            representativeness_score: score,
            breakdown,
            warnings: self.warnings,
            partial,
        }
    }
}

/// Sampler over one scope (source types + filters).
#[derive(Debug, Clone)]
pub struct StratifiedSampler {
    params: SamplingParams,
}

impl StratifiedSampler {
    pub fn new(params: SamplingParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &SamplingParams {
        &self.params
    }

    /// Run to completion and return the result.
    pub async fn sample(
        &self,
        store: &dyn RecordStore,
        source_types: &[SourceType],
        filters: &[ScopeFilter],
    ) -> Result<SamplingResult> {
        let mut progress = SamplingProgress::new();
        self.run(store, source_types, filters, &mut progress).await?;
        Ok(progress.into_result(self.params.max_sample_size, false))
    }

    /// Drive sampling, recording every selection into `progress`.
    ///
    /// Only the initial scope count can fail the call; stage failures become
    /// warnings.
    pub async fn run(
        &self,
        store: &dyn RecordStore,
        source_types: &[SourceType],
        filters: &[ScopeFilter],
        progress: &mut SamplingProgress,
    ) -> Result<()> {
        let caps = self.params.caps_for(&date_window(filters));
        progress.caps = Some(caps);

        progress.current_stage = Some("count");
        let total = {
            let no_exclusions = HashSet::new();
            let scope = RecordQuery::new(source_types, filters, &no_exclusions);
            store
                .count(&scope)
                .await
                .context("counting records in sampling scope")?
        };
        progress.total_in_scope = Some(total);

        let components = {
            let no_exclusions = HashSet::new();
            let scope = RecordQuery::new(source_types, filters, &no_exclusions);
            store.count_by(&scope, GroupKey::Component).await
        };
        match components {
            Ok(groups) => progress.total_components = groups.len(),
            Err(e) => {
                tracing::warn!(error = %e, "component count failed");
                progress.warn(format!("component count failed: {e:#}"));
            }
        }

        if total <= caps.max_sample_size {
            progress.strategy = Some(SamplingStrategy::Complete);
            tracing::debug!(total, "sampling scope fits; taking all records");
            if let Err(e) = self.take_all(store, source_types, filters, total, progress).await {
                tracing::warn!(error = %e, "complete fetch failed");
                progress.warn(format!("complete fetch failed: {e:#}"));
            }
            progress.current_stage = None;
            return Ok(());
        }

        progress.strategy = Some(SamplingStrategy::Stratified);
        tracing::debug!(
            total,
            max_sample_size = caps.max_sample_size,
            wide_range = caps.wide_range,
            "stratified sampling"
        );

        let ctx = StageCtx {
            store,
            source_types,
            filters,
        };

        let step = ctx
            .take(Stratum::Any, FetchOrder::NewestFirst, caps.recent_quota, progress)
            .await;
        finish_stage("recent", step, progress);

        let step = ctx
            .take(Stratum::Any, FetchOrder::OldestFirst, caps.oldest_quota, progress)
            .await;
        finish_stage("oldest", step, progress);

        for severity in Severity::ALL {
            let target = self.params.band(severity).target(total);
            let already = progress
                .selected
                .iter()
                .filter(|r| r.metadata.severity == Some(severity))
                .count();
            let need = target.saturating_sub(already);
            let step = ctx
                .take(
                    Stratum::Severity(severity),
                    FetchOrder::NewestFirst,
                    need,
                    progress,
                )
                .await;
            finish_stage("severity", step, progress);
        }

        let groups = {
            let scope = RecordQuery::new(source_types, filters, &progress.selected_ids);
            store.count_by(&scope, GroupKey::Component).await
        };
        match groups {
            Ok(groups) => {
                for group in groups.iter().take(self.params.max_components) {
                    if progress.remaining() == 0 {
                        break;
                    }
                    let step = ctx
                        .take(
                            Stratum::Component(&group.key),
                            FetchOrder::NewestFirst,
                            self.params.component_cap,
                            progress,
                        )
                        .await;
                    finish_stage("components", step, progress);
                }
            }
            Err(e) => finish_stage("components", Err(e), progress),
        }

        let fill = progress.remaining();
        let step = ctx
            .take(Stratum::Any, FetchOrder::NewestFirst, fill, progress)
            .await;
        finish_stage("fill", step, progress);

        progress.current_stage = None;
        Ok(())
    }

    async fn take_all(
        &self,
        store: &dyn RecordStore,
        source_types: &[SourceType],
        filters: &[ScopeFilter],
        total: usize,
        progress: &mut SamplingProgress,
    ) -> Result<()> {
        let no_exclusions = HashSet::new();
        let scope = RecordQuery::new(source_types, filters, &no_exclusions);
        let mut offset = 0;
        while offset < total {
            let page = store
                .fetch(&scope, FetchOrder::NewestFirst, offset, COMPLETE_PAGE_SIZE)
                .await?;
            if page.is_empty() {
                break;
            }
            offset += page.len();
            progress.admit(page, usize::MAX);
        }
        Ok(())
    }
}

fn finish_stage(stage: &'static str, step: Result<usize>, progress: &mut SamplingProgress) {
    match step {
        Ok(added) => tracing::debug!(stage, added, selected = progress.selected.len(), "stage done"),
        Err(e) => {
            tracing::warn!(stage, error = %e, "sampling stage failed");
            progress.warn(format!("sampling stage '{stage}' failed: {e:#}"));
        }
    }
}

struct StageCtx<'a> {
    store: &'a dyn RecordStore,
    source_types: &'a [SourceType],
    filters: &'a [ScopeFilter],
}

impl StageCtx<'_> {
    /// Fetch up to `want` unselected records (capped by the remaining budget)
    /// and admit them.
    async fn take(
        &self,
        stratum: Stratum<'_>,
        order: FetchOrder,
        want: usize,
        progress: &mut SamplingProgress,
    ) -> Result<usize> {
        let want = want.min(progress.remaining());
        if want == 0 {
            return Ok(0);
        }
        progress.current_stage = Some(match stratum {
            Stratum::Any => "fetch",
            Stratum::Severity(_) => "severity",
            Stratum::Component(_) => "components",
        });
        tracing::debug!(excluded = progress.selected_ids.len(), want, "sampling fetch");
        let records = {
            let query = RecordQuery::new(self.source_types, self.filters, &progress.selected_ids)
                .with_stratum(stratum);
            self.store.fetch(&query, order, 0, want).await?
        };
        Ok(progress.admit(records, want))
    }
}

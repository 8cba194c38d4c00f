//! Retrieval and sampling tuning parameters, decoupled from application config.
//!
//! The application parses its TOML file into loosely-typed "raw" values
//! (`Option<i64>`, `Option<f64>`) so that a negative limit or a threshold
//! outside `[0, 1]` can be detected. The helpers here turn those raw values
//! into validated parameters, falling back to documented defaults and
//! collecting a human-readable warning for every value they replace. A bad
//! knob never fails a retrieval call.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::models::{DateFilter, Severity, SourceType};

/// Default global context budget, in characters.
pub const DEFAULT_MAX_TOTAL_CONTEXT_LENGTH: usize = 12_000;

/// Per-source-type retrieval knobs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeLimits {
    pub max_results: usize,
    pub similarity_threshold: f64,
    pub max_item_length: usize,
}

impl TypeLimits {
    /// Documented defaults for each source type.
    pub fn default_for(source_type: SourceType) -> Self {
        let (max_results, similarity_threshold, max_item_length) = match source_type {
            SourceType::Requirement => (5, 0.70, 1500),
            SourceType::Defect => (5, 0.70, 1000),
            SourceType::TestCase => (5, 0.70, 800),
            SourceType::Document => (3, 0.65, 2000),
            SourceType::DocumentSection => (5, 0.65, 1500),
        };
        Self {
            max_results,
            similarity_threshold,
            max_item_length,
        }
    }
}

/// Raw, possibly-invalid per-type values as they arrive from config files or
/// request overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TypeLimitsOverride {
    #[serde(default, alias = "maxResults")]
    pub max_results: Option<i64>,
    #[serde(default, alias = "similarityThreshold")]
    pub similarity_threshold: Option<f64>,
    #[serde(default, alias = "maxItemLength")]
    pub max_item_length: Option<i64>,
}

/// Raw overrides for a whole retrieval call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetrievalOverrides {
    #[serde(default)]
    pub types: BTreeMap<SourceType, TypeLimitsOverride>,
    #[serde(default, alias = "maxTotalContextLength")]
    pub max_total_context_length: Option<i64>,
}

/// Validated retrieval parameters for one call.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalParams {
    per_type: BTreeMap<SourceType, TypeLimits>,
    pub max_total_context_length: usize,
    /// Mark truncated items with a trailing `...`.
    pub mark_truncation: bool,
}

impl Default for RetrievalParams {
    fn default() -> Self {
        Self {
            per_type: SourceType::ALL
                .iter()
                .map(|t| (*t, TypeLimits::default_for(*t)))
                .collect(),
            max_total_context_length: DEFAULT_MAX_TOTAL_CONTEXT_LENGTH,
            mark_truncation: true,
        }
    }
}

impl RetrievalParams {
    /// Limits for `source_type`.
    pub fn limits(&self, source_type: SourceType) -> TypeLimits {
        self.per_type
            .get(&source_type)
            .copied()
            .unwrap_or_else(|| TypeLimits::default_for(source_type))
    }

    /// Apply raw overrides on top of `self`.
    ///
    /// Each invalid value is replaced by the corresponding *default* (not the
    /// base value) and reported in the returned warnings.
    pub fn with_overrides(&self, overrides: &RetrievalOverrides) -> (Self, Vec<String>) {
        let mut warnings = Vec::new();
        let mut out = self.clone();

        for (source_type, raw) in &overrides.types {
            let base = self.limits(*source_type);
            let defaults = TypeLimits::default_for(*source_type);
            let prefix = source_type.as_str();
            let limits = TypeLimits {
                max_results: match raw.max_results {
                    None => base.max_results,
                    some => positive_or_default(
                        some,
                        defaults.max_results,
                        &format!("{prefix}.max_results"),
                        &mut warnings,
                    ),
                },
                similarity_threshold: match raw.similarity_threshold {
                    None => base.similarity_threshold,
                    some => unit_or_default(
                        some,
                        defaults.similarity_threshold,
                        &format!("{prefix}.similarity_threshold"),
                        &mut warnings,
                    ),
                },
                max_item_length: match raw.max_item_length {
                    None => base.max_item_length,
                    some => positive_or_default(
                        some,
                        defaults.max_item_length,
                        &format!("{prefix}.max_item_length"),
                        &mut warnings,
                    ),
                },
            };
            out.per_type.insert(*source_type, limits);
        }

        if overrides.max_total_context_length.is_some() {
            out.max_total_context_length = positive_or_default(
                overrides.max_total_context_length,
                DEFAULT_MAX_TOTAL_CONTEXT_LENGTH,
                "max_total_context_length",
                &mut warnings,
            );
        }

        (out, warnings)
    }
}

/// Resolve a count-like knob: `None` → default silently, `<= 0` → default
/// with a warning.
pub fn positive_or_default(
    raw: Option<i64>,
    default: usize,
    field: &str,
    warnings: &mut Vec<String>,
) -> usize {
    match raw {
        None => default,
        Some(v) if v > 0 => v as usize,
        Some(v) => {
            warnings.push(format!(
                "{field} = {v} is invalid (must be > 0); using default {default}"
            ));
            default
        }
    }
}

/// Resolve a `[0, 1]` knob: `None` → default silently, NaN or out of range →
/// default with a warning.
pub fn unit_or_default(
    raw: Option<f64>,
    default: f64,
    field: &str,
    warnings: &mut Vec<String>,
) -> f64 {
    match raw {
        None => default,
        Some(v) if (0.0..=1.0).contains(&v) => v,
        Some(v) => {
            warnings.push(format!(
                "{field} = {v} is invalid (must be within [0, 1]); using default {default}"
            ));
            default
        }
    }
}

// ============ Sampling ============

/// Quota rule for one severity band.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BandQuota {
    /// Share of the corpus this band aims for.
    pub fraction: f64,
    pub min: usize,
    pub max: usize,
}

impl BandQuota {
    /// `clamp(floor(total × fraction), min, max)`.
    pub fn target(&self, total_in_scope: usize) -> usize {
        let raw = (total_in_scope as f64 * self.fraction).floor() as usize;
        raw.clamp(self.min, self.max)
    }

    pub fn default_for(severity: Severity) -> Self {
        let (fraction, min, max) = match severity {
            Severity::Critical => (0.10, 5, 20),
            Severity::High => (0.15, 5, 25),
            Severity::Medium => (0.10, 3, 15),
            Severity::Low => (0.05, 2, 10),
        };
        Self { fraction, min, max }
    }
}

/// Validated stratified-sampling parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingParams {
    pub max_sample_size: usize,
    pub wide_range_max_sample_size: usize,
    pub wide_range_days: i64,
    pub recent_quota: usize,
    pub wide_range_recent_quota: usize,
    pub oldest_quota: usize,
    pub bands: BTreeMap<Severity, BandQuota>,
    pub component_cap: usize,
    pub max_components: usize,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            max_sample_size: 100,
            wide_range_max_sample_size: 75,
            wide_range_days: 180,
            recent_quota: 20,
            wide_range_recent_quota: 30,
            oldest_quota: 10,
            bands: Severity::ALL
                .iter()
                .map(|s| (*s, BandQuota::default_for(*s)))
                .collect(),
            component_cap: 3,
            max_components: 10,
        }
    }
}

/// Caps that apply to one sampling call after the time range is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplingCaps {
    pub max_sample_size: usize,
    pub recent_quota: usize,
    pub oldest_quota: usize,
    pub wide_range: bool,
}

impl SamplingParams {
    pub fn band(&self, severity: Severity) -> BandQuota {
        self.bands
            .get(&severity)
            .copied()
            .unwrap_or_else(|| BandQuota::default_for(severity))
    }

    /// Caps for a scope covering `window`. Bounded windows longer than
    /// `wide_range_days` get the smaller sample and the larger recency quota.
    pub fn caps_for(&self, window: &DateFilter) -> SamplingCaps {
        let wide_range = window
            .span()
            .is_some_and(|span| span.num_days() > self.wide_range_days);
        if wide_range {
            SamplingCaps {
                max_sample_size: self.wide_range_max_sample_size,
                recent_quota: self.wide_range_recent_quota,
                oldest_quota: self.oldest_quota,
                wide_range,
            }
        } else {
            SamplingCaps {
                max_sample_size: self.max_sample_size,
                recent_quota: self.recent_quota,
                oldest_quota: self.oldest_quota,
                wide_range,
            }
        }
    }

    /// Replace inconsistent values with defaults, reporting each replacement.
    ///
    /// Catches what the per-field helpers cannot: band fractions outside
    /// `[0, 1]`, `min > max`, and a wide-range cap larger than the normal cap.
    pub fn sanitized(mut self) -> (Self, Vec<String>) {
        let mut warnings = Vec::new();
        let defaults = SamplingParams::default();

        for severity in Severity::ALL {
            let quota = self.band(severity);
            let fallback = BandQuota::default_for(severity);
            let fraction = unit_or_default(
                Some(quota.fraction),
                fallback.fraction,
                &format!("sampling.bands.{severity}.fraction"),
                &mut warnings,
            );
            let (min, max) = if quota.min > quota.max {
                warnings.push(format!(
                    "sampling.bands.{severity}: min {} > max {}; using defaults [{}, {}]",
                    quota.min, quota.max, fallback.min, fallback.max
                ));
                (fallback.min, fallback.max)
            } else {
                (quota.min, quota.max)
            };
            self.bands.insert(severity, BandQuota { fraction, min, max });
        }

        if self.max_sample_size == 0 {
            warnings.push(format!(
                "sampling.max_sample_size = 0 is invalid; using default {}",
                defaults.max_sample_size
            ));
            self.max_sample_size = defaults.max_sample_size;
        }
        if self.wide_range_max_sample_size == 0
            || self.wide_range_max_sample_size > self.max_sample_size
        {
            warnings.push(format!(
                "sampling.wide_range_max_sample_size = {} is invalid (must be in 1..={}); using {}",
                self.wide_range_max_sample_size,
                self.max_sample_size,
                self.max_sample_size.min(defaults.wide_range_max_sample_size)
            ));
            self.wide_range_max_sample_size =
                self.max_sample_size.min(defaults.wide_range_max_sample_size);
        }
        if self.wide_range_days <= 0 {
            warnings.push(format!(
                "sampling.wide_range_days = {} is invalid; using default {}",
                self.wide_range_days, defaults.wide_range_days
            ));
            self.wide_range_days = defaults.wide_range_days;
        }
        if self.component_cap == 0 {
            warnings.push(format!(
                "sampling.component_cap = 0 is invalid; using default {}",
                defaults.component_cap
            ));
            self.component_cap = defaults.component_cap;
        }

        (self, warnings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    #[test]
    fn test_default_limits_cover_every_type() {
        let p = RetrievalParams::default();
        for t in SourceType::ALL {
            let l = p.limits(t);
            assert!(l.max_results > 0);
            assert!((0.0..=1.0).contains(&l.similarity_threshold));
            assert!(l.max_item_length > 0);
        }
        assert_eq!(p.max_total_context_length, DEFAULT_MAX_TOTAL_CONTEXT_LENGTH);
    }

    #[test]
    fn test_overrides_apply_valid_values() {
        let mut types = BTreeMap::new();
        types.insert(
            SourceType::Defect,
            TypeLimitsOverride {
                max_results: Some(9),
                similarity_threshold: Some(0.5),
                max_item_length: None,
            },
        );
        let (p, warnings) = RetrievalParams::default().with_overrides(&RetrievalOverrides {
            types,
            max_total_context_length: Some(4000),
        });
        assert!(warnings.is_empty());
        let l = p.limits(SourceType::Defect);
        assert_eq!(l.max_results, 9);
        assert_eq!(l.similarity_threshold, 0.5);
        assert_eq!(
            l.max_item_length,
            TypeLimits::default_for(SourceType::Defect).max_item_length
        );
        assert_eq!(p.max_total_context_length, 4000);
    }

    #[test]
    fn test_invalid_overrides_fall_back_with_warnings() {
        let mut types = BTreeMap::new();
        types.insert(
            SourceType::Requirement,
            TypeLimitsOverride {
                max_results: Some(-3),
                similarity_threshold: Some(1.7),
                max_item_length: Some(0),
            },
        );
        let (p, warnings) = RetrievalParams::default().with_overrides(&RetrievalOverrides {
            types,
            max_total_context_length: Some(-1),
        });
        assert_eq!(warnings.len(), 4);
        assert_eq!(
            p.limits(SourceType::Requirement),
            TypeLimits::default_for(SourceType::Requirement)
        );
        assert_eq!(p.max_total_context_length, DEFAULT_MAX_TOTAL_CONTEXT_LENGTH);
    }

    #[test]
    fn test_nan_threshold_falls_back() {
        let mut w = Vec::new();
        assert_eq!(unit_or_default(Some(f64::NAN), 0.7, "x", &mut w), 0.7);
        assert_eq!(w.len(), 1);
    }

    #[test]
    fn test_overrides_accept_camel_case_json() {
        let o: RetrievalOverrides = serde_json::from_str(
            r#"{"types":{"test_case":{"maxResults":2}},"maxTotalContextLength":900}"#,
        )
        .unwrap();
        assert_eq!(o.types[&SourceType::TestCase].max_results, Some(2));
        assert_eq!(o.max_total_context_length, Some(900));
    }

    #[test]
    fn test_band_target_clamps() {
        let q = BandQuota::default_for(Severity::Critical);
        assert_eq!(q.target(1000), 20);
        assert_eq!(q.target(120), 12);
        assert_eq!(q.target(10), 5);
    }

    #[test]
    fn test_caps_for_wide_range() {
        let p = SamplingParams::default();
        let from = Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap();
        let wide = DateFilter {
            from: Some(from),
            to: Some(from + Duration::days(365)),
        };
        let narrow = DateFilter {
            from: Some(from),
            to: Some(from + Duration::days(30)),
        };
        assert!(p.caps_for(&wide).wide_range);
        assert_eq!(p.caps_for(&wide).max_sample_size, 75);
        assert_eq!(p.caps_for(&wide).recent_quota, 30);
        assert!(!p.caps_for(&narrow).wide_range);
        assert_eq!(p.caps_for(&DateFilter::default()).max_sample_size, 100);
    }

    #[test]
    fn test_sanitized_repairs_bands() {
        let mut p = SamplingParams::default();
        p.bands.insert(
            Severity::High,
            BandQuota {
                fraction: 2.0,
                min: 30,
                max: 4,
            },
        );
        p.wide_range_max_sample_size = 500;
        let (p, warnings) = p.sanitized();
        assert_eq!(warnings.len(), 3);
        assert_eq!(p.band(Severity::High), BandQuota::default_for(Severity::High));
        assert_eq!(p.wide_range_max_sample_size, 75);
    }
}

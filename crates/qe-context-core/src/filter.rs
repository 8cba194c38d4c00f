//! Typed scope filters for sampling mode.
//!
//! A sampling scope is a list of [`ScopeFilter`]s, combined with AND. Each
//! variant covers exactly one filterable dimension, so free-form key/value
//! maps never reach the store. Unknown `kind` tags and unknown fields are
//! rejected during deserialization; semantic problems (empty value lists,
//! inverted date ranges) are rejected by [`validate_filters`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{DateFilter, Severity, SourceRecord};

/// One filterable dimension of a sampling scope.
///
/// ```rust
/// use qe_context_core::filter::ScopeFilter;
///
/// let f: ScopeFilter =
///     serde_json::from_str(r#"{"kind":"component_in","values":["checkout"]}"#).unwrap();
/// assert!(matches!(f, ScopeFilter::ComponentIn { .. }));
///
/// let bad = serde_json::from_str::<ScopeFilter>(r#"{"kind":"owner_in","values":["bob"]}"#);
/// assert!(bad.is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum ScopeFilter {
    SeverityIn {
        values: Vec<Severity>,
    },
    ComponentIn {
        values: Vec<String>,
    },
    StatusIn {
        values: Vec<String>,
    },
    DateRange {
        #[serde(default)]
        from: Option<DateTime<Utc>>,
        #[serde(default)]
        to: Option<DateTime<Utc>>,
    },
}

/// Rejections raised at the filter boundary.
#[derive(Debug, Error, PartialEq)]
pub enum ScopeError {
    #[error("malformed filter: {0}")]
    Malformed(String),
    #[error("{kind} filter must list at least one value")]
    EmptyValues { kind: &'static str },
    #[error("date_range.from ({from}) is after date_range.to ({to})")]
    InvertedDateRange {
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    },
    #[error("at most one date_range filter is allowed")]
    DuplicateDateRange,
    #[error("date_filter only applies to query requests; use a date_range filter")]
    DateFilterWithFilters,
}

impl ScopeFilter {
    fn kind(&self) -> &'static str {
        match self {
            ScopeFilter::SeverityIn { .. } => "severity_in",
            ScopeFilter::ComponentIn { .. } => "component_in",
            ScopeFilter::StatusIn { .. } => "status_in",
            ScopeFilter::DateRange { .. } => "date_range",
        }
    }

    /// Whether `record` satisfies this filter. Component and status
    /// comparisons are case-insensitive.
    pub fn matches(&self, record: &SourceRecord) -> bool {
        let meta = &record.metadata;
        match self {
            ScopeFilter::SeverityIn { values } => {
                meta.severity.is_some_and(|s| values.contains(&s))
            }
            ScopeFilter::ComponentIn { values } => meta
                .component
                .as_deref()
                .is_some_and(|c| values.iter().any(|v| v.eq_ignore_ascii_case(c))),
            ScopeFilter::StatusIn { values } => meta
                .status
                .as_deref()
                .is_some_and(|s| values.iter().any(|v| v.eq_ignore_ascii_case(s))),
            ScopeFilter::DateRange { from, to } => DateFilter {
                from: *from,
                to: *to,
            }
            .contains(meta.created_at),
        }
    }
}

/// Whether `record` satisfies every filter in the list.
pub fn matches_all(filters: &[ScopeFilter], record: &SourceRecord) -> bool {
    filters.iter().all(|f| f.matches(record))
}

/// The date window implied by the filter list (unbounded if none).
pub fn date_window(filters: &[ScopeFilter]) -> DateFilter {
    filters
        .iter()
        .find_map(|f| match f {
            ScopeFilter::DateRange { from, to } => Some(DateFilter {
                from: *from,
                to: *to,
            }),
            _ => None,
        })
        .unwrap_or_default()
}

/// Check a filter list for semantic problems that deserialization cannot see.
pub fn validate_filters(filters: &[ScopeFilter]) -> Result<(), ScopeError> {
    let mut seen_date_range = false;
    for f in filters {
        match f {
            ScopeFilter::SeverityIn { values } if values.is_empty() => {
                return Err(ScopeError::EmptyValues { kind: f.kind() })
            }
            ScopeFilter::ComponentIn { values } | ScopeFilter::StatusIn { values }
                if values.is_empty() =>
            {
                return Err(ScopeError::EmptyValues { kind: f.kind() })
            }
            ScopeFilter::DateRange { from, to } => {
                if seen_date_range {
                    return Err(ScopeError::DuplicateDateRange);
                }
                seen_date_range = true;
                if let (Some(from), Some(to)) = (from, to) {
                    if from > to {
                        return Err(ScopeError::InvertedDateRange {
                            from: *from,
                            to: *to,
                        });
                    }
                }
            }
            _ => {}
        }
    }
    Ok(())
}

/// Parse and validate a JSON array of filters in one step.
pub fn parse_filters(value: serde_json::Value) -> Result<Vec<ScopeFilter>, ScopeError> {
    let filters: Vec<ScopeFilter> =
        serde_json::from_value(value).map_err(|e| ScopeError::Malformed(e.to_string()))?;
    validate_filters(&filters)?;
    Ok(filters)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SourceType;
    use chrono::TimeZone;
    use serde_json::json;

    fn defect() -> SourceRecord {
        let ts = Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap();
        SourceRecord::new("D-1", SourceType::Defect, "crash on save", ts)
            .with_severity(Severity::High)
            .with_component("Editor")
            .with_status("Open")
    }

    #[test]
    fn test_parse_all_variants() {
        let filters = parse_filters(json!([
            {"kind": "severity_in", "values": ["critical", "High"]},
            {"kind": "component_in", "values": ["editor"]},
            {"kind": "status_in", "values": ["open"]},
            {"kind": "date_range", "from": "2024-01-01T00:00:00Z"}
        ]))
        .unwrap();
        assert_eq!(filters.len(), 4);
        assert!(matches_all(&filters, &defect()));
    }

    #[test]
    fn test_rejects_unknown_kind_and_fields() {
        assert!(matches!(
            parse_filters(json!([{"kind": "assignee_in", "values": ["x"]}])),
            Err(ScopeError::Malformed(_))
        ));
        assert!(matches!(
            parse_filters(json!([{"kind": "status_in", "values": ["x"], "extra": 1}])),
            Err(ScopeError::Malformed(_))
        ));
        assert!(matches!(
            parse_filters(json!({"severity": "High"})),
            Err(ScopeError::Malformed(_))
        ));
    }

    #[test]
    fn test_rejects_empty_values() {
        let err = parse_filters(json!([{"kind": "component_in", "values": []}])).unwrap_err();
        assert_eq!(
            err,
            ScopeError::EmptyValues {
                kind: "component_in"
            }
        );
    }

    #[test]
    fn test_rejects_inverted_and_duplicate_ranges() {
        let err = parse_filters(json!([{
            "kind": "date_range",
            "from": "2024-05-01T00:00:00Z",
            "to": "2024-01-01T00:00:00Z"
        }]))
        .unwrap_err();
        assert!(matches!(err, ScopeError::InvertedDateRange { .. }));

        let err = parse_filters(json!([
            {"kind": "date_range", "from": "2024-01-01T00:00:00Z"},
            {"kind": "date_range", "to": "2024-02-01T00:00:00Z"}
        ]))
        .unwrap_err();
        assert_eq!(err, ScopeError::DuplicateDateRange);
    }

    #[test]
    fn test_matches_is_case_insensitive() {
        let f = ScopeFilter::ComponentIn {
            values: vec!["EDITOR".to_string()],
        };
        assert!(f.matches(&defect()));
        let f = ScopeFilter::SeverityIn {
            values: vec![Severity::Low],
        };
        assert!(!f.matches(&defect()));
    }

    #[test]
    fn test_date_window() {
        assert!(date_window(&[]).is_unbounded());
        let from = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let w = date_window(&[
            ScopeFilter::StatusIn {
                values: vec!["open".into()],
            },
            ScopeFilter::DateRange {
                from: Some(from),
                to: None,
            },
        ]);
        assert_eq!(w.from, Some(from));
        assert_eq!(w.to, None);
    }
}

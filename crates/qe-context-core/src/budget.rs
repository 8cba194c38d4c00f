//! Greedy context-budget assembler.
//!
//! Packs ranked candidates into a bounded total length:
//!
//! 1. Walk candidates in ranked order.
//! 2. Truncate each one to its source type's `max_item_length` (suffix cut,
//!    optionally marked with `...`; the marker counts toward the limit).
//! 3. If the item would push the total past the budget, stop. Later items
//!    are never squeezed in, so provenance order is preserved.
//!
//! Lengths are counted in `char`s. How an item is *measured* is pluggable
//! through [`Measure`]: [`ContentLength`] counts the truncated content only,
//! while the formatter's rendered-length measure counts the full prompt
//! block, which is what bounds the final context text.

use std::collections::HashSet;

use serde::Serialize;

use crate::models::{SourceRecord, SourceType};

/// Marker appended to truncated content.
pub const TRUNCATION_MARKER: &str = "...";

/// One packed item, carrying its provenance.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextEntry {
    pub id: String,
    pub source_type: SourceType,
    pub display_title: String,
    pub truncated_content: String,
    #[serde(skip)]
    pub truncated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub similarity: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub representativeness: Option<f64>,
}

/// A ranked record plus its resolved display title, if any.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub record: SourceRecord,
    pub display_title: Option<String>,
}

impl From<SourceRecord> for Candidate {
    fn from(record: SourceRecord) -> Self {
        Self {
            record,
            display_title: None,
        }
    }
}

impl ContextEntry {
    /// Build an entry from a candidate, truncating its content.
    pub fn from_candidate(candidate: &Candidate, max_item_length: usize, mark: bool) -> Self {
        let record = &candidate.record;
        let (truncated_content, truncated) = truncate_chars(&record.content, max_item_length, mark);
        Self {
            id: record.id.clone(),
            source_type: record.source_type,
            display_title: candidate
                .display_title
                .clone()
                .unwrap_or_else(|| record.fallback_title()),
            truncated_content,
            truncated,
            similarity: record.similarity,
            representativeness: record.representativeness,
        }
    }
}

/// Truncate `text` to at most `max_chars` characters.
///
/// Returns the (possibly) shortened text and whether it was cut. With
/// `mark`, the cut text ends in [`TRUNCATION_MARKER`] and still fits within
/// `max_chars` (the marker is dropped when `max_chars` is too small to hold it).
pub fn truncate_chars(text: &str, max_chars: usize, mark: bool) -> (String, bool) {
    if text.chars().count() <= max_chars {
        return (text.to_string(), false);
    }
    let marker_len = TRUNCATION_MARKER.chars().count();
    if mark && max_chars > marker_len {
        let mut out: String = text.chars().take(max_chars - marker_len).collect();
        out.push_str(TRUNCATION_MARKER);
        (out, true)
    } else {
        (text.chars().take(max_chars).collect(), true)
    }
}

/// How much of the budget an entry consumes.
pub trait Measure {
    fn measure(&self, entry: &ContextEntry) -> usize;
}

/// Counts the truncated content only.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContentLength;

impl Measure for ContentLength {
    fn measure(&self, entry: &ContextEntry) -> usize {
        entry.truncated_content.chars().count()
    }
}

/// Outcome of one packing run.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetReport {
    pub entries: Vec<ContextEntry>,
    /// Candidates offered to the assembler.
    pub items_found: usize,
    /// Entries actually packed.
    pub items_used: usize,
    /// Sum of measured lengths of the packed entries.
    pub total_length: usize,
    pub truncated_items: usize,
    /// Duplicate ids skipped.
    pub duplicates_skipped: usize,
    /// Whether packing stopped because the next item did not fit.
    pub budget_exhausted: bool,
}

/// Greedy packer over a total length budget.
#[derive(Debug, Clone, Copy)]
pub struct Assembler {
    pub max_total_length: usize,
    pub mark_truncation: bool,
}

impl Assembler {
    pub fn new(max_total_length: usize) -> Self {
        Self {
            max_total_length,
            mark_truncation: true,
        }
    }

    pub fn with_mark_truncation(mut self, mark: bool) -> Self {
        self.mark_truncation = mark;
        self
    }

    /// Pack `candidates` in order.
    ///
    /// `max_item_length` gives the per-type truncation limit so mixed-type
    /// lists honour each type's setting.
    pub fn pack<M, F>(&self, candidates: &[Candidate], max_item_length: F, measure: &M) -> BudgetReport
    where
        M: Measure + ?Sized,
        F: Fn(SourceType) -> usize,
    {
        let mut report = BudgetReport {
            items_found: candidates.len(),
            ..Default::default()
        };
        let mut seen: HashSet<(SourceType, &str)> = HashSet::new();

        for candidate in candidates {
            if !seen.insert((candidate.record.source_type, candidate.record.id.as_str())) {
                report.duplicates_skipped += 1;
                continue;
            }
            let entry = ContextEntry::from_candidate(
                candidate,
                max_item_length(candidate.record.source_type),
                self.mark_truncation,
            );
            let cost = measure.measure(&entry);
            if report.total_length + cost > self.max_total_length {
                report.budget_exhausted = true;
                break;
            }
            report.total_length += cost;
            if entry.truncated {
                report.truncated_items += 1;
            }
            report.entries.push(entry);
        }

        report.items_used = report.entries.len();
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use proptest::prelude::*;

    fn candidate(id: &str, len: usize) -> Candidate {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        SourceRecord::new(id, SourceType::Requirement, "x".repeat(len), ts)
            .with_similarity(0.9)
            .into()
    }

    #[test]
    fn test_three_items_of_400_in_800_budget() {
        let items = vec![candidate("a", 400), candidate("b", 400), candidate("c", 400)];
        let report = Assembler::new(800).pack(&items, |_| 1000, &ContentLength);
        assert_eq!(report.items_found, 3);
        assert_eq!(report.items_used, 2);
        assert_eq!(report.total_length, 800);
        assert!(report.budget_exhausted);
        let ids: Vec<&str> = report.entries.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_stops_instead_of_skipping() {
        let items = vec![candidate("a", 500), candidate("b", 400), candidate("c", 100)];
        let report = Assembler::new(800).pack(&items, |_| 1000, &ContentLength);
        assert_eq!(report.items_used, 1);
    }

    #[test]
    fn test_zero_items_when_first_does_not_fit() {
        let items = vec![candidate("a", 300)];
        let report = Assembler::new(100).pack(&items, |_| 1000, &ContentLength);
        assert_eq!(report.items_used, 0);
        assert!(report.entries.is_empty());
    }

    #[test]
    fn test_truncates_to_item_length_with_marker() {
        let items = vec![candidate("a", 50)];
        let report = Assembler::new(100).pack(&items, |_| 20, &ContentLength);
        let e = &report.entries[0];
        assert_eq!(e.truncated_content.chars().count(), 20);
        assert!(e.truncated_content.ends_with(TRUNCATION_MARKER));
        assert_eq!(report.truncated_items, 1);
    }

    #[test]
    fn test_truncation_without_marker() {
        let items = vec![candidate("a", 50)];
        let report = Assembler::new(100)
            .with_mark_truncation(false)
            .pack(&items, |_| 20, &ContentLength);
        assert_eq!(report.entries[0].truncated_content, "x".repeat(20));
    }

    #[test]
    fn test_truncate_is_char_safe() {
        let (out, cut) = truncate_chars("héllo wörld ünïcode", 8, true);
        assert!(cut);
        assert_eq!(out.chars().count(), 8);
        assert_eq!(out, "héllo...");
        let (out, cut) = truncate_chars("äöü", 2, true);
        assert!(cut);
        assert_eq!(out, "äö");
    }

    #[test]
    fn test_duplicates_skipped() {
        let items = vec![candidate("a", 10), candidate("a", 10), candidate("b", 10)];
        let report = Assembler::new(100).pack(&items, |_| 100, &ContentLength);
        assert_eq!(report.items_used, 2);
        assert_eq!(report.duplicates_skipped, 1);
    }

    #[test]
    fn test_same_id_of_another_type_is_not_a_duplicate() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let defect: Candidate = SourceRecord::new("a", SourceType::Defect, "y".repeat(10), ts)
            .with_similarity(0.8)
            .into();
        let items = vec![candidate("a", 10), defect];
        let report = Assembler::new(100).pack(&items, |_| 100, &ContentLength);
        assert_eq!(report.items_used, 2);
        assert_eq!(report.duplicates_skipped, 0);
    }

    #[test]
    fn test_fallback_title_when_unresolved() {
        let items = vec![candidate("REQ-9", 10)];
        let report = Assembler::new(100).pack(&items, |_| 100, &ContentLength);
        assert_eq!(report.entries[0].display_title, "REQUIREMENT: REQ-9");
    }

    proptest! {
        #[test]
        fn prop_total_never_exceeds_budget(
            lens in prop::collection::vec(0usize..600, 0..20),
            budget in 0usize..3000,
            item_max in 1usize..700,
        ) {
            let items: Vec<Candidate> = lens
                .iter()
                .enumerate()
                .map(|(i, l)| candidate(&format!("r{i}"), *l))
                .collect();
            let report = Assembler::new(budget).pack(&items, |_| item_max, &ContentLength);
            let sum: usize = report
                .entries
                .iter()
                .map(|e| e.truncated_content.chars().count())
                .sum();
            prop_assert!(sum <= budget);
            prop_assert_eq!(sum, report.total_length);
            prop_assert!(report.entries.iter().all(|e| e.truncated_content.chars().count() <= item_max));
            let ids: Vec<String> = report.entries.iter().map(|e| e.id.clone()).collect();
            let expected: Vec<String> = (0..report.items_used).map(|i| format!("r{i}")).collect();
            prop_assert_eq!(ids, expected);
        }
    }
}

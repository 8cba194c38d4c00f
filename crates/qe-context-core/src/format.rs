//! Prompt context formatter.
//!
//! Renders packed entries as a source-attributed block for a language-model
//! prompt. Each entry becomes:
//!
//! ```text
//! [Source: <title> | Type: <TYPE> | Similarity: <0.00|sampled>]
//! <truncated content>
//! ---
//! ```
//!
//! Sampling-mode output starts with a preamble stating the corpus size,
//! strategy and representativeness score, and asks the model to extrapolate.
//! [`entry_len`] and [`preamble_len`] give exact rendered lengths (in chars)
//! so the budget assembler can bound the final text.

use std::fmt::Write as _;

use crate::budget::{ContextEntry, Measure};
use crate::sampler::SamplingStrategy;

/// Context text returned when neither search nor sampling found anything.
pub const NO_CONTEXT_NOTICE: &str = "[No stored context found]\n\
No requirements, defects, test cases or documents matched this request. \
Answer from the request alone and state that no supporting records were available.\n";

const SEPARATOR: &str = "---\n";

/// Sampling-mode header data.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingPreamble {
    pub total_in_scope: usize,
    pub strategy: SamplingStrategy,
    pub representativeness_score: f64,
}

fn score_label(entry: &ContextEntry) -> String {
    match entry.similarity {
        Some(s) => format!("{s:.2}"),
        None => "sampled".to_string(),
    }
}

/// Write one entry to `out`.
pub fn render_entry(entry: &ContextEntry, out: &mut String) {
    let _ = writeln!(
        out,
        "[Source: {} | Type: {} | Similarity: {}]",
        entry.display_title,
        entry.source_type.label(),
        score_label(entry)
    );
    out.push_str(&entry.truncated_content);
    out.push('\n');
    out.push_str(SEPARATOR);
}

/// Rendered length of one entry, in chars.
pub fn entry_len(entry: &ContextEntry) -> usize {
    let mut s = String::new();
    render_entry(entry, &mut s);
    s.chars().count()
}

/// Render the sampling preamble.
pub fn render_preamble(p: &SamplingPreamble) -> String {
    format!(
        "[Sampled context | Total in scope: {total} | Strategy: {strategy} | Representativeness: {score:.2}]\n\
         The items below were selected from {total} records. Treat findings as \
         representative of the full corpus and extrapolate them to all {total} records.\n{sep}",
        total = p.total_in_scope,
        strategy = p.strategy.as_str(),
        score = p.representativeness_score,
        sep = SEPARATOR,
    )
}

pub fn preamble_len(p: &SamplingPreamble) -> usize {
    render_preamble(p).chars().count()
}

/// Concatenate `entries` in order, after the preamble when given.
pub fn render(entries: &[ContextEntry], preamble: Option<&SamplingPreamble>) -> String {
    let mut out = preamble.map(render_preamble).unwrap_or_default();
    for entry in entries {
        render_entry(entry, &mut out);
    }
    out
}

/// Measures an entry by its full rendered block.
#[derive(Debug, Clone, Copy, Default)]
pub struct RenderedLength;

impl Measure for RenderedLength {
    fn measure(&self, entry: &ContextEntry) -> usize {
        entry_len(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SourceType;

    fn entry(similarity: Option<f64>) -> ContextEntry {
        ContextEntry {
            id: "D-12".into(),
            source_type: SourceType::Defect,
            display_title: "Login times out".into(),
            truncated_content: "Steps: open login, wait 30s".into(),
            truncated: false,
            similarity,
            representativeness: similarity.is_none().then_some(0.8),
        }
    }

    #[test]
    fn test_entry_layout() {
        let text = render(&[entry(Some(0.876))], None);
        assert_eq!(
            text,
            "[Source: Login times out | Type: DEFECT | Similarity: 0.88]\n\
             Steps: open login, wait 30s\n---\n"
        );
    }

    #[test]
    fn test_sampled_label_and_preamble() {
        let p = SamplingPreamble {
            total_in_scope: 1000,
            strategy: SamplingStrategy::Stratified,
            representativeness_score: 0.7125,
        };
        let text = render(&[entry(None)], Some(&p));
        assert!(text.starts_with("[Sampled context | Total in scope: 1000 | Strategy: stratified | Representativeness: 0.71]"));
        assert!(text.contains("extrapolate"));
        assert!(text.contains("| Similarity: sampled]"));
    }

    #[test]
    fn test_lengths_match_rendering() {
        let e = entry(Some(0.5));
        let p = SamplingPreamble {
            total_in_scope: 7,
            strategy: SamplingStrategy::Complete,
            representativeness_score: 1.0,
        };
        let text = render(&[e.clone(), e.clone()], Some(&p));
        assert_eq!(text.chars().count(), preamble_len(&p) + 2 * entry_len(&e));
        assert_eq!(RenderedLength.measure(&e), entry_len(&e));
    }

    #[test]
    fn test_empty_render() {
        assert_eq!(render(&[], None), "");
    }
}

//! Keyword-overlap relevance filter.
//!
//! Embedding similarity produces generic false positives ("the system shall
//! ..." matches everything). This second pass keeps an item only when it
//! shares enough concrete vocabulary with the scope:
//!
//! 1. `keyword_hits`: boosted keywords present in both the item and the scope.
//! 2. `scope_word_hits`: distinct scope words longer than three characters
//!    present in the item.
//!
//! The item is kept when either count reaches its configured minimum.
//! Matching is case-insensitive substring matching. A scope with no
//! qualifying terms at all gives the filter nothing to judge by, so every
//! item is kept.

use std::collections::BTreeSet;

use serde::Serialize;

/// Built-in boosted keywords for quality-engineering scopes.
pub const DEFAULT_BOOSTED_KEYWORDS: &[&str] = &[
    "login",
    "logout",
    "authentication",
    "authorization",
    "password",
    "session",
    "payment",
    "checkout",
    "cart",
    "order",
    "invoice",
    "refund",
    "search",
    "upload",
    "download",
    "export",
    "import",
    "report",
    "dashboard",
    "notification",
    "email",
    "api",
    "database",
    "timeout",
    "crash",
    "performance",
    "latency",
    "security",
    "encryption",
    "accessibility",
    "mobile",
    "regression",
];

/// Relevance filter settings.
#[derive(Debug, Clone, PartialEq)]
pub struct RelevanceFilter {
    keywords: Vec<String>,
    pub min_keyword_matches: usize,
    pub min_scope_word_matches: usize,
}

/// Per-item scoring, reported for observability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RelevanceScore {
    pub keyword_hits: usize,
    pub scope_word_hits: usize,
}

/// Terms extracted once from the scope text and reused for every item.
#[derive(Debug, Clone, Default)]
pub struct ScopeTerms {
    keywords: Vec<String>,
    words: Vec<String>,
}

impl ScopeTerms {
    /// Whether the scope carries any term the filter could match on.
    pub fn is_empty(&self) -> bool {
        self.keywords.is_empty() && self.words.is_empty()
    }
}

impl Default for RelevanceFilter {
    fn default() -> Self {
        Self::new(DEFAULT_BOOSTED_KEYWORDS.iter().copied(), 1, 2)
    }
}

impl RelevanceFilter {
    pub fn new<I, S>(keywords: I, min_keyword_matches: usize, min_scope_word_matches: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let keywords: BTreeSet<String> = keywords
            .into_iter()
            .map(|k| k.as_ref().trim().to_lowercase())
            .filter(|k| !k.is_empty())
            .collect();
        Self {
            keywords: keywords.into_iter().collect(),
            min_keyword_matches: min_keyword_matches.max(1),
            min_scope_word_matches: min_scope_word_matches.max(1),
        }
    }

    /// Same thresholds, different keyword set.
    pub fn with_keywords<I, S>(&self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::new(keywords, self.min_keyword_matches, self.min_scope_word_matches)
    }

    pub fn keywords(&self) -> &[String] {
        &self.keywords
    }

    /// Extract the boosted keywords and long words present in `scope`.
    pub fn scope_terms(&self, scope: &str) -> ScopeTerms {
        let scope_lower = scope.to_lowercase();
        let keywords = self
            .keywords
            .iter()
            .filter(|k| scope_lower.contains(k.as_str()))
            .cloned()
            .collect();
        let words: BTreeSet<String> = scope_lower
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| w.chars().count() > 3)
            .map(str::to_string)
            .collect();
        ScopeTerms {
            keywords,
            words: words.into_iter().collect(),
        }
    }

    /// Score `item` against pre-extracted scope terms.
    pub fn score(&self, item: &str, terms: &ScopeTerms) -> RelevanceScore {
        let item_lower = item.to_lowercase();
        RelevanceScore {
            keyword_hits: terms
                .keywords
                .iter()
                .filter(|k| item_lower.contains(k.as_str()))
                .count(),
            scope_word_hits: terms
                .words
                .iter()
                .filter(|w| item_lower.contains(w.as_str()))
                .count(),
        }
    }

    /// Keep/discard decision for one item.
    pub fn keep(&self, item: &str, terms: &ScopeTerms) -> bool {
        if terms.is_empty() {
            return true;
        }
        let s = self.score(item, terms);
        s.keyword_hits >= self.min_keyword_matches
            || s.scope_word_hits >= self.min_scope_word_matches
    }

    /// Convenience one-shot form of [`keep`](Self::keep).
    pub fn is_relevant(&self, item: &str, scope: &str) -> bool {
        self.keep(item, &self.scope_terms(scope))
    }

    /// Retain the items of `items` that pass, preserving order.
    pub fn retain<T>(&self, items: Vec<T>, scope: &str, text: impl Fn(&T) -> &str) -> Vec<T> {
        let terms = self.scope_terms(scope);
        items
            .into_iter()
            .filter(|item| self.keep(text(item), &terms))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn filter() -> RelevanceFilter {
        RelevanceFilter::new(["checkout", "payment", "login"], 1, 2)
    }

    #[test]
    fn test_keyword_in_both_keeps() {
        let f = filter();
        assert!(f.is_relevant(
            "Checkout page shows stale totals",
            "analyze checkout defects"
        ));
    }

    #[test]
    fn test_keyword_only_in_item_does_not_count() {
        let f = filter();
        let terms = f.scope_terms("slow report generation");
        let s = f.score("checkout slow", &terms);
        assert_eq!(s.keyword_hits, 0);
        assert!(!f.keep("checkout slow", &terms));
    }

    #[test]
    fn test_scope_words_threshold() {
        let f = filter();
        let scope = "report generation exceeds thirty seconds";
        assert!(f.is_relevant("Report generation hangs for large exports", scope));
        assert!(!f.is_relevant("Report title misspelled", scope));
    }

    #[test]
    fn test_short_scope_words_ignored() {
        let f = filter();
        let terms = f.scope_terms("the api is not ok");
        assert!(terms.is_empty());
        assert!(f.keep("anything at all", &terms));
    }

    #[test]
    fn test_case_insensitive() {
        let f = filter();
        assert!(f.is_relevant("LOGIN button disabled", "Login flow"));
    }

    #[test]
    fn test_retain_preserves_order() {
        let f = filter();
        let items = vec!["payment declined twice", "avatar upload", "payment retry"];
        let kept = f.retain(items, "payment failures", |s| *s);
        assert_eq!(kept, vec!["payment declined twice", "payment retry"]);
    }

    #[test]
    fn test_minimums_never_zero() {
        let f = RelevanceFilter::new(Vec::<String>::new(), 0, 0);
        assert_eq!(f.min_keyword_matches, 1);
        assert_eq!(f.min_scope_word_matches, 1);
    }

    proptest! {
        #[test]
        fn prop_decision_is_deterministic(item in ".{0,80}", scope in ".{0,80}") {
            let f = RelevanceFilter::default();
            prop_assert_eq!(f.is_relevant(&item, &scope), f.is_relevant(&item, &scope));
        }
    }
}

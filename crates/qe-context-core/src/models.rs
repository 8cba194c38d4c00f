//! Core data models used throughout the context engine.
//!
//! These types represent the records that flow through retrieval, sampling,
//! budgeting, and formatting. They are transient: the engine constructs them
//! per call from its collaborators and never persists them.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Kind of stored knowledge a record represents.
///
/// Adding a source type is a closed change: every `match` over this enum
/// (defaults, prompt labels, ordering) fails to compile until it is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Requirement,
    Defect,
    TestCase,
    Document,
    DocumentSection,
}

impl SourceType {
    /// All source types in declaration order. Merge tie-breaks follow this order.
    pub const ALL: [SourceType; 5] = [
        SourceType::Requirement,
        SourceType::Defect,
        SourceType::TestCase,
        SourceType::Document,
        SourceType::DocumentSection,
    ];

    /// Wire name (`test_case`).
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Requirement => "requirement",
            SourceType::Defect => "defect",
            SourceType::TestCase => "test_case",
            SourceType::Document => "document",
            SourceType::DocumentSection => "document_section",
        }
    }

    /// Prompt label (`TEST_CASE`).
    pub fn label(&self) -> &'static str {
        match self {
            SourceType::Requirement => "REQUIREMENT",
            SourceType::Defect => "DEFECT",
            SourceType::TestCase => "TEST_CASE",
            SourceType::Document => "DOCUMENT",
            SourceType::DocumentSection => "DOCUMENT_SECTION",
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        SourceType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == normalized)
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "Unknown source type: '{}'. Use requirement, defect, test_case, document, or document_section.",
                    s
                )
            })
    }
}

/// Severity band used by the stratified sampler.
///
/// Deserializes leniently (see [`Severity::parse`]) but rejects values that
/// name no band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

impl Severity {
    /// All bands, most severe first.
    pub const ALL: [Severity; 4] = [
        Severity::Critical,
        Severity::High,
        Severity::Medium,
        Severity::Low,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "Critical",
            Severity::High => "High",
            Severity::Medium => "Medium",
            Severity::Low => "Low",
        }
    }

    /// Lenient parse used at import boundaries.
    ///
    /// Accepts the band names case-insensitively plus the usual issue-tracker
    /// aliases (`blocker`, `major`, `minor`, `trivial`). Returns `None` for
    /// anything else rather than failing the record.
    pub fn parse(s: &str) -> Option<Severity> {
        match s.trim().to_ascii_lowercase().as_str() {
            "critical" | "blocker" => Some(Severity::Critical),
            "high" | "major" => Some(Severity::High),
            "medium" | "normal" => Some(Severity::Medium),
            "low" | "minor" | "trivial" => Some(Severity::Low),
            _ => None,
        }
    }
}

impl<'de> Deserialize<'de> for Severity {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Severity::parse(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown severity: '{}'", raw)))
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Record metadata used for filtering and stratification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One retrievable unit of stored knowledge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceRecord {
    pub id: String,
    pub source_type: SourceType,
    pub content: String,
    pub metadata: RecordMetadata,
    /// Similarity to the query, set by the vector index.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub similarity: Option<f64>,
    /// Sample representativeness, set by the stratified sampler.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub representativeness: Option<f64>,
}

impl SourceRecord {
    /// Create a record with no severity, component, or status.
    pub fn new(
        id: impl Into<String>,
        source_type: SourceType,
        content: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            source_type,
            content: content.into(),
            metadata: RecordMetadata {
                severity: None,
                component: None,
                status: None,
                created_at,
                updated_at: created_at,
            },
            similarity: None,
            representativeness: None,
        }
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.metadata.severity = Some(severity);
        self
    }

    pub fn with_component(mut self, component: impl Into<String>) -> Self {
        self.metadata.component = Some(component.into());
        self
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.metadata.status = Some(status.into());
        self
    }

    pub fn with_similarity(mut self, similarity: f64) -> Self {
        self.similarity = Some(similarity);
        self
    }

    /// Title used when the display-title lookup fails: `"<TYPE>: <id>"`.
    pub fn fallback_title(&self) -> String {
        format!("{}: {}", self.source_type.label(), self.id)
    }

    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.source_type, self.id.clone())
    }
}

/// Store identity of a record. Ids are only unique within a source type, so
/// a requirement `"1"` and a defect `"1"` are different records.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordKey {
    pub source_type: SourceType,
    pub id: String,
}

impl RecordKey {
    pub fn new(source_type: SourceType, id: impl Into<String>) -> Self {
        Self {
            source_type,
            id: id.into(),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source_type, self.id)
    }
}

/// Optional creation-date window applied to searches and samples.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DateFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<DateTime<Utc>>,
}

impl DateFilter {
    /// Whether `ts` falls inside the (inclusive) window.
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.from.map_or(true, |from| ts >= from) && self.to.map_or(true, |to| ts <= to)
    }

    /// Span of the window, or `None` when either side is open.
    pub fn span(&self) -> Option<Duration> {
        match (self.from, self.to) {
            (Some(from), Some(to)) => Some(to - from),
            _ => None,
        }
    }

    pub fn is_unbounded(&self) -> bool {
        self.from.is_none() && self.to.is_none()
    }
}

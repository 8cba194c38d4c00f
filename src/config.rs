//! Configuration parsing and shared, reloadable config state.
//!
//! The TOML file is parsed once into an immutable [`Config`]. Structural
//! problems (unparseable TOML, unknown provider names, missing model for a
//! network provider) fail [`load_config`]. Value-level problems (a negative
//! limit, a threshold outside `[0, 1]`) are *not* fatal: [`Config::resolve`]
//! replaces each bad value with its documented default and reports a warning.
//!
//! [`SharedConfig`] holds the process-wide `Arc<Config>` and swaps it on an
//! explicit [`SharedConfig::reload`]. Hot paths clone the `Arc`; they never
//! touch the filesystem.
//!
//! # Example
//!
//! ```toml
//! [db]
//! path = "./data/qectx.sqlite"
//!
//! [retrieval]
//! max_total_context_length = 12000
//! deadline_ms = 8000
//!
//! [retrieval.types.defect]
//! max_results = 8
//! similarity_threshold = 0.6
//!
//! [sampling]
//! max_sample_size = 100
//!
//! [sampling.bands.critical]
//! fraction = 0.10
//! min = 5
//! max = 20
//!
//! [embedding]
//! provider = "hashing"
//!
//! [generation]
//! provider = "openai"
//! model = "gpt-4o-mini"
//! max_concurrency = 1
//!
//! [server]
//! bind = "127.0.0.1:7431"
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use qe_context_core::models::{Severity, SourceType};
use qe_context_core::params::{
    positive_or_default, unit_or_default, BandQuota, RetrievalOverrides, RetrievalParams,
    SamplingParams, TypeLimitsOverride,
};
use qe_context_core::relevance::{RelevanceFilter, DEFAULT_BOOSTED_KEYWORDS};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub relevance: RelevanceConfig,
    #[serde(default)]
    pub sampling: SamplingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./data/qectx.sqlite")
}

/// Raw retrieval knobs. Validated by [`Config::resolve`].
#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default)]
    pub max_total_context_length: Option<i64>,
    #[serde(default = "default_deadline_ms")]
    pub deadline_ms: i64,
    #[serde(default = "default_true")]
    pub mark_truncation: bool,
    #[serde(default)]
    pub types: BTreeMap<SourceType, TypeLimitsOverride>,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            max_total_context_length: None,
            deadline_ms: default_deadline_ms(),
            mark_truncation: true,
            types: BTreeMap::new(),
        }
    }
}

pub const DEFAULT_DEADLINE_MS: u64 = 8000;

fn default_deadline_ms() -> i64 {
    DEFAULT_DEADLINE_MS as i64
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct RelevanceConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_min_keyword_matches")]
    pub min_keyword_matches: i64,
    #[serde(default = "default_min_scope_word_matches")]
    pub min_scope_word_matches: i64,
    /// Replaces the built-in keyword list when set.
    #[serde(default)]
    pub boosted_keywords: Option<Vec<String>>,
}

impl Default for RelevanceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_keyword_matches: default_min_keyword_matches(),
            min_scope_word_matches: default_min_scope_word_matches(),
            boosted_keywords: None,
        }
    }
}

fn default_min_keyword_matches() -> i64 {
    1
}
fn default_min_scope_word_matches() -> i64 {
    2
}

/// Raw sampling knobs; every field falls back to [`SamplingParams::default`].
#[derive(Debug, Deserialize, Clone, Default)]
pub struct SamplingConfig {
    #[serde(default)]
    pub max_sample_size: Option<i64>,
    #[serde(default)]
    pub wide_range_max_sample_size: Option<i64>,
    #[serde(default)]
    pub wide_range_days: Option<i64>,
    #[serde(default)]
    pub recent_quota: Option<i64>,
    #[serde(default)]
    pub wide_range_recent_quota: Option<i64>,
    #[serde(default)]
    pub oldest_quota: Option<i64>,
    #[serde(default)]
    pub component_cap: Option<i64>,
    #[serde(default)]
    pub max_components: Option<i64>,
    #[serde(default)]
    pub bands: BTreeMap<Severity, BandConfig>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct BandConfig {
    #[serde(default)]
    pub fraction: Option<f64>,
    #[serde(default)]
    pub min: Option<i64>,
    #[serde(default)]
    pub max: Option<i64>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL of an OpenAI-compatible API.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_embedding_provider() -> String {
    "hashing".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_generation_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    /// In-flight generation requests allowed at once.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_generation_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub system_prompt: Option<String>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_generation_provider(),
            model: None,
            url: None,
            max_concurrency: default_max_concurrency(),
            max_retries: default_max_retries(),
            timeout_secs: default_generation_timeout_secs(),
            temperature: None,
            system_prompt: None,
        }
    }
}

fn default_generation_provider() -> String {
    "disabled".to_string()
}
fn default_max_concurrency() -> usize {
    1
}
fn default_generation_timeout_secs() -> u64 {
    120
}

impl GenerationConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7431".to_string()
}

/// Validated engine settings derived from a [`Config`].
#[derive(Debug, Clone)]
pub struct ResolvedSettings {
    pub retrieval: RetrievalParams,
    pub sampling: SamplingParams,
    /// `None` when relevance filtering is disabled.
    pub relevance: Option<RelevanceFilter>,
    pub deadline: Duration,
    /// One entry per value that was replaced by its default.
    pub warnings: Vec<String>,
}

impl Config {
    /// Turn raw values into validated parameters, collecting a warning for
    /// every value that had to fall back.
    pub fn resolve(&self) -> ResolvedSettings {
        let mut warnings = Vec::new();

        let mut base = RetrievalParams::default();
        base.mark_truncation = self.retrieval.mark_truncation;
        let (retrieval, w) = base.with_overrides(&RetrievalOverrides {
            types: self.retrieval.types.clone(),
            max_total_context_length: self.retrieval.max_total_context_length,
        });
        warnings.extend(w);

        let deadline_ms = positive_or_default(
            Some(self.retrieval.deadline_ms),
            DEFAULT_DEADLINE_MS as usize,
            "retrieval.deadline_ms",
            &mut warnings,
        );

        let sampling = self.sampling_params(&mut warnings);

        let relevance = self.relevance.enabled.then(|| {
            let min_kw = positive_or_default(
                Some(self.relevance.min_keyword_matches),
                default_min_keyword_matches() as usize,
                "relevance.min_keyword_matches",
                &mut warnings,
            );
            let min_words = positive_or_default(
                Some(self.relevance.min_scope_word_matches),
                default_min_scope_word_matches() as usize,
                "relevance.min_scope_word_matches",
                &mut warnings,
            );
            match &self.relevance.boosted_keywords {
                Some(keywords) => RelevanceFilter::new(keywords, min_kw, min_words),
                None => RelevanceFilter::new(
                    DEFAULT_BOOSTED_KEYWORDS.iter().copied(),
                    min_kw,
                    min_words,
                ),
            }
        });

        for w in &warnings {
            tracing::warn!("config: {w}");
        }

        ResolvedSettings {
            retrieval,
            sampling,
            relevance,
            deadline: Duration::from_millis(deadline_ms as u64),
            warnings,
        }
    }

    fn sampling_params(&self, warnings: &mut Vec<String>) -> SamplingParams {
        let raw = &self.sampling;
        let d = SamplingParams::default();
        let mut field = |value: Option<i64>, default: usize, name: &str| {
            positive_or_default(value, default, &format!("sampling.{name}"), warnings)
        };
        let mut params = SamplingParams {
            max_sample_size: field(raw.max_sample_size, d.max_sample_size, "max_sample_size"),
            wide_range_max_sample_size: field(
                raw.wide_range_max_sample_size,
                d.wide_range_max_sample_size,
                "wide_range_max_sample_size",
            ),
            wide_range_days: field(
                raw.wide_range_days,
                d.wide_range_days as usize,
                "wide_range_days",
            ) as i64,
            recent_quota: field(raw.recent_quota, d.recent_quota, "recent_quota"),
            wide_range_recent_quota: field(
                raw.wide_range_recent_quota,
                d.wide_range_recent_quota,
                "wide_range_recent_quota",
            ),
            oldest_quota: field(raw.oldest_quota, d.oldest_quota, "oldest_quota"),
            component_cap: field(raw.component_cap, d.component_cap, "component_cap"),
            max_components: field(raw.max_components, d.max_components, "max_components"),
            bands: d.bands.clone(),
        };

        for (severity, band) in &raw.bands {
            let fallback = BandQuota::default_for(*severity);
            let prefix = format!("sampling.bands.{severity}");
            let quota = BandQuota {
                fraction: unit_or_default(
                    band.fraction,
                    fallback.fraction,
                    &format!("{prefix}.fraction"),
                    warnings,
                ),
                min: non_negative_or_default(band.min, fallback.min, &format!("{prefix}.min"), warnings),
                max: positive_or_default(band.max, fallback.max, &format!("{prefix}.max"), warnings),
            };
            params.bands.insert(*severity, quota);
        }

        let (params, w) = params.sanitized();
        warnings.extend(w);
        params
    }
}

fn non_negative_or_default(
    raw: Option<i64>,
    default: usize,
    field: &str,
    warnings: &mut Vec<String>,
) -> usize {
    match raw {
        None => default,
        Some(v) if v >= 0 => v as usize,
        Some(v) => {
            warnings.push(format!(
                "{field} = {v} is invalid (must be >= 0); using default {default}"
            ));
            default
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and structurally validate TOML config text.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    match config.embedding.provider.as_str() {
        "disabled" | "hashing" => {}
        "openai" => {
            if config.embedding.model.is_none() {
                bail!("embedding.model must be specified when provider is 'openai'");
            }
            if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
                bail!("embedding.dims must be > 0 when provider is 'openai'");
            }
        }
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, hashing, or openai.",
            other
        ),
    }

    match config.generation.provider.as_str() {
        "disabled" => {}
        "openai" => {
            if config.generation.model.is_none() {
                bail!("generation.model must be specified when provider is 'openai'");
            }
        }
        other => bail!(
            "Unknown generation provider: '{}'. Must be disabled or openai.",
            other
        ),
    }

    if config.embedding.batch_size == 0 {
        bail!("embedding.batch_size must be > 0");
    }

    Ok(config)
}

/// Process-wide configuration with explicit reload.
pub struct SharedConfig {
    path: Option<PathBuf>,
    current: RwLock<Arc<Config>>,
}

impl SharedConfig {
    /// Load from `path`; later [`reload`](Self::reload)s re-read the same file.
    pub fn load(path: &Path) -> Result<Self> {
        let config = load_config(path)?;
        Ok(Self {
            path: Some(path.to_path_buf()),
            current: RwLock::new(Arc::new(config)),
        })
    }

    /// Wrap an in-memory config. Reloading is a no-op.
    pub fn fixed(config: Config) -> Self {
        Self {
            path: None,
            current: RwLock::new(Arc::new(config)),
        }
    }

    pub fn current(&self) -> Arc<Config> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Re-read the backing file and swap it in. On error the previous config
    /// stays active.
    pub fn reload(&self) -> Result<Arc<Config>> {
        let Some(path) = &self.path else {
            return Ok(self.current());
        };
        let fresh = Arc::new(load_config(path)?);
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = fresh.clone();
        tracing::info!(path = %path.display(), "configuration reloaded");
        Ok(fresh)
    }
}

//! CLI front-ends for retrieval, sampling and analysis.
//!
//! Each command opens the SQLite store named in the config, builds a
//! [`ContextEngine`] over it, and prints either the formatted context text
//! or (with `--json`) the full response.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::SqlitePool;

use qe_context_core::filter::ScopeFilter;
use qe_context_core::models::{DateFilter, Severity, SourceType};

use crate::config::{load_config, Config};
use crate::db;
use crate::embedding::create_embedder;
use crate::engine::{
    ContextEngine, ContextRequest, ContextResponse, RequestOverrides, DEFAULT_SOURCE_TYPES,
};
use crate::generate::{build_prompt, GenerationPool};
use crate::migrate;
use crate::sqlite_store::SqliteStore;

/// Options shared by `context` and `sample`.
#[derive(Debug, Clone, Default)]
pub struct OutputOptions {
    pub types: Option<String>,
    pub since: Option<String>,
    pub until: Option<String>,
    pub max_chars: Option<i64>,
    pub json: bool,
}

/// Parse a comma-separated list of source types; `None` means the defaults.
pub fn parse_types(raw: Option<&str>) -> Result<Vec<SourceType>> {
    match raw {
        None => Ok(DEFAULT_SOURCE_TYPES.to_vec()),
        Some(s) => s
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(SourceType::from_str)
            .collect(),
    }
}

/// `--since` / `--until` as an inclusive window over whole days.
pub fn parse_window(since: Option<&str>, until: Option<&str>) -> Result<DateFilter> {
    let day = |s: &str| -> Result<NaiveDate> {
        NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .with_context(|| format!("Invalid date '{}', expected YYYY-MM-DD", s))
    };
    let from = since
        .map(day)
        .transpose()?
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| DateTime::<Utc>::from_naive_utc_and_offset(dt, Utc));
    let to = until
        .map(day)
        .transpose()?
        .and_then(|d| d.and_hms_milli_opt(23, 59, 59, 999))
        .map(|dt| DateTime::<Utc>::from_naive_utc_and_offset(dt, Utc));
    Ok(DateFilter { from, to })
}

async fn open_engine(config: &Config) -> Result<(ContextEngine, SqlitePool)> {
    let pool = db::connect(config).await?;
    migrate::migrate_pool(&pool).await?;
    let store = SqliteStore::new(pool.clone(), create_embedder(&config.embedding)?);
    Ok((
        ContextEngine::from_store(Arc::new(store), config.resolve()),
        pool,
    ))
}

fn overrides(opts: &OutputOptions) -> RequestOverrides {
    RequestOverrides {
        max_total_context_length: opts.max_chars,
        ..Default::default()
    }
}

fn print_response(response: &ContextResponse, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(response)?);
        return Ok(());
    }
    print!("{}", response.context_text);
    let meta = &response.meta;
    println!(
        "\n-- status: {:?} | strategy: {:?} | items: {}/{} | in scope: {}{}",
        meta.status,
        meta.strategy,
        meta.items_used,
        meta.items_found,
        meta.total_in_scope,
        if meta.partial { " | partial" } else { "" }
    );
    if let Some(score) = meta.representativeness_score {
        println!("-- representativeness: {:.2}", score);
    }
    for w in &meta.warnings {
        println!("warning: {}", w);
    }
    Ok(())
}

/// `qectx context "<query>"`.
pub async fn run_context(config: &Config, query: &str, opts: &OutputOptions) -> Result<()> {
    if query.trim().is_empty() {
        bail!("query must not be empty");
    }
    let mut request = ContextRequest::query(query)
        .with_source_types(parse_types(opts.types.as_deref())?)
        .with_overrides(overrides(opts));
    let window = parse_window(opts.since.as_deref(), opts.until.as_deref())?;
    if !window.is_unbounded() {
        request = request.with_date_filter(window);
    }

    let (engine, pool) = open_engine(config).await?;
    let response = engine.retrieve(&request).await?;
    print_response(&response, opts.json)?;
    pool.close().await;
    Ok(())
}

/// Filter flags for `qectx sample`.
#[derive(Debug, Clone, Default)]
pub struct SampleFilters {
    pub severity: Vec<String>,
    pub component: Vec<String>,
    pub status: Vec<String>,
}

/// Turn CLI flags into typed filters.
pub fn build_filters(flags: &SampleFilters, window: DateFilter) -> Result<Vec<ScopeFilter>> {
    let mut filters = Vec::new();
    if !flags.severity.is_empty() {
        let values = flags
            .severity
            .iter()
            .map(|s| Severity::parse(s).ok_or_else(|| anyhow!("Unknown severity: '{}'", s)))
            .collect::<Result<Vec<_>>>()?;
        filters.push(ScopeFilter::SeverityIn { values });
    }
    if !flags.component.is_empty() {
        filters.push(ScopeFilter::ComponentIn {
            values: flags.component.clone(),
        });
    }
    if !flags.status.is_empty() {
        filters.push(ScopeFilter::StatusIn {
            values: flags.status.clone(),
        });
    }
    if !window.is_unbounded() {
        filters.push(ScopeFilter::DateRange {
            from: window.from,
            to: window.to,
        });
    }
    Ok(filters)
}

/// `qectx sample`.
pub async fn run_sample(config: &Config, flags: &SampleFilters, opts: &OutputOptions) -> Result<()> {
    let window = parse_window(opts.since.as_deref(), opts.until.as_deref())?;
    let request = ContextRequest::filters(build_filters(flags, window)?)
        .with_source_types(parse_types(opts.types.as_deref())?)
        .with_overrides(overrides(opts));

    let (engine, pool) = open_engine(config).await?;
    let response = engine.retrieve(&request).await?;
    print_response(&response, opts.json)?;
    pool.close().await;
    Ok(())
}

/// `qectx analyze "<query>" --task "..." [--task "..."]`.
///
/// Context is retrieved once; every task goes through the generation pool
/// and results print in the order the tasks were given.
pub async fn run_analyze(
    config: &Config,
    query: &str,
    tasks: &[String],
    opts: &OutputOptions,
) -> Result<()> {
    if tasks.is_empty() {
        bail!("at least one --task is required");
    }
    let pool = GenerationPool::from_config(&config.generation)?.ok_or_else(|| {
        anyhow!("Text generation is disabled. Set [generation] provider in config.")
    })?;

    let request = ContextRequest::query(query)
        .with_source_types(parse_types(opts.types.as_deref())?)
        .with_overrides(overrides(opts));
    let (engine, db_pool) = open_engine(config).await?;
    let context = engine.retrieve(&request).await?;
    db_pool.close().await;

    let system = config.generation.system_prompt.as_deref();
    let prompts = tasks
        .iter()
        .map(|task| build_prompt(system, task, &context))
        .collect();
    let outputs = pool.run_batch(prompts).await;

    for (i, (task, output)) in tasks.iter().zip(outputs).enumerate() {
        println!("## Task {}: {}", i + 1, task);
        match output {
            Ok(text) => println!("{}\n", text),
            Err(e) => println!("error: {:#}\n", e),
        }
    }
    for w in &context.meta.warnings {
        println!("warning: {}", w);
    }
    Ok(())
}

/// `qectx check-config`: parse, resolve and report.
pub fn run_check_config(path: &Path) -> Result<()> {
    let config = load_config(path)?;
    let settings = config.resolve();

    println!("Config: {}", path.display());
    println!("  db.path: {}", config.db.path.display());
    println!("  embedding.provider: {}", config.embedding.provider);
    println!("  generation.provider: {}", config.generation.provider);
    println!(
        "  retrieval.max_total_context_length: {}",
        settings.retrieval.max_total_context_length
    );
    println!("  retrieval.deadline_ms: {}", settings.deadline.as_millis());
    println!("  sampling.max_sample_size: {}", settings.sampling.max_sample_size);
    println!(
        "  relevance: {}",
        if settings.relevance.is_some() { "enabled" } else { "disabled" }
    );

    if settings.warnings.is_empty() {
        println!("OK: no warnings");
    } else {
        for w in &settings.warnings {
            println!("warning: {}", w);
        }
    }
    Ok(())
}

//! # QE Context Core
//!
//! Runtime-agnostic logic for the QE Context Engine: the record model, typed
//! scope filters, retrieval and sampling parameters, collaborator traits, and
//! the pure algorithms that decide what reaches a language-model prompt.
//!
//! This crate contains no tokio, sqlx, HTTP or filesystem I/O. Storage and
//! network backends implement the traits in [`store`] and [`embedding`]
//! from the application crate.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`models`] | `SourceRecord`, `SourceType`, `Severity`, `DateFilter` |
//! | [`filter`] | tagged-union `ScopeFilter` and boundary validation |
//! | [`params`] | retrieval/sampling knobs with default fallback |
//! | [`store`] | `VectorIndex`, `RecordStore`, `TitleResolver` + in-memory backend |
//! | [`relevance`] | keyword-overlap relevance filter |
//! | [`budget`] | greedy context-budget assembler |
//! | [`sampler`] | stratified sampler and representativeness score |
//! | [`format`] | source-attributed prompt block rendering |

pub mod budget;
pub mod embedding;
pub mod filter;
pub mod format;
pub mod models;
pub mod params;
pub mod relevance;
pub mod sampler;
pub mod store;

//! # QE Context
//!
//! Retrieval and context assembly for AI-assisted quality engineering. For
//! every language-model call it decides which stored requirements, defects,
//! test cases and documents are worth sending, and packs them into a bounded
//! character budget with their provenance attached.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌───────────┐   ┌──────────┐   ┌───────────┐
//! │ fan-out      │──▶│ relevance │──▶│  budget  │──▶│ formatter │──▶ contextText
//! │ search       │   │  filter   │   │ assembler│   │           │
//! ├──────────────┤   └───────────┘   └──────────┘   └───────────┘
//! │ stratified   │─────────────────────────▲
//! │ sampler      │
//! └──────────────┘
//!        ▲ VectorIndex / RecordStore / TitleResolver (SQLite or in-memory)
//! ```
//!
//! The algorithms live in [`qe_context_core`]; this crate adds
//! configuration, storage adapters, the [`engine::ContextEngine`] façade,
//! the generation pool, the HTTP API and the `qectx` CLI.
//!
//! ## Quick Start
//!
//! ```bash
//! qectx init
//! qectx import ./defects.jsonl --type defect
//! qectx context "checkout payment failures" --types defect,requirement
//! qectx sample --types defect --severity critical --since 2024-01-01
//! qectx serve
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration, validation, reloadable shared config |
//! | [`logging`] | `tracing` subscriber setup |
//! | [`db`] | SQLite connection pool |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_store`] | SQLite implementation of the collaborator traits |
//! | [`embedding`] | Embedding provider selection |
//! | [`openai`] | OpenAI-compatible HTTP client with retry |
//! | [`ingest`] | JSON / JSONL record import |
//! | [`search`] | Concurrent per-type similarity search |
//! | [`engine`] | `ContextEngine::retrieve`, the single retrieval entry point |
//! | [`generate`] | Text generation and the bounded worker pool |
//! | [`context_cmd`] | CLI retrieval, sampling and analysis commands |
//! | [`server`] | JSON HTTP API |

pub mod config;
pub mod context_cmd;
pub mod db;
pub mod embedding;
pub mod engine;
pub mod generate;
pub mod ingest;
pub mod logging;
pub mod migrate;
pub mod openai;
pub mod search;
pub mod server;
pub mod sqlite_store;

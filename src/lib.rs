//! # docweave
//!
//! Incremental README regeneration for source trees.
//!
//! docweave walks a repository, summarizes every textual file through a
//! language model, folds the file summaries into directory summaries up to
//! the root, and merges the result with the existing README and an optional
//! template. A digest of every file gates the whole pipeline: when nothing
//! changed since the last successful run, no model call is made.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌─────────┐   ┌────────────┐   ┌───────────┐   ┌─────────┐
//! │  Walker  │──▶│ Chunker │──▶│   Oracle   │──▶│ Aggregator│──▶│  Merge  │
//! │ + digest │   │         │   │  adapter   │   │ file → dir│   │ + write │
//! └──────────┘   └─────────┘   └────────────┘   └───────────┘   └─────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! export OPENAI_API_KEY=...
//! docweave generate .                 # write README.md
//! docweave check .                    # "stale" or "up to date"
//! docweave tools .                    # detected toolchains
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration and per-run options |
//! | [`models`] | Core data types |
//! | [`digest`] | Fingerprint store and staleness decision |
//! | [`walker`] | Deterministic tree walk with exclusion rules |
//! | [`chunk`] | Line-aligned chunking and `!important` findings |
//! | [`oracle`] | Language model boundary with retry and concurrency limits |
//! | [`aggregate`] | Chunk → file → directory summarization |
//! | [`tools`] | Toolchain detection and installation guides |
//! | [`merge`] | Section-aware merge with the existing document |
//! | [`pipeline`] | Orchestration and run report |
//! | [`progress`] | Progress reporting on stderr |

pub mod aggregate;
pub mod chunk;
pub mod config;
pub mod digest;
pub mod merge;
pub mod models;
pub mod oracle;
pub mod pipeline;
pub mod progress;
pub mod tools;
pub mod walker;

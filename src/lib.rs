//! # casebridge
//!
//! Schema-flexible ingestion of external forensic extractions with
//! rate-limited hash enrichment.
//!
//! External executables (an Amcache hive parser, a CloudTrail log fetcher,
//! a reputation lookup client) populate a local SQLite working database
//! with tables casebridge does not know in advance. casebridge discovers
//! that schema at runtime, maps it onto a generic typed artifact catalog,
//! imports one artifact per row, and for hash-bearing tables drives a
//! paced, cancellable lookup pass that turns each verdict row into a
//! further artifact.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐   ┌────────────┐   ┌─────────────┐
//! │ External tool │──▶│  Working   │──▶│  Schema +    │
//! │ (subprocess)  │   │  database  │   │  row import  │
//! └──────▲────────┘   └────────────┘   └──────┬───────┘
//!        │                                    ▼
//!   one lookup per row                 ┌─────────────┐
//!   (paced, cancellable)               │  Artifact    │
//!        └─────────────────────────────│  store       │
//!                                      └─────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration and credential validation |
//! | [`models`] | Value kinds, column classification, artifacts |
//! | [`db`] | Working-database connections |
//! | [`store`] | Typed catalogs and artifact persistence |
//! | [`schema`] | Runtime schema discovery and catalog mapping |
//! | [`import`] | Row-to-artifact import |
//! | [`bridge`] | External tool invocation |
//! | [`enrich`] | Paced per-key enrichment scheduling |
//! | [`progress`] | Progress reporting |
//! | [`cancel`] | Cooperative cancellation |
//! | [`pipeline`] | Per-data-source orchestration |

pub mod bridge;
pub mod cancel;
pub mod config;
pub mod db;
pub mod enrich;
pub mod import;
pub mod models;
pub mod pipeline;
pub mod progress;
pub mod schema;
pub mod store;

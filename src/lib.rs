//! # byggeviden
//!
//! **A retrieval-augmented indexing and wiki-generation engine for
//! construction-project PDFs.**
//!
//! byggeviden ingests construction documentation (tender packages, technical
//! specifications, drawings, checklists), partitions it into structured
//! elements, enriches and chunks those elements with geometry-aware
//! provenance, embeds them for semantic retrieval, and builds on top of that
//! index both an ask-a-question query engine and a fully generated project
//! wiki.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌─────────────────────────────┐   ┌──────────┐
//! │  Uploads  │──▶│   Indexing Orchestrator     │──▶│  SQLite   │
//! │ Email/API │   │ Partition→Enrich→Chunk→Embed│   │  + Vecs   │
//! └───────────┘   └─────────────────────────────┘   └────┬─────┘
//!                                                         │
//!                      ┌──────────────────────────────────┤
//!                      ▼                  ▼                ▼
//!                 ┌──────────┐      ┌──────────┐     ┌──────────┐
//!                 │  Query   │      │   Wiki   │     │Checklist │
//!                 │  Engine  │      │Generator │     │ Analyzer │
//!                 └──────────┘      └──────────┘     └──────────┘
//! ```
//!
//! ## Data Flow
//!
//! 1. An upload (email attachment or API project upload) becomes an
//!    [`models::IndexingRun`] with one [`models::DocumentInput`] per PDF.
//! 2. The **indexing orchestrator** ([`orchestrator`]) runs each document
//!    through partitioning ([`partition`]), metadata derivation
//!    ([`metadata_step`]), table/image enrichment ([`enrichment`]), and
//!    geometry-aware chunking ([`chunking`]), then embeds the run's chunks
//!    in one batched pass ([`embedding_step`]).
//! 3. The **retrieval engine** ([`retrieval`]) expands a query with
//!    paraphrases and a HyDE hypothetical passage, embeds every variation,
//!    and fans out vector search scoped to the caller's access level.
//! 4. The **generation engine** ([`generation`]) turns retrieved chunks into
//!    a cited answer and persists a [`models::QueryRun`].
//! 5. The **wiki orchestrator** ([`wiki`]) clusters a run's chunks, names
//!    each cluster, plans a page structure, and synthesizes every page from
//!    retrieved evidence.
//! 6. The **checklist analyzer** ([`checklist`]) parses a free-text audit
//!    checklist, retrieves evidence per item, and classifies each item's
//!    status with source attribution.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | JSON configuration parsing and validation |
//! | [`models`] | Core data types: runs, documents, elements, chunks, wiki/checklist records |
//! | [`context`] | `RequestContext` access scoping threaded through every entry point |
//! | [`object_store`] | Content-addressed storage for source PDFs and rendered pages |
//! | [`ocr`] | OCR provider trait for scanned-document partitioning |
//! | [`llm_client`] | Chat/vision/embedding provider with retry and backoff |
//! | [`partition`] | PDF partitioning: native extraction, OCR fallback, table/role heuristics |
//! | [`metadata_step`] | Section outline derivation, page classification, language detection |
//! | [`enrichment`] | Concurrency-bounded table/image captioning with retry |
//! | [`chunking`] | Reading-order chunk assembly with bbox geometry propagation |
//! | [`embedding_step`] | Token-aware batched embedding with resume-by-query |
//! | [`orchestrator`] | Per-document pipeline scheduling and run-level aggregation |
//! | [`retrieval`] | Query expansion, HyDE, multi-variation vector search, dedup |
//! | [`generation`] | Cited answer synthesis and Query Run persistence |
//! | [`wiki`] | Clustering, structure planning, and page synthesis orchestration |
//! | [`checklist`] | Checklist parsing, per-item evidence retrieval, status classification |
//! | [`progress`] | Ephemeral CLI-facing progress reporting, separate from the DB-persisted step journal |
//! | [`server`] | HTTP API (Axum) with CORS |
//! | [`db`] | SQLite connection pool with WAL mode |
//! | [`migrate`] | Database schema migrations (idempotent) |
//!
//! ## Configuration
//!
//! byggeviden is configured via a JSON file (default: `config/byggeviden.json`).
//! See [`config`] for all available options and [`config::load_config`] for
//! validation rules.

pub mod checklist;
pub mod chunking;
pub mod config;
pub mod context;
pub mod db;
pub mod embedding_step;
pub mod enrichment;
pub mod error;
pub mod generation;
pub mod llm_client;
pub mod metadata_step;
pub mod migrate;
pub mod models;
pub mod object_store;
pub mod ocr;
pub mod orchestrator;
pub mod partition;
pub mod progress;
pub mod retrieval;
pub mod server;
pub mod store;
pub mod vector_index;
pub mod wiki;

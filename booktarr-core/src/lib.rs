//! # Booktarr Core
//!
//! The metadata enrichment and ingestion core of the Booktarr book
//! library service.
//!
//! ## Overview
//!
//! This crate turns ISBN/title/author queries and bulk catalog files
//! into deduplicated, fully enriched book, edition, and series
//! records by orchestrating external bibliographic APIs under rate
//! limits and caching:
//!
//! - **Fetch layer**: per-source rate limiting, a TTL+LRU response
//!   cache with an optional durable backing, and retrying HTTP
//! - **Source clients**: a uniform contract over Google Books and
//!   Open Library, normalizing vendor payloads into canonical records
//! - **Enrichment engine**: parallel fan-out, precedence merge,
//!   ranked multi-source search
//! - **Ingestion pipeline**: CSV/JSON catalog imports with job
//!   tracking and bounded concurrency
//! - **Series integrity**: validation and reconciliation of declared
//!   series totals against owned volumes
//!
//! The REST surface, authentication, and UI live elsewhere; storage
//! is reached only through the [`database::LibraryRepository`]
//! contract.

pub mod config;
pub mod database;
pub mod enrich;
pub mod error;
pub mod fetch;
pub mod ingest;
pub mod logging;
pub mod series;
pub mod sources;

pub use config::AppConfig;
pub use database::{LibraryRepository, MemoryLibraryRepository, PostgresLibraryRepository};
pub use enrich::{BatchOutcome, EnrichmentEngine, EnrichmentOutcome, ScoredRecord};
pub use error::{CoreError, Result, SourceError, SourceErrorKind};
pub use fetch::{RateLimiter, ResponseCache};
pub use ingest::{ImportFormat, ImportOptions, ImportPipeline, IngestionJob, JobStatus, JobTracker};
pub use series::{SeriesIntegrityEngine, SeriesReport};
pub use sources::{GoogleBooksSource, OpenLibrarySource, SourceClient, build_source_clients};

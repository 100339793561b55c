//! Book and edition entities.
//!
//! A `Book` is the work; it owns one or more `Edition`s. The edition's
//! canonical key is its ISBN-13, which is globally unique across the
//! library.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{BookId, EditionId};
use crate::isbn::{Isbn10, Isbn13};

/// Which external catalog produced a piece of metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataSource {
    GoogleBooks,
    OpenLibrary,
    Import,
    Unknown,
}

impl MetadataSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetadataSource::GoogleBooks => "google_books",
            MetadataSource::OpenLibrary => "open_library",
            MetadataSource::Import => "import",
            MetadataSource::Unknown => "unknown",
        }
    }

    pub fn from_name(name: &str) -> Self {
        match name {
            "google_books" => MetadataSource::GoogleBooks,
            "open_library" => MetadataSource::OpenLibrary,
            "import" => MetadataSource::Import,
            _ => MetadataSource::Unknown,
        }
    }
}

impl std::fmt::Display for MetadataSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A price observed at one source at one point in time. Snapshots are
/// appended per source, never deduplicated across sources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceSnapshot {
    pub source: String,
    pub price: f64,
    pub currency: String,
    pub captured_at: DateTime<Utc>,
}

/// The work. Identity is the canonical ISBN-13 of one of its editions
/// when available, else the normalized (title, author set) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Book {
    pub id: BookId,
    pub title: String,
    /// Ordered author list; order is display order, first-seen wins.
    pub authors: Vec<String>,
    pub series_name: Option<String>,
    pub series_position: Option<u32>,
    pub categories: Vec<String>,
    pub description: Option<String>,
    pub language: Option<String>,
    /// Original-language title or bracketed romanization, verbatim.
    /// Never collapsed into `title`.
    pub original_title: Option<String>,
    pub added_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One published form of a book.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edition {
    pub id: EditionId,
    pub book_id: BookId,
    pub isbn_10: Option<Isbn10>,
    /// Canonical key; unique across all editions.
    pub isbn_13: Option<Isbn13>,
    pub publisher: Option<String>,
    pub release_date: Option<NaiveDate>,
    pub page_count: Option<u32>,
    pub language: Option<String>,
    pub format: Option<String>,
    pub cover_url: Option<String>,
    pub pricing: Vec<PriceSnapshot>,
    pub metadata_source: MetadataSource,
    pub enriched_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// The (book, edition) slice returned by ISBN reads. Repository
/// consumers never walk the entity graph beyond this pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookWithEdition {
    pub book: Book,
    pub edition: Edition,
}

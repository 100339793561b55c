//! The source-independent normalized payload every source client
//! produces. Vendor responses are untyped JSON with optional fields;
//! downstream code (merge, persistence, search) operates only on this
//! record.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::book::{MetadataSource, PriceSnapshot};
use crate::isbn::{Isbn10, Isbn13};

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub isbn_10: Option<Isbn10>,
    pub isbn_13: Option<Isbn13>,
    pub title: Option<String>,
    pub subtitle: Option<String>,
    /// Original-language title or bracketed romanization, verbatim.
    pub original_title: Option<String>,
    pub authors: Vec<String>,
    pub series: Option<String>,
    pub series_position: Option<u32>,
    pub publisher: Option<String>,
    pub published_date: Option<NaiveDate>,
    pub page_count: Option<u32>,
    /// ISO-639-1 code where determinable.
    pub language: Option<String>,
    pub thumbnail_url: Option<String>,
    pub description: Option<String>,
    pub categories: Vec<String>,
    pub pricing: Vec<PriceSnapshot>,
    pub source: Option<MetadataSource>,
}

impl CanonicalRecord {
    /// The canonical ISBN-13, promoting a lone ISBN-10 when that is
    /// all the source provided.
    pub fn canonical_isbn13(&self) -> Option<Isbn13> {
        self.isbn_13
            .clone()
            .or_else(|| self.isbn_10.as_ref().map(Isbn10::to_isbn13))
    }

    /// Whether the record carries anything beyond identifiers. Used to
    /// treat empty vendor payloads as not-found.
    pub fn has_metadata(&self) -> bool {
        self.title.is_some()
            || !self.authors.is_empty()
            || self.publisher.is_some()
            || self.description.is_some()
            || self.page_count.is_some()
            || self.published_date.is_some()
    }
}

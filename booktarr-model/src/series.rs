//! Series and series-volume entities.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use unicode_normalization::UnicodeNormalization;

use crate::book::MetadataSource;
use crate::ids::{BookId, SeriesId, VolumeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeriesStatus {
    Ongoing,
    Completed,
    Unknown,
}

impl SeriesStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SeriesStatus::Ongoing => "ongoing",
            SeriesStatus::Completed => "completed",
            SeriesStatus::Unknown => "unknown",
        }
    }

    pub fn from_name(name: &str) -> Self {
        match name {
            "ongoing" => SeriesStatus::Ongoing,
            "completed" => SeriesStatus::Completed,
            _ => SeriesStatus::Unknown,
        }
    }
}

/// An ordered collection of books sharing a canonical name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Series {
    pub id: SeriesId,
    /// Display name, verbatim. Non-Latin characters and bracketed
    /// romanizations are preserved; comparison goes through
    /// [`Series::canonical_key`].
    pub name: String,
    /// Declared total volume count, when an external catalog knows it.
    pub total_volumes: Option<u32>,
    pub status: SeriesStatus,
    pub metadata_source: MetadataSource,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Series {
    /// Canonical comparison key: NFKC fold, lowercase, collapsed
    /// whitespace. The display name itself is left untouched.
    pub fn canonical_key(name: &str) -> String {
        let folded: String = name.nfkc().collect();
        folded
            .to_lowercase()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolumeStatus {
    Owned,
    Wanted,
    Missing,
}

impl VolumeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VolumeStatus::Owned => "owned",
            VolumeStatus::Wanted => "wanted",
            VolumeStatus::Missing => "missing",
        }
    }

    pub fn from_name(name: &str) -> Self {
        match name {
            "owned" => VolumeStatus::Owned,
            "wanted" => VolumeStatus::Wanted,
            _ => VolumeStatus::Missing,
        }
    }
}

/// One position within a series. May exist without a linked book (a
/// placeholder for a volume the library knows about but does not
/// hold).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesVolume {
    pub id: VolumeId,
    pub series_id: SeriesId,
    /// Positive, unique within the series.
    pub position: u32,
    pub book_id: Option<BookId>,
    pub status: VolumeStatus,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_key_folds_case_and_whitespace() {
        assert_eq!(
            Series::canonical_key("  The Stormlight   Archive "),
            "the stormlight archive"
        );
    }

    #[test]
    fn canonical_key_preserves_non_latin_text() {
        // NFKC fold maps the full-width digit to ASCII but keeps the
        // kana intact, so romanized and original titles stay distinct.
        assert_eq!(
            Series::canonical_key("とある魔術の禁書目録 １"),
            "とある魔術の禁書目録 1"
        );
        assert_eq!(
            Series::canonical_key("Toaru Majutsu no Index [とある魔術の禁書目録]"),
            "toaru majutsu no index [とある魔術の禁書目録]"
        );
    }
}

//! Core data model definitions shared across Booktarr crates.
#![allow(missing_docs)]

pub mod book;
pub mod error;
pub mod ids;
pub mod isbn;
pub mod record;
pub mod series;

// Intentionally curated re-exports for downstream consumers.
pub use book::{Book, BookWithEdition, Edition, MetadataSource, PriceSnapshot};
pub use error::{ModelError, Result as ModelResult};
pub use ids::{BookId, EditionId, SeriesId, VolumeId};
pub use isbn::{Isbn, Isbn10, Isbn13, looks_like_isbn};
pub use record::CanonicalRecord;
pub use series::{Series, SeriesStatus, SeriesVolume, VolumeStatus};

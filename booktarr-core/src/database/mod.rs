//! The persistence gateway.
//!
//! The relational store is an external collaborator; the core talks to
//! it only through [`LibraryRepository`]. Reads return flat slices
//! (book+edition, series+volumes) rather than a walkable graph, and
//! every write implementation runs inside its own transaction.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use booktarr_model::{
    BookId, BookWithEdition, CanonicalRecord, Isbn, Isbn13, Series, SeriesId, SeriesVolume,
    VolumeId, VolumeStatus,
};
use futures::stream::BoxStream;

use crate::error::Result;

pub use memory::MemoryLibraryRepository;
pub use postgres::PostgresLibraryRepository;

#[async_trait]
pub trait LibraryRepository: Send + Sync {
    /// Look up the (book, edition) pair for an ISBN. The canonical
    /// ISBN-13 is tried first; a lone stored ISBN-10 still matches.
    async fn get_book_by_isbn(&self, isbn: &Isbn) -> Result<Option<BookWithEdition>>;

    /// Every canonical ISBN-13 in the library, lazily.
    fn all_edition_isbns(&self) -> BoxStream<'_, Result<Isbn13>>;

    /// Atomic upsert. Identity resolves by canonical ISBN-13 first,
    /// then by (normalized title, author set); never duplicates. A
    /// stored edition carrying only an ISBN-10 is promoted to ISBN-13
    /// here. Pricing on the record replaces the stored snapshots (the
    /// merge layer owns append semantics).
    async fn upsert_book_and_edition(&self, record: &CanonicalRecord) -> Result<BookWithEdition>;

    /// Match by canonical series key, create when absent. A declared
    /// total only ever grows an existing value.
    async fn upsert_series(&self, name: &str, total_volumes: Option<u32>) -> Result<Series>;

    /// Bind a position to a book (or a placeholder when `book_id` is
    /// `None`). Re-linking an existing position updates it in place.
    async fn link_volume(
        &self,
        series_id: SeriesId,
        position: u32,
        book_id: Option<BookId>,
    ) -> Result<SeriesVolume>;

    /// The series plus its volumes, position-ordered.
    async fn get_series_with_volumes(&self, name: &str)
    -> Result<Option<(Series, Vec<SeriesVolume>)>>;

    async fn all_series(&self) -> Result<Vec<Series>>;

    async fn set_series_total(&self, series_id: SeriesId, total_volumes: u32) -> Result<()>;

    async fn set_volume_status(&self, volume_id: VolumeId, status: VolumeStatus) -> Result<()>;

    async fn remove_volume(&self, volume_id: VolumeId) -> Result<()>;

    /// Detach a volume from a book id that no longer resolves.
    async fn unlink_volume_book(&self, volume_id: VolumeId) -> Result<()>;

    async fn book_exists(&self, book_id: BookId) -> Result<bool>;

    /// Admin-only removal; the core never destroys books on its own.
    async fn delete_book(&self, book_id: BookId) -> Result<bool>;
}

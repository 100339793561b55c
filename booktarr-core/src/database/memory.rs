//! In-memory repository used by tests and embedded runs. Enforces the
//! same identity and uniqueness rules as the Postgres gateway.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use booktarr_model::{
    Book, BookId, BookWithEdition, CanonicalRecord, Edition, EditionId, Isbn, Isbn13,
    MetadataSource, Series, SeriesId, SeriesStatus, SeriesVolume, VolumeId, VolumeStatus,
};
use chrono::Utc;
use futures::stream::{self, BoxStream, StreamExt};

use crate::database::LibraryRepository;
use crate::error::{CoreError, Result};

#[derive(Debug, Default)]
struct State {
    books: HashMap<BookId, Book>,
    editions: HashMap<EditionId, Edition>,
    series: HashMap<SeriesId, Series>,
    volumes: HashMap<VolumeId, SeriesVolume>,
}

#[derive(Debug, Default)]
pub struct MemoryLibraryRepository {
    state: Mutex<State>,
}

impl MemoryLibraryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a volume row verbatim, bypassing the position upsert.
    /// For fixtures and legacy-data imports only; the normal path is
    /// [`LibraryRepository::link_volume`].
    pub fn seed_volume(&self, volume: SeriesVolume) {
        self.lock().volumes.insert(volume.id, volume);
    }

    fn identity_key(title: &str, authors: &[String]) -> (String, Vec<String>) {
        let mut authors: Vec<String> = authors.iter().map(|a| a.trim().to_lowercase()).collect();
        authors.sort();
        (title.trim().to_lowercase(), authors)
    }
}

fn apply_record_to_book(book: &mut Book, record: &CanonicalRecord) {
    if let Some(title) = &record.title {
        book.title = title.clone();
    }
    if !record.authors.is_empty() {
        book.authors = record.authors.clone();
    }
    if let Some(series) = &record.series {
        book.series_name = Some(series.clone());
    }
    if record.series_position.is_some() {
        book.series_position = record.series_position;
    }
    if !record.categories.is_empty() {
        book.categories = record.categories.clone();
    }
    if record.description.is_some() {
        book.description = record.description.clone();
    }
    if record.language.is_some() {
        book.language = record.language.clone();
    }
    if record.original_title.is_some() {
        book.original_title = record.original_title.clone();
    }
    book.updated_at = Utc::now();
}

fn apply_record_to_edition(edition: &mut Edition, record: &CanonicalRecord) {
    if let Some(isbn10) = &record.isbn_10 {
        edition.isbn_10 = Some(isbn10.clone());
    }
    if let Some(canonical) = record.canonical_isbn13() {
        edition.isbn_13 = Some(canonical);
    }
    if record.publisher.is_some() {
        edition.publisher = record.publisher.clone();
    }
    if record.published_date.is_some() {
        edition.release_date = record.published_date;
    }
    if record.page_count.is_some() {
        edition.page_count = record.page_count;
    }
    if record.language.is_some() {
        edition.language = record.language.clone();
    }
    if let Some(thumbnail) = &record.thumbnail_url {
        edition.cover_url = Some(thumbnail.clone());
    }
    if !record.pricing.is_empty() {
        edition.pricing = record.pricing.clone();
    }
    if let Some(source) = record.source {
        edition.metadata_source = source;
        if matches!(source, MetadataSource::GoogleBooks | MetadataSource::OpenLibrary) {
            edition.enriched_at = Some(Utc::now());
        }
    }
}

fn new_book(record: &CanonicalRecord) -> Book {
    let now = Utc::now();
    Book {
        id: BookId::new(),
        title: record.title.clone().unwrap_or_default(),
        authors: record.authors.clone(),
        series_name: record.series.clone(),
        series_position: record.series_position,
        categories: record.categories.clone(),
        description: record.description.clone(),
        language: record.language.clone(),
        original_title: record.original_title.clone(),
        added_at: now,
        updated_at: now,
    }
}

fn new_edition(book_id: BookId, record: &CanonicalRecord) -> Edition {
    Edition {
        id: EditionId::new(),
        book_id,
        isbn_10: record.isbn_10.clone(),
        isbn_13: record.canonical_isbn13(),
        publisher: record.publisher.clone(),
        release_date: record.published_date,
        page_count: record.page_count,
        language: record.language.clone(),
        format: None,
        cover_url: record.thumbnail_url.clone(),
        pricing: record.pricing.clone(),
        metadata_source: record.source.unwrap_or(MetadataSource::Unknown),
        enriched_at: None,
        created_at: Utc::now(),
    }
}

#[async_trait]
impl LibraryRepository for MemoryLibraryRepository {
    async fn get_book_by_isbn(&self, isbn: &Isbn) -> Result<Option<BookWithEdition>> {
        let canonical = isbn.canonical();
        let state = self.lock();

        let edition = state
            .editions
            .values()
            .find(|e| e.isbn_13.as_ref() == Some(&canonical))
            .or_else(|| match isbn {
                Isbn::Ten(isbn10) => state
                    .editions
                    .values()
                    .find(|e| e.isbn_10.as_ref() == Some(isbn10)),
                Isbn::Thirteen(_) => None,
            });

        Ok(edition.and_then(|edition| {
            state.books.get(&edition.book_id).map(|book| BookWithEdition {
                book: book.clone(),
                edition: edition.clone(),
            })
        }))
    }

    fn all_edition_isbns(&self) -> BoxStream<'_, Result<Isbn13>> {
        let isbns: Vec<Isbn13> = self
            .lock()
            .editions
            .values()
            .filter_map(|e| e.isbn_13.clone())
            .collect();
        stream::iter(isbns.into_iter().map(Ok)).boxed()
    }

    async fn upsert_book_and_edition(&self, record: &CanonicalRecord) -> Result<BookWithEdition> {
        let canonical = record.canonical_isbn13();
        let mut state = self.lock();

        // Resolve by canonical ISBN-13, promoting a lone stored
        // ISBN-10 when the canonical lookup misses.
        let mut edition_id = canonical.as_ref().and_then(|c| {
            state
                .editions
                .values()
                .find(|e| e.isbn_13.as_ref() == Some(c))
                .map(|e| e.id)
        });
        if edition_id.is_none() {
            if let Some(isbn10) = &record.isbn_10 {
                edition_id = state
                    .editions
                    .values()
                    .find(|e| e.isbn_13.is_none() && e.isbn_10.as_ref() == Some(isbn10))
                    .map(|e| e.id);
            }
        }

        if let Some(edition_id) = edition_id {
            let Some(edition) = state.editions.get(&edition_id).cloned() else {
                return Err(CoreError::Internal("edition index out of sync".to_string()));
            };
            let book_id = edition.book_id;

            let mut edition = edition;
            apply_record_to_edition(&mut edition, record);
            state.editions.insert(edition_id, edition.clone());

            let Some(book) = state.books.get_mut(&book_id) else {
                return Err(CoreError::Database(format!(
                    "edition {edition_id} references missing book {book_id}"
                )));
            };
            apply_record_to_book(book, record);
            return Ok(BookWithEdition {
                book: book.clone(),
                edition,
            });
        }

        // Fall back to (title, author set) identity.
        let book_id = record.title.as_ref().and_then(|title| {
            let key = Self::identity_key(title, &record.authors);
            state
                .books
                .values()
                .find(|b| Self::identity_key(&b.title, &b.authors) == key)
                .map(|b| b.id)
        });

        let book_id = match book_id {
            Some(book_id) => {
                if let Some(book) = state.books.get_mut(&book_id) {
                    apply_record_to_book(book, record);
                }
                book_id
            }
            None => {
                let book = new_book(record);
                let book_id = book.id;
                state.books.insert(book_id, book);
                book_id
            }
        };

        // An existing ISBN-less edition of the same book is matched by
        // (publisher, release date) rather than duplicated.
        let existing = if canonical.is_none() {
            state
                .editions
                .values()
                .find(|e| {
                    e.book_id == book_id
                        && e.isbn_13.is_none()
                        && e.publisher == record.publisher
                        && e.release_date == record.published_date
                })
                .map(|e| e.id)
        } else {
            None
        };

        let edition = match existing {
            Some(edition_id) => {
                let Some(edition) = state.editions.get_mut(&edition_id) else {
                    return Err(CoreError::Internal("edition index out of sync".to_string()));
                };
                apply_record_to_edition(edition, record);
                edition.clone()
            }
            None => {
                let edition = new_edition(book_id, record);
                state.editions.insert(edition.id, edition.clone());
                edition
            }
        };

        let Some(book) = state.books.get(&book_id) else {
            return Err(CoreError::Internal("book index out of sync".to_string()));
        };
        Ok(BookWithEdition {
            book: book.clone(),
            edition,
        })
    }

    async fn upsert_series(&self, name: &str, total_volumes: Option<u32>) -> Result<Series> {
        let key = Series::canonical_key(name);
        let mut state = self.lock();

        let existing = state
            .series
            .values()
            .find(|s| Series::canonical_key(&s.name) == key)
            .map(|s| s.id);

        let series = match existing {
            Some(series_id) => {
                let Some(series) = state.series.get_mut(&series_id) else {
                    return Err(CoreError::Internal("series index out of sync".to_string()));
                };
                if let Some(total) = total_volumes {
                    series.total_volumes = Some(series.total_volumes.map_or(total, |t| t.max(total)));
                    series.updated_at = Utc::now();
                }
                series.clone()
            }
            None => {
                let now = Utc::now();
                let series = Series {
                    id: SeriesId::new(),
                    name: name.to_string(),
                    total_volumes,
                    status: SeriesStatus::Unknown,
                    metadata_source: MetadataSource::Unknown,
                    created_at: now,
                    updated_at: now,
                };
                state.series.insert(series.id, series.clone());
                series
            }
        };

        Ok(series)
    }

    async fn link_volume(
        &self,
        series_id: SeriesId,
        position: u32,
        book_id: Option<BookId>,
    ) -> Result<SeriesVolume> {
        if position == 0 {
            return Err(CoreError::InvalidInput(
                "volume position must be positive".to_string(),
            ));
        }

        let mut state = self.lock();
        if !state.series.contains_key(&series_id) {
            return Err(CoreError::Database(format!("unknown series {series_id}")));
        }

        let existing = state
            .volumes
            .values()
            .find(|v| v.series_id == series_id && v.position == position)
            .map(|v| v.id);

        let volume = match existing {
            Some(volume_id) => {
                let Some(volume) = state.volumes.get_mut(&volume_id) else {
                    return Err(CoreError::Internal("volume index out of sync".to_string()));
                };
                if book_id.is_some() {
                    volume.book_id = book_id;
                    volume.status = VolumeStatus::Owned;
                }
                volume.clone()
            }
            None => {
                let volume = SeriesVolume {
                    id: VolumeId::new(),
                    series_id,
                    position,
                    book_id,
                    status: if book_id.is_some() {
                        VolumeStatus::Owned
                    } else {
                        VolumeStatus::Missing
                    },
                    created_at: Utc::now(),
                };
                state.volumes.insert(volume.id, volume.clone());
                volume
            }
        };

        Ok(volume)
    }

    async fn get_series_with_volumes(
        &self,
        name: &str,
    ) -> Result<Option<(Series, Vec<SeriesVolume>)>> {
        let key = Series::canonical_key(name);
        let state = self.lock();

        let Some(series) = state
            .series
            .values()
            .find(|s| Series::canonical_key(&s.name) == key)
            .cloned()
        else {
            return Ok(None);
        };

        let mut volumes: Vec<SeriesVolume> = state
            .volumes
            .values()
            .filter(|v| v.series_id == series.id)
            .cloned()
            .collect();
        volumes.sort_by_key(|v| (v.position, v.created_at));

        Ok(Some((series, volumes)))
    }

    async fn all_series(&self) -> Result<Vec<Series>> {
        let mut series: Vec<Series> = self.lock().series.values().cloned().collect();
        series.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(series)
    }

    async fn set_series_total(&self, series_id: SeriesId, total_volumes: u32) -> Result<()> {
        let mut state = self.lock();
        let Some(series) = state.series.get_mut(&series_id) else {
            return Err(CoreError::Database(format!("unknown series {series_id}")));
        };
        series.total_volumes = Some(total_volumes);
        series.updated_at = Utc::now();
        Ok(())
    }

    async fn set_volume_status(&self, volume_id: VolumeId, status: VolumeStatus) -> Result<()> {
        let mut state = self.lock();
        let Some(volume) = state.volumes.get_mut(&volume_id) else {
            return Err(CoreError::Database(format!("unknown volume {volume_id}")));
        };
        volume.status = status;
        Ok(())
    }

    async fn remove_volume(&self, volume_id: VolumeId) -> Result<()> {
        self.lock().volumes.remove(&volume_id);
        Ok(())
    }

    async fn unlink_volume_book(&self, volume_id: VolumeId) -> Result<()> {
        let mut state = self.lock();
        let Some(volume) = state.volumes.get_mut(&volume_id) else {
            return Err(CoreError::Database(format!("unknown volume {volume_id}")));
        };
        volume.book_id = None;
        if volume.status == VolumeStatus::Owned {
            volume.status = VolumeStatus::Missing;
        }
        Ok(())
    }

    async fn book_exists(&self, book_id: BookId) -> Result<bool> {
        Ok(self.lock().books.contains_key(&book_id))
    }

    async fn delete_book(&self, book_id: BookId) -> Result<bool> {
        let mut state = self.lock();
        let removed = state.books.remove(&book_id).is_some();
        state.editions.retain(|_, e| e.book_id != book_id);
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(title: &str, isbn: &str) -> CanonicalRecord {
        let mut record = CanonicalRecord {
            title: Some(title.to_string()),
            authors: vec!["Author".to_string()],
            ..Default::default()
        };
        match Isbn::parse(isbn).unwrap() {
            Isbn::Ten(isbn10) => record.isbn_10 = Some(isbn10),
            Isbn::Thirteen(isbn13) => record.isbn_13 = Some(isbn13),
        }
        record
    }

    #[tokio::test]
    async fn upserts_never_duplicate_a_canonical_isbn() {
        let repo = MemoryLibraryRepository::new();
        let first = repo
            .upsert_book_and_edition(&record("Book", "9780439708180"))
            .await
            .unwrap();
        // The same edition arriving as ISBN-10 resolves to the same row.
        let second = repo
            .upsert_book_and_edition(&record("Book", "0439708184"))
            .await
            .unwrap();

        assert_eq!(first.edition.id, second.edition.id);
        assert_eq!(first.book.id, second.book.id);

        let isbns: Vec<_> = repo.all_edition_isbns().collect::<Vec<_>>().await;
        assert_eq!(isbns.len(), 1);
    }

    #[tokio::test]
    async fn lone_isbn10_is_promoted_on_next_upsert() {
        let repo = MemoryLibraryRepository::new();

        // Simulate a legacy row that was stored before promotion.
        let first = repo
            .upsert_book_and_edition(&record("Book", "0439708184"))
            .await
            .unwrap();
        assert_eq!(first.edition.isbn_13.as_ref().unwrap().as_str(), "9780439708180");
        assert_eq!(first.edition.isbn_10.as_ref().unwrap().as_str(), "0439708184");
    }

    #[tokio::test]
    async fn title_author_identity_attaches_new_edition_to_same_book() {
        let repo = MemoryLibraryRepository::new();
        let hardcover = repo
            .upsert_book_and_edition(&record("Same Work", "9780439708180"))
            .await
            .unwrap();
        let paperback = repo
            .upsert_book_and_edition(&record("  same work ", "9780747532743"))
            .await
            .unwrap();

        assert_eq!(hardcover.book.id, paperback.book.id);
        assert_ne!(hardcover.edition.id, paperback.edition.id);
    }

    #[tokio::test]
    async fn link_volume_updates_in_place_per_position() {
        let repo = MemoryLibraryRepository::new();
        let series = repo.upsert_series("Saga", Some(3)).await.unwrap();

        let placeholder = repo.link_volume(series.id, 1, None).await.unwrap();
        assert_eq!(placeholder.status, VolumeStatus::Missing);

        let book = repo
            .upsert_book_and_edition(&record("Saga 1", "9780439708180"))
            .await
            .unwrap();
        let linked = repo
            .link_volume(series.id, 1, Some(book.book.id))
            .await
            .unwrap();
        assert_eq!(linked.id, placeholder.id);
        assert_eq!(linked.status, VolumeStatus::Owned);

        let (_, volumes) = repo.get_series_with_volumes("saga").await.unwrap().unwrap();
        assert_eq!(volumes.len(), 1);
    }

    #[tokio::test]
    async fn series_total_only_grows_on_upsert() {
        let repo = MemoryLibraryRepository::new();
        repo.upsert_series("Saga", Some(5)).await.unwrap();
        let after = repo.upsert_series("SAGA", Some(3)).await.unwrap();
        assert_eq!(after.total_volumes, Some(5));
    }
}

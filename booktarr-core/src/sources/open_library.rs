//! Open Library client: the books API for ISBN lookups and the search
//! API for text queries.

use std::sync::Arc;

use async_trait::async_trait;
use booktarr_model::{CanonicalRecord, Isbn, MetadataSource};
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use crate::config::SourceSettings;
use crate::error::{CoreError, SourceError};
use crate::fetch::{ResponseCache, SourceFetcher, fingerprint};
use crate::sources::normalize::{
    clean_text, detect_original_title, https_upgrade, normalize_language, parse_published_date,
};
use crate::sources::{SourceClient, require_query};

const BOOKS_API: &str = "https://openlibrary.org/api/books";
const SEARCH_API: &str = "https://openlibrary.org/search.json";
const COVERS_BASE: &str = "https://covers.openlibrary.org/b/id";
const SEARCH_LIMIT_CAP: usize = 100;
const CATEGORY_CAP: usize = 10;
const SEARCH_FIELDS: &str =
    "key,title,author_name,isbn,publisher,publish_date,number_of_pages_median,language,cover_i,subject";
const SERIES_TTL: std::time::Duration = std::time::Duration::from_secs(72 * 3600);

pub struct OpenLibrarySource {
    fetcher: SourceFetcher,
    cache: Arc<ResponseCache>,
    books_url: Url,
    search_url: Url,
}

impl std::fmt::Debug for OpenLibrarySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenLibrarySource").finish()
    }
}

impl OpenLibrarySource {
    pub fn new(settings: &SourceSettings, cache: Arc<ResponseCache>) -> Result<Self, CoreError> {
        let parse = |raw: &str| {
            Url::parse(raw)
                .map_err(|e| CoreError::Internal(format!("invalid Open Library URL: {e}")))
        };

        Ok(Self {
            fetcher: SourceFetcher::new(settings)?,
            cache,
            books_url: parse(BOOKS_API)?,
            search_url: parse(SEARCH_API)?,
        })
    }

    fn records_from_cache(&self, payload: Value) -> Option<Vec<CanonicalRecord>> {
        match serde_json::from_value(payload) {
            Ok(records) => Some(records),
            Err(err) => {
                warn!(source = self.name(), %err, "discarding undecodable cache entry");
                None
            }
        }
    }

    async fn run_search(
        &self,
        params: &[(&str, &str)],
        durable: bool,
    ) -> Result<Vec<CanonicalRecord>, SourceError> {
        let fp = fingerprint(self.name(), self.search_url.as_str(), params);
        if let Some(payload) = self.cache.get_api_response(&fp).await {
            if let Some(records) = self.records_from_cache(payload) {
                return Ok(records);
            }
        }

        let mut url = self.search_url.clone();
        url.query_pairs_mut().extend_pairs(params.iter().copied());

        let payload = self.fetcher.get_json(url).await?;
        let records = self.records_from_search(&payload);

        if let Ok(payload) = serde_json::to_value(&records) {
            if durable {
                self.cache
                    .set_api_response_durable(&fp, payload, SERIES_TTL)
                    .await;
            } else {
                self.cache.set_api_response(&fp, payload, None).await;
            }
        }

        Ok(records)
    }

    fn records_from_search(&self, payload: &Value) -> Vec<CanonicalRecord> {
        let Some(docs) = payload.get("docs").and_then(Value::as_array) else {
            return Vec::new();
        };

        docs.iter()
            .filter_map(|doc| self.record_from_search_doc(doc))
            .collect()
    }

    fn record_from_search_doc(&self, doc: &Value) -> Option<CanonicalRecord> {
        let mut record = CanonicalRecord {
            source: Some(MetadataSource::OpenLibrary),
            ..Default::default()
        };

        record.title = doc.get("title").and_then(Value::as_str).and_then(clean_text);
        record.original_title = record.title.as_deref().and_then(detect_original_title);
        record.authors = string_list(doc.get("author_name"));
        record.publisher = string_list(doc.get("publisher")).into_iter().next();
        record.published_date = string_list(doc.get("publish_date"))
            .iter()
            .find_map(|raw| parse_published_date(raw));
        record.page_count = doc
            .get("number_of_pages_median")
            .and_then(Value::as_u64)
            .and_then(|n| u32::try_from(n).ok());
        record.language = string_list(doc.get("language"))
            .first()
            .and_then(|hint| normalize_language(hint));
        record.thumbnail_url = doc
            .get("cover_i")
            .and_then(Value::as_i64)
            .map(|id| format!("{COVERS_BASE}/{id}-L.jpg"));

        let mut categories = string_list(doc.get("subject"));
        categories.truncate(CATEGORY_CAP);
        record.categories = categories;

        // Use the first ISBN that actually validates; search docs mix
        // 10s, 13s, and malformed identifiers freely.
        for candidate in string_list(doc.get("isbn")) {
            match Isbn::parse(&candidate) {
                Ok(Isbn::Thirteen(isbn13)) if record.isbn_13.is_none() => {
                    record.isbn_13 = Some(isbn13);
                }
                Ok(Isbn::Ten(isbn10)) if record.isbn_10.is_none() => {
                    record.isbn_10 = Some(isbn10);
                }
                _ => {}
            }
            if record.isbn_13.is_some() && record.isbn_10.is_some() {
                break;
            }
        }

        record.has_metadata().then_some(record)
    }

    fn record_from_book_data(&self, data: &Value) -> CanonicalRecord {
        let mut record = CanonicalRecord {
            source: Some(MetadataSource::OpenLibrary),
            ..Default::default()
        };

        record.title = data.get("title").and_then(Value::as_str).and_then(clean_text);
        record.original_title = record.title.as_deref().and_then(detect_original_title);
        record.authors = data
            .get("authors")
            .and_then(Value::as_array)
            .map(|authors| {
                authors
                    .iter()
                    .filter_map(|a| a.get("name").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        record.publisher = data
            .get("publishers")
            .and_then(Value::as_array)
            .and_then(|list| list.first())
            .and_then(|p| p.get("name"))
            .and_then(Value::as_str)
            .and_then(clean_text);
        record.published_date = data
            .get("publish_date")
            .and_then(Value::as_str)
            .and_then(parse_published_date);
        record.page_count = data
            .get("number_of_pages")
            .and_then(Value::as_u64)
            .and_then(|n| u32::try_from(n).ok());
        record.language = data
            .get("languages")
            .and_then(Value::as_array)
            .and_then(|list| list.first())
            .and_then(|l| l.get("key"))
            .and_then(Value::as_str)
            .map(|key| key.trim_start_matches("/languages/"))
            .and_then(normalize_language);
        record.thumbnail_url = data
            .get("cover")
            .and_then(|cover| {
                cover
                    .get("large")
                    .or_else(|| cover.get("medium"))
                    .or_else(|| cover.get("small"))
            })
            .and_then(Value::as_str)
            .map(https_upgrade);
        // Descriptions arrive as either a bare string or {"value": ...}.
        record.description = data
            .get("description")
            .and_then(|d| d.as_str().or_else(|| d.get("value").and_then(Value::as_str)))
            .and_then(clean_text);

        let mut categories: Vec<String> = data
            .get("subjects")
            .and_then(Value::as_array)
            .map(|subjects| {
                subjects
                    .iter()
                    .filter_map(|s| {
                        s.as_str()
                            .or_else(|| s.get("name").and_then(Value::as_str))
                    })
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        categories.truncate(CATEGORY_CAP);
        record.categories = categories;

        record
    }
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|list| {
            list.iter()
                .filter_map(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl SourceClient for OpenLibrarySource {
    fn name(&self) -> &str {
        self.fetcher.source_name()
    }

    async fn fetch_by_isbn(&self, isbn: &Isbn) -> Result<Option<CanonicalRecord>, SourceError> {
        // Ask for both forms; editions are catalogued under either.
        let mut bibkeys = format!("ISBN:{}", isbn.as_str());
        match isbn {
            Isbn::Ten(isbn10) => {
                bibkeys.push_str(&format!(",ISBN:{}", isbn10.to_isbn13()));
            }
            Isbn::Thirteen(isbn13) => {
                if let Some(isbn10) = isbn13.to_isbn10() {
                    bibkeys.push_str(&format!(",ISBN:{isbn10}"));
                }
            }
        }

        let params = [
            ("bibkeys", bibkeys.as_str()),
            ("format", "json"),
            ("jscmd", "data"),
        ];
        let fp = fingerprint(self.name(), self.books_url.as_str(), &params);

        if let Some(payload) = self.cache.get_api_response(&fp).await {
            if let Some(records) = self.records_from_cache(payload) {
                debug!(source = self.name(), isbn = isbn.as_str(), "isbn lookup served from cache");
                return Ok(records.into_iter().next());
            }
        }

        let mut url = self.books_url.clone();
        url.query_pairs_mut().extend_pairs(params.iter().copied());

        let payload = self.fetcher.get_json(url).await?;
        let record = bibkeys
            .split(',')
            .find_map(|key| payload.get(key))
            .map(|data| {
                let mut record = self.record_from_book_data(data);
                match isbn {
                    Isbn::Ten(isbn10) => record.isbn_10 = Some(isbn10.clone()),
                    Isbn::Thirteen(isbn13) => record.isbn_13 = Some(isbn13.clone()),
                }
                record
            })
            .filter(CanonicalRecord::has_metadata);

        let records: Vec<&CanonicalRecord> = record.iter().collect();
        if let Ok(payload) = serde_json::to_value(&records) {
            self.cache.set_api_response(&fp, payload, None).await;
        }

        Ok(record)
    }

    async fn search_by_title(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<CanonicalRecord>, SourceError> {
        require_query(self.name(), query)?;
        let limit = limit.clamp(1, SEARCH_LIMIT_CAP).to_string();
        let params = [
            ("title", query),
            ("limit", limit.as_str()),
            ("fields", SEARCH_FIELDS),
        ];
        self.run_search(&params, false).await
    }

    async fn search_by_author(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<CanonicalRecord>, SourceError> {
        require_query(self.name(), query)?;
        let limit = limit.clamp(1, SEARCH_LIMIT_CAP).to_string();
        let params = [
            ("author", query),
            ("limit", limit.as_str()),
            ("fields", SEARCH_FIELDS),
        ];
        self.run_search(&params, false).await
    }

    async fn search_series<'a>(
        &'a self,
        name: &'a str,
        author: Option<&'a str>,
        limit: usize,
    ) -> Result<Vec<CanonicalRecord>, SourceError> {
        require_query(self.name(), name)?;
        let limit = limit.clamp(1, SEARCH_LIMIT_CAP).to_string();
        let mut params = vec![
            ("title", name),
            ("limit", limit.as_str()),
            ("fields", SEARCH_FIELDS),
        ];
        if let Some(author) = author {
            params.push(("author", author));
        }
        self.run_search(&params, true).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheSettings;
    use serde_json::json;

    fn source() -> OpenLibrarySource {
        let settings = SourceSettings::open_library();
        let cache = Arc::new(ResponseCache::new(&CacheSettings::default()));
        OpenLibrarySource::new(&settings, cache).unwrap()
    }

    #[test]
    fn book_data_normalizes_into_canonical_record() {
        let data = json!({
            "title": "Harry Potter and the Philosopher's Stone",
            "authors": [{"name": "J. K. Rowling"}],
            "publishers": [{"name": "Bloomsbury"}],
            "publish_date": "June 26, 1997",
            "number_of_pages": 223,
            "languages": [{"key": "/languages/eng"}],
            "cover": {"large": "http://covers.openlibrary.org/b/id/123-L.jpg"},
            "description": {"value": "A <i>wizard</i> discovers who he is."},
            "subjects": [{"name": "Magic"}, {"name": "Wizards"}]
        });

        let record = source().record_from_book_data(&data);
        assert_eq!(
            record.title.as_deref(),
            Some("Harry Potter and the Philosopher's Stone")
        );
        assert_eq!(record.authors, vec!["J. K. Rowling"]);
        assert_eq!(record.publisher.as_deref(), Some("Bloomsbury"));
        assert_eq!(
            record.published_date,
            chrono::NaiveDate::from_ymd_opt(1997, 6, 26)
        );
        assert_eq!(record.page_count, Some(223));
        assert_eq!(record.language.as_deref(), Some("en"));
        assert_eq!(
            record.thumbnail_url.as_deref(),
            Some("https://covers.openlibrary.org/b/id/123-L.jpg")
        );
        assert_eq!(
            record.description.as_deref(),
            Some("A wizard discovers who he is.")
        );
        assert_eq!(record.categories, vec!["Magic", "Wizards"]);
        assert_eq!(record.source, Some(MetadataSource::OpenLibrary));
    }

    #[test]
    fn search_doc_takes_first_valid_isbn_and_caps_subjects() {
        let payload = json!({
            "docs": [{
                "title": "Dune",
                "author_name": ["Frank Herbert"],
                "isbn": ["not-an-isbn", "9780441172719", "0441172717"],
                "cover_i": 44,
                "subject": (0..20).map(|i| format!("subject-{i}")).collect::<Vec<_>>()
            }]
        });

        let records = source().records_from_search(&payload);
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.isbn_13.as_ref().unwrap().as_str(), "9780441172719");
        assert_eq!(record.isbn_10.as_ref().unwrap().as_str(), "0441172717");
        assert_eq!(record.categories.len(), CATEGORY_CAP);
        assert_eq!(
            record.thumbnail_url.as_deref(),
            Some("https://covers.openlibrary.org/b/id/44-L.jpg")
        );
    }

    #[test]
    fn docless_payload_yields_no_records() {
        assert!(source().records_from_search(&json!({})).is_empty());
    }
}

//! Google Books volumes API client.

use std::sync::Arc;

use async_trait::async_trait;
use booktarr_model::{CanonicalRecord, Isbn, MetadataSource, PriceSnapshot};
use chrono::Utc;
use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use crate::config::SourceSettings;
use crate::error::{CoreError, SourceError};
use crate::fetch::{ResponseCache, SourceFetcher, fingerprint};
use crate::sources::normalize::{
    clean_text, detect_original_title, detect_series, https_upgrade, normalize_language,
    parse_published_date,
};
use crate::sources::{SourceClient, require_query};

const GOOGLE_BOOKS_API: &str = "https://www.googleapis.com/books/v1/volumes";
const MAX_RESULTS_CAP: usize = 40;
/// Series lookups change rarely; cache them well past the API shard
/// default and persist them when a durable layer is attached.
const SERIES_TTL: std::time::Duration = std::time::Duration::from_secs(72 * 3600);

pub struct GoogleBooksSource {
    fetcher: SourceFetcher,
    cache: Arc<ResponseCache>,
    api_key: Option<String>,
    base_url: Url,
}

impl std::fmt::Debug for GoogleBooksSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GoogleBooksSource")
            .field("base_url", &self.base_url.as_str())
            .finish()
    }
}

impl GoogleBooksSource {
    pub fn new(settings: &SourceSettings, cache: Arc<ResponseCache>) -> Result<Self, CoreError> {
        let base_url = Url::parse(GOOGLE_BOOKS_API)
            .map_err(|e| CoreError::Internal(format!("invalid Google Books base URL: {e}")))?;

        Ok(Self {
            fetcher: SourceFetcher::new(settings)?,
            cache,
            api_key: settings.api_key.clone(),
            base_url,
        })
    }

    fn request_url(&self, params: &[(&str, &str)]) -> Url {
        let mut url = self.base_url.clone();
        {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in params {
                pairs.append_pair(key, value);
            }
            if let Some(key) = &self.api_key {
                pairs.append_pair("key", key);
            }
        }
        url
    }

    /// The API key never participates in the fingerprint; rotating it
    /// must not invalidate the cache.
    fn request_fingerprint(&self, params: &[(&str, &str)]) -> String {
        fingerprint(self.name(), self.base_url.as_str(), params)
    }

    async fn fetch_volumes(&self, params: &[(&str, &str)]) -> Result<SearchResponse, SourceError> {
        let payload = self.fetcher.get_json(self.request_url(params)).await?;
        serde_json::from_value(payload)
            .map_err(|e| SourceError::permanent(self.name(), format!("unexpected payload: {e}")))
    }

    fn records_from_cache(&self, payload: serde_json::Value) -> Option<Vec<CanonicalRecord>> {
        match serde_json::from_value(payload) {
            Ok(records) => Some(records),
            Err(err) => {
                warn!(source = self.name(), %err, "discarding undecodable cache entry");
                None
            }
        }
    }

    fn record_from_volume(&self, volume: &Volume) -> CanonicalRecord {
        let info = &volume.volume_info;
        let mut record = CanonicalRecord {
            source: Some(MetadataSource::GoogleBooks),
            ..Default::default()
        };

        record.title = info.title.as_deref().and_then(clean_text);
        record.subtitle = info.subtitle.as_deref().and_then(clean_text);
        record.authors = info.authors.clone().unwrap_or_default();
        record.publisher = info.publisher.as_deref().and_then(clean_text);
        record.published_date = info.published_date.as_deref().and_then(parse_published_date);
        record.page_count = info.page_count.and_then(|n| u32::try_from(n).ok());
        record.language = info.language.as_deref().and_then(normalize_language);
        record.description = info.description.as_deref().and_then(clean_text);
        record.categories = info.categories.clone().unwrap_or_default();

        for identifier in info.industry_identifiers.iter().flatten() {
            let Some(value) = identifier.identifier.as_deref() else {
                continue;
            };
            match (identifier.id_type.as_deref(), Isbn::parse(value)) {
                (Some("ISBN_13"), Ok(Isbn::Thirteen(isbn13))) => {
                    record.isbn_13 = Some(isbn13);
                }
                (Some("ISBN_10"), Ok(Isbn::Ten(isbn10))) => record.isbn_10 = Some(isbn10),
                _ => {}
            }
        }

        record.thumbnail_url = info
            .image_links
            .as_ref()
            .and_then(ImageLinks::best)
            .map(|u| https_upgrade(&u));

        if let Some(title) = &record.title {
            record.original_title = detect_original_title(title);
            if let Some((series, position)) = detect_series(title) {
                record.series = Some(series);
                record.series_position = position;
            }
        }

        if let Some(sale) = &volume.sale_info {
            record.pricing = sale.price_snapshots();
        }

        record
    }
}

#[async_trait]
impl SourceClient for GoogleBooksSource {
    fn name(&self) -> &str {
        self.fetcher.source_name()
    }

    async fn fetch_by_isbn(&self, isbn: &Isbn) -> Result<Option<CanonicalRecord>, SourceError> {
        let query = format!("isbn:{}", isbn.as_str());
        let params = [("q", query.as_str())];
        let fp = self.request_fingerprint(&params);

        if let Some(payload) = self.cache.get_api_response(&fp).await {
            if let Some(records) = self.records_from_cache(payload) {
                debug!(source = self.name(), isbn = isbn.as_str(), "isbn lookup served from cache");
                return Ok(records.into_iter().next());
            }
        }

        let response = self.fetch_volumes(&params).await?;
        let record = response
            .items
            .unwrap_or_default()
            .first()
            .map(|volume| self.record_from_volume(volume))
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
        let q = format!("intitle:{query}");
        let max = limit.clamp(1, MAX_RESULTS_CAP).to_string();
        let params = [("q", q.as_str()), ("maxResults", max.as_str()), ("printType", "books")];
        let fp = self.request_fingerprint(&params);

        if let Some(payload) = self.cache.get_api_response(&fp).await {
            if let Some(records) = self.records_from_cache(payload) {
                return Ok(records);
            }
        }

        let response = self.fetch_volumes(&params).await?;
        let records: Vec<CanonicalRecord> = response
            .items
            .unwrap_or_default()
            .iter()
            .map(|volume| self.record_from_volume(volume))
            .collect();

        if let Ok(payload) = serde_json::to_value(&records) {
            self.cache.set_api_response(&fp, payload, None).await;
        }

        Ok(records)
    }

    async fn search_by_author(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<CanonicalRecord>, SourceError> {
        require_query(self.name(), query)?;
        let q = format!("inauthor:{query}");
        let max = limit.clamp(1, MAX_RESULTS_CAP).to_string();
        let params = [("q", q.as_str()), ("maxResults", max.as_str()), ("printType", "books")];
        let fp = self.request_fingerprint(&params);

        if let Some(payload) = self.cache.get_api_response(&fp).await {
            if let Some(records) = self.records_from_cache(payload) {
                return Ok(records);
            }
        }

        let response = self.fetch_volumes(&params).await?;
        let records: Vec<CanonicalRecord> = response
            .items
            .unwrap_or_default()
            .iter()
            .map(|volume| self.record_from_volume(volume))
            .collect();

        if let Ok(payload) = serde_json::to_value(&records) {
            self.cache.set_api_response(&fp, payload, None).await;
        }

        Ok(records)
    }

    async fn search_series<'a>(
        &'a self,
        name: &'a str,
        author: Option<&'a str>,
        limit: usize,
    ) -> Result<Vec<CanonicalRecord>, SourceError> {
        require_query(self.name(), name)?;
        let mut q = format!("intitle:\"{name}\"");
        if let Some(author) = author {
            q.push_str(&format!(" inauthor:\"{author}\""));
        }
        let max = limit.clamp(1, MAX_RESULTS_CAP).to_string();
        let params = [
            ("q", q.as_str()),
            ("maxResults", max.as_str()),
            ("orderBy", "relevance"),
        ];
        let fp = self.request_fingerprint(&params);

        if let Some(payload) = self.cache.get_api_response(&fp).await {
            if let Some(records) = self.records_from_cache(payload) {
                return Ok(records);
            }
        }

        let response = self.fetch_volumes(&params).await?;
        let records: Vec<CanonicalRecord> = response
            .items
            .unwrap_or_default()
            .iter()
            .map(|volume| self.record_from_volume(volume))
            .collect();

        if let Ok(payload) = serde_json::to_value(&records) {
            self.cache
                .set_api_response_durable(&fp, payload, SERIES_TTL)
                .await;
        }

        Ok(records)
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    items: Option<Vec<Volume>>,
}

#[derive(Debug, Deserialize)]
struct Volume {
    #[serde(rename = "volumeInfo")]
    volume_info: VolumeInfo,
    #[serde(rename = "saleInfo")]
    sale_info: Option<SaleInfo>,
}

#[derive(Debug, Deserialize)]
struct VolumeInfo {
    title: Option<String>,
    subtitle: Option<String>,
    authors: Option<Vec<String>>,
    publisher: Option<String>,
    #[serde(rename = "publishedDate")]
    published_date: Option<String>,
    description: Option<String>,
    #[serde(rename = "industryIdentifiers")]
    industry_identifiers: Option<Vec<IndustryIdentifier>>,
    #[serde(rename = "pageCount")]
    page_count: Option<i64>,
    categories: Option<Vec<String>>,
    #[serde(rename = "imageLinks")]
    image_links: Option<ImageLinks>,
    language: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IndustryIdentifier {
    #[serde(rename = "type")]
    id_type: Option<String>,
    identifier: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ImageLinks {
    #[serde(rename = "smallThumbnail")]
    small_thumbnail: Option<String>,
    thumbnail: Option<String>,
    small: Option<String>,
    medium: Option<String>,
    large: Option<String>,
}

impl ImageLinks {
    fn best(&self) -> Option<String> {
        self.large
            .clone()
            .or_else(|| self.medium.clone())
            .or_else(|| self.small.clone())
            .or_else(|| self.thumbnail.clone())
            .or_else(|| self.small_thumbnail.clone())
    }
}

#[derive(Debug, Deserialize)]
struct SaleInfo {
    saleability: Option<String>,
    #[serde(rename = "retailPrice")]
    retail_price: Option<RetailPrice>,
}

#[derive(Debug, Deserialize)]
struct RetailPrice {
    amount: Option<f64>,
    #[serde(rename = "currencyCode")]
    currency_code: Option<String>,
}

impl SaleInfo {
    fn price_snapshots(&self) -> Vec<PriceSnapshot> {
        if self.saleability.as_deref() != Some("FOR_SALE") {
            return Vec::new();
        }
        let Some(amount) = self.retail_price.as_ref().and_then(|p| p.amount) else {
            return Vec::new();
        };

        vec![PriceSnapshot {
            source: "google_books".to_string(),
            price: amount,
            currency: self
                .retail_price
                .as_ref()
                .and_then(|p| p.currency_code.clone())
                .unwrap_or_else(|| "USD".to_string()),
            captured_at: Utc::now(),
        }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_volume() -> Volume {
        serde_json::from_value(json!({
            "volumeInfo": {
                "title": "Harry Potter and the Sorcerer's Stone",
                "authors": ["J.K. Rowling"],
                "publisher": "Scholastic ",
                "publishedDate": "1998-09",
                "description": "<p>The boy who lived.</p>",
                "industryIdentifiers": [
                    {"type": "ISBN_10", "identifier": "0439708184"},
                    {"type": "ISBN_13", "identifier": "9780439708180"}
                ],
                "pageCount": 309,
                "categories": ["Juvenile Fiction"],
                "imageLinks": {
                    "thumbnail": "http://books.google.com/thumb?id=1",
                    "large": "http://books.google.com/large?id=1"
                },
                "language": "en"
            },
            "saleInfo": {
                "saleability": "FOR_SALE",
                "retailPrice": {"amount": 8.99, "currencyCode": "USD"}
            }
        }))
        .unwrap()
    }

    #[test]
    fn volume_normalizes_into_canonical_record() {
        let settings = SourceSettings::google_books();
        let cache = Arc::new(ResponseCache::new(&crate::config::CacheSettings::default()));
        let source = GoogleBooksSource::new(&settings, cache).unwrap();

        let record = source.record_from_volume(&sample_volume());
        assert_eq!(
            record.title.as_deref(),
            Some("Harry Potter and the Sorcerer's Stone")
        );
        assert_eq!(record.authors, vec!["J.K. Rowling"]);
        assert_eq!(record.publisher.as_deref(), Some("Scholastic"));
        assert_eq!(
            record.published_date,
            chrono::NaiveDate::from_ymd_opt(1998, 9, 1)
        );
        assert_eq!(record.page_count, Some(309));
        assert_eq!(record.description.as_deref(), Some("The boy who lived."));
        assert_eq!(record.isbn_13.as_ref().unwrap().as_str(), "9780439708180");
        assert_eq!(record.isbn_10.as_ref().unwrap().as_str(), "0439708184");
        assert_eq!(
            record.thumbnail_url.as_deref(),
            Some("https://books.google.com/large?id=1")
        );
        assert_eq!(record.pricing.len(), 1);
        assert_eq!(record.pricing[0].price, 8.99);
        assert_eq!(record.source, Some(MetadataSource::GoogleBooks));
        // "Harry Potter and the Sorcerer's Stone" has no series marker.
        assert_eq!(record.series, None);
    }

    #[test]
    fn volume_without_sale_price_has_no_snapshots() {
        let sale: SaleInfo =
            serde_json::from_value(json!({"saleability": "NOT_FOR_SALE"})).unwrap();
        assert!(sale.price_snapshots().is_empty());
    }
}

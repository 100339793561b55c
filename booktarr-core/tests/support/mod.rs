//! Shared fixtures: stub source clients and engine wiring.
#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use booktarr_core::config::{CacheSettings, EnrichmentSettings};
use booktarr_core::database::MemoryLibraryRepository;
use booktarr_core::error::{SourceError, SourceErrorKind};
use booktarr_core::fetch::ResponseCache;
use booktarr_core::sources::SourceClient;
use booktarr_core::EnrichmentEngine;
use booktarr_model::{CanonicalRecord, Isbn, MetadataSource};

/// A canned source: returns the same record for every ISBN, or a
/// fixed result list for title searches, or always fails, or never
/// answers at all.
pub struct StubSource {
    name: String,
    record: Option<CanonicalRecord>,
    search_results: Vec<CanonicalRecord>,
    failure: Option<SourceErrorKind>,
    hang: bool,
    pub calls: AtomicUsize,
}

impl StubSource {
    pub fn returning(name: &str, record: CanonicalRecord) -> Self {
        Self {
            name: name.to_string(),
            record: Some(record),
            search_results: Vec::new(),
            failure: None,
            hang: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn empty(name: &str) -> Self {
        Self {
            name: name.to_string(),
            record: None,
            search_results: Vec::new(),
            failure: None,
            hang: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(name: &str, kind: SourceErrorKind) -> Self {
        Self {
            name: name.to_string(),
            record: None,
            search_results: Vec::new(),
            failure: Some(kind),
            hang: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn searching(name: &str, results: Vec<CanonicalRecord>) -> Self {
        Self {
            name: name.to_string(),
            record: None,
            search_results: results,
            failure: None,
            hang: false,
            calls: AtomicUsize::new(0),
        }
    }

    /// Parks every lookup forever, for cancellation tests.
    pub fn hanging(name: &str) -> Self {
        Self {
            name: name.to_string(),
            record: None,
            search_results: Vec::new(),
            failure: None,
            hang: true,
            calls: AtomicUsize::new(0),
        }
    }

    fn fail(&self) -> Option<SourceError> {
        self.failure.map(|kind| match kind {
            SourceErrorKind::Transient => SourceError::transient(&self.name, "stub outage"),
            SourceErrorKind::Permanent => SourceError::permanent(&self.name, "stub rejection"),
            SourceErrorKind::NotFound => SourceError::not_found(&self.name, "stub 404"),
        })
    }
}

#[async_trait]
impl SourceClient for StubSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch_by_isbn(&self, _isbn: &Isbn) -> Result<Option<CanonicalRecord>, SourceError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if self.hang {
            futures::future::pending::<()>().await;
        }
        if let Some(err) = self.fail() {
            return Err(err);
        }
        Ok(self.record.clone())
    }

    async fn search_by_title(
        &self,
        _query: &str,
        limit: usize,
    ) -> Result<Vec<CanonicalRecord>, SourceError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if let Some(err) = self.fail() {
            return Err(err);
        }
        Ok(self.search_results.iter().take(limit).cloned().collect())
    }

    async fn search_by_author(
        &self,
        _query: &str,
        limit: usize,
    ) -> Result<Vec<CanonicalRecord>, SourceError> {
        self.search_by_title(_query, limit).await
    }

    async fn search_series<'a>(
        &'a self,
        _name: &'a str,
        _author: Option<&'a str>,
        limit: usize,
    ) -> Result<Vec<CanonicalRecord>, SourceError> {
        self.search_by_title(_name, limit).await
    }
}

pub struct Harness {
    pub repository: Arc<MemoryLibraryRepository>,
    pub cache: Arc<ResponseCache>,
    pub engine: Arc<EnrichmentEngine>,
}

pub fn harness(clients: Vec<Arc<dyn SourceClient>>) -> Harness {
    let repository = Arc::new(MemoryLibraryRepository::new());
    let cache = Arc::new(ResponseCache::new(&CacheSettings::default()));
    let engine = Arc::new(EnrichmentEngine::new(
        repository.clone() as Arc<dyn booktarr_core::LibraryRepository>,
        cache.clone(),
        clients,
        EnrichmentSettings {
            inter_batch_delay_ms: 0,
            ..Default::default()
        },
    ));
    Harness {
        repository,
        cache,
        engine,
    }
}

/// A minimal stored record, as the ingestion path would create it.
pub fn stub_record(title: &str, authors: &[&str], isbn13: &str) -> CanonicalRecord {
    let mut record = CanonicalRecord {
        title: Some(title.to_string()),
        authors: authors.iter().map(|a| a.to_string()).collect(),
        source: Some(MetadataSource::Import),
        ..Default::default()
    };
    match Isbn::parse(isbn13).expect("valid fixture isbn") {
        Isbn::Ten(isbn10) => record.isbn_10 = Some(isbn10),
        Isbn::Thirteen(isbn13) => record.isbn_13 = Some(isbn13),
    }
    record
}

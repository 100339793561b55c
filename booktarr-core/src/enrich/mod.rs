//! The enrichment engine: fans a query out across the configured
//! source clients, merges what comes back under precedence rules, and
//! persists the result through the gateway.

pub mod merge;
pub mod search;

use std::sync::Arc;
use std::time::Duration;

use booktarr_model::{BookWithEdition, CanonicalRecord, Isbn, looks_like_isbn};
use dashmap::DashMap;
use futures::future::join_all;
use futures::stream::TryStreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EnrichmentSettings;
use crate::database::LibraryRepository;
use crate::error::{CoreError, Result};
use crate::fetch::{ResponseCache, fingerprint};
use crate::sources::SourceClient;

pub use merge::{merge_records, record_from_stored};
pub use search::ScoredRecord;

use search::RawHit;

const SEARCH_RESULT_TTL: Duration = Duration::from_secs(30 * 60);

/// Result of a single-ISBN enrichment.
#[derive(Debug)]
pub enum EnrichmentOutcome {
    Completed {
        original: Box<BookWithEdition>,
        enriched: Box<BookWithEdition>,
        sources_used: Vec<String>,
    },
    CachedHit {
        enriched: Box<CanonicalRecord>,
    },
    NotFound,
    Failed {
        reason: String,
        sources_tried: Vec<String>,
    },
}

/// Tally of a bulk enrichment run.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub total: usize,
    pub enriched: usize,
    pub cached: usize,
    pub not_found: usize,
    pub failed: usize,
    pub cancelled: bool,
}

pub struct EnrichmentEngine {
    repository: Arc<dyn LibraryRepository>,
    cache: Arc<ResponseCache>,
    /// Precedence order: index 0 merges and ranks first.
    clients: Vec<Arc<dyn SourceClient>>,
    settings: EnrichmentSettings,
    /// Per-ISBN guards so concurrent enrichments of the same ISBN
    /// coalesce instead of racing the persistence step.
    in_flight: DashMap<String, Arc<Mutex<()>>>,
}

impl std::fmt::Debug for EnrichmentEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnrichmentEngine")
            .field("clients", &self.clients.len())
            .field("settings", &self.settings)
            .finish()
    }
}

impl EnrichmentEngine {
    pub fn new(
        repository: Arc<dyn LibraryRepository>,
        cache: Arc<ResponseCache>,
        clients: Vec<Arc<dyn SourceClient>>,
        settings: EnrichmentSettings,
    ) -> Self {
        Self {
            repository,
            cache,
            clients,
            settings,
            in_flight: DashMap::new(),
        }
    }

    /// Enrich one already-stored ISBN. Strictly an enhancement
    /// operation: a stub book and edition must exist first. A cancel
    /// aborts the call at its next suspension point, including while
    /// waiting on a coalesced in-flight enrichment or mid-fetch.
    pub async fn enrich_by_isbn(
        &self,
        isbn: &Isbn,
        force_refresh: bool,
        cancel: &CancellationToken,
    ) -> Result<EnrichmentOutcome> {
        let canonical = isbn.canonical();
        let cache_key = format!("enriched:{canonical}");

        let guard = self
            .in_flight
            .entry(canonical.as_str().to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let result = tokio::select! {
            held = guard.lock() => {
                let result = self.enrich_locked(isbn, force_refresh, &cache_key, cancel).await;
                drop(held);
                result
            }
            _ = cancel.cancelled() => Err(CoreError::Cancelled(format!(
                "enrichment of {} cancelled",
                isbn.as_str()
            ))),
        };

        drop(guard);
        self.in_flight
            .remove_if(canonical.as_str(), |_, lock| Arc::strong_count(lock) <= 2);

        result
    }

    async fn enrich_locked(
        &self,
        isbn: &Isbn,
        force_refresh: bool,
        cache_key: &str,
        cancel: &CancellationToken,
    ) -> Result<EnrichmentOutcome> {
        let Some(stored) = self.repository.get_book_by_isbn(isbn).await? else {
            return Ok(EnrichmentOutcome::Failed {
                reason: format!("ISBN {} is not in the library", isbn.as_str()),
                sources_tried: Vec::new(),
            });
        };

        if !force_refresh {
            if let Some(payload) = self.cache.get_api_response(cache_key).await {
                match serde_json::from_value::<CanonicalRecord>(payload) {
                    Ok(record) => {
                        debug!(isbn = isbn.as_str(), "enrichment served from cache");
                        return Ok(EnrichmentOutcome::CachedHit {
                            enriched: Box::new(record),
                        });
                    }
                    Err(err) => {
                        warn!(isbn = isbn.as_str(), %err, "discarding undecodable enrichment cache entry");
                    }
                }
            }
        }

        let lookups = self.clients.iter().map(|client| {
            let client = Arc::clone(client);
            async move {
                let name = client.name().to_string();
                let result = client.fetch_by_isbn(isbn).await;
                (name, result)
            }
        });

        // Dropping the fan-out on cancel tears down every in-flight
        // request, retry sleep, and rate-limiter wait with it.
        let results = tokio::select! {
            results = join_all(lookups) => results,
            _ = cancel.cancelled() => {
                return Err(CoreError::Cancelled(format!(
                    "enrichment of {} cancelled",
                    isbn.as_str()
                )));
            }
        };

        let mut fetched = Vec::new();
        let mut sources_used = Vec::new();
        let mut sources_tried = Vec::new();
        let mut failures = Vec::new();

        for (name, result) in results {
            sources_tried.push(name.clone());
            match result {
                Ok(Some(record)) => {
                    debug!(isbn = isbn.as_str(), source = %name, "source returned a record");
                    sources_used.push(name);
                    fetched.push(record);
                }
                Ok(None) => {}
                Err(err) if err.is_not_found() => {}
                Err(err) => {
                    warn!(isbn = isbn.as_str(), source = %name, %err, "source failed");
                    failures.push(err);
                }
            }
        }

        if fetched.is_empty() {
            if !failures.is_empty() && failures.len() == self.clients.len() {
                return Ok(EnrichmentOutcome::Failed {
                    reason: failures
                        .iter()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>()
                        .join("; "),
                    sources_tried,
                });
            }
            return Ok(EnrichmentOutcome::NotFound);
        }

        let merged = merge_records(&record_from_stored(&stored), &fetched);
        let enriched = self.repository.upsert_book_and_edition(&merged).await?;

        if let Ok(payload) = serde_json::to_value(&merged) {
            self.cache
                .set_api_response(cache_key, payload, Some(self.settings.long_ttl()))
                .await;
        }

        info!(isbn = isbn.as_str(), sources = ?sources_used, "enrichment completed");
        Ok(EnrichmentOutcome::Completed {
            original: Box::new(stored),
            enriched: Box::new(enriched),
            sources_used,
        })
    }

    /// Drive `enrich_by_isbn` over every persisted ISBN in bounded
    /// batches, pausing between batches for the slowest source's rate
    /// limit. A cancel aborts new batches; finished work stands.
    pub async fn enrich_all(
        &self,
        force_refresh: bool,
        cancel: CancellationToken,
    ) -> Result<BatchOutcome> {
        let isbns: Vec<_> = self.repository.all_edition_isbns().try_collect().await?;

        let mut outcome = BatchOutcome {
            total: isbns.len(),
            ..Default::default()
        };

        for batch in isbns.chunks(self.settings.batch_size.max(1)) {
            if cancel.is_cancelled() {
                outcome.cancelled = true;
                break;
            }

            let results = join_all(batch.iter().map(|isbn13| {
                let isbn = Isbn::Thirteen(isbn13.clone());
                let cancel = cancel.clone();
                async move { self.enrich_by_isbn(&isbn, force_refresh, &cancel).await }
            }))
            .await;

            for result in results {
                match result {
                    Ok(EnrichmentOutcome::Completed { .. }) => outcome.enriched += 1,
                    Ok(EnrichmentOutcome::CachedHit { .. }) => outcome.cached += 1,
                    Ok(EnrichmentOutcome::NotFound) => outcome.not_found += 1,
                    Ok(EnrichmentOutcome::Failed { reason, .. }) => {
                        warn!(%reason, "bulk enrichment entry failed");
                        outcome.failed += 1;
                    }
                    Err(CoreError::Cancelled(_)) => outcome.cancelled = true,
                    Err(err) => {
                        warn!(%err, "bulk enrichment entry errored");
                        outcome.failed += 1;
                    }
                }
            }

            info!(
                processed = outcome.enriched + outcome.cached + outcome.not_found + outcome.failed,
                total = outcome.total,
                "bulk enrichment progress"
            );

            tokio::select! {
                _ = cancel.cancelled() => {
                    outcome.cancelled = true;
                    break;
                }
                _ = tokio::time::sleep(self.settings.inter_batch_delay()) => {}
            }
        }

        Ok(outcome)
    }

    /// Free-text or ISBN search across every source, deduplicated and
    /// ranked. Results cache for thirty minutes.
    pub async fn search(&self, query: &str, limit: usize) -> Result<Vec<ScoredRecord>> {
        let query = query.trim();
        if query.is_empty() {
            return Err(CoreError::InvalidInput("empty search query".to_string()));
        }
        let limit = limit.max(1);

        let limit_str = limit.to_string();
        let cache_key = fingerprint("search", &query.to_lowercase(), &[("limit", &limit_str)]);
        if let Some(payload) = self.cache.get_api_response(&cache_key).await {
            if let Ok(results) = serde_json::from_value::<Vec<ScoredRecord>>(payload) {
                debug!(query, "search served from cache");
                return Ok(results);
            }
        }

        let results = if looks_like_isbn(query) {
            self.search_isbn(query).await
        } else {
            self.search_text(query, limit).await
        };

        if let Ok(payload) = serde_json::to_value(&results) {
            self.cache
                .set_api_response(&cache_key, payload, Some(SEARCH_RESULT_TTL))
                .await;
        }

        Ok(results)
    }

    /// ISBN lookup: the union of per-source hits, one per source that
    /// responded, scored by the precedence prior alone.
    async fn search_isbn(&self, query: &str) -> Vec<ScoredRecord> {
        let Ok(isbn) = Isbn::parse(query) else {
            // ISBN-shaped but failing its check digit finds nothing.
            return Vec::new();
        };

        let lookups = self.clients.iter().enumerate().map(|(precedence, client)| {
            let client = Arc::clone(client);
            let isbn = isbn.clone();
            async move {
                let name = client.name().to_string();
                (precedence, name, client.fetch_by_isbn(&isbn).await)
            }
        });

        let mut results = Vec::new();
        for (precedence, source, result) in join_all(lookups).await {
            match result {
                Ok(Some(record)) => results.push(ScoredRecord {
                    record,
                    score: search::base_prior(precedence),
                    source,
                }),
                Ok(None) => {}
                Err(err) if err.is_not_found() => {}
                Err(err) => warn!(source = %err.source, %err, "isbn search source failed"),
            }
        }
        results
    }

    async fn search_text(&self, query: &str, limit: usize) -> Vec<ScoredRecord> {
        let per_source = (limit / 2).max(1);

        let searches = self.clients.iter().enumerate().map(|(precedence, client)| {
            let client = Arc::clone(client);
            async move {
                let name = client.name().to_string();
                (precedence, name, client.search_by_title(query, per_source).await)
            }
        });

        let mut hits = Vec::new();
        for (precedence, source, result) in join_all(searches).await {
            match result {
                Ok(records) => {
                    for (position, record) in records.into_iter().enumerate() {
                        hits.push(RawHit {
                            record,
                            source: source.clone(),
                            precedence,
                            position,
                        });
                    }
                }
                Err(err) if err.is_not_found() => {}
                Err(err) => warn!(source = %source, %err, "text search source failed"),
            }
        }

        // Precedence-order the pool so dedup keeps the right hit.
        hits.sort_by_key(|hit| (hit.precedence, hit.position));
        search::dedupe_and_rank(hits, &query.to_lowercase(), limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheSettings;
    use crate::database::MemoryLibraryRepository;
    use crate::sources::MockSourceClient;
    use booktarr_model::MetadataSource;

    #[tokio::test]
    async fn concurrent_enrichments_of_one_isbn_coalesce() {
        let repository = Arc::new(MemoryLibraryRepository::new());
        let seed = CanonicalRecord {
            title: Some("Stub".to_string()),
            authors: vec!["Author".to_string()],
            isbn_13: Some(booktarr_model::Isbn13::new("9780439708180").unwrap()),
            source: Some(MetadataSource::Import),
            ..Default::default()
        };
        repository.upsert_book_and_edition(&seed).await.unwrap();

        let mut mock = MockSourceClient::new();
        mock.expect_name().return_const("mock".to_string());
        mock.expect_fetch_by_isbn().times(1).returning(|_| {
            Ok(Some(CanonicalRecord {
                title: Some("Enriched".to_string()),
                source: Some(MetadataSource::GoogleBooks),
                ..Default::default()
            }))
        });

        let engine = EnrichmentEngine::new(
            repository as Arc<dyn LibraryRepository>,
            Arc::new(ResponseCache::new(&CacheSettings::default())),
            vec![Arc::new(mock)],
            EnrichmentSettings::default(),
        );

        let isbn = Isbn::parse("9780439708180").unwrap();
        let cancel = CancellationToken::new();
        let (first, second) = tokio::join!(
            engine.enrich_by_isbn(&isbn, false, &cancel),
            engine.enrich_by_isbn(&isbn, false, &cancel)
        );

        // The second caller waits out the first and lands on its
        // cached result; the mock's times(1) guards the fetch count.
        let outcomes = [first.unwrap(), second.unwrap()];
        assert_eq!(
            outcomes
                .iter()
                .filter(|o| matches!(o, EnrichmentOutcome::Completed { .. }))
                .count(),
            1
        );
        assert_eq!(
            outcomes
                .iter()
                .filter(|o| matches!(o, EnrichmentOutcome::CachedHit { .. }))
                .count(),
            1
        );
    }
}

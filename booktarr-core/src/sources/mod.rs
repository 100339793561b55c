//! Source clients: one uniform contract per external bibliographic
//! API. Adding a source means implementing [`SourceClient`] and
//! registering its precedence in the configuration.

pub mod google_books;
pub mod normalize;
pub mod open_library;

use std::sync::Arc;

use async_trait::async_trait;
use booktarr_model::{CanonicalRecord, Isbn};
use tracing::warn;

use crate::config::AppConfig;
use crate::error::{CoreError, SourceError};
use crate::fetch::ResponseCache;

pub use google_books::GoogleBooksSource;
pub use open_library::OpenLibrarySource;

/// Uniform contract over one external bibliographic API. Every method
/// consults the response cache, acquires the source's rate limiter on
/// miss, issues the HTTP request with bounded timeouts, and returns
/// payloads normalized to [`CanonicalRecord`].
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SourceClient: Send + Sync {
    /// Stable source name; used for cache scoping, configuration,
    /// provenance, and precedence lookup.
    fn name(&self) -> &str;

    async fn fetch_by_isbn(&self, isbn: &Isbn) -> Result<Option<CanonicalRecord>, SourceError>;

    async fn search_by_title(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<CanonicalRecord>, SourceError>;

    async fn search_by_author(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<CanonicalRecord>, SourceError>;

    async fn search_series<'a>(
        &'a self,
        name: &'a str,
        author: Option<&'a str>,
        limit: usize,
    ) -> Result<Vec<CanonicalRecord>, SourceError>;
}

/// Build the configured clients in precedence order. Unrecognized
/// source names are skipped with a warning so a config typo degrades
/// instead of failing startup.
pub fn build_source_clients(
    config: &AppConfig,
    cache: &Arc<ResponseCache>,
) -> Result<Vec<Arc<dyn SourceClient>>, CoreError> {
    let mut clients: Vec<Arc<dyn SourceClient>> = Vec::new();

    for settings in config.sources_by_precedence() {
        match settings.name.as_str() {
            "google_books" => {
                clients.push(Arc::new(GoogleBooksSource::new(settings, Arc::clone(cache))?));
            }
            "open_library" => {
                clients.push(Arc::new(OpenLibrarySource::new(settings, Arc::clone(cache))?));
            }
            other => warn!(source = other, "no client registered for configured source"),
        }
    }

    Ok(clients)
}

pub(crate) fn require_query(source: &str, query: &str) -> Result<(), SourceError> {
    if query.trim().is_empty() {
        return Err(SourceError::permanent(source, "empty search query"));
    }
    Ok(())
}

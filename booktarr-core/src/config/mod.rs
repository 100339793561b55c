//! Runtime configuration for the enrichment core.
//!
//! Settings load from an optional `booktarr.toml` with `BOOKTARR_*`
//! environment overrides layered on top. Every struct carries full
//! defaults so a bare process runs with sensible limits.

use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// One external bibliographic source: identity, merge precedence, and
/// the limits its API publishes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceSettings {
    pub name: String,
    /// Merge/ranking precedence; lower ranks first.
    pub precedence: u32,
    pub per_second: u32,
    pub per_minute: u32,
    pub api_key: Option<String>,
    pub timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub max_retries: u32,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            name: String::new(),
            precedence: 0,
            per_second: 10,
            per_minute: 1000,
            api_key: None,
            timeout_ms: 30_000,
            connect_timeout_ms: 10_000,
            max_retries: 3,
        }
    }
}

impl SourceSettings {
    pub fn google_books() -> Self {
        Self {
            name: "google_books".to_string(),
            precedence: 0,
            per_second: 10,
            per_minute: 1000,
            ..Default::default()
        }
    }

    pub fn open_library() -> Self {
        Self {
            name: "open_library".to_string(),
            precedence: 1,
            per_second: 2,
            per_minute: 100,
            ..Default::default()
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Book-record shard TTL (7 days).
    pub book_ttl_s: u64,
    /// API-response shard TTL (24 hours).
    pub api_ttl_s: u64,
    /// Fetched-page shard TTL (2 hours).
    pub page_ttl_s: u64,
    pub max_entries: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            book_ttl_s: 7 * 24 * 3600,
            api_ttl_s: 24 * 3600,
            page_ttl_s: 2 * 3600,
            max_entries: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnrichmentSettings {
    /// Concurrent enrichments per batch in bulk runs.
    pub batch_size: usize,
    /// Cooperative pause between batches, for the slowest source.
    pub inter_batch_delay_ms: u64,
    /// TTL for merged enrichment results (30 days).
    pub long_ttl_s: u64,
}

impl Default for EnrichmentSettings {
    fn default() -> Self {
        Self {
            batch_size: 5,
            inter_batch_delay_ms: 1000,
            long_ttl_s: 30 * 24 * 3600,
        }
    }
}

impl EnrichmentSettings {
    pub fn inter_batch_delay(&self) -> Duration {
        Duration::from_millis(self.inter_batch_delay_ms)
    }

    pub fn long_ttl(&self) -> Duration {
        Duration::from_secs(self.long_ttl_s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestionSettings {
    /// Concurrent rows in flight.
    pub concurrency: usize,
    pub skip_duplicates_default: bool,
    pub enrich_default: bool,
    /// Sample rows returned by import preview.
    pub preview_rows: usize,
}

impl Default for IngestionSettings {
    fn default() -> Self {
        Self {
            concurrency: 5,
            skip_duplicates_default: true,
            enrich_default: true,
            preview_rows: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub sources: Vec<SourceSettings>,
    pub cache: CacheSettings,
    pub enrichment: EnrichmentSettings,
    pub ingestion: IngestionSettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            sources: vec![SourceSettings::google_books(), SourceSettings::open_library()],
            cache: CacheSettings::default(),
            enrichment: EnrichmentSettings::default(),
            ingestion: IngestionSettings::default(),
        }
    }
}

impl AppConfig {
    /// Layer `booktarr.toml` (optional, current directory) and
    /// `BOOKTARR_*` environment variables over the defaults.
    pub fn load() -> Result<Self> {
        let builder = Config::builder()
            .add_source(File::with_name("booktarr").required(false))
            .add_source(Environment::with_prefix("BOOKTARR").separator("__"));

        builder
            .build()
            .and_then(Config::try_deserialize)
            .map_err(|e| CoreError::InvalidInput(format!("configuration error: {e}")))
    }

    /// Load from an explicit config file path, without env layering.
    pub fn load_from(path: &Path) -> Result<Self> {
        Config::builder()
            .add_source(File::from(path))
            .build()
            .and_then(Config::try_deserialize)
            .map_err(|e| CoreError::InvalidInput(format!("configuration error: {e}")))
    }

    /// Sources in precedence order (rank 0 first). Name ties keep the
    /// declared order.
    pub fn sources_by_precedence(&self) -> Vec<&SourceSettings> {
        let mut ordered: Vec<&SourceSettings> = self.sources.iter().collect();
        ordered.sort_by_key(|s| s.precedence);
        ordered
    }

    pub fn source(&self, name: &str) -> Option<&SourceSettings> {
        self.sources.iter().find(|s| s.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_cover_both_builtin_sources() {
        let config = AppConfig::default();
        let ordered = config.sources_by_precedence();
        assert_eq!(ordered[0].name, "google_books");
        assert_eq!(ordered[1].name, "open_library");
        assert_eq!(ordered[1].per_second, 2);
        assert_eq!(config.enrichment.batch_size, 5);
        assert!(config.ingestion.skip_duplicates_default);
    }

    #[test]
    fn file_overrides_limits_per_source() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        writeln!(
            file,
            r#"
[[sources]]
name = "google_books"
precedence = 1
per_second = 3
per_minute = 120

[[sources]]
name = "open_library"
precedence = 0

[enrichment]
batch_size = 2
"#
        )
        .unwrap();

        let config = AppConfig::load_from(file.path()).unwrap();
        assert_eq!(config.enrichment.batch_size, 2);
        assert_eq!(config.sources_by_precedence()[0].name, "open_library");
        assert_eq!(config.source("google_books").unwrap().per_second, 3);
        // Unset fields fall back to the struct defaults.
        assert_eq!(config.source("open_library").unwrap().max_retries, 3);
    }
}

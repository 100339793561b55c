//! The rate-limited, cached fetch layer every source client sits on.

pub mod cache;
pub mod durable;
pub mod http;
pub mod rate_limit;

pub use cache::{CacheStats, ResponseCache, ResponseCacheStats, TtlLruCache, fingerprint};
pub use durable::{DurableResponseStore, PostgresResponseStore};
pub use http::SourceFetcher;
pub use rate_limit::RateLimiter;

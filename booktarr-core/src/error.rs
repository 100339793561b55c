use std::fmt;

use thiserror::Error;

/// How a source failure should be treated by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceErrorKind {
    /// Network failures, 5xx, 429. Retried inside the fetch layer;
    /// captured per-source by the engine once retries are exhausted.
    Transient,
    /// 4xx other than 404. Never retried.
    Permanent,
    /// 404 or an empty payload. Not an error for callers that can
    /// proceed without the source.
    NotFound,
}

/// A failure from one external bibliographic source.
#[derive(Debug, Clone)]
pub struct SourceError {
    pub kind: SourceErrorKind,
    pub source: String,
    pub detail: String,
}

impl SourceError {
    pub fn transient(source: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            kind: SourceErrorKind::Transient,
            source: source.into(),
            detail: detail.into(),
        }
    }

    pub fn permanent(source: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            kind: SourceErrorKind::Permanent,
            source: source.into(),
            detail: detail.into(),
        }
    }

    pub fn not_found(source: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            kind: SourceErrorKind::NotFound,
            source: source.into(),
            detail: detail.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == SourceErrorKind::Transient
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == SourceErrorKind::NotFound
    }
}

impl fmt::Display for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            SourceErrorKind::Transient => "transient",
            SourceErrorKind::Permanent => "permanent",
            SourceErrorKind::NotFound => "not found",
        };
        write!(f, "{} ({kind}): {}", self.source, self.detail)
    }
}

impl std::error::Error for SourceError {}

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::Database(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;

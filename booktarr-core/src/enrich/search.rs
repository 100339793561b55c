//! Relevance scoring and ranking for multi-source search.

use std::cmp::Ordering;

use booktarr_model::CanonicalRecord;
use serde::{Deserialize, Serialize};

/// One ranked search hit with its provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredRecord {
    pub record: CanonicalRecord,
    pub score: f64,
    pub source: String,
}

/// A raw per-source result with the context scoring needs.
#[derive(Debug)]
pub(crate) struct RawHit {
    pub record: CanonicalRecord,
    pub source: String,
    /// Index of the source in precedence order; sets the base prior.
    pub precedence: usize,
    /// Result position within its source's list.
    pub position: usize,
}

/// Precedence prior: 1.0 for the first source, 0.9 for the next, and
/// so on down.
pub(crate) fn base_prior(precedence: usize) -> f64 {
    (1.0 - 0.1 * precedence as f64).max(0.1)
}

/// base − 0.1·position + field-match bonuses, capped at 1.0.
pub(crate) fn relevance_score(hit: &RawHit, query_lower: &str) -> f64 {
    let base = base_prior(hit.precedence) - 0.1 * hit.position as f64;
    let mut bonus = 0.0;

    if let Some(title) = &hit.record.title {
        let title = title.to_lowercase();
        if title.starts_with(query_lower) {
            bonus += 0.5;
        } else if title.contains(query_lower) {
            bonus += 0.3;
        }
    }

    let mut author_bonus: f64 = 0.0;
    for author in &hit.record.authors {
        let author = author.to_lowercase();
        if author.starts_with(query_lower) {
            author_bonus = author_bonus.max(0.3);
        } else if author.contains(query_lower) {
            author_bonus = author_bonus.max(0.2);
        }
    }
    bonus += author_bonus;

    if let Some(series) = &hit.record.series {
        if series.to_lowercase().contains(query_lower) {
            bonus += 0.1;
        }
    }
    if let Some(publisher) = &hit.record.publisher {
        if publisher.to_lowercase().contains(query_lower) {
            bonus += 0.05;
        }
    }

    (base + bonus).clamp(0.0, 1.0)
}

/// Deduplicate by canonical ISBN-13 (first hit in precedence order
/// wins), score, and rank. Hits without any ISBN cannot participate
/// in dedup and are dropped, matching the lookup-oriented contract.
pub(crate) fn dedupe_and_rank(
    hits: Vec<RawHit>,
    query_lower: &str,
    limit: usize,
) -> Vec<ScoredRecord> {
    let mut seen: Vec<String> = Vec::new();
    let mut unique: Vec<(RawHit, f64)> = Vec::new();

    for hit in hits {
        let Some(isbn) = hit.record.canonical_isbn13() else {
            continue;
        };
        let key = isbn.into_string();
        if seen.contains(&key) {
            continue;
        }
        seen.push(key);

        let score = relevance_score(&hit, query_lower);
        unique.push((hit, score));
    }

    unique.sort_by(|(a, a_score), (b, b_score)| {
        b_score
            .partial_cmp(a_score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.precedence.cmp(&b.precedence))
            .then_with(|| a.record.title.cmp(&b.record.title))
    });

    unique
        .into_iter()
        .take(limit)
        .map(|(hit, score)| ScoredRecord {
            record: hit.record,
            score,
            source: hit.source,
        })
        .collect()
}

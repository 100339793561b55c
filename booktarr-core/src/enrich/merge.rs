//! Deterministic merge of source records over the stored record.
//!
//! `fetched` arrives in source-precedence order (highest first). The
//! output is the complete post-merge state: the gateway writes it
//! verbatim, including the full pricing list.

use booktarr_model::{BookWithEdition, CanonicalRecord, PriceSnapshot};

/// Fields that always prefer the freshest non-empty enriched value
/// over the stored one: title, thumbnail, description, page count,
/// published date. Everything else fills only when the stored value
/// is empty.
pub fn merge_records(original: &CanonicalRecord, fetched: &[CanonicalRecord]) -> CanonicalRecord {
    let mut merged = original.clone();

    merged.title = freshest(fetched, |r| r.title.clone()).or_else(|| original.title.clone());
    merged.thumbnail_url =
        freshest(fetched, |r| r.thumbnail_url.clone()).or_else(|| original.thumbnail_url.clone());
    merged.description =
        freshest(fetched, |r| r.description.clone()).or_else(|| original.description.clone());
    merged.page_count = freshest(fetched, |r| r.page_count).or(original.page_count);
    merged.published_date = freshest(fetched, |r| r.published_date).or(original.published_date);

    merged.subtitle = original
        .subtitle
        .clone()
        .or_else(|| freshest(fetched, |r| r.subtitle.clone()));
    merged.original_title = original
        .original_title
        .clone()
        .or_else(|| freshest(fetched, |r| r.original_title.clone()));
    merged.publisher = original
        .publisher
        .clone()
        .or_else(|| freshest(fetched, |r| r.publisher.clone()));
    merged.language = original
        .language
        .clone()
        .or_else(|| freshest(fetched, |r| r.language.clone()));
    merged.series = original
        .series
        .clone()
        .or_else(|| freshest(fetched, |r| r.series.clone()));
    merged.series_position = original
        .series_position
        .or_else(|| freshest(fetched, |r| r.series_position));
    merged.isbn_10 = original
        .isbn_10
        .clone()
        .or_else(|| freshest(fetched, |r| r.isbn_10.clone()));
    merged.isbn_13 = original
        .isbn_13
        .clone()
        .or_else(|| freshest(fetched, |r| r.isbn_13.clone()));

    // Set-valued fields union across sources; first-seen order wins
    // for display.
    merged.authors = union_strings(&original.authors, fetched.iter().map(|r| &r.authors));
    merged.categories = union_strings(&original.categories, fetched.iter().map(|r| &r.categories));

    // Pricing appends: every source is a separate price point.
    let mut pricing: Vec<PriceSnapshot> = original.pricing.clone();
    for record in fetched {
        pricing.extend(record.pricing.iter().cloned());
    }
    merged.pricing = pricing;

    // Provenance goes to the highest-precedence contributor.
    merged.source = fetched
        .iter()
        .find_map(|r| r.source)
        .or(original.source);

    merged
}

/// View of the persisted pair as a canonical record, for merging.
pub fn record_from_stored(stored: &BookWithEdition) -> CanonicalRecord {
    let book = &stored.book;
    let edition = &stored.edition;

    CanonicalRecord {
        isbn_10: edition.isbn_10.clone(),
        isbn_13: edition.isbn_13.clone(),
        title: non_empty(&book.title),
        subtitle: None,
        original_title: book.original_title.clone(),
        authors: book.authors.clone(),
        series: book.series_name.clone(),
        series_position: book.series_position,
        publisher: edition.publisher.clone(),
        published_date: edition.release_date,
        page_count: edition.page_count,
        language: edition.language.clone().or_else(|| book.language.clone()),
        thumbnail_url: edition.cover_url.clone(),
        description: book.description.clone(),
        categories: book.categories.clone(),
        pricing: edition.pricing.clone(),
        source: None,
    }
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn freshest<T, F>(fetched: &[CanonicalRecord], pick: F) -> Option<T>
where
    F: Fn(&CanonicalRecord) -> Option<T>,
{
    fetched.iter().find_map(pick)
}

fn union_strings<'a>(
    base: &'a [String],
    others: impl Iterator<Item = &'a Vec<String>>,
) -> Vec<String> {
    let mut seen: Vec<String> = Vec::new();
    let mut out: Vec<String> = Vec::new();

    for value in base.iter().chain(others.flatten()) {
        let key = value.trim().to_lowercase();
        if key.is_empty() || seen.contains(&key) {
            continue;
        }
        seen.push(key);
        out.push(value.trim().to_string());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use booktarr_model::MetadataSource;

    fn record(source: MetadataSource) -> CanonicalRecord {
        CanonicalRecord {
            source: Some(source),
            ..Default::default()
        }
    }

    #[test]
    fn fresh_fields_replace_stored_values() {
        let original = CanonicalRecord {
            title: Some("Harry Potter 1".to_string()),
            page_count: Some(200),
            ..Default::default()
        };
        let fetched = CanonicalRecord {
            title: Some("Harry Potter and the Sorcerer's Stone".to_string()),
            page_count: Some(309),
            description: Some("The boy who lived.".to_string()),
            ..record(MetadataSource::GoogleBooks)
        };

        let merged = merge_records(&original, &[fetched]);
        assert_eq!(
            merged.title.as_deref(),
            Some("Harry Potter and the Sorcerer's Stone")
        );
        assert_eq!(merged.page_count, Some(309));
        assert_eq!(merged.description.as_deref(), Some("The boy who lived."));
        assert_eq!(merged.source, Some(MetadataSource::GoogleBooks));
    }

    #[test]
    fn fill_fields_keep_stored_values() {
        let original = CanonicalRecord {
            publisher: Some("Original House".to_string()),
            language: Some("en".to_string()),
            ..Default::default()
        };
        let fetched = CanonicalRecord {
            publisher: Some("Other House".to_string()),
            language: Some("fr".to_string()),
            ..record(MetadataSource::GoogleBooks)
        };

        let merged = merge_records(&original, &[fetched]);
        assert_eq!(merged.publisher.as_deref(), Some("Original House"));
        assert_eq!(merged.language.as_deref(), Some("en"));
    }

    #[test]
    fn scalar_precedence_favors_the_first_source() {
        let original = CanonicalRecord::default();
        let a = CanonicalRecord {
            publisher: Some("A-Pub".to_string()),
            ..record(MetadataSource::GoogleBooks)
        };
        let b = CanonicalRecord {
            publisher: Some("B-Pub".to_string()),
            page_count: Some(200),
            ..record(MetadataSource::OpenLibrary)
        };

        let merged = merge_records(&original, &[a, b]);
        assert_eq!(merged.publisher.as_deref(), Some("A-Pub"));
        // The lower-precedence source still fills what A lacked.
        assert_eq!(merged.page_count, Some(200));
        assert_eq!(merged.source, Some(MetadataSource::GoogleBooks));
    }

    #[test]
    fn set_fields_union_in_first_seen_order() {
        let original = CanonicalRecord {
            authors: vec!["J.K. Rowling".to_string()],
            categories: vec!["Fantasy".to_string()],
            ..Default::default()
        };
        let a = CanonicalRecord {
            authors: vec!["J.K. Rowling".to_string(), "Mary GrandPré".to_string()],
            categories: vec!["Juvenile Fiction".to_string()],
            ..record(MetadataSource::GoogleBooks)
        };
        let b = CanonicalRecord {
            categories: vec!["fantasy".to_string(), "Magic".to_string()],
            ..record(MetadataSource::OpenLibrary)
        };

        let merged = merge_records(&original, &[a, b]);
        assert_eq!(merged.authors, vec!["J.K. Rowling", "Mary GrandPré"]);
        // Case-insensitive dedupe keeps the first spelling.
        assert_eq!(merged.categories, vec!["Fantasy", "Juvenile Fiction", "Magic"]);
    }

    #[test]
    fn pricing_appends_without_dedupe() {
        use chrono::Utc;
        let snapshot = |source: &str, price: f64| PriceSnapshot {
            source: source.to_string(),
            price,
            currency: "USD".to_string(),
            captured_at: Utc::now(),
        };

        let original = CanonicalRecord {
            pricing: vec![snapshot("google_books", 8.99)],
            ..Default::default()
        };
        let fetched = CanonicalRecord {
            pricing: vec![snapshot("google_books", 8.99), snapshot("open_library", 7.50)],
            ..record(MetadataSource::GoogleBooks)
        };

        let merged = merge_records(&original, &[fetched]);
        assert_eq!(merged.pricing.len(), 3);
    }
}

//! Normalization applied to every vendor payload before it leaves a
//! source client as a `CanonicalRecord`.

use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;

static HTML_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]*>").unwrap());

// Series heuristics, tried in order against the raw title.
static SERIES_NUMBERED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(.+?)\s+(?:Book|Volume|#)\s*(\d+)").unwrap());
static SERIES_SUBTITLE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(.+?):\s*(.+)$").unwrap());
static SERIES_TRAILING_NUMBER: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(.+?)\s+(\d+)$").unwrap());

static BRACKETED_SEGMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[([^\[\]]+)\]").unwrap());

/// Strip markup and collapse whitespace. Returns `None` when nothing
/// readable is left.
pub fn clean_text(raw: &str) -> Option<String> {
    let without_tags = HTML_TAG.replace_all(raw, " ");
    let collapsed = without_tags.split_whitespace().collect::<Vec<_>>().join(" ");
    (!collapsed.is_empty()).then_some(collapsed)
}

/// Parse the publication-date shapes the vendors actually emit:
/// `YYYY`, `YYYY-MM`, `YYYY-MM-DD`, `January 2, 2006`, `January 2006`.
pub fn parse_published_date(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        return Some(date);
    }
    if trimmed.len() == 7 && trimmed.as_bytes()[4] == b'-' {
        if let Ok(date) = NaiveDate::parse_from_str(&format!("{trimmed}-01"), "%Y-%m-%d") {
            return Some(date);
        }
    }
    if trimmed.len() == 4 && trimmed.bytes().all(|b| b.is_ascii_digit()) {
        if let Ok(year) = trimmed.parse::<i32>() {
            return NaiveDate::from_ymd_opt(year, 1, 1);
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%B %d, %Y") {
        return Some(date);
    }
    if let Ok(date) = NaiveDate::parse_from_str(&format!("{trimmed} 1"), "%B %Y %d") {
        return Some(date);
    }

    None
}

/// Map vendor language hints onto ISO-639-1 where determinable;
/// anything unrecognized passes through lowercased.
pub fn normalize_language(hint: &str) -> Option<String> {
    let lower = hint.trim().to_lowercase();
    if lower.is_empty() {
        return None;
    }

    let mapped = match lower.as_str() {
        "eng" | "english" => "en",
        "spa" | "esp" | "spanish" => "es",
        "fre" | "fra" | "french" => "fr",
        "ger" | "deu" | "german" => "de",
        "ita" | "italian" => "it",
        "jpn" | "japanese" => "ja",
        "kor" | "korean" => "ko",
        "chi" | "zho" | "chinese" => "zh",
        "por" | "portuguese" => "pt",
        "rus" | "russian" => "ru",
        other => other,
    };
    Some(mapped.to_string())
}

/// Heuristic series extraction from a title, used only when the
/// vendor has no structured series field. Patterns are tried in
/// order; the first match wins.
pub fn detect_series(title: &str) -> Option<(String, Option<u32>)> {
    if let Some(captures) = SERIES_NUMBERED.captures(title) {
        let name = captures.get(1)?.as_str().trim().to_string();
        let position = captures.get(2).and_then(|m| m.as_str().parse().ok());
        return Some((name, position));
    }
    if let Some(captures) = SERIES_SUBTITLE.captures(title) {
        let name = captures.get(1)?.as_str().trim().to_string();
        return Some((name, None));
    }
    if let Some(captures) = SERIES_TRAILING_NUMBER.captures(title) {
        let name = captures.get(1)?.as_str().trim().to_string();
        let position = captures.get(2).and_then(|m| m.as_str().parse().ok());
        return Some((name, position));
    }
    None
}

/// Rewrite plain-http image links to https. The bibliographic CDNs
/// all serve TLS; anything else is left alone.
pub fn https_upgrade(url: &str) -> String {
    match url.strip_prefix("http://") {
        Some(rest) => format!("https://{rest}"),
        None => url.to_string(),
    }
}

/// A bracketed original-language segment in a title, kept verbatim
/// for the `original_title` slot. Only segments with non-ASCII text
/// qualify; `[Paperback]`-style noise does not.
pub fn detect_original_title(title: &str) -> Option<String> {
    BRACKETED_SEGMENT
        .captures_iter(title)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().trim())
        .find(|segment| !segment.is_ascii())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_text_strips_markup_and_whitespace() {
        assert_eq!(
            clean_text("  <p>A <b>wizard</b>\n arrives</p> ").as_deref(),
            Some("A wizard arrives")
        );
        assert_eq!(clean_text("<br/>"), None);
    }

    #[test]
    fn date_parsing_accepts_vendor_shapes() {
        let full = NaiveDate::from_ymd_opt(1997, 6, 26).unwrap();
        assert_eq!(parse_published_date("1997-06-26"), Some(full));
        assert_eq!(
            parse_published_date("1997-06"),
            NaiveDate::from_ymd_opt(1997, 6, 1)
        );
        assert_eq!(
            parse_published_date("1997"),
            NaiveDate::from_ymd_opt(1997, 1, 1)
        );
        assert_eq!(parse_published_date("June 26, 1997"), Some(full));
        assert_eq!(
            parse_published_date("June 1997"),
            NaiveDate::from_ymd_opt(1997, 6, 1)
        );
        assert_eq!(parse_published_date("unknown"), None);
        assert_eq!(parse_published_date(""), None);
    }

    #[test]
    fn language_hints_fold_to_iso_639_1() {
        assert_eq!(normalize_language("eng").as_deref(), Some("en"));
        assert_eq!(normalize_language("English").as_deref(), Some("en"));
        assert_eq!(normalize_language("ja").as_deref(), Some("ja"));
        assert_eq!(normalize_language("jpn").as_deref(), Some("ja"));
        assert_eq!(normalize_language("  ").is_none(), true);
    }

    #[test]
    fn series_heuristics_apply_in_order() {
        assert_eq!(
            detect_series("The Wheel of Time Book 4"),
            Some(("The Wheel of Time".to_string(), Some(4)))
        );
        assert_eq!(
            detect_series("Mistborn: The Final Empire"),
            Some(("Mistborn".to_string(), None))
        );
        assert_eq!(
            detect_series("Vagabond 12"),
            Some(("Vagabond".to_string(), Some(12)))
        );
        assert_eq!(detect_series("Standalone Title"), None);
    }

    #[test]
    fn numbered_pattern_wins_over_subtitle() {
        assert_eq!(
            detect_series("Discworld: The Colour of Magic Volume 1"),
            Some(("Discworld: The Colour of Magic".to_string(), Some(1)))
        );
    }

    #[test]
    fn image_links_move_to_https() {
        assert_eq!(
            https_upgrade("http://books.google.com/thumb?id=1"),
            "https://books.google.com/thumb?id=1"
        );
        assert_eq!(https_upgrade("https://already.example"), "https://already.example");
    }

    #[test]
    fn bracketed_romanization_is_preserved_verbatim() {
        assert_eq!(
            detect_original_title("Kino's Journey [キノの旅]").as_deref(),
            Some("キノの旅")
        );
        assert_eq!(detect_original_title("A Title [Paperback]"), None);
    }
}

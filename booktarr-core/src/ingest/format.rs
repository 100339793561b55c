//! Catalog file formats and column mapping.
//!
//! Four formats are accepted: generic CSV (caller-supplied or
//! auto-detected column mapping), Goodreads CSV, HandyLib
//! tab-delimited, and Hardcover JSON. Parsing yields one `RowRecord`
//! per logical row; rows are surfaced incrementally rather than
//! collected up front.

use std::collections::HashMap;
use std::io::Cursor;

use serde_json::Value;

use crate::error::{CoreError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportFormat {
    CsvGeneric,
    CsvGoodreads,
    CsvHandylibTab,
    JsonHardcover,
}

impl ImportFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImportFormat::CsvGeneric => "csv_generic",
            ImportFormat::CsvGoodreads => "csv_goodreads",
            ImportFormat::CsvHandylibTab => "csv_handylib_tab",
            ImportFormat::JsonHardcover => "json_hardcover",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "csv" | "csv_generic" => Some(ImportFormat::CsvGeneric),
            "goodreads" | "csv_goodreads" => Some(ImportFormat::CsvGoodreads),
            "handylib" | "csv_handylib_tab" => Some(ImportFormat::CsvHandylibTab),
            "hardcover" | "json_hardcover" => Some(ImportFormat::JsonHardcover),
            _ => None,
        }
    }
}

/// The fields a catalog column can map onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetField {
    Title,
    Authors,
    Isbn,
    SeriesName,
    SeriesPosition,
    Publisher,
    PublishedDate,
    PageCount,
    Description,
    Rating,
    PagesRead,
}

impl TargetField {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetField::Title => "title",
            TargetField::Authors => "authors",
            TargetField::Isbn => "isbn",
            TargetField::SeriesName => "series_name",
            TargetField::SeriesPosition => "series_position",
            TargetField::Publisher => "publisher",
            TargetField::PublishedDate => "published_date",
            TargetField::PageCount => "page_count",
            TargetField::Description => "description",
            TargetField::Rating => "rating",
            TargetField::PagesRead => "pages_read",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "title" => Some(TargetField::Title),
            "authors" | "author" => Some(TargetField::Authors),
            "isbn" => Some(TargetField::Isbn),
            "series_name" | "series" => Some(TargetField::SeriesName),
            "series_position" => Some(TargetField::SeriesPosition),
            "publisher" => Some(TargetField::Publisher),
            "published_date" => Some(TargetField::PublishedDate),
            "page_count" => Some(TargetField::PageCount),
            "description" => Some(TargetField::Description),
            "rating" => Some(TargetField::Rating),
            "pages_read" => Some(TargetField::PagesRead),
            _ => None,
        }
    }
}

/// One normalized catalog row, pre-persistence.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowRecord {
    /// 1-based data row index, for error reporting.
    pub index: usize,
    pub title: Option<String>,
    pub authors: Vec<String>,
    pub isbn: Option<String>,
    pub series_name: Option<String>,
    pub series_position: Option<u32>,
    pub publisher: Option<String>,
    pub published_date: Option<String>,
    pub page_count: Option<u32>,
    pub description: Option<String>,
    pub rating: Option<f32>,
    pub pages_read: Option<u32>,
}

/// Guess which book field each header feeds, for generic CSVs
/// imported without an explicit mapping and for preview.
pub fn detect_mapping(headers: &[String]) -> HashMap<String, String> {
    let mut mapping = HashMap::new();
    let mut assign = |field: TargetField, header: &str| {
        mapping
            .entry(field.as_str().to_string())
            .or_insert_with(|| header.to_string());
    };

    for header in headers {
        let lower = header.to_lowercase();
        if lower.contains("title") {
            assign(TargetField::Title, header);
        } else if lower.contains("author") {
            assign(TargetField::Authors, header);
        } else if lower.contains("isbn") {
            assign(TargetField::Isbn, header);
        } else if lower.contains("position") || lower.contains("volume") {
            assign(TargetField::SeriesPosition, header);
        } else if lower.contains("series") {
            assign(TargetField::SeriesName, header);
        } else if lower.contains("publisher") {
            assign(TargetField::Publisher, header);
        } else if lower.contains("date") || lower.contains("year") {
            assign(TargetField::PublishedDate, header);
        } else if lower.contains("page") && lower.contains("read") {
            assign(TargetField::PagesRead, header);
        } else if lower.contains("page") {
            assign(TargetField::PageCount, header);
        } else if lower.contains("description") || lower.contains("summary") {
            assign(TargetField::Description, header);
        } else if lower.contains("rating") {
            assign(TargetField::Rating, header);
        }
    }

    mapping
}

/// Goodreads exports wrap ISBNs in an Excel formula (`="0439708184"`)
/// to stop spreadsheets from eating leading zeros.
pub fn clean_goodreads_value(value: &str) -> &str {
    value
        .strip_prefix("=\"")
        .and_then(|rest| rest.strip_suffix('"'))
        .unwrap_or(value)
}

/// Split an author cell on commas and the word "and".
pub fn split_authors(raw: &str) -> Vec<String> {
    raw.replace(" and ", ", ")
        .split(',')
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_u32(raw: &str) -> Option<u32> {
    raw.trim().parse().ok()
}

fn parse_f32(raw: &str) -> Option<f32> {
    raw.trim().parse().ok()
}

fn non_empty(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

type RowIter = Box<dyn Iterator<Item = Result<RowRecord>> + Send>;

/// Open a catalog for row-at-a-time parsing. `mapping` applies to the
/// generic CSV format only; when absent the mapping is auto-detected
/// from the header row.
pub fn parse_catalog(
    bytes: Vec<u8>,
    format: ImportFormat,
    mapping: Option<&HashMap<String, String>>,
) -> Result<RowIter> {
    match format {
        ImportFormat::CsvGeneric => parse_delimited(bytes, b',', CsvDialect::Generic, mapping),
        ImportFormat::CsvGoodreads => parse_delimited(bytes, b',', CsvDialect::Goodreads, None),
        ImportFormat::CsvHandylibTab => parse_delimited(bytes, b'\t', CsvDialect::Handylib, None),
        ImportFormat::JsonHardcover => parse_hardcover(&bytes),
    }
}

/// Header names and the first sample rows, for import preview.
pub fn read_preview(
    bytes: &[u8],
    format: ImportFormat,
    sample_rows: usize,
) -> Result<(Vec<String>, Vec<Vec<String>>)> {
    match format {
        ImportFormat::JsonHardcover => {
            let entries = hardcover_entries(bytes)?;
            let headers: Vec<String> = entries
                .first()
                .and_then(Value::as_object)
                .map(|obj| obj.keys().cloned().collect())
                .unwrap_or_default();
            let rows = entries
                .iter()
                .take(sample_rows)
                .map(|entry| {
                    headers
                        .iter()
                        .map(|key| json_string(entry.get(key)))
                        .collect()
                })
                .collect();
            Ok((headers, rows))
        }
        _ => {
            let delimiter = if format == ImportFormat::CsvHandylibTab {
                b'\t'
            } else {
                b','
            };
            let mut reader = csv::ReaderBuilder::new()
                .delimiter(delimiter)
                .flexible(true)
                .from_reader(Cursor::new(bytes));

            let headers: Vec<String> = reader
                .headers()
                .map_err(|e| CoreError::InvalidInput(format!("unreadable catalog header: {e}")))?
                .iter()
                .map(str::to_string)
                .collect();

            let mut rows = Vec::new();
            for record in reader.records().take(sample_rows) {
                let record = record
                    .map_err(|e| CoreError::InvalidInput(format!("unreadable catalog row: {e}")))?;
                rows.push(record.iter().map(str::to_string).collect());
            }
            Ok((headers, rows))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CsvDialect {
    Generic,
    Goodreads,
    Handylib,
}

fn parse_delimited(
    bytes: Vec<u8>,
    delimiter: u8,
    dialect: CsvDialect,
    mapping: Option<&HashMap<String, String>>,
) -> Result<RowIter> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .from_reader(Cursor::new(bytes));

    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| CoreError::InvalidInput(format!("unreadable catalog header: {e}")))?
        .iter()
        .map(str::to_string)
        .collect();

    let columns: HashMap<TargetField, usize> = match dialect {
        CsvDialect::Generic => {
            let by_name: HashMap<String, String> = match mapping {
                Some(mapping) if !mapping.is_empty() => mapping.clone(),
                _ => detect_mapping(&headers),
            };
            by_name
                .iter()
                .filter_map(|(field, column)| {
                    let field = TargetField::from_name(field)?;
                    let index = headers.iter().position(|h| h == column)?;
                    Some((field, index))
                })
                .collect()
        }
        CsvDialect::Goodreads => goodreads_columns(&headers),
        CsvDialect::Handylib => handylib_columns(&headers),
    };

    if !columns.contains_key(&TargetField::Title) {
        return Err(CoreError::InvalidInput(
            "catalog has no usable title column".to_string(),
        ));
    }

    let goodreads = dialect == CsvDialect::Goodreads;
    let iter = reader.into_records().enumerate().map(move |(i, record)| {
        let record =
            record.map_err(|e| CoreError::InvalidInput(format!("row {}: {e}", i + 1)))?;

        let cell = |field: TargetField| -> Option<String> {
            let raw = columns.get(&field).and_then(|&idx| record.get(idx))?;
            let raw = if goodreads {
                clean_goodreads_value(raw)
            } else {
                raw
            };
            non_empty(raw)
        };

        let row = RowRecord {
            index: i + 1,
            title: cell(TargetField::Title),
            authors: cell(TargetField::Authors)
                .map(|raw| split_authors(&raw))
                .unwrap_or_default(),
            isbn: cell(TargetField::Isbn),
            series_name: cell(TargetField::SeriesName),
            series_position: cell(TargetField::SeriesPosition).and_then(|v| parse_u32(&v)),
            publisher: cell(TargetField::Publisher),
            published_date: cell(TargetField::PublishedDate),
            page_count: cell(TargetField::PageCount).and_then(|v| parse_u32(&v)),
            description: cell(TargetField::Description),
            rating: cell(TargetField::Rating).and_then(|v| parse_f32(&v)),
            pages_read: cell(TargetField::PagesRead).and_then(|v| parse_u32(&v)),
        };

        Ok(row)
    });

    Ok(Box::new(iter))
}

fn goodreads_columns(headers: &[String]) -> HashMap<TargetField, usize> {
    let find = |names: &[&str]| -> Option<usize> {
        names
            .iter()
            .find_map(|name| headers.iter().position(|h| h == name))
    };

    let mut columns = HashMap::new();
    let mut put = |field: TargetField, names: &[&str]| {
        if let Some(index) = find(names) {
            columns.insert(field, index);
        }
    };

    put(TargetField::Title, &["Title"]);
    put(TargetField::Authors, &["Author"]);
    put(TargetField::Isbn, &["ISBN13", "ISBN"]);
    put(TargetField::SeriesName, &["Series"]);
    put(TargetField::SeriesPosition, &["Series Position"]);
    put(TargetField::Rating, &["My Rating"]);
    put(TargetField::Description, &["Description"]);
    put(TargetField::PublishedDate, &["Year Published"]);
    put(TargetField::PageCount, &["Number of Pages"]);
    columns
}

fn handylib_columns(headers: &[String]) -> HashMap<TargetField, usize> {
    let mut columns = HashMap::new();
    let mut put = |field: TargetField, name: &str| {
        if let Some(index) = headers.iter().position(|h| h == name) {
            columns.insert(field, index);
        }
    };

    put(TargetField::Title, "Title");
    put(TargetField::Authors, "Author");
    put(TargetField::Isbn, "ISBN");
    put(TargetField::SeriesName, "Series");
    put(TargetField::SeriesPosition, "Position");
    put(TargetField::Description, "Description");
    put(TargetField::PublishedDate, "Published");
    put(TargetField::PageCount, "Pages");
    put(TargetField::PagesRead, "Pages Read");
    columns
}

fn hardcover_entries(bytes: &[u8]) -> Result<Vec<Value>> {
    let value: Value = serde_json::from_slice(bytes)
        .map_err(|e| CoreError::InvalidInput(format!("invalid JSON catalog: {e}")))?;

    Ok(match value {
        Value::Array(entries) => entries,
        other => vec![other],
    })
}

fn parse_hardcover(bytes: &[u8]) -> Result<RowIter> {
    let entries = hardcover_entries(bytes)?;

    let iter = entries.into_iter().enumerate().map(|(i, entry)| {
        let text = |keys: &[&str]| -> Option<String> {
            keys.iter()
                .find_map(|key| entry.get(key))
                .map(|v| json_string(Some(v)))
                .and_then(|s| non_empty(&s))
        };

        Ok(RowRecord {
            index: i + 1,
            title: text(&["title"]),
            authors: text(&["author", "authors"])
                .map(|raw| split_authors(&raw))
                .unwrap_or_default(),
            isbn: text(&["isbn", "isbn13"]),
            series_name: text(&["series"]),
            series_position: text(&["seriesPosition"]).and_then(|v| parse_u32(&v)),
            publisher: text(&["publisher"]),
            published_date: text(&["publishedDate"]),
            page_count: text(&["pageCount"]).and_then(|v| parse_u32(&v)),
            description: text(&["description"]),
            rating: text(&["rating"]).and_then(|v| parse_f32(&v)),
            pages_read: text(&["pagesRead"]).and_then(|v| parse_u32(&v)),
        })
    });

    Ok(Box::new(iter))
}

fn json_string(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(iter: RowIter) -> Vec<RowRecord> {
        iter.map(|r| r.unwrap()).collect()
    }

    #[test]
    fn generic_csv_auto_detects_columns() {
        let csv = b"Book Title,Author Name,ISBN Number\nDune,Frank Herbert,9780441172719\n".to_vec();
        let rows = collect(parse_catalog(csv, ImportFormat::CsvGeneric, None).unwrap());

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].title.as_deref(), Some("Dune"));
        assert_eq!(rows[0].authors, vec!["Frank Herbert"]);
        assert_eq!(rows[0].isbn.as_deref(), Some("9780441172719"));
    }

    #[test]
    fn generic_csv_honors_explicit_mapping() {
        let csv = b"colA,colB\nDune,9780441172719\n".to_vec();
        let mapping = HashMap::from([
            ("title".to_string(), "colA".to_string()),
            ("isbn".to_string(), "colB".to_string()),
        ]);
        let rows =
            collect(parse_catalog(csv, ImportFormat::CsvGeneric, Some(&mapping)).unwrap());

        assert_eq!(rows[0].title.as_deref(), Some("Dune"));
        assert_eq!(rows[0].isbn.as_deref(), Some("9780441172719"));
    }

    #[test]
    fn goodreads_cells_lose_their_excel_wrappers() {
        let csv = concat!(
            "Title,Author,ISBN,ISBN13,My Rating,Number of Pages\n",
            "Dune,Frank Herbert,=\"0441172717\",=\"9780441172719\",5,412\n"
        )
        .as_bytes()
        .to_vec();
        let rows = collect(parse_catalog(csv, ImportFormat::CsvGoodreads, None).unwrap());

        assert_eq!(rows[0].isbn.as_deref(), Some("9780441172719"));
        assert_eq!(rows[0].rating, Some(5.0));
        assert_eq!(rows[0].page_count, Some(412));
    }

    #[test]
    fn handylib_is_tab_delimited() {
        let tsv = b"Title\tAuthor\tISBN\tPosition\nVagabond 1\tTakehiko Inoue\t9781591167693\t1\n"
            .to_vec();
        let rows = collect(parse_catalog(tsv, ImportFormat::CsvHandylibTab, None).unwrap());

        assert_eq!(rows[0].title.as_deref(), Some("Vagabond 1"));
        assert_eq!(rows[0].series_position, Some(1));
    }

    #[test]
    fn hardcover_accepts_array_or_single_object() {
        let array = br#"[{"title": "Dune", "isbn13": "9780441172719", "pageCount": 412}]"#.to_vec();
        let rows = collect(parse_catalog(array, ImportFormat::JsonHardcover, None).unwrap());
        assert_eq!(rows[0].page_count, Some(412));

        let single = br#"{"title": "Dune", "isbn": "9780441172719"}"#.to_vec();
        let rows = collect(parse_catalog(single, ImportFormat::JsonHardcover, None).unwrap());
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn non_numeric_integers_become_null() {
        let csv = b"Title,ISBN,Pages\nDune,9780441172719,about 400\n".to_vec();
        let mapping = HashMap::from([
            ("title".to_string(), "Title".to_string()),
            ("isbn".to_string(), "ISBN".to_string()),
            ("page_count".to_string(), "Pages".to_string()),
        ]);
        let rows =
            collect(parse_catalog(csv, ImportFormat::CsvGeneric, Some(&mapping)).unwrap());
        assert_eq!(rows[0].page_count, None);
    }

    #[test]
    fn authors_split_on_commas_and_and() {
        assert_eq!(
            split_authors("Terry Pratchett and Neil Gaiman"),
            vec!["Terry Pratchett", "Neil Gaiman"]
        );
        assert_eq!(split_authors("A, B,C"), vec!["A", "B", "C"]);
    }

    #[test]
    fn detect_mapping_separates_series_name_from_position() {
        let headers: Vec<String> = ["Title", "Series", "Series Position"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let mapping = detect_mapping(&headers);
        assert_eq!(mapping.get("series_name").map(String::as_str), Some("Series"));
        assert_eq!(
            mapping.get("series_position").map(String::as_str),
            Some("Series Position")
        );
    }
}

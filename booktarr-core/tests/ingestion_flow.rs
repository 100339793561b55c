//! Catalog import scenarios: partial failure, duplicate handling,
//! preview, cancellation.

mod support;

use std::fmt::Write as _;
use std::sync::Arc;

use booktarr_core::config::IngestionSettings;
use booktarr_core::ingest::{ImportFormat, ImportOptions, ImportPipeline, JobStatus, JobTracker};
use booktarr_core::LibraryRepository;
use booktarr_model::Isbn;
use tokio_util::sync::CancellationToken;

use support::{StubSource, harness};

/// Fifty rows of valid data except row 17, whose title is empty. Rows
/// carry valid, distinct ISBN-13s generated from a numeric base.
fn fifty_row_csv() -> Vec<u8> {
    let mut csv = String::from("Title,Author,ISBN\n");
    for i in 1..=50u32 {
        let isbn = isbn13_from_base(900_000 + i);
        if i == 17 {
            writeln!(csv, ",Author {i},{isbn}").unwrap();
        } else {
            writeln!(csv, "Book {i},Author {i},{isbn}").unwrap();
        }
    }
    csv.into_bytes()
}

/// Build a valid ISBN-13 from `978` + zero-padded base + check digit.
fn isbn13_from_base(base: u32) -> String {
    let mut digits = format!("978{base:09}");
    let total: u32 = digits
        .bytes()
        .enumerate()
        .map(|(i, b)| u32::from(b - b'0') * if i % 2 == 1 { 3 } else { 1 })
        .sum();
    let check = (10 - total % 10) % 10;
    digits.push(char::from(b'0' + check as u8));
    digits
}

fn pipeline(h: &support::Harness) -> ImportPipeline {
    ImportPipeline::new(
        h.repository.clone() as Arc<dyn LibraryRepository>,
        h.engine.clone(),
        Arc::new(JobTracker::new()),
        IngestionSettings::default(),
    )
}

fn options(skip_duplicates: bool) -> ImportOptions {
    ImportOptions {
        format: ImportFormat::CsvGeneric,
        mapping: None,
        skip_duplicates,
        enrich_metadata: false,
    }
}

#[tokio::test]
async fn a_bad_row_skips_without_failing_the_job() {
    let h = harness(vec![]);
    let pipeline = pipeline(&h);

    let job = pipeline
        .run(fifty_row_csv(), options(true), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.total, 50);
    assert_eq!(job.succeeded, 49);
    assert_eq!(job.skipped, 1);
    assert_eq!(job.failed, 0);
    assert_eq!(job.errors.len(), 1);
    assert!(job.errors[0].message.contains("missing title"));

    // 49 books persisted, each reachable by its ISBN.
    let sample = Isbn::parse(&isbn13_from_base(900_001)).unwrap();
    assert!(h.repository.get_book_by_isbn(&sample).await.unwrap().is_some());
}

#[tokio::test]
async fn reimporting_with_skip_duplicates_imports_nothing() {
    let h = harness(vec![]);
    let pipeline = pipeline(&h);

    pipeline
        .run(fifty_row_csv(), options(true), CancellationToken::new())
        .await
        .unwrap();
    let second = pipeline
        .run(fifty_row_csv(), options(true), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(second.succeeded, 0);
    assert_eq!(second.failed, 0);
    // 49 duplicates plus the still-broken row 17.
    assert_eq!(second.skipped, 50);
    let duplicates = second
        .errors
        .iter()
        .filter(|e| e.message == "duplicate")
        .count();
    assert_eq!(duplicates, 49);
}

#[tokio::test]
async fn rows_missing_an_isbn_are_skipped() {
    let h = harness(vec![]);
    let pipeline = pipeline(&h);

    let csv = b"Title,Author,ISBN\nNo Isbn,Someone,\nBad Isbn,Someone,notanisbn\n".to_vec();
    let job = pipeline
        .run(csv, options(true), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(job.succeeded, 0);
    assert_eq!(job.skipped, 2);
}

#[tokio::test]
async fn series_columns_create_linked_volumes() {
    let h = harness(vec![]);
    let pipeline = pipeline(&h);

    let csv = concat!(
        "Title,Author,ISBN,Series,Series Position\n",
        "Vagabond 1,Takehiko Inoue,9781591167693,Vagabond,1\n",
        "Vagabond 2,Takehiko Inoue,9781591164548,Vagabond,2\n",
    )
    .as_bytes()
    .to_vec();

    let job = pipeline
        .run(csv, options(true), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(job.succeeded, 2);

    let (_, volumes) = h
        .repository
        .get_series_with_volumes("Vagabond")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(volumes.len(), 2);
    assert!(volumes.iter().all(|v| v.book_id.is_some()));
}

#[tokio::test]
async fn unreadable_catalogs_fail_the_job_visibly() {
    let h = harness(vec![]);
    let pipeline = pipeline(&h);

    let result = pipeline
        .run(
            b"{not json".to_vec(),
            ImportOptions {
                format: ImportFormat::JsonHardcover,
                mapping: None,
                skip_duplicates: true,
                enrich_metadata: false,
            },
            CancellationToken::new(),
        )
        .await;
    assert!(result.is_err());

    let jobs = pipeline.tracker().jobs().await;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].status, JobStatus::Failed);
}

#[tokio::test]
async fn cancellation_keeps_committed_rows_and_fails_the_job() {
    let h = harness(vec![]);
    let pipeline = pipeline(&h);

    let cancel = CancellationToken::new();
    cancel.cancel();

    let job = pipeline
        .run(fifty_row_csv(), options(true), cancel)
        .await
        .unwrap();

    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.errors.iter().any(|e| e.message == "cancelled"));
    assert_eq!(job.succeeded, 0);
}

#[tokio::test]
async fn cancellation_interrupts_in_flight_enrichment() {
    let h = harness(vec![Arc::new(StubSource::hanging("stuck"))]);
    let pipeline = Arc::new(pipeline(&h));
    let cancel = CancellationToken::new();

    let csv = b"Title,Author,ISBN\nDune,Frank Herbert,9780441172719\n".to_vec();
    let run = {
        let pipeline = Arc::clone(&pipeline);
        let cancel = cancel.clone();
        let options = ImportOptions {
            enrich_metadata: true,
            ..options(true)
        };
        tokio::spawn(async move { pipeline.run(csv, options, cancel).await })
    };

    // The row commits its minimal record, then parks inside the
    // never-answering source; the cancel must reach that await.
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    cancel.cancel();

    let job = run.await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.errors.iter().any(|e| e.message == "cancelled"));
    // The committed row is kept; only its enhancement was abandoned.
    assert_eq!(job.succeeded, 1);

    let isbn = Isbn::parse("9780441172719").unwrap();
    assert!(h.repository.get_book_by_isbn(&isbn).await.unwrap().is_some());
}

#[tokio::test]
async fn preview_detects_columns_without_creating_a_job() {
    let h = harness(vec![]);
    let pipeline = pipeline(&h);

    let preview = pipeline
        .preview(&fifty_row_csv(), ImportFormat::CsvGeneric, None)
        .unwrap();

    assert_eq!(preview.headers, vec!["Title", "Author", "ISBN"]);
    assert_eq!(preview.sample_rows.len(), 10);
    assert_eq!(preview.total_rows, 50);
    assert_eq!(
        preview.detected_mapping.get("title").map(String::as_str),
        Some("Title")
    );
    assert_eq!(
        preview.detected_mapping.get("isbn").map(String::as_str),
        Some("ISBN")
    );
    assert!(pipeline.tracker().jobs().await.is_empty());
}

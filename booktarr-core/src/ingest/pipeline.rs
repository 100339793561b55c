//! The bulk import pipeline: catalog bytes in, tracked job out.

use std::collections::HashMap;
use std::sync::Arc;

use booktarr_model::{CanonicalRecord, Isbn, MetadataSource};
use futures::{StreamExt, stream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::IngestionSettings;
use crate::database::LibraryRepository;
use crate::enrich::{EnrichmentEngine, EnrichmentOutcome};
use crate::error::{CoreError, Result};
use crate::ingest::format::{ImportFormat, RowRecord, detect_mapping, parse_catalog, read_preview};
use crate::ingest::job::{IngestionJob, JobOutcome, JobTracker};
use crate::sources::normalize::parse_published_date;

#[derive(Debug, Clone)]
pub struct ImportOptions {
    pub format: ImportFormat,
    /// Column mapping for the generic CSV format; ignored elsewhere.
    pub mapping: Option<HashMap<String, String>>,
    pub skip_duplicates: bool,
    pub enrich_metadata: bool,
}

impl ImportOptions {
    pub fn new(format: ImportFormat, settings: &IngestionSettings) -> Self {
        Self {
            format,
            mapping: None,
            skip_duplicates: settings.skip_duplicates_default,
            enrich_metadata: settings.enrich_default,
        }
    }
}

/// What the caller sees before committing to an import. No job is
/// created for a preview.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ImportPreview {
    pub headers: Vec<String>,
    pub sample_rows: Vec<Vec<String>>,
    pub total_rows: usize,
    pub detected_mapping: HashMap<String, String>,
}

enum RowOutcome {
    Imported { row: usize },
    Skipped { row: usize, reason: String },
    Failed { row: usize, reason: String },
    Cancelled,
}

pub struct ImportPipeline {
    repository: Arc<dyn LibraryRepository>,
    engine: Arc<EnrichmentEngine>,
    tracker: Arc<JobTracker>,
    settings: IngestionSettings,
}

impl std::fmt::Debug for ImportPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImportPipeline")
            .field("settings", &self.settings)
            .finish()
    }
}

impl ImportPipeline {
    pub fn new(
        repository: Arc<dyn LibraryRepository>,
        engine: Arc<EnrichmentEngine>,
        tracker: Arc<JobTracker>,
        settings: IngestionSettings,
    ) -> Self {
        Self {
            repository,
            engine,
            tracker,
            settings,
        }
    }

    pub fn tracker(&self) -> &Arc<JobTracker> {
        &self.tracker
    }

    /// Run an import to completion. Rows process with bounded
    /// parallelism; a cancel stops new rows at the next suspension
    /// point and the job finalizes as failed with reason `cancelled`,
    /// keeping whatever already committed.
    pub async fn run(
        &self,
        bytes: Vec<u8>,
        options: ImportOptions,
        cancel: CancellationToken,
    ) -> Result<IngestionJob> {
        let job_id = self.tracker.open_job(options.format.as_str(), None);

        let rows = match parse_catalog(bytes, options.format, options.mapping.as_ref()) {
            Ok(rows) => rows,
            Err(err) => {
                self.tracker
                    .finalize_job(
                        job_id,
                        JobOutcome::Failed {
                            reason: err.to_string(),
                        },
                    )
                    .await;
                return Err(err);
            }
        };

        let concurrency = self.settings.concurrency.max(1);
        let mut outcomes = stream::iter(rows)
            .map(|row| self.process_row(row, &options, &cancel))
            .buffer_unordered(concurrency);

        while let Some(outcome) = outcomes.next().await {
            if matches!(outcome, RowOutcome::Cancelled) {
                continue;
            }
            self.tracker.add_row(job_id);
            match outcome {
                RowOutcome::Imported { .. } => self.tracker.record_success(job_id),
                RowOutcome::Skipped { row, reason } => {
                    self.tracker.record_skip(job_id, row, reason).await;
                }
                RowOutcome::Failed { row, reason } => {
                    self.tracker.record_failure(job_id, row, reason).await;
                }
                RowOutcome::Cancelled => {}
            }
        }
        drop(outcomes);

        let outcome = if cancel.is_cancelled() {
            JobOutcome::Failed {
                reason: "cancelled".to_string(),
            }
        } else {
            JobOutcome::Completed
        };
        self.tracker.finalize_job(job_id, outcome).await;

        let job = self.tracker.job(job_id).await.ok_or_else(|| {
            CoreError::Internal(format!("job {job_id} vanished from the tracker"))
        })?;
        info!(
            job = %job.id,
            total = job.total,
            succeeded = job.succeeded,
            skipped = job.skipped,
            failed = job.failed,
            "import finished"
        );
        Ok(job)
    }

    async fn process_row(
        &self,
        row: Result<RowRecord>,
        options: &ImportOptions,
        cancel: &CancellationToken,
    ) -> RowOutcome {
        if cancel.is_cancelled() {
            return RowOutcome::Cancelled;
        }

        let row = match row {
            Ok(row) => row,
            Err(err) => {
                return RowOutcome::Failed {
                    row: 0,
                    reason: err.to_string(),
                };
            }
        };
        let index = row.index;

        let Some(title) = row.title.clone() else {
            return RowOutcome::Skipped {
                row: index,
                reason: "missing title".to_string(),
            };
        };
        let Some(raw_isbn) = row.isbn.clone() else {
            return RowOutcome::Skipped {
                row: index,
                reason: "missing isbn".to_string(),
            };
        };
        let isbn = match Isbn::parse(&raw_isbn) {
            Ok(isbn) => isbn,
            Err(err) => {
                return RowOutcome::Skipped {
                    row: index,
                    reason: format!("invalid isbn {raw_isbn}: {err}"),
                };
            }
        };

        match self.repository.get_book_by_isbn(&isbn).await {
            Ok(Some(_)) if options.skip_duplicates => {
                return RowOutcome::Skipped {
                    row: index,
                    reason: "duplicate".to_string(),
                };
            }
            Ok(_) => {}
            Err(err) => {
                return RowOutcome::Failed {
                    row: index,
                    reason: err.to_string(),
                };
            }
        }

        let record = minimal_record(&title, &isbn, &row);
        let stored = match self.repository.upsert_book_and_edition(&record).await {
            Ok(stored) => stored,
            Err(err) => {
                return RowOutcome::Failed {
                    row: index,
                    reason: err.to_string(),
                };
            }
        };

        if let Some(series_name) = &row.series_name {
            if let Err(err) = self.link_series(series_name, row.series_position, &stored).await {
                // Series linkage is additive; a failure degrades the
                // row to a book without a volume slot.
                warn!(row = index, %err, "series linkage failed");
            }
        }

        if options.enrich_metadata {
            match self.engine.enrich_by_isbn(&isbn, false, cancel).await {
                Ok(EnrichmentOutcome::Failed { reason, .. }) => {
                    warn!(row = index, isbn = isbn.as_str(), %reason, "enrichment failed for imported row");
                }
                Ok(_) => {
                    debug!(row = index, isbn = isbn.as_str(), "imported row enriched");
                }
                // The minimal record is already committed; only the
                // enhancement is abandoned.
                Err(CoreError::Cancelled(_)) => {
                    debug!(row = index, isbn = isbn.as_str(), "enrichment cancelled mid-row");
                }
                Err(err) => {
                    warn!(row = index, isbn = isbn.as_str(), %err, "enrichment errored for imported row");
                }
            }
        }

        RowOutcome::Imported { row: index }
    }

    async fn link_series(
        &self,
        series_name: &str,
        position: Option<u32>,
        stored: &booktarr_model::BookWithEdition,
    ) -> Result<()> {
        let series = self.repository.upsert_series(series_name, None).await?;
        if let Some(position) = position {
            self.repository
                .link_volume(series.id, position, Some(stored.book.id))
                .await?;
        }
        Ok(())
    }

    /// Inspect a catalog without creating a job: headers, the first
    /// sample rows, and the auto-detected column mapping.
    pub fn preview(
        &self,
        bytes: &[u8],
        format: ImportFormat,
        mapping: Option<&HashMap<String, String>>,
    ) -> Result<ImportPreview> {
        let (headers, sample_rows) = read_preview(bytes, format, self.settings.preview_rows)?;

        let detected_mapping = match (format, mapping) {
            (_, Some(mapping)) if !mapping.is_empty() => mapping.clone(),
            (ImportFormat::JsonHardcover, _) => HashMap::new(),
            _ => detect_mapping(&headers),
        };

        let total_rows = parse_catalog(bytes.to_vec(), format, mapping)?.count();

        Ok(ImportPreview {
            headers,
            sample_rows,
            total_rows,
            detected_mapping,
        })
    }
}

/// The row as a canonical record: exactly what the user supplied,
/// stamped as an import.
fn minimal_record(title: &str, isbn: &Isbn, row: &RowRecord) -> CanonicalRecord {
    let mut record = CanonicalRecord {
        title: Some(title.to_string()),
        authors: row.authors.clone(),
        series: row.series_name.clone(),
        series_position: row.series_position,
        publisher: row.publisher.clone(),
        published_date: row.published_date.as_deref().and_then(parse_published_date),
        page_count: row.page_count,
        description: row.description.clone(),
        source: Some(MetadataSource::Import),
        ..Default::default()
    };
    match isbn {
        Isbn::Ten(isbn10) => record.isbn_10 = Some(isbn10.clone()),
        Isbn::Thirteen(isbn13) => record.isbn_13 = Some(isbn13.clone()),
    }
    record
}

//! Ingestion job state.
//!
//! Jobs live in an in-process registry for the lifetime of the
//! process; durability beyond a restart is the caller's concern.
//! Counters update atomically from concurrent row workers.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

/// Unique identifier for ingestion jobs, time-ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Why a row did not produce a book.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowError {
    pub row: usize,
    pub message: String,
}

/// Snapshot of one ingestion job, readable by id while the process
/// lives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionJob {
    pub id: JobId,
    /// What produced the catalog ("goodreads_csv", an importer name).
    pub source: String,
    pub url: Option<String>,
    pub status: JobStatus,
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub skipped: u64,
    pub errors: Vec<RowError>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Terminal states a job can be finalized with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Failed { reason: String },
}

#[derive(Debug, Default)]
struct Counters {
    total: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
}

#[derive(Debug)]
struct JobState {
    source: String,
    url: Option<String>,
    status: Mutex<JobStatus>,
    counters: Counters,
    errors: Mutex<Vec<RowError>>,
    started_at: DateTime<Utc>,
    finished_at: Mutex<Option<DateTime<Utc>>>,
}

/// Registry of ingestion jobs. One instance per process, shared by
/// every pipeline run.
#[derive(Debug, Default)]
pub struct JobTracker {
    jobs: DashMap<JobId, Arc<JobState>>,
}

impl JobTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a job in the running state.
    pub fn open_job(&self, source: &str, url: Option<&str>) -> JobId {
        let id = JobId::new();
        let state = JobState {
            source: source.to_string(),
            url: url.map(str::to_string),
            status: Mutex::new(JobStatus::Running),
            counters: Counters::default(),
            errors: Mutex::new(Vec::new()),
            started_at: Utc::now(),
            finished_at: Mutex::new(None),
        };
        self.jobs.insert(id, Arc::new(state));
        info!(job = %id, source, "ingestion job opened");
        id
    }

    /// Transition a job to its terminal state.
    pub async fn finalize_job(&self, id: JobId, outcome: JobOutcome) {
        let Some(state) = self.jobs.get(&id).map(|s| Arc::clone(&s)) else {
            return;
        };

        let status = match outcome {
            JobOutcome::Completed => JobStatus::Completed,
            JobOutcome::Failed { reason } => {
                state.errors.lock().await.push(RowError {
                    row: 0,
                    message: reason,
                });
                JobStatus::Failed
            }
        };

        *state.status.lock().await = status;
        *state.finished_at.lock().await = Some(Utc::now());
        info!(job = %id, ?status, "ingestion job finalized");
    }

    pub fn set_total(&self, id: JobId, total: u64) {
        if let Some(state) = self.jobs.get(&id) {
            state.counters.total.store(total, Ordering::Relaxed);
        }
    }

    pub fn add_row(&self, id: JobId) {
        if let Some(state) = self.jobs.get(&id) {
            state.counters.total.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_success(&self, id: JobId) {
        if let Some(state) = self.jobs.get(&id) {
            state.counters.succeeded.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub async fn record_skip(&self, id: JobId, row: usize, message: impl Into<String>) {
        if let Some(state) = self.jobs.get(&id).map(|s| Arc::clone(&s)) {
            state.counters.skipped.fetch_add(1, Ordering::Relaxed);
            state.errors.lock().await.push(RowError {
                row,
                message: message.into(),
            });
        }
    }

    pub async fn record_failure(&self, id: JobId, row: usize, message: impl Into<String>) {
        if let Some(state) = self.jobs.get(&id).map(|s| Arc::clone(&s)) {
            state.counters.failed.fetch_add(1, Ordering::Relaxed);
            state.errors.lock().await.push(RowError {
                row,
                message: message.into(),
            });
        }
    }

    /// Current snapshot of a job, or `None` for an unknown id.
    pub async fn job(&self, id: JobId) -> Option<IngestionJob> {
        let state = self.jobs.get(&id).map(|s| Arc::clone(&s))?;

        Some(IngestionJob {
            id,
            source: state.source.clone(),
            url: state.url.clone(),
            status: *state.status.lock().await,
            total: state.counters.total.load(Ordering::Relaxed),
            succeeded: state.counters.succeeded.load(Ordering::Relaxed),
            failed: state.counters.failed.load(Ordering::Relaxed),
            skipped: state.counters.skipped.load(Ordering::Relaxed),
            errors: state.errors.lock().await.clone(),
            started_at: state.started_at,
            finished_at: *state.finished_at.lock().await,
        })
    }

    /// Every known job, newest first.
    pub async fn jobs(&self) -> Vec<IngestionJob> {
        let ids: Vec<JobId> = self.jobs.iter().map(|entry| *entry.key()).collect();
        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(job) = self.job(id).await {
                jobs.push(job);
            }
        }
        jobs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        jobs
    }

    /// Drop a job from history. Returns whether it existed.
    pub fn delete_job(&self, id: JobId) -> bool {
        self.jobs.remove(&id).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn counters_survive_concurrent_updates() {
        let tracker = Arc::new(JobTracker::new());
        let id = tracker.open_job("test", None);

        let mut handles = Vec::new();
        for _ in 0..20 {
            let tracker = Arc::clone(&tracker);
            handles.push(tokio::spawn(async move {
                tracker.record_success(id);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let job = tracker.job(id).await.unwrap();
        assert_eq!(job.succeeded, 20);
    }

    #[tokio::test]
    async fn finalize_is_terminal_and_records_the_reason() {
        let tracker = JobTracker::new();
        let id = tracker.open_job("test", Some("file://catalog.csv"));

        tracker
            .finalize_job(
                id,
                JobOutcome::Failed {
                    reason: "cancelled".to_string(),
                },
            )
            .await;

        let job = tracker.job(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.finished_at.is_some());
        assert_eq!(job.errors[0].message, "cancelled");
    }

    #[tokio::test]
    async fn history_lists_newest_first_and_deletes() {
        let tracker = JobTracker::new();
        let first = tracker.open_job("a", None);
        let second = tracker.open_job("b", None);

        let jobs = tracker.jobs().await;
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].id, second);

        assert!(tracker.delete_job(first));
        assert!(!tracker.delete_job(first));
    }
}

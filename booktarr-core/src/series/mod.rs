//! Series integrity: reconciling declared totals against what the
//! library actually holds.
//!
//! The one hard invariant: a series never declares fewer total
//! volumes than the library owns. Validation proposes a corrected
//! total; reconciliation applies it (totals only ever grow here) and
//! cleans duplicate and orphaned volume rows.

use std::collections::BTreeMap;
use std::sync::Arc;

use booktarr_model::{Series, SeriesVolume, VolumeId, VolumeStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::database::LibraryRepository;
use crate::error::{CoreError, Result};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeriesReport {
    pub series: Series,
    /// Volume rows with status `owned`, duplicates included.
    pub owned_count: u32,
    /// Distinct positions recorded for the series.
    pub volume_count: u32,
    pub declared_total: Option<u32>,
    /// max(declared, owned, distinct positions, highest position).
    pub proposed_total: u32,
    pub missing_positions: Vec<u32>,
    /// Positions recorded more than once.
    pub duplicates: Vec<u32>,
    /// Volumes whose linked book no longer resolves.
    pub orphans: Vec<VolumeId>,
    /// owned ≤ declared (an undeclared total is unbounded).
    pub valid: bool,
    pub needs_correction: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeriesAudit {
    pub total: usize,
    pub valid: usize,
    pub correctable: usize,
    pub invalid: usize,
    /// Reports for everything that is not valid.
    pub reports: Vec<SeriesReport>,
    pub audited_at: DateTime<Utc>,
}

/// Verdict of the pre-write total check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum TotalCheck {
    Ok,
    Rejected { owned_count: u32 },
}

/// Verdict of the pre-write ownership check. Never blocks; flags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum OwnedCheck {
    Ok,
    ExceedsDeclared { owned_count: u32, declared: u32 },
}

pub struct SeriesIntegrityEngine {
    repository: Arc<dyn LibraryRepository>,
}

impl std::fmt::Debug for SeriesIntegrityEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeriesIntegrityEngine").finish()
    }
}

impl SeriesIntegrityEngine {
    pub fn new(repository: Arc<dyn LibraryRepository>) -> Self {
        Self { repository }
    }

    pub async fn validate(&self, name: &str) -> Result<SeriesReport> {
        let (series, volumes) = self.load(name).await?;
        self.build_report(series, volumes).await
    }

    /// Apply the proposed total (never lowering below the owned
    /// count), collapse duplicate positions, and unlink orphans.
    pub async fn reconcile(&self, name: &str) -> Result<SeriesReport> {
        let report = self.validate(name).await?;

        if report.needs_correction {
            info!(
                series = %report.series.name,
                from = ?report.declared_total,
                to = report.proposed_total,
                "correcting series total"
            );
            self.repository
                .set_series_total(report.series.id, report.proposed_total)
                .await?;
        }

        if !report.duplicates.is_empty() {
            let (_, volumes) = self.load(name).await?;
            let mut by_position: BTreeMap<u32, Vec<&SeriesVolume>> = BTreeMap::new();
            for volume in &volumes {
                by_position.entry(volume.position).or_default().push(volume);
            }

            for (position, mut rows) in by_position {
                if rows.len() < 2 {
                    continue;
                }
                // Keep the book-linked row, else the oldest.
                rows.sort_by_key(|v| (v.book_id.is_none(), v.created_at));
                warn!(
                    series = %report.series.name,
                    position,
                    removed = rows.len() - 1,
                    "collapsing duplicate volume rows"
                );
                for duplicate in &rows[1..] {
                    self.repository.remove_volume(duplicate.id).await?;
                }
            }
        }

        for orphan in &report.orphans {
            warn!(series = %report.series.name, volume = %orphan, "unlinking orphaned volume");
            self.repository.unlink_volume_book(*orphan).await?;
        }

        self.validate(name).await
    }

    /// Validate every series and bucket the results.
    pub async fn audit_all(&self) -> Result<SeriesAudit> {
        let all = self.repository.all_series().await?;

        let mut audit = SeriesAudit {
            total: all.len(),
            valid: 0,
            correctable: 0,
            invalid: 0,
            reports: Vec::new(),
            audited_at: Utc::now(),
        };

        for series in all {
            let report = self.validate(&series.name).await?;
            if report.valid {
                audit.valid += 1;
            } else {
                if report.needs_correction {
                    audit.correctable += 1;
                } else {
                    audit.invalid += 1;
                }
                audit.reports.push(report);
            }
        }

        Ok(audit)
    }

    /// Percentage of valid series, 0–100. An empty library is healthy.
    pub async fn health_score(&self) -> Result<u8> {
        let audit = self.audit_all().await?;
        if audit.total == 0 {
            return Ok(100);
        }
        Ok(((audit.valid * 100) / audit.total) as u8)
    }

    /// Pre-write guard: refuse any declared total below the owned
    /// count.
    pub async fn check_update_total(&self, name: &str, new_total: u32) -> Result<TotalCheck> {
        let (_, volumes) = self.load(name).await?;
        let owned_count = owned(&volumes);

        if new_total < owned_count {
            return Ok(TotalCheck::Rejected { owned_count });
        }
        Ok(TotalCheck::Ok)
    }

    /// Pre-write flag: marking one more volume owned would exceed the
    /// declared total. Does not block.
    pub async fn check_mark_owned(&self, name: &str) -> Result<OwnedCheck> {
        let (series, volumes) = self.load(name).await?;
        let owned_count = owned(&volumes);

        if let Some(declared) = series.total_volumes {
            if owned_count >= declared {
                return Ok(OwnedCheck::ExceedsDeclared {
                    owned_count,
                    declared,
                });
            }
        }
        Ok(OwnedCheck::Ok)
    }

    async fn load(&self, name: &str) -> Result<(Series, Vec<SeriesVolume>)> {
        self.repository
            .get_series_with_volumes(name)
            .await?
            .ok_or_else(|| CoreError::InvalidInput(format!("unknown series: {name}")))
    }

    async fn build_report(
        &self,
        series: Series,
        volumes: Vec<SeriesVolume>,
    ) -> Result<SeriesReport> {
        let owned_count = owned(&volumes);

        let mut rows_per_position: BTreeMap<u32, u32> = BTreeMap::new();
        for volume in &volumes {
            *rows_per_position.entry(volume.position).or_default() += 1;
        }
        let volume_count = rows_per_position.len() as u32;
        let highest_position = rows_per_position.keys().next_back().copied().unwrap_or(0);

        let declared_total = series.total_volumes;
        let proposed_total = declared_total
            .unwrap_or(0)
            .max(owned_count)
            .max(volume_count)
            .max(highest_position);

        let missing_positions: Vec<u32> = (1..=proposed_total)
            .filter(|p| !rows_per_position.contains_key(p))
            .collect();
        let duplicates: Vec<u32> = rows_per_position
            .iter()
            .filter(|&(_, &count)| count > 1)
            .map(|(&position, _)| position)
            .collect();

        let mut orphans = Vec::new();
        for volume in &volumes {
            if let Some(book_id) = volume.book_id {
                if !self.repository.book_exists(book_id).await? {
                    orphans.push(volume.id);
                }
            }
        }

        let valid = declared_total.is_none_or(|declared| owned_count <= declared);
        let needs_correction = declared_total != Some(proposed_total) && proposed_total > 0;

        Ok(SeriesReport {
            series,
            owned_count,
            volume_count,
            declared_total,
            proposed_total,
            missing_positions,
            duplicates,
            orphans,
            valid,
            needs_correction,
        })
    }
}

fn owned(volumes: &[SeriesVolume]) -> u32 {
    volumes
        .iter()
        .filter(|v| v.status == VolumeStatus::Owned)
        .count() as u32
}

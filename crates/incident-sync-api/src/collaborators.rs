//! Pluggable services the API calls out to: reference allocation and change publication.

use anyhow::{Context, Result};
use incident_sync_core::{InformationSource, Report, ReportId};
use incident_sync_store_sqlite::ReportTransaction;
use serde::{Deserialize, Serialize};

/// Primary references start here so they never collide with legacy incident ids.
pub const DEFAULT_REFERENCE_OFFSET: i64 = 100_000_000_000;

/// Issues human-readable references for reports created in the primary source.
pub trait ReferenceAllocator: Send + Sync {
    /// Allocate inside the creating transaction so a rolled-back create releases nothing
    /// visible.
    ///
    /// # Errors
    /// Returns an error when no reference can be produced.
    fn allocate(&self, tx: &ReportTransaction<'_>) -> Result<String>;
}

/// Offset counter backed by the store's reference sequence table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceReferenceAllocator {
    pub offset: i64,
}

impl Default for SequenceReferenceAllocator {
    fn default() -> Self {
        Self { offset: DEFAULT_REFERENCE_OFFSET }
    }
}

impl ReferenceAllocator for SequenceReferenceAllocator {
    fn allocate(&self, tx: &ReportTransaction<'_>) -> Result<String> {
        let value = tx.next_reference_number()?;
        let reference = self
            .offset
            .checked_add(value)
            .context("report reference sequence overflowed")?;
        Ok(reference.to_string())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

/// Notification handed to the publisher after a committed change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReportChange {
    pub kind: ChangeKind,
    pub report_id: ReportId,
    pub reference: String,
    pub source: InformationSource,
}

impl ReportChange {
    #[must_use]
    pub fn of(kind: ChangeKind, report: &Report) -> Self {
        Self {
            kind,
            report_id: report.id,
            reference: report.reference.clone(),
            source: report.modified_in,
        }
    }
}

pub trait ReportEventPublisher: Send + Sync {
    fn publish(&self, change: &ReportChange);
}

/// Writes every change to the `tracing` log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingPublisher;

impl ReportEventPublisher for TracingPublisher {
    fn publish(&self, change: &ReportChange) {
        tracing::info!(
            kind = ?change.kind,
            report_id = %change.report_id,
            reference = %change.reference,
            source = %change.source,
            "report changed"
        );
    }
}

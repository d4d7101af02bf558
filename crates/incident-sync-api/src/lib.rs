//! Transactional operations over the incident store: legacy snapshot upserts and
//! primary-source edits.
//!
//! Every call opens its own connection and runs in one `IMMEDIATE` transaction. Updates of
//! an existing report first take that report's lock from a registry shared by all clones of
//! [`IncidentSyncApi`].

mod collaborators;
mod error;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use incident_sync_core::{
    add_related, archive_type_change, create_from_snapshot, draft_report, ensure_legacy_may_update,
    event_for_report, merge_event, merge_snapshot, normalize, remove_related, update_related,
    Change, CodeMappings, CorrectionRequest, CorrectionRequestDraft, DescriptionAddendum,
    DescriptionAddendumDraft, EventId, InformationSource, LegacyReport, NewReport,
    NormalizedReport, PrisonerInvolvement, PrisonerInvolvementDraft, Report, ReportBasic,
    ReportId, ReportStatus, ReportType, Sequenced, SnapshotSummary, StaffInvolvement,
    StaffInvolvementDraft,
};
use incident_sync_store_sqlite::{is_unique_violation, SqliteStore};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub use collaborators::{
    ChangeKind, ReferenceAllocator, ReportChange, ReportEventPublisher,
    SequenceReferenceAllocator, TracingPublisher, DEFAULT_REFERENCE_OFFSET,
};
pub use error::SyncError;
pub use incident_sync_store_sqlite::{IntegrityReport, ReportFilter, SchemaStatus};

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

/// Inbound legacy sync payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    #[serde(default)]
    pub id: Option<ReportId>,
    #[serde(default)]
    pub initial_migration: bool,
    pub report: LegacyReport,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub created: bool,
    pub report: Report,
    pub summary: SnapshotSummary,
}

type AggregateLocks = Arc<Mutex<HashMap<ReportId, Arc<Mutex<()>>>>>;

type CollectionOf<T> = fn(&mut Report) -> &mut Vec<T>;

#[derive(Clone)]
pub struct IncidentSyncApi {
    db_path: PathBuf,
    locks: AggregateLocks,
    mappings: Arc<CodeMappings>,
    allocator: Arc<dyn ReferenceAllocator>,
    publisher: Arc<dyn ReportEventPublisher>,
}

impl IncidentSyncApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self {
            db_path,
            locks: AggregateLocks::default(),
            mappings: Arc::new(CodeMappings::standard()),
            allocator: Arc::new(SequenceReferenceAllocator::default()),
            publisher: Arc::new(TracingPublisher),
        }
    }

    #[must_use]
    pub fn with_mappings(mut self, mappings: CodeMappings) -> Self {
        self.mappings = Arc::new(mappings);
        self
    }

    #[must_use]
    pub fn with_allocator(mut self, allocator: Arc<dyn ReferenceAllocator>) -> Self {
        self.allocator = allocator;
        self
    }

    #[must_use]
    pub fn with_publisher(mut self, publisher: Arc<dyn ReportEventPublisher>) -> Self {
        self.publisher = publisher;
        self
    }

    fn open_store(&self) -> anyhow::Result<SqliteStore> {
        let mut store = SqliteStore::open(&self.db_path)?;
        store.migrate()?;
        Ok(store)
    }

    /// Run `f` holding the report's lock. The registry entry lives only while some call
    /// holds or waits for it.
    fn with_aggregate_lock<R>(&self, id: ReportId, f: impl FnOnce() -> R) -> R {
        let lock = Arc::clone(self.locks.lock().entry(id).or_default());
        let result = {
            let _guard = lock.lock();
            f()
        };
        let mut locks = self.locks.lock();
        // One reference in the registry, one here.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(&id);
        }
        result
    }

    #[cfg(test)]
    fn tracked_locks(&self) -> usize {
        self.locks.lock().len()
    }

    fn publish(&self, kind: ChangeKind, report: &Report) {
        self.publisher.publish(&ReportChange::of(kind, report));
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus, SyncError> {
        let store = SqliteStore::open(&self.db_path)?;
        Ok(store.schema_status()?)
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult, SyncError> {
        let mut store = SqliteStore::open(&self.db_path)?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: before.pending_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// # Errors
    /// Returns an error when an integrity probe fails to run.
    pub fn integrity_check(&self) -> Result<IntegrityReport, SyncError> {
        let store = self.open_store()?;
        Ok(store.integrity_check()?)
    }

    /// Create or update a report from a legacy snapshot.
    ///
    /// Without an id the snapshot becomes a new legacy-sourced report. With an id the stored
    /// report is reconciled against the snapshot, provided the legacy source was its last
    /// writer.
    ///
    /// # Errors
    /// - [`SyncError::InvalidRequest`] for an id combined with `initialMigration`, unmapped
    ///   codes, or repeated natural keys;
    /// - [`SyncError::NotFound`] when the id or its event does not exist;
    /// - [`SyncError::ProvenanceConflict`] when the report was last modified in the primary
    ///   source;
    /// - [`SyncError::AlreadyExists`] when a new report's reference is taken.
    pub fn upsert(&self, request: SyncRequest) -> Result<UpsertOutcome, SyncError> {
        if request.id.is_some() && request.initial_migration {
            return Err(SyncError::InvalidRequest(
                "an initial migration cannot target an existing report".to_string(),
            ));
        }
        let snapshot = normalize(&request.report, &self.mappings)?;

        let Some(id) = request.id else {
            return self.create_from_legacy(snapshot);
        };

        self.with_aggregate_lock(id, || self.update_from_legacy(id, &snapshot))
    }

    fn update_from_legacy(
        &self,
        id: ReportId,
        snapshot: &NormalizedReport,
    ) -> Result<UpsertOutcome, SyncError> {
        let mut store = self.open_store()?;
        let tx = store.begin()?;
        let mut report = tx.load_report(id)?.ok_or_else(|| SyncError::report_not_found(id))?;
        if let Err(conflict) = ensure_legacy_may_update(&report) {
            tracing::warn!(
                report_id = %id,
                reference = %report.reference,
                modified_in = %report.modified_in,
                "rejected legacy snapshot for report edited in primary source"
            );
            return Err(conflict.into());
        }

        let summary = merge_snapshot(&mut report, snapshot, OffsetDateTime::now_utc())?;
        let mut event = tx.load_event(report.event_id)?.ok_or_else(|| SyncError::NotFound {
            entity: "event",
            id: report.event_id.to_string(),
        })?;
        merge_event(&mut event, snapshot);

        tx.save_report(&report)?;
        tx.save_event(&event)?;
        tx.commit()?;

        tracing::info!(
            report_id = %id,
            reference = %report.reference,
            type_archived = summary.type_archived,
            status_changed = summary.status_changed,
            inserted = summary.collections.inserted,
            updated = summary.collections.updated,
            deleted = summary.collections.deleted,
            "updated report from legacy snapshot"
        );
        self.publish(ChangeKind::Updated, &report);
        Ok(UpsertOutcome { created: false, report, summary })
    }

    fn create_from_legacy(
        &self,
        snapshot: NormalizedReport,
    ) -> Result<UpsertOutcome, SyncError> {
        let reference = snapshot.reference.clone();
        let (report, event, summary) = create_from_snapshot(snapshot)?;

        let mut store = self.open_store()?;
        let tx = store.begin()?;
        tx.insert_event(&event).map_err(|err| creation_error(err, &reference))?;
        tx.insert_report(&report).map_err(|err| creation_error(err, &reference))?;
        tx.commit()?;

        tracing::info!(
            report_id = %report.id,
            reference = %report.reference,
            inserted = summary.collections.inserted,
            "created report from legacy snapshot"
        );
        self.publish(ChangeKind::Created, &report);
        Ok(UpsertOutcome { created: true, report, summary })
    }

    /// Create a DRAFT report in the primary source, with a freshly allocated reference.
    ///
    /// # Errors
    /// Returns [`SyncError::NotFound`] when `request.event_id` names a missing event and
    /// [`SyncError::AlreadyExists`] when the allocated reference is already taken.
    pub fn create_report(&self, request: NewReport, actor: &str) -> Result<Report, SyncError> {
        let change = Change { by: actor.to_string(), at: OffsetDateTime::now_utc() };
        let mut store = self.open_store()?;
        let tx = store.begin()?;

        let existing_event = match request.event_id {
            Some(event_id) => Some(tx.load_event(event_id)?.ok_or_else(|| {
                SyncError::NotFound { entity: "event", id: event_id.to_string() }
            })?),
            None => None,
        };
        let reference = self.allocator.allocate(&tx)?;
        let event_id = existing_event.as_ref().map_or_else(EventId::new, |event| event.id);
        let report = draft_report(request, reference, event_id, &change);

        if existing_event.is_none() {
            tx.insert_event(&event_for_report(&report))
                .map_err(|err| creation_error(err, &report.reference))?;
        }
        tx.insert_report(&report).map_err(|err| creation_error(err, &report.reference))?;
        tx.commit()?;

        tracing::info!(report_id = %report.id, reference = %report.reference, "created draft report");
        self.publish(ChangeKind::Created, &report);
        Ok(report)
    }

    /// # Errors
    /// Returns [`SyncError::NotFound`] when no report has `id`.
    pub fn get_report(&self, id: ReportId) -> Result<Report, SyncError> {
        let store = self.open_store()?;
        store.load_report(id)?.ok_or_else(|| SyncError::report_not_found(id))
    }

    /// # Errors
    /// Returns [`SyncError::NotFound`] when no report has `reference`.
    pub fn get_report_by_reference(&self, reference: &str) -> Result<Report, SyncError> {
        let store = self.open_store()?;
        let not_found = || SyncError::NotFound { entity: "report", id: reference.to_string() };
        let id = store.find_report_id(reference)?.ok_or_else(not_found)?;
        store.load_report(id)?.ok_or_else(not_found)
    }

    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn list_reports(&self, filter: &ReportFilter) -> Result<Vec<ReportBasic>, SyncError> {
        let store = self.open_store()?;
        Ok(store.list_reports(filter)?)
    }

    /// Delete a report with everything it owns, and its event once no report links to it.
    ///
    /// # Errors
    /// Returns [`SyncError::NotFound`] when no report has `id`.
    pub fn delete_report(&self, id: ReportId) -> Result<Report, SyncError> {
        self.with_aggregate_lock(id, || -> Result<Report, SyncError> {
            let mut store = self.open_store()?;
            let tx = store.begin()?;
            let report = tx.load_report(id)?.ok_or_else(|| SyncError::report_not_found(id))?;
            tx.delete_report(id)?;
            let event_deleted = tx.delete_event_if_orphaned(report.event_id)?;
            tx.commit()?;

            tracing::info!(report_id = %id, reference = %report.reference, event_deleted, "deleted report");
            self.publish(ChangeKind::Deleted, &report);
            Ok(report)
        })
    }

    /// # Errors
    /// Returns [`SyncError::NotFound`] when no report has `id`.
    pub fn change_status(
        &self,
        id: ReportId,
        status: ReportStatus,
        actor: &str,
    ) -> Result<Report, SyncError> {
        self.edit_report(id, actor, |report, change| {
            report.change_status(status, &change.by, change.at);
            Ok(())
        })
    }

    /// Change the report type, archiving the current questions under the outgoing type.
    ///
    /// # Errors
    /// Returns [`SyncError::NotFound`] when no report has `id`.
    pub fn change_type(
        &self,
        id: ReportId,
        report_type: ReportType,
        actor: &str,
    ) -> Result<Report, SyncError> {
        self.edit_report(id, actor, |report, change| {
            archive_type_change(report, report_type, change.at, &change.by);
            Ok(())
        })
    }

    /// # Errors
    /// Returns [`SyncError::NotFound`] when no report has `id`.
    pub fn add_staff_involvement(
        &self,
        id: ReportId,
        draft: StaffInvolvementDraft,
        actor: &str,
    ) -> Result<Report, SyncError> {
        self.add_to(id, actor, draft, staff_of)
    }

    /// # Errors
    /// Returns [`SyncError::NotFound`] or [`SyncError::IndexOutOfRange`].
    pub fn update_staff_involvement(
        &self,
        id: ReportId,
        index: usize,
        draft: StaffInvolvementDraft,
        actor: &str,
    ) -> Result<Report, SyncError> {
        self.update_in(id, actor, index, draft, staff_of)
    }

    /// # Errors
    /// Returns [`SyncError::NotFound`] or [`SyncError::IndexOutOfRange`].
    pub fn remove_staff_involvement(
        &self,
        id: ReportId,
        index: usize,
        actor: &str,
    ) -> Result<Report, SyncError> {
        self.remove_from(id, actor, index, staff_of)
    }

    /// # Errors
    /// Returns [`SyncError::NotFound`] when no report has `id`.
    pub fn add_prisoner_involvement(
        &self,
        id: ReportId,
        draft: PrisonerInvolvementDraft,
        actor: &str,
    ) -> Result<Report, SyncError> {
        self.add_to(id, actor, draft, prisoners_of)
    }

    /// # Errors
    /// Returns [`SyncError::NotFound`] or [`SyncError::IndexOutOfRange`].
    pub fn update_prisoner_involvement(
        &self,
        id: ReportId,
        index: usize,
        draft: PrisonerInvolvementDraft,
        actor: &str,
    ) -> Result<Report, SyncError> {
        self.update_in(id, actor, index, draft, prisoners_of)
    }

    /// # Errors
    /// Returns [`SyncError::NotFound`] or [`SyncError::IndexOutOfRange`].
    pub fn remove_prisoner_involvement(
        &self,
        id: ReportId,
        index: usize,
        actor: &str,
    ) -> Result<Report, SyncError> {
        self.remove_from(id, actor, index, prisoners_of)
    }

    /// # Errors
    /// Returns [`SyncError::NotFound`] when no report has `id`.
    pub fn add_correction_request(
        &self,
        id: ReportId,
        draft: CorrectionRequestDraft,
        actor: &str,
    ) -> Result<Report, SyncError> {
        self.add_to(id, actor, draft, corrections_of)
    }

    /// # Errors
    /// Returns [`SyncError::NotFound`] or [`SyncError::IndexOutOfRange`].
    pub fn update_correction_request(
        &self,
        id: ReportId,
        index: usize,
        draft: CorrectionRequestDraft,
        actor: &str,
    ) -> Result<Report, SyncError> {
        self.update_in(id, actor, index, draft, corrections_of)
    }

    /// # Errors
    /// Returns [`SyncError::NotFound`] or [`SyncError::IndexOutOfRange`].
    pub fn remove_correction_request(
        &self,
        id: ReportId,
        index: usize,
        actor: &str,
    ) -> Result<Report, SyncError> {
        self.remove_from(id, actor, index, corrections_of)
    }

    /// # Errors
    /// Returns [`SyncError::NotFound`] when no report has `id`.
    pub fn add_description_addendum(
        &self,
        id: ReportId,
        draft: DescriptionAddendumDraft,
        actor: &str,
    ) -> Result<Report, SyncError> {
        self.add_to(id, actor, draft, addenda_of)
    }

    fn add_to<T: Sequenced>(
        &self,
        id: ReportId,
        actor: &str,
        draft: T::Draft,
        collection: CollectionOf<T>,
    ) -> Result<Report, SyncError> {
        self.edit_report(id, actor, |report, change| {
            add_related(collection(report), draft, change)?;
            Ok(())
        })
    }

    fn update_in<T: Sequenced>(
        &self,
        id: ReportId,
        actor: &str,
        index: usize,
        draft: T::Draft,
        collection: CollectionOf<T>,
    ) -> Result<Report, SyncError> {
        self.edit_report(id, actor, |report, change| {
            update_related(collection(report), index, draft, change)?;
            Ok(())
        })
    }

    fn remove_from<T: Sequenced>(
        &self,
        id: ReportId,
        actor: &str,
        index: usize,
        collection: CollectionOf<T>,
    ) -> Result<Report, SyncError> {
        self.edit_report(id, actor, |report, _change| {
            remove_related(collection(report), index)?;
            Ok(())
        })
    }

    /// Load, edit and save one report as a primary-source write.
    fn edit_report(
        &self,
        id: ReportId,
        actor: &str,
        edit: impl FnOnce(&mut Report, &Change) -> Result<(), SyncError>,
    ) -> Result<Report, SyncError> {
        self.with_aggregate_lock(id, || -> Result<Report, SyncError> {
            let mut store = self.open_store()?;
            let tx = store.begin()?;
            let mut report =
                tx.load_report(id)?.ok_or_else(|| SyncError::report_not_found(id))?;

            let change = Change { by: actor.to_string(), at: OffsetDateTime::now_utc() };
            edit(&mut report, &change)?;
            report.touch(InformationSource::Primary, &change.by, change.at);

            tx.save_report(&report)?;
            tx.commit()?;

            tracing::debug!(report_id = %id, modified_by = %change.by, "saved primary edit");
            self.publish(ChangeKind::Updated, &report);
            Ok(report)
        })
    }
}

fn staff_of(report: &mut Report) -> &mut Vec<StaffInvolvement> {
    &mut report.staff_involved
}

fn prisoners_of(report: &mut Report) -> &mut Vec<PrisonerInvolvement> {
    &mut report.prisoners_involved
}

fn corrections_of(report: &mut Report) -> &mut Vec<CorrectionRequest> {
    &mut report.correction_requests
}

fn addenda_of(report: &mut Report) -> &mut Vec<DescriptionAddendum> {
    &mut report.description_addenda
}

fn creation_error(err: anyhow::Error, reference: &str) -> SyncError {
    if is_unique_violation(&err) {
        SyncError::AlreadyExists { reference: reference.to_string() }
    } else {
        SyncError::Unexpected(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("incident-sync-api-{}.sqlite3", ulid::Ulid::new()))
    }

    #[test]
    fn migrate_dry_run_plans_without_applying() -> Result<(), SyncError> {
        let api = IncidentSyncApi::new(unique_temp_db_path());

        let planned = api.migrate(true)?;
        assert_eq!(planned.would_apply_versions, vec![1]);
        assert_eq!(api.schema_status()?.current_version, 0);

        let applied = api.migrate(false)?;
        assert_eq!(applied.after_version, Some(1));
        assert_eq!(applied.up_to_date, Some(true));
        Ok(())
    }

    #[test]
    fn id_with_initial_migration_is_rejected_before_normalizing() -> Result<(), serde_json::Error> {
        let api = IncidentSyncApi::new(unique_temp_db_path());
        let request: SyncRequest = serde_json::from_value(serde_json::json!({
            "id": ulid::Ulid::new().to_string(),
            "initialMigration": true,
            "report": {
                "incidentId": 1,
                "prison": {"code": "MDI"},
                "status": {"code": "UNMAPPED"},
                "type": "UNMAPPED",
                "reportingStaff": {"username": "U", "firstName": "F", "lastName": "L"},
                "reportedDateTime": "2024-06-01T10:05:00Z",
                "incidentDateTime": "2024-06-01T09:30:00Z",
                "createDateTime": "2024-06-01T10:05:00Z",
                "createdBy": "U"
            }
        }))?;

        let result = api.upsert(request);
        assert!(matches!(result, Err(SyncError::InvalidRequest(message)) if message.contains("initial migration")));
        Ok(())
    }

    #[test]
    fn lock_registry_forgets_reports_once_calls_finish() -> Result<(), SyncError> {
        let api = IncidentSyncApi::new(unique_temp_db_path());
        for _ in 0..50 {
            let result = api.change_status(ReportId::new(), ReportStatus::Closed, "EDITOR");
            assert!(matches!(result, Err(SyncError::NotFound { .. })));
        }
        assert!(matches!(api.delete_report(ReportId::new()), Err(SyncError::NotFound { .. })));
        assert_eq!(api.tracked_locks(), 0);

        let report = api.create_report(
            NewReport {
                report_type: ReportType::Find,
                location: "LEI".to_string(),
                title: "Phone".to_string(),
                description: "Found in cell".to_string(),
                incident_date_and_time: OffsetDateTime::UNIX_EPOCH,
                event_id: None,
            },
            "EDITOR",
        )?;
        api.change_status(report.id, ReportStatus::AwaitingReview, "EDITOR")?;
        assert_eq!(api.tracked_locks(), 0);
        Ok(())
    }

    #[test]
    fn waiting_callers_keep_the_shared_lock() {
        let api = IncidentSyncApi::new(unique_temp_db_path());
        let id = ReportId::new();
        let held = Arc::clone(api.locks.lock().entry(id).or_default());

        api.with_aggregate_lock(id, || ());
        assert_eq!(api.tracked_locks(), 1);

        drop(held);
        api.with_aggregate_lock(id, || ());
        assert_eq!(api.tracked_locks(), 0);
    }

    #[test]
    fn sequence_allocator_offsets_references() -> anyhow::Result<()> {
        let path = unique_temp_db_path();
        let mut store = SqliteStore::open(&path)?;
        store.migrate()?;
        let tx = store.begin()?;
        let allocator = SequenceReferenceAllocator { offset: 500 };
        assert_eq!(allocator.allocate(&tx)?, "501");
        assert_eq!(allocator.allocate(&tx)?, "502");
        Ok(())
    }
}

//! Applying normalized legacy snapshots to report aggregates.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::archive::archive_type_change;
use crate::codes::InformationSource;
use crate::error::ReconcileError;
use crate::keys::Keyed;
use crate::model::{Event, EventId, History, Report, ReportId, StatusHistory};
use crate::normalize::NormalizedReport;
use crate::reconcile::{ensure_unique_keys, reconcile, ReconcileSummary, StalePolicy};

/// What a snapshot did to an aggregate.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotSummary {
    pub type_archived: bool,
    pub status_changed: bool,
    pub collections: ReconcileSummary,
}

/// Build a brand new legacy-sourced report and its event from a snapshot.
///
/// Collections are seeded by reconciling against empty ones, so the same key validation
/// applies as for updates.
///
/// # Errors
/// Returns [`ReconcileError::DuplicateKey`] when a snapshot collection repeats a key.
pub fn create_from_snapshot(
    snapshot: NormalizedReport,
) -> Result<(Report, Event, SnapshotSummary), ReconcileError> {
    let event = Event {
        id: EventId::new(),
        event_reference: snapshot.reference.clone(),
        event_date_and_time: snapshot.incident_date_and_time,
        location: snapshot.location.clone(),
        title: snapshot.title.clone(),
        description: snapshot.description.clone(),
        created_at: snapshot.created_at,
        modified_at: snapshot.modified_at,
        modified_by: snapshot.modified_by.clone(),
    };

    let mut report = Report {
        id: ReportId::new(),
        reference: snapshot.reference.clone(),
        event_id: event.id,
        report_type: snapshot.report_type,
        status: snapshot.status,
        location: String::new(),
        title: String::new(),
        description: String::new(),
        incident_date_and_time: snapshot.incident_date_and_time,
        reported_by: String::new(),
        reported_at: snapshot.reported_at,
        created_at: snapshot.created_at,
        modified_at: snapshot.modified_at,
        modified_by: snapshot.modified_by.clone(),
        source: InformationSource::Legacy,
        modified_in: InformationSource::Legacy,
        status_history: vec![StatusHistory {
            status: snapshot.status,
            changed_at: snapshot.created_at,
            changed_by: snapshot.created_by.clone(),
        }],
        staff_involved: Vec::new(),
        prisoners_involved: Vec::new(),
        correction_requests: Vec::new(),
        description_addenda: Vec::new(),
        questions: Vec::new(),
        history: Vec::new(),
    };

    let collections = reconcile_collections(&mut report, &snapshot)?;
    copy_scalars(&mut report, &snapshot);
    Ok((report, event, SnapshotSummary { collections, ..SnapshotSummary::default() }))
}

/// Merge a snapshot into an existing report.
///
/// A type change is archived before questions are reconciled. When the snapshot's history
/// already records that change, the archive takes the recorded time and actor so both
/// collapse into one entry. All keys are validated up front so a rejected snapshot leaves
/// `report` untouched. Provenance is the caller's
/// concern and must be checked before this runs.
///
/// # Errors
/// Returns [`ReconcileError::DuplicateKey`] when a snapshot collection repeats a key.
pub fn merge_snapshot(
    report: &mut Report,
    snapshot: &NormalizedReport,
    now: OffsetDateTime,
) -> Result<SnapshotSummary, ReconcileError> {
    validate_snapshot_keys(snapshot)?;

    let (changed_at, changed_by) = recorded_type_change(report, snapshot).map_or(
        (now, snapshot.modified_by.as_str()),
        |entry| (entry.changed_at, entry.changed_by.as_str()),
    );
    let type_archived = archive_type_change(report, snapshot.report_type, changed_at, changed_by);
    let collections = reconcile_collections(report, snapshot)?;
    copy_scalars(report, snapshot);
    let status_changed =
        report.change_status(snapshot.status, &snapshot.modified_by, snapshot.modified_at);
    report.touch(InformationSource::Legacy, &snapshot.modified_by, snapshot.modified_at);

    Ok(SnapshotSummary { type_archived, status_changed, collections })
}

/// Mirror the snapshot's descriptive fields onto the report's event.
pub fn merge_event(event: &mut Event, snapshot: &NormalizedReport) {
    event.event_date_and_time = snapshot.incident_date_and_time;
    event.location.clone_from(&snapshot.location);
    event.title.clone_from(&snapshot.title);
    event.description.clone_from(&snapshot.description);
    event.modified_at = snapshot.modified_at;
    event.modified_by.clone_from(&snapshot.modified_by);
}

/// Latest snapshot history entry for the report's outgoing type that is not stored yet.
fn recorded_type_change<'a>(
    report: &Report,
    snapshot: &'a NormalizedReport,
) -> Option<&'a History> {
    if report.report_type == snapshot.report_type {
        return None;
    }
    let stored: BTreeSet<_> = report.history.iter().map(Keyed::key).collect();
    snapshot
        .history
        .iter()
        .filter(|entry| entry.report_type == report.report_type && !stored.contains(&entry.key()))
        .max_by_key(|entry| entry.changed_at)
}

fn validate_snapshot_keys(snapshot: &NormalizedReport) -> Result<(), ReconcileError> {
    ensure_unique_keys(&snapshot.staff_involved)?;
    ensure_unique_keys(&snapshot.prisoners_involved)?;
    ensure_unique_keys(&snapshot.correction_requests)?;
    ensure_unique_keys(&snapshot.description_addenda)?;
    ensure_unique_keys(&snapshot.questions)?;
    ensure_unique_keys(&snapshot.history)
}

fn reconcile_collections(
    report: &mut Report,
    snapshot: &NormalizedReport,
) -> Result<ReconcileSummary, ReconcileError> {
    let mut summary = ReconcileSummary::default();
    summary.add(reconcile(
        &mut report.staff_involved,
        snapshot.staff_involved.clone(),
        StalePolicy::Delete,
    )?);
    summary.add(reconcile(
        &mut report.prisoners_involved,
        snapshot.prisoners_involved.clone(),
        StalePolicy::Delete,
    )?);
    summary.add(reconcile(
        &mut report.correction_requests,
        snapshot.correction_requests.clone(),
        StalePolicy::Delete,
    )?);
    summary.add(reconcile(
        &mut report.description_addenda,
        snapshot.description_addenda.clone(),
        StalePolicy::Delete,
    )?);
    summary.add(reconcile(
        &mut report.questions,
        snapshot.questions.clone(),
        StalePolicy::Delete,
    )?);
    // Entries archived by primary-source type changes never reach the legacy history.
    summary.add(reconcile(&mut report.history, snapshot.history.clone(), StalePolicy::Keep)?);
    Ok(summary)
}

fn copy_scalars(report: &mut Report, snapshot: &NormalizedReport) {
    report.location.clone_from(&snapshot.location);
    report.title.clone_from(&snapshot.title);
    report.description.clone_from(&snapshot.description);
    report.incident_date_and_time = snapshot.incident_date_and_time;
    report.reported_by.clone_from(&snapshot.reported_by);
    report.reported_at = snapshot.reported_at;
}

#[cfg(test)]
mod tests {
    use time::Duration;

    use super::*;
    use crate::codes::{ReportStatus, ReportType, StaffRole};
    use crate::model::{HistoricalQuestion, Question, StaffInvolvement};
    use crate::provenance::ensure_legacy_may_update;

    fn at(offset: i64) -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_700_000_000 + offset)
    }

    fn staff(sequence: u32, username: &str, role: StaffRole) -> StaffInvolvement {
        StaffInvolvement {
            sequence,
            staff_username: username.to_string(),
            first_name: username.to_string(),
            last_name: "Officer".to_string(),
            staff_role: role,
            comment: None,
        }
    }

    fn question(code: &str, sequence: u32) -> Question {
        Question {
            code: code.to_string(),
            sequence,
            question: format!("question {code}"),
            additional_information: None,
            responses: Vec::new(),
        }
    }

    fn snapshot() -> NormalizedReport {
        NormalizedReport {
            reference: "4001".to_string(),
            report_type: ReportType::Damage,
            status: ReportStatus::AwaitingReview,
            location: "MDI".to_string(),
            title: "Damage".to_string(),
            description: "Window".to_string(),
            incident_date_and_time: at(0),
            reported_by: "reporter".to_string(),
            reported_at: at(10),
            created_at: at(10),
            created_by: "reporter".to_string(),
            modified_at: at(10),
            modified_by: "reporter".to_string(),
            staff_involved: vec![
                staff(0, "alice", StaffRole::ActivelyInvolved),
                staff(1, "bob", StaffRole::Witness),
                staff(2, "carl", StaffRole::Victim),
            ],
            prisoners_involved: Vec::new(),
            correction_requests: Vec::new(),
            description_addenda: Vec::new(),
            questions: vec![question("Q1", 0), question("Q2", 1)],
            history: Vec::new(),
        }
    }

    #[test]
    fn create_seeds_every_collection_and_initial_status() -> Result<(), ReconcileError> {
        let (report, event, summary) = create_from_snapshot(snapshot())?;

        assert_eq!(report.reference, "4001");
        assert_eq!(report.event_id, event.id);
        assert_eq!(event.event_reference, "4001");
        assert_eq!(report.source, InformationSource::Legacy);
        assert_eq!(report.modified_in, InformationSource::Legacy);
        assert_eq!(report.staff_involved.len(), 3);
        assert_eq!(report.status_history.len(), 1);
        assert_eq!(report.title, "Damage");
        assert_eq!(summary.collections.inserted, 5);
        Ok(())
    }

    #[test]
    fn staff_scenario_updates_matched_and_removes_missing() -> Result<(), ReconcileError> {
        let (mut report, _, _) = create_from_snapshot(snapshot())?;
        let mut next = snapshot();
        next.staff_involved =
            vec![staff(0, "alice", StaffRole::ActivelyInvolved), staff(2, "carl2", StaffRole::Victim)];

        merge_snapshot(&mut report, &next, at(100))?;

        assert_eq!(report.staff_involved.len(), 2);
        assert_eq!(report.staff_involved[0], staff(0, "alice", StaffRole::ActivelyInvolved));
        assert_eq!(report.staff_involved[1].sequence, 2);
        assert_eq!(report.staff_involved[1].staff_username, "carl2");
        Ok(())
    }

    #[test]
    fn merging_the_same_snapshot_twice_is_a_noop() -> Result<(), ReconcileError> {
        let (mut report, _, _) = create_from_snapshot(snapshot())?;
        let mut next = snapshot();
        next.title = "Damage to cell".to_string();
        next.status = ReportStatus::Closed;

        let first = merge_snapshot(&mut report, &next, at(100))?;
        assert!(first.status_changed);
        let after_first = report.clone();

        let second = merge_snapshot(&mut report, &next, at(200))?;
        assert!(second.collections.is_noop());
        assert!(!second.status_changed);
        assert!(!second.type_archived);
        assert_eq!(report, after_first);
        Ok(())
    }

    #[test]
    fn type_change_archives_damage_questions() -> Result<(), ReconcileError> {
        let (mut report, _, _) = create_from_snapshot(snapshot())?;
        let mut next = snapshot();
        next.report_type = ReportType::Assault;
        next.questions = Vec::new();

        let summary = merge_snapshot(&mut report, &next, at(100))?;

        assert!(summary.type_archived);
        assert_eq!(report.report_type, ReportType::Assault);
        assert!(report.questions.is_empty());
        assert_eq!(report.history.len(), 1);
        assert_eq!(report.history[0].report_type, ReportType::Damage);
        assert_eq!(report.history[0].changed_at, at(100));
        assert_eq!(report.history[0].questions.len(), 2);
        Ok(())
    }

    #[test]
    fn type_change_listed_in_legacy_history_archives_once() -> Result<(), ReconcileError> {
        let (mut report, _, _) = create_from_snapshot(snapshot())?;
        let mut next = snapshot();
        next.report_type = ReportType::Assault;
        next.questions = vec![question("Q7", 0)];
        next.history = vec![History {
            report_type: ReportType::Damage,
            changed_at: at(50),
            changed_by: "legacy-user".to_string(),
            questions: vec![HistoricalQuestion::from(&question("Q1", 0))],
        }];

        let summary = merge_snapshot(&mut report, &next, at(100))?;

        assert!(summary.type_archived);
        assert_eq!(report.history.len(), 1);
        let entry = &report.history[0];
        assert_eq!(entry.report_type, ReportType::Damage);
        assert_eq!(entry.changed_at, at(50));
        assert_eq!(entry.changed_by, "legacy-user");
        assert_eq!(entry.questions.len(), 2);

        let again = merge_snapshot(&mut report, &next, at(200))?;
        assert!(!again.type_archived);
        assert!(again.collections.is_noop());
        assert_eq!(report.history.len(), 1);
        Ok(())
    }

    #[test]
    fn same_type_creates_no_history() -> Result<(), ReconcileError> {
        let (mut report, _, _) = create_from_snapshot(snapshot())?;
        merge_snapshot(&mut report, &snapshot(), at(100))?;
        assert!(report.history.is_empty());
        Ok(())
    }

    #[test]
    fn duplicate_snapshot_key_leaves_report_untouched() -> Result<(), ReconcileError> {
        let (mut report, _, _) = create_from_snapshot(snapshot())?;
        let before = report.clone();
        let mut next = snapshot();
        next.report_type = ReportType::Assault;
        next.questions = vec![question("Q9", 3), question("Q9", 3)];

        let result = merge_snapshot(&mut report, &next, at(100));

        assert!(result.is_err());
        assert_eq!(report, before);
        Ok(())
    }

    #[test]
    fn primary_edited_report_refuses_legacy_snapshot() -> Result<(), ReconcileError> {
        let (mut report, _, _) = create_from_snapshot(snapshot())?;
        assert!(ensure_legacy_may_update(&report).is_ok());

        report.touch(InformationSource::Primary, "editor", at(50));
        let conflict = ensure_legacy_may_update(&report);
        assert!(matches!(conflict, Err(err) if err.modified_in == InformationSource::Primary));
        Ok(())
    }

    #[test]
    fn event_follows_snapshot_text() -> Result<(), ReconcileError> {
        let (_, mut event, _) = create_from_snapshot(snapshot())?;
        let mut next = snapshot();
        next.title = "Renamed".to_string();
        next.modified_by = "editor".to_string();

        merge_event(&mut event, &next);

        assert_eq!(event.title, "Renamed");
        assert_eq!(event.modified_by, "editor");
        assert_eq!(event.event_reference, "4001");
        Ok(())
    }
}

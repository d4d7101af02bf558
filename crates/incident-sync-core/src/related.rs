//! Primary-source edits of sequence-keyed related objects.
//!
//! Related objects are addressed by their 1-based position in the collection. New records
//! get `last sequence + 1`; gaps left by removals are never refilled.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::codes::{
    InformationSource, PrisonerOutcome, PrisonerRole, ReportStatus, ReportType, StaffRole,
};
use crate::error::{IndexOutOfRange, SequenceExhausted};
use crate::keys::Keyed;
use crate::model::{
    CorrectionRequest, DescriptionAddendum, Event, EventId, PrisonerInvolvement, Report,
    ReportId, StaffInvolvement, StatusHistory,
};

/// Who is making a primary-source edit, and when.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub by: String,
    pub at: OffsetDateTime,
}

pub trait Sequenced: Keyed {
    /// Caller-supplied fields of a new or replaced record.
    type Draft;

    fn sequence(&self) -> u32;

    fn from_draft(sequence: u32, draft: Self::Draft, change: &Change) -> Self;

    fn apply_draft(&mut self, draft: Self::Draft, change: &Change);
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StaffInvolvementDraft {
    pub staff_username: String,
    pub first_name: String,
    pub last_name: String,
    pub staff_role: StaffRole,
    #[serde(default)]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PrisonerInvolvementDraft {
    pub prisoner_number: String,
    pub first_name: String,
    pub last_name: String,
    pub prisoner_role: PrisonerRole,
    #[serde(default)]
    pub outcome: Option<PrisonerOutcome>,
    #[serde(default)]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CorrectionRequestDraft {
    pub description_of_change: String,
    #[serde(default)]
    pub location: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DescriptionAddendumDraft {
    pub first_name: String,
    pub last_name: String,
    pub text: String,
}

impl Sequenced for StaffInvolvement {
    type Draft = StaffInvolvementDraft;

    fn sequence(&self) -> u32 {
        self.sequence
    }

    fn from_draft(sequence: u32, draft: Self::Draft, _change: &Change) -> Self {
        Self {
            sequence,
            staff_username: draft.staff_username,
            first_name: draft.first_name,
            last_name: draft.last_name,
            staff_role: draft.staff_role,
            comment: draft.comment,
        }
    }

    fn apply_draft(&mut self, draft: Self::Draft, change: &Change) {
        *self = Self::from_draft(self.sequence, draft, change);
    }
}

impl Sequenced for PrisonerInvolvement {
    type Draft = PrisonerInvolvementDraft;

    fn sequence(&self) -> u32 {
        self.sequence
    }

    fn from_draft(sequence: u32, draft: Self::Draft, _change: &Change) -> Self {
        Self {
            sequence,
            prisoner_number: draft.prisoner_number,
            first_name: draft.first_name,
            last_name: draft.last_name,
            prisoner_role: draft.prisoner_role,
            outcome: draft.outcome,
            comment: draft.comment,
        }
    }

    fn apply_draft(&mut self, draft: Self::Draft, change: &Change) {
        *self = Self::from_draft(self.sequence, draft, change);
    }
}

impl Sequenced for CorrectionRequest {
    type Draft = CorrectionRequestDraft;

    fn sequence(&self) -> u32 {
        self.sequence
    }

    fn from_draft(sequence: u32, draft: Self::Draft, change: &Change) -> Self {
        Self {
            sequence,
            description_of_change: draft.description_of_change,
            correction_requested_by: change.by.clone(),
            correction_requested_at: change.at,
            location: draft.location,
        }
    }

    fn apply_draft(&mut self, draft: Self::Draft, change: &Change) {
        *self = Self::from_draft(self.sequence, draft, change);
    }
}

impl Sequenced for DescriptionAddendum {
    type Draft = DescriptionAddendumDraft;

    fn sequence(&self) -> u32 {
        self.sequence
    }

    fn from_draft(sequence: u32, draft: Self::Draft, change: &Change) -> Self {
        Self {
            sequence,
            created_by: change.by.clone(),
            first_name: draft.first_name,
            last_name: draft.last_name,
            created_at: change.at,
            text: draft.text,
        }
    }

    fn apply_draft(&mut self, draft: Self::Draft, change: &Change) {
        *self = Self::from_draft(self.sequence, draft, change);
    }
}

/// Sequence a new record in `collection` would receive.
///
/// # Errors
/// Returns [`SequenceExhausted`] when the last sequence is already `u32::MAX`.
pub fn next_sequence<T: Sequenced>(collection: &[T]) -> Result<u32, SequenceExhausted> {
    match collection.iter().map(Sequenced::sequence).max() {
        None => Ok(0),
        Some(last) => {
            last.checked_add(1).ok_or(SequenceExhausted { collection: T::COLLECTION, last })
        }
    }
}

/// Append a record built from `draft` and return it.
///
/// # Errors
/// Returns [`SequenceExhausted`] when no sequence follows the collection's last one.
pub fn add_related<'a, T: Sequenced>(
    collection: &'a mut Vec<T>,
    draft: T::Draft,
    change: &Change,
) -> Result<&'a T, SequenceExhausted> {
    let sequence = next_sequence(collection)?;
    let index = collection.len();
    collection.push(T::from_draft(sequence, draft, change));
    Ok(&collection[index])
}

/// Replace the fields of the record at 1-based `index`, keeping its sequence.
///
/// # Errors
/// Returns [`IndexOutOfRange`] when `index` is 0 or past the end of the collection.
pub fn update_related<'a, T: Sequenced>(
    collection: &'a mut [T],
    index: usize,
    draft: T::Draft,
    change: &Change,
) -> Result<&'a T, IndexOutOfRange> {
    let position = position::<T>(collection.len(), index)?;
    let record = &mut collection[position];
    record.apply_draft(draft, change);
    Ok(&*record)
}

/// Remove and return the record at 1-based `index`.
///
/// # Errors
/// Returns [`IndexOutOfRange`] when `index` is 0 or past the end of the collection.
pub fn remove_related<T: Sequenced>(
    collection: &mut Vec<T>,
    index: usize,
) -> Result<T, IndexOutOfRange> {
    let position = position::<T>(collection.len(), index)?;
    Ok(collection.remove(position))
}

fn position<T: Keyed>(size: usize, index: usize) -> Result<usize, IndexOutOfRange> {
    if index == 0 || index > size {
        return Err(IndexOutOfRange { collection: T::COLLECTION, index, size });
    }
    Ok(index - 1)
}

/// Fields of a report created directly in the primary source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewReport {
    #[serde(rename = "type")]
    pub report_type: ReportType,
    pub location: String,
    pub title: String,
    pub description: String,
    #[serde(with = "time::serde::rfc3339")]
    pub incident_date_and_time: OffsetDateTime,
    /// Attach to an existing event instead of creating one.
    #[serde(default)]
    pub event_id: Option<EventId>,
}

/// A fresh DRAFT report with its initial status history entry.
#[must_use]
pub fn draft_report(
    request: NewReport,
    reference: String,
    event_id: EventId,
    change: &Change,
) -> Report {
    Report {
        id: ReportId::new(),
        reference,
        event_id,
        report_type: request.report_type,
        status: ReportStatus::Draft,
        location: request.location,
        title: request.title,
        description: request.description,
        incident_date_and_time: request.incident_date_and_time,
        reported_by: change.by.clone(),
        reported_at: change.at,
        created_at: change.at,
        modified_at: change.at,
        modified_by: change.by.clone(),
        source: InformationSource::Primary,
        modified_in: InformationSource::Primary,
        status_history: vec![StatusHistory {
            status: ReportStatus::Draft,
            changed_at: change.at,
            changed_by: change.by.clone(),
        }],
        staff_involved: Vec::new(),
        prisoners_involved: Vec::new(),
        correction_requests: Vec::new(),
        description_addenda: Vec::new(),
        questions: Vec::new(),
        history: Vec::new(),
    }
}

/// A new event describing `report`, sharing its reference.
#[must_use]
pub fn event_for_report(report: &Report) -> Event {
    Event {
        id: report.event_id,
        event_reference: report.reference.clone(),
        event_date_and_time: report.incident_date_and_time,
        location: report.location.clone(),
        title: report.title.clone(),
        description: report.description.clone(),
        created_at: report.created_at,
        modified_at: report.modified_at,
        modified_by: report.modified_by.clone(),
    }
}

#[cfg(test)]
mod tests {
    use time::Duration;

    use super::*;

    fn change() -> Change {
        Change { by: "editor".to_string(), at: OffsetDateTime::UNIX_EPOCH + Duration::days(19_000) }
    }

    fn draft(username: &str) -> StaffInvolvementDraft {
        StaffInvolvementDraft {
            staff_username: username.to_string(),
            first_name: username.to_string(),
            last_name: "Officer".to_string(),
            staff_role: StaffRole::Witness,
            comment: None,
        }
    }

    #[test]
    fn sequences_continue_from_last_and_keep_gaps() -> Result<(), Box<dyn std::error::Error>> {
        let mut staff: Vec<StaffInvolvement> = Vec::new();
        add_related(&mut staff, draft("alice"), &change())?;
        add_related(&mut staff, draft("bob"), &change())?;
        add_related(&mut staff, draft("carl"), &change())?;

        let removed = remove_related(&mut staff, 2)?;
        assert_eq!(removed.staff_username, "bob");

        let added = add_related(&mut staff, draft("dana"), &change())?;
        assert_eq!(added.sequence, 3);
        assert_eq!(staff.iter().map(|s| s.sequence).collect::<Vec<_>>(), vec![0, 2, 3]);
        Ok(())
    }

    #[test]
    fn update_replaces_fields_but_not_sequence() -> Result<(), Box<dyn std::error::Error>> {
        let mut staff: Vec<StaffInvolvement> = Vec::new();
        add_related(&mut staff, draft("alice"), &change())?;
        add_related(&mut staff, draft("bob"), &change())?;

        let mut replacement = draft("robert");
        replacement.comment = Some("renamed".to_string());
        let updated = update_related(&mut staff, 2, replacement, &change())?;

        assert_eq!(updated.sequence, 1);
        assert_eq!(updated.staff_username, "robert");
        assert_eq!(updated.comment.as_deref(), Some("renamed"));
        Ok(())
    }

    #[test]
    fn out_of_range_positions_are_rejected() -> Result<(), SequenceExhausted> {
        let mut staff: Vec<StaffInvolvement> = Vec::new();
        add_related(&mut staff, draft("alice"), &change())?;

        let zero = remove_related(&mut staff, 0);
        assert_eq!(
            zero,
            Err(IndexOutOfRange { collection: "staff_involved", index: 0, size: 1 })
        );
        let past_end = update_related(&mut staff, 2, draft("x"), &change());
        assert!(matches!(past_end, Err(IndexOutOfRange { index: 2, size: 1, .. })));
        assert_eq!(staff.len(), 1);
        Ok(())
    }

    #[test]
    fn adding_after_the_largest_sequence_is_refused() -> Result<(), SequenceExhausted> {
        let mut staff = vec![StaffInvolvement::from_draft(u32::MAX, draft("alice"), &change())];

        let result = add_related(&mut staff, draft("bob"), &change());
        assert_eq!(
            result.map(|member| member.sequence),
            Err(SequenceExhausted { collection: "staff_involved", last: u32::MAX })
        );
        assert_eq!(staff.len(), 1);

        staff[0].sequence = u32::MAX - 1;
        assert_eq!(add_related(&mut staff, draft("bob"), &change())?.sequence, u32::MAX);
        Ok(())
    }

    #[test]
    fn correction_requests_record_who_asked() -> Result<(), SequenceExhausted> {
        let mut corrections: Vec<CorrectionRequest> = Vec::new();
        let added = add_related(
            &mut corrections,
            CorrectionRequestDraft {
                description_of_change: "wrong cell".to_string(),
                location: Some("MDI".to_string()),
            },
            &change(),
        )?;
        assert_eq!(added.sequence, 0);
        assert_eq!(added.correction_requested_by, "editor");
        Ok(())
    }

    #[test]
    fn drafts_start_in_primary_with_one_status_entry() {
        let request = NewReport {
            report_type: ReportType::Find,
            location: "LEI".to_string(),
            title: "Phone found".to_string(),
            description: "Found in cell".to_string(),
            incident_date_and_time: change().at,
            event_id: None,
        };
        let report = draft_report(request, "IR-0000000001".to_string(), EventId::new(), &change());
        let event = event_for_report(&report);

        assert_eq!(report.status, ReportStatus::Draft);
        assert_eq!(report.source, InformationSource::Primary);
        assert_eq!(report.modified_in, InformationSource::Primary);
        assert_eq!(report.status_history.len(), 1);
        assert_eq!(event.id, report.event_id);
        assert_eq!(event.event_reference, report.reference);
    }
}

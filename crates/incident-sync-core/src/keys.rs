//! Natural keys used to match incoming child records against existing ones.
//!
//! Matching never looks at storage identity: two records are "the same" exactly when
//! their keys are equal. `absorb` copies every mutable field from the incoming record
//! and leaves the key untouched.

use std::fmt::Debug;

use time::OffsetDateTime;

use crate::codes::ReportType;
use crate::error::ReconcileError;
use crate::model::{
    CorrectionRequest, DescriptionAddendum, HistoricalQuestion, HistoricalResponse, History,
    PrisonerInvolvement, Question, Response, StaffInvolvement,
};
use crate::reconcile::{apply, ensure_unique_keys, StalePolicy};

pub trait Keyed: Clone + PartialEq {
    type Key: Ord + Clone + Debug;

    /// Collection name used in diagnostics.
    const COLLECTION: &'static str;

    fn key(&self) -> Self::Key;

    fn absorb(&mut self, incoming: Self);

    /// Validate keys of collections nested inside this record.
    ///
    /// # Errors
    /// Returns [`ReconcileError::DuplicateKey`] when a nested collection repeats a key.
    fn check_nested_keys(&self) -> Result<(), ReconcileError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SequenceKey(pub u32);

/// Key for question-like records. Field order makes the derived ordering sequence-first.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CodedKey {
    pub sequence: u32,
    pub code: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HistoryKey {
    pub changed_at: OffsetDateTime,
    pub report_type: ReportType,
}

impl Keyed for StaffInvolvement {
    type Key = SequenceKey;
    const COLLECTION: &'static str = "staff_involved";

    fn key(&self) -> SequenceKey {
        SequenceKey(self.sequence)
    }

    fn absorb(&mut self, incoming: Self) {
        self.staff_username = incoming.staff_username;
        self.first_name = incoming.first_name;
        self.last_name = incoming.last_name;
        self.staff_role = incoming.staff_role;
        self.comment = incoming.comment;
    }
}

impl Keyed for PrisonerInvolvement {
    type Key = SequenceKey;
    const COLLECTION: &'static str = "prisoners_involved";

    fn key(&self) -> SequenceKey {
        SequenceKey(self.sequence)
    }

    fn absorb(&mut self, incoming: Self) {
        self.prisoner_number = incoming.prisoner_number;
        self.first_name = incoming.first_name;
        self.last_name = incoming.last_name;
        self.prisoner_role = incoming.prisoner_role;
        self.outcome = incoming.outcome;
        self.comment = incoming.comment;
    }
}

impl Keyed for CorrectionRequest {
    type Key = SequenceKey;
    const COLLECTION: &'static str = "correction_requests";

    fn key(&self) -> SequenceKey {
        SequenceKey(self.sequence)
    }

    fn absorb(&mut self, incoming: Self) {
        self.description_of_change = incoming.description_of_change;
        self.correction_requested_by = incoming.correction_requested_by;
        self.correction_requested_at = incoming.correction_requested_at;
        self.location = incoming.location;
    }
}

impl Keyed for DescriptionAddendum {
    type Key = SequenceKey;
    const COLLECTION: &'static str = "description_addenda";

    fn key(&self) -> SequenceKey {
        SequenceKey(self.sequence)
    }

    fn absorb(&mut self, incoming: Self) {
        self.created_by = incoming.created_by;
        self.first_name = incoming.first_name;
        self.last_name = incoming.last_name;
        self.created_at = incoming.created_at;
        self.text = incoming.text;
    }
}

impl Keyed for Response {
    type Key = CodedKey;
    const COLLECTION: &'static str = "responses";

    fn key(&self) -> CodedKey {
        CodedKey { sequence: self.sequence, code: self.code.clone() }
    }

    fn absorb(&mut self, incoming: Self) {
        self.response = incoming.response;
        self.response_date = incoming.response_date;
        self.additional_information = incoming.additional_information;
        self.recorded_by = incoming.recorded_by;
        self.recorded_at = incoming.recorded_at;
    }
}

impl Keyed for Question {
    type Key = CodedKey;
    const COLLECTION: &'static str = "questions";

    fn key(&self) -> CodedKey {
        CodedKey { sequence: self.sequence, code: self.code.clone() }
    }

    fn absorb(&mut self, incoming: Self) {
        self.question = incoming.question;
        self.additional_information = incoming.additional_information;
        // Responses are a function of the latest snapshot: omitted ones go.
        apply(&mut self.responses, incoming.responses, StalePolicy::Delete);
    }

    fn check_nested_keys(&self) -> Result<(), ReconcileError> {
        ensure_unique_keys(&self.responses)
    }
}

impl Keyed for HistoricalResponse {
    type Key = CodedKey;
    const COLLECTION: &'static str = "historical_responses";

    fn key(&self) -> CodedKey {
        CodedKey { sequence: self.sequence, code: self.code.clone() }
    }

    // Archived data is immutable.
    fn absorb(&mut self, _incoming: Self) {}
}

impl Keyed for HistoricalQuestion {
    type Key = CodedKey;
    const COLLECTION: &'static str = "historical_questions";

    fn key(&self) -> CodedKey {
        CodedKey { sequence: self.sequence, code: self.code.clone() }
    }

    fn absorb(&mut self, incoming: Self) {
        apply(&mut self.responses, incoming.responses, StalePolicy::Keep);
    }

    fn check_nested_keys(&self) -> Result<(), ReconcileError> {
        ensure_unique_keys(&self.responses)
    }
}

impl Keyed for History {
    type Key = HistoryKey;
    const COLLECTION: &'static str = "history";

    fn key(&self) -> HistoryKey {
        HistoryKey { changed_at: self.changed_at, report_type: self.report_type }
    }

    /// Only appends questions/responses missing from the archived entry.
    fn absorb(&mut self, incoming: Self) {
        apply(&mut self.questions, incoming.questions, StalePolicy::Keep);
    }

    fn check_nested_keys(&self) -> Result<(), ReconcileError> {
        ensure_unique_keys(&self.questions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codes::StaffRole;

    fn staff(sequence: u32, username: &str) -> StaffInvolvement {
        StaffInvolvement {
            sequence,
            staff_username: username.to_string(),
            first_name: "Test".to_string(),
            last_name: "Officer".to_string(),
            staff_role: StaffRole::Witness,
            comment: None,
        }
    }

    #[test]
    fn absorb_overwrites_fields_but_never_the_key() {
        let mut existing = staff(4, "alice");
        let mut incoming = staff(9, "bob");
        incoming.comment = Some("arrived second".to_string());

        existing.absorb(incoming);

        assert_eq!(existing.key(), SequenceKey(4));
        assert_eq!(existing.staff_username, "bob");
        assert_eq!(existing.comment.as_deref(), Some("arrived second"));
    }

    #[test]
    fn coded_keys_order_by_sequence_before_code() {
        let a = CodedKey { sequence: 1, code: "Z".to_string() };
        let b = CodedKey { sequence: 2, code: "A".to_string() };
        assert!(a < b);
    }
}

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

use crate::codes::{
    InformationSource, PrisonerOutcome, PrisonerRole, ReportStatus, ReportType, StaffRole,
};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ReportId(pub Ulid);

impl ReportId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for ReportId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for ReportId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct EventId(pub Ulid);

impl EventId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for EventId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An occurrence that one or more reports describe. Reports point at it by id only.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Event {
    pub id: EventId,
    pub event_reference: String,
    #[serde(with = "time::serde::rfc3339")]
    pub event_date_and_time: OffsetDateTime,
    pub location: String,
    pub title: String,
    pub description: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub modified_at: OffsetDateTime,
    pub modified_by: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct StatusHistory {
    pub status: ReportStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub changed_at: OffsetDateTime,
    pub changed_by: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct StaffInvolvement {
    pub sequence: u32,
    pub staff_username: String,
    pub first_name: String,
    pub last_name: String,
    pub staff_role: StaffRole,
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct PrisonerInvolvement {
    pub sequence: u32,
    pub prisoner_number: String,
    pub first_name: String,
    pub last_name: String,
    pub prisoner_role: PrisonerRole,
    pub outcome: Option<PrisonerOutcome>,
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CorrectionRequest {
    pub sequence: u32,
    pub description_of_change: String,
    pub correction_requested_by: String,
    #[serde(with = "time::serde::rfc3339")]
    pub correction_requested_at: OffsetDateTime,
    pub location: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct DescriptionAddendum {
    pub sequence: u32,
    pub created_by: String,
    pub first_name: String,
    pub last_name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Response {
    pub code: String,
    pub sequence: u32,
    pub response: String,
    #[serde(with = "time::serde::rfc3339::option")]
    pub response_date: Option<OffsetDateTime>,
    pub additional_information: Option<String>,
    pub recorded_by: String,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Question {
    pub code: String,
    pub sequence: u32,
    pub question: String,
    pub additional_information: Option<String>,
    #[serde(default)]
    pub responses: Vec<Response>,
}

/// Archived copy of a [`Response`]; never edited after archiving.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct HistoricalResponse {
    pub code: String,
    pub sequence: u32,
    pub response: String,
    #[serde(with = "time::serde::rfc3339::option")]
    pub response_date: Option<OffsetDateTime>,
    pub additional_information: Option<String>,
    pub recorded_by: String,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
}

/// Archived copy of a [`Question`]; never edited after archiving.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct HistoricalQuestion {
    pub code: String,
    pub sequence: u32,
    pub question: String,
    pub additional_information: Option<String>,
    #[serde(default)]
    pub responses: Vec<HistoricalResponse>,
}

/// Snapshot of the classification-dependent content taken when the type changed.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct History {
    #[serde(rename = "type")]
    pub report_type: ReportType,
    #[serde(with = "time::serde::rfc3339")]
    pub changed_at: OffsetDateTime,
    pub changed_by: String,
    #[serde(default)]
    pub questions: Vec<HistoricalQuestion>,
}

impl From<&Response> for HistoricalResponse {
    fn from(response: &Response) -> Self {
        Self {
            code: response.code.clone(),
            sequence: response.sequence,
            response: response.response.clone(),
            response_date: response.response_date,
            additional_information: response.additional_information.clone(),
            recorded_by: response.recorded_by.clone(),
            recorded_at: response.recorded_at,
        }
    }
}

impl From<&Question> for HistoricalQuestion {
    fn from(question: &Question) -> Self {
        Self {
            code: question.code.clone(),
            sequence: question.sequence,
            question: question.question.clone(),
            additional_information: question.additional_information.clone(),
            responses: question.responses.iter().map(HistoricalResponse::from).collect(),
        }
    }
}

/// The incident report aggregate root and every collection it owns.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Report {
    pub id: ReportId,
    pub reference: String,
    pub event_id: EventId,
    #[serde(rename = "type")]
    pub report_type: ReportType,
    pub status: ReportStatus,
    pub location: String,
    pub title: String,
    pub description: String,
    #[serde(with = "time::serde::rfc3339")]
    pub incident_date_and_time: OffsetDateTime,
    pub reported_by: String,
    #[serde(with = "time::serde::rfc3339")]
    pub reported_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub modified_at: OffsetDateTime,
    pub modified_by: String,
    pub source: InformationSource,
    pub modified_in: InformationSource,
    #[serde(default)]
    pub status_history: Vec<StatusHistory>,
    #[serde(default)]
    pub staff_involved: Vec<StaffInvolvement>,
    #[serde(default)]
    pub prisoners_involved: Vec<PrisonerInvolvement>,
    #[serde(default)]
    pub correction_requests: Vec<CorrectionRequest>,
    #[serde(default)]
    pub description_addenda: Vec<DescriptionAddendum>,
    #[serde(default)]
    pub questions: Vec<Question>,
    #[serde(default)]
    pub history: Vec<History>,
}

/// Scalar-only read view of a [`Report`].
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ReportBasic {
    pub id: ReportId,
    pub reference: String,
    pub event_id: EventId,
    #[serde(rename = "type")]
    pub report_type: ReportType,
    pub status: ReportStatus,
    pub location: String,
    pub title: String,
    #[serde(with = "time::serde::rfc3339")]
    pub incident_date_and_time: OffsetDateTime,
    pub reported_by: String,
    #[serde(with = "time::serde::rfc3339")]
    pub reported_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub modified_at: OffsetDateTime,
    pub modified_by: String,
    pub source: InformationSource,
    pub modified_in: InformationSource,
}

impl Report {
    #[must_use]
    pub fn to_basic(&self) -> ReportBasic {
        ReportBasic {
            id: self.id,
            reference: self.reference.clone(),
            event_id: self.event_id,
            report_type: self.report_type,
            status: self.status,
            location: self.location.clone(),
            title: self.title.clone(),
            incident_date_and_time: self.incident_date_and_time,
            reported_by: self.reported_by.clone(),
            reported_at: self.reported_at,
            modified_at: self.modified_at,
            modified_by: self.modified_by.clone(),
            source: self.source,
            modified_in: self.modified_in,
        }
    }

    /// Record who last wrote the aggregate and through which source.
    pub fn touch(&mut self, source: InformationSource, by: &str, at: OffsetDateTime) {
        self.modified_in = source;
        self.modified_by = by.to_string();
        self.modified_at = at;
    }

    /// Move to `status`, appending to the status history. Returns `false` when unchanged.
    pub fn change_status(&mut self, status: ReportStatus, by: &str, at: OffsetDateTime) -> bool {
        if self.status == status {
            return false;
        }
        self.status = status;
        self.status_history.push(StatusHistory {
            status,
            changed_at: at,
            changed_by: by.to_string(),
        });
        true
    }
}

//! Legacy snapshot shapes and their conversion into domain records.
//!
//! The legacy system speaks camelCase JSON with its own code tables. Every code is mapped
//! through an injected [`CodeMappings`]; an unrecognised code fails the whole snapshot.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};

use crate::codes::{PrisonerOutcome, PrisonerRole, ReportStatus, ReportType, StaffRole};
use crate::error::NormalizeError;
use crate::model::{
    CorrectionRequest, DescriptionAddendum, HistoricalQuestion, History,
    PrisonerInvolvement, Question, Response, StaffInvolvement,
};
use crate::reconcile::ensure_unique_keys;

/// Placeholder for text the domain requires but the legacy record left empty.
pub const NO_DETAILS_GIVEN: &str = "NO DETAILS GIVEN";

const ADDENDUM_MARKER: &str = r"User:([^,]+),(.+?)Date:(\d{2}-[A-Za-z]{3}-\d{4} \d{2}:\d{2})";
const ADDENDUM_DATE_FORMAT: &str =
    "[day]-[month repr:short case_sensitive:false]-[year] [hour]:[minute]";

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LegacyCode {
    pub code: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LegacyStaff {
    pub username: String,
    #[serde(default)]
    pub staff_id: Option<i64>,
    pub first_name: String,
    pub last_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LegacyStaffParty {
    pub staff: LegacyStaff,
    pub sequence: u32,
    pub role: LegacyCode,
    #[serde(default)]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LegacyOffender {
    pub offender_no: String,
    pub first_name: String,
    pub last_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LegacyOffenderParty {
    pub offender: LegacyOffender,
    pub sequence: u32,
    pub role: LegacyCode,
    #[serde(default)]
    pub outcome: Option<LegacyCode>,
    #[serde(default)]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LegacyRequirement {
    pub sequence: u32,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_date: OffsetDateTime,
    pub staff: LegacyStaff,
    #[serde(default)]
    pub prison_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LegacyAnswer {
    #[serde(default)]
    pub question_response_id: Option<i64>,
    pub sequence: u32,
    #[serde(default)]
    pub answer: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub response_date: Option<OffsetDateTime>,
    #[serde(default)]
    pub comment: Option<String>,
    pub recording_staff: LegacyStaff,
    #[serde(with = "time::serde::rfc3339")]
    pub created_date_time: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LegacyQuestion {
    pub question_id: i64,
    pub sequence: u32,
    #[serde(default)]
    pub question: Option<String>,
    #[serde(default)]
    pub answers: Vec<LegacyAnswer>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LegacyHistory {
    #[serde(rename = "type")]
    pub report_type: String,
    #[serde(with = "time::serde::rfc3339")]
    pub incident_change_date_time: OffsetDateTime,
    pub incident_change_staff: LegacyStaff,
    #[serde(default)]
    pub questions: Vec<LegacyQuestion>,
}

/// A full legacy incident as pushed by the sync job.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LegacyReport {
    pub incident_id: i64,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub prison: LegacyCode,
    pub status: LegacyCode,
    #[serde(rename = "type")]
    pub report_type: String,
    pub reporting_staff: LegacyStaff,
    #[serde(with = "time::serde::rfc3339")]
    pub reported_date_time: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub incident_date_time: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub create_date_time: OffsetDateTime,
    pub created_by: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_modified_date_time: Option<OffsetDateTime>,
    #[serde(default)]
    pub last_modified_by: Option<String>,
    #[serde(default)]
    pub staff_parties: Vec<LegacyStaffParty>,
    #[serde(default)]
    pub offender_parties: Vec<LegacyOffenderParty>,
    #[serde(default)]
    pub requirements: Vec<LegacyRequirement>,
    #[serde(default)]
    pub questions: Vec<LegacyQuestion>,
    #[serde(default)]
    pub history: Vec<LegacyHistory>,
}

/// Legacy code to domain value tables.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct CodeMappings {
    pub report_types: BTreeMap<String, ReportType>,
    pub statuses: BTreeMap<String, ReportStatus>,
    pub staff_roles: BTreeMap<String, StaffRole>,
    pub prisoner_roles: BTreeMap<String, PrisonerRole>,
    pub prisoner_outcomes: BTreeMap<String, PrisonerOutcome>,
}

fn table<T: Copy>(entries: &[(&str, T)]) -> BTreeMap<String, T> {
    entries.iter().map(|(code, value)| ((*code).to_string(), *value)).collect()
}

impl CodeMappings {
    /// The tables used by the legacy system in production.
    #[must_use]
    pub fn standard() -> Self {
        Self {
            report_types: table(&[
                ("ABSCOND", ReportType::Abscond),
                ("ASSAULTS3", ReportType::Assault),
                ("ATT_ESCAPE", ReportType::AttemptedEscapeFromCustody),
                ("ATT_ESC_E", ReportType::AttemptedEscapeFromEscort),
                ("BOMB", ReportType::BombThreat),
                ("BREACH", ReportType::BreachOfSecurity),
                ("DAMAGE", ReportType::Damage),
                ("DEATH", ReportType::DeathInCustody),
                ("DEATH_NI", ReportType::DeathOther),
                ("DISORDER1", ReportType::Disorder),
                ("DRONE1", ReportType::DroneSighting),
                ("ESCAPE_EST", ReportType::EscapeFromCustody),
                ("ESCAPE_ESC", ReportType::EscapeFromEscort),
                ("FIND0422", ReportType::Find),
                ("FIRE", ReportType::Fire),
                ("FOOD_REF", ReportType::FoodRefusal),
                ("CLOSE_DOWN", ReportType::FullCloseDownSearch),
                ("KEY_LOCKNEW", ReportType::KeyOrLock),
                ("MISC", ReportType::Miscellaneous),
                ("RADIO_COMP", ReportType::RadioCompromise),
                ("REL_ERROR", ReportType::ReleasedInError),
                ("SELF_HARM", ReportType::SelfHarm),
                ("TOOL_LOSS", ReportType::ToolLoss),
                ("TRF3", ReportType::TemporaryReleaseFailure),
            ]),
            statuses: table(&[
                ("AWAN", ReportStatus::AwaitingReview),
                ("INAN", ReportStatus::OnHold),
                ("INREQ", ReportStatus::NeedsUpdating),
                ("INAME", ReportStatus::Updated),
                ("CLOSE", ReportStatus::Closed),
                ("PIU", ReportStatus::PostIncidentUpdate),
                ("IUP", ReportStatus::IncidentUpdated),
                ("DUP", ReportStatus::Duplicate),
            ]),
            staff_roles: table(&[
                ("AI", StaffRole::ActivelyInvolved),
                ("AO", StaffRole::AuthorisingOfficer),
                ("CRH", StaffRole::CrHead),
                ("CRLA", StaffRole::CrLeftArm),
                ("CRL", StaffRole::CrLegs),
                ("CRRA", StaffRole::CrRightArm),
                ("CRS", StaffRole::CrSupervisor),
                ("DEC", StaffRole::Deceased),
                ("FOS", StaffRole::FirstOnScene),
                ("HEALTH", StaffRole::Healthcare),
                ("HOST", StaffRole::Hostage),
                ("INPOS", StaffRole::InPossession),
                ("NEG", StaffRole::Negotiator),
                ("PAS", StaffRole::PresentAtScene),
                ("SUSIN", StaffRole::SuspectedInvolvement),
                ("VICT", StaffRole::Victim),
                ("WIT", StaffRole::Witness),
            ]),
            prisoner_roles: table(&[
                ("ABS", PrisonerRole::Absconder),
                ("ACTINV", PrisonerRole::ActiveInvolvement),
                ("ASSIAL", PrisonerRole::Assailant),
                ("ASSIST", PrisonerRole::AssistedStaff),
                ("DEC", PrisonerRole::Deceased),
                ("ESC", PrisonerRole::Escapee),
                ("FIGHT", PrisonerRole::Fighter),
                ("HOST", PrisonerRole::Hostage),
                ("IMPED", PrisonerRole::ImpededStaff),
                ("INPOSS", PrisonerRole::InPossession),
                ("INREC", PrisonerRole::IntendedRecipient),
                ("LICFAIL", PrisonerRole::LicenseFailure),
                ("PERP", PrisonerRole::Perpetrator),
                ("PRESENT", PrisonerRole::PresentAtScene),
                ("SUSASS", PrisonerRole::SuspectedAssailant),
                ("SUSINV", PrisonerRole::SuspectedInvolved),
                ("TRF", PrisonerRole::TemporaryReleaseFailure),
                ("VICT", PrisonerRole::Victim),
            ]),
            prisoner_outcomes: table(&[
                ("ACCT", PrisonerOutcome::Acct),
                ("CBP", PrisonerOutcome::ChargedByPolice),
                ("CON", PrisonerOutcome::Convicted),
                ("CORIN", PrisonerOutcome::CoronerInformed),
                ("DEA", PrisonerOutcome::Death),
                ("FCHRG", PrisonerOutcome::FurtherCharges),
                ("ILOC", PrisonerOutcome::LocalInvestigation),
                ("NKI", PrisonerOutcome::NextOfKinInformed),
                ("POR", PrisonerOutcome::PlacedOnReport),
                ("IPOL", PrisonerOutcome::PoliceInvestigation),
                ("RC", PrisonerOutcome::Remand),
                ("DUTY", PrisonerOutcome::SeenDutyGovernor),
                ("HELTH", PrisonerOutcome::SeenHealthcare),
                ("IMB", PrisonerOutcome::SeenImb),
                ("OUTH", PrisonerOutcome::SeenOutsideHospital),
                ("TRN", PrisonerOutcome::Transfer),
                ("TRIAL", PrisonerOutcome::Trial),
            ]),
        }
    }

    /// # Errors
    /// Returns [`NormalizeError::UnknownCode`] when `code` is not in the table.
    pub fn report_type(&self, code: &str) -> Result<ReportType, NormalizeError> {
        lookup(&self.report_types, "report type", code)
    }

    /// # Errors
    /// Returns [`NormalizeError::UnknownCode`] when `code` is not in the table.
    pub fn status(&self, code: &str) -> Result<ReportStatus, NormalizeError> {
        lookup(&self.statuses, "status", code)
    }

    /// # Errors
    /// Returns [`NormalizeError::UnknownCode`] when `code` is not in the table.
    pub fn staff_role(&self, code: &str) -> Result<StaffRole, NormalizeError> {
        lookup(&self.staff_roles, "staff role", code)
    }

    /// # Errors
    /// Returns [`NormalizeError::UnknownCode`] when `code` is not in the table.
    pub fn prisoner_role(&self, code: &str) -> Result<PrisonerRole, NormalizeError> {
        lookup(&self.prisoner_roles, "prisoner role", code)
    }

    /// # Errors
    /// Returns [`NormalizeError::UnknownCode`] when `code` is not in the table.
    pub fn prisoner_outcome(&self, code: &str) -> Result<PrisonerOutcome, NormalizeError> {
        lookup(&self.prisoner_outcomes, "prisoner outcome", code)
    }
}

fn lookup<T: Copy>(
    table: &BTreeMap<String, T>,
    name: &'static str,
    code: &str,
) -> Result<T, NormalizeError> {
    table
        .get(code)
        .copied()
        .ok_or_else(|| NormalizeError::UnknownCode { table: name, code: code.to_string() })
}

/// Domain view of a legacy snapshot, ready to be reconciled into a report.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct NormalizedReport {
    pub reference: String,
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
    pub created_by: String,
    #[serde(with = "time::serde::rfc3339")]
    pub modified_at: OffsetDateTime,
    pub modified_by: String,
    pub staff_involved: Vec<StaffInvolvement>,
    pub prisoners_involved: Vec<PrisonerInvolvement>,
    pub correction_requests: Vec<CorrectionRequest>,
    pub description_addenda: Vec<DescriptionAddendum>,
    pub questions: Vec<Question>,
    pub history: Vec<History>,
}

/// Convert a legacy snapshot into domain records.
///
/// # Errors
/// Fails on the first unrecognised code, on a malformed description addendum marker and
/// when any collection (at any depth) repeats a natural key.
pub fn normalize(
    legacy: &LegacyReport,
    mappings: &CodeMappings,
) -> Result<NormalizedReport, NormalizeError> {
    let (description, description_addenda) =
        split_description(legacy.description.as_deref().unwrap_or_default())?;

    let staff_involved = legacy
        .staff_parties
        .iter()
        .map(|party| {
            Ok(StaffInvolvement {
                sequence: party.sequence,
                staff_username: party.staff.username.clone(),
                first_name: party.staff.first_name.clone(),
                last_name: party.staff.last_name.clone(),
                staff_role: mappings.staff_role(&party.role.code)?,
                comment: party.comment.clone(),
            })
        })
        .collect::<Result<Vec<_>, NormalizeError>>()?;

    let prisoners_involved = legacy
        .offender_parties
        .iter()
        .map(|party| {
            Ok(PrisonerInvolvement {
                sequence: party.sequence,
                prisoner_number: party.offender.offender_no.clone(),
                first_name: party.offender.first_name.clone(),
                last_name: party.offender.last_name.clone(),
                prisoner_role: mappings.prisoner_role(&party.role.code)?,
                outcome: party
                    .outcome
                    .as_ref()
                    .map(|outcome| mappings.prisoner_outcome(&outcome.code))
                    .transpose()?,
                comment: party.comment.clone(),
            })
        })
        .collect::<Result<Vec<_>, NormalizeError>>()?;

    let correction_requests = legacy
        .requirements
        .iter()
        .map(|requirement| CorrectionRequest {
            sequence: requirement.sequence,
            description_of_change: or_sentinel(requirement.comment.as_deref()),
            correction_requested_by: requirement.staff.username.clone(),
            correction_requested_at: requirement.recorded_date,
            location: requirement.prison_id.clone(),
        })
        .collect::<Vec<_>>();

    let questions = legacy.questions.iter().map(question).collect::<Vec<_>>();

    let history = legacy
        .history
        .iter()
        .map(|entry| {
            Ok(History {
                report_type: mappings.report_type(&entry.report_type)?,
                changed_at: entry.incident_change_date_time,
                changed_by: entry.incident_change_staff.username.clone(),
                questions: entry
                    .questions
                    .iter()
                    .map(|legacy_question| HistoricalQuestion::from(&question(legacy_question)))
                    .collect(),
            })
        })
        .collect::<Result<Vec<_>, NormalizeError>>()?;

    ensure_unique_keys(&staff_involved)?;
    ensure_unique_keys(&prisoners_involved)?;
    ensure_unique_keys(&correction_requests)?;
    ensure_unique_keys(&description_addenda)?;
    ensure_unique_keys(&questions)?;
    ensure_unique_keys(&history)?;

    Ok(NormalizedReport {
        reference: legacy.incident_id.to_string(),
        report_type: mappings.report_type(&legacy.report_type)?,
        status: mappings.status(&legacy.status.code)?,
        location: legacy.prison.code.clone(),
        title: or_sentinel(legacy.title.as_deref()),
        description,
        incident_date_and_time: legacy.incident_date_time,
        reported_by: legacy.reporting_staff.username.clone(),
        reported_at: legacy.reported_date_time,
        created_at: legacy.create_date_time,
        created_by: legacy.created_by.clone(),
        modified_at: legacy.last_modified_date_time.unwrap_or(legacy.create_date_time),
        modified_by: legacy.last_modified_by.clone().unwrap_or_else(|| legacy.created_by.clone()),
        staff_involved,
        prisoners_involved,
        correction_requests,
        description_addenda,
        questions,
        history,
    })
}

fn or_sentinel(value: Option<&str>) -> String {
    match value.map(str::trim) {
        Some(text) if !text.is_empty() => text.to_string(),
        _ => NO_DETAILS_GIVEN.to_string(),
    }
}

fn question(legacy: &LegacyQuestion) -> Question {
    Question {
        code: legacy.question_id.to_string(),
        sequence: legacy.sequence,
        question: or_sentinel(legacy.question.as_deref()),
        additional_information: None,
        responses: legacy.answers.iter().map(response).collect(),
    }
}

fn response(legacy: &LegacyAnswer) -> Response {
    // Answers without a legacy id are identified by their position.
    let code = legacy
        .question_response_id
        .map_or_else(|| legacy.sequence.to_string(), |id| id.to_string());
    Response {
        code,
        sequence: legacy.sequence,
        response: or_sentinel(legacy.answer.as_deref()),
        response_date: legacy.response_date,
        additional_information: legacy.comment.clone(),
        recorded_by: legacy.recording_staff.username.clone(),
        recorded_at: legacy.created_date_time,
    }
}

/// Split a legacy description into its base text and the addenda appended after it.
///
/// Each addendum starts with a `User:<LAST>,<FIRST>Date:<DD-MON-YYYY HH:MM>` marker and
/// runs up to the next marker.
///
/// # Errors
/// Returns [`NormalizeError::InvalidField`] when a marker carries an unparseable date.
pub fn split_description(
    text: &str,
) -> Result<(String, Vec<DescriptionAddendum>), NormalizeError> {
    let marker = regex_lite::Regex::new(ADDENDUM_MARKER).map_err(|err| {
        NormalizeError::InvalidField { field: "description", reason: err.to_string() }
    })?;
    let date_format = format_description::parse(ADDENDUM_DATE_FORMAT).map_err(|err| {
        NormalizeError::InvalidField { field: "description", reason: err.to_string() }
    })?;

    let captures = marker.captures_iter(text).collect::<Vec<_>>();
    let Some(first) = captures.first().and_then(|caps| caps.get(0)) else {
        return Ok((or_sentinel(Some(text)), Vec::new()));
    };
    let base = or_sentinel(Some(&text[..first.start()]));

    let mut addenda = Vec::with_capacity(captures.len());
    for (index, caps) in captures.iter().enumerate() {
        let (Some(whole), Some(last), Some(first_name), Some(date)) =
            (caps.get(0), caps.get(1), caps.get(2), caps.get(3))
        else {
            continue;
        };
        let end = captures
            .get(index + 1)
            .and_then(|next| next.get(0))
            .map_or(text.len(), |next| next.start());
        let sequence = u32::try_from(index).map_err(|err| NormalizeError::InvalidField {
            field: "description",
            reason: err.to_string(),
        })?;
        let last_name = last.as_str().trim().to_string();
        let first_name = first_name.as_str().trim().to_string();
        addenda.push(DescriptionAddendum {
            sequence,
            created_by: format!("{last_name},{first_name}"),
            first_name,
            last_name,
            created_at: PrimitiveDateTime::parse(date.as_str(), date_format.as_slice())
                .map(PrimitiveDateTime::assume_utc)
                .map_err(|err| NormalizeError::InvalidField {
                    field: "description",
                    reason: format!("addendum date {:?}: {err}", date.as_str()),
                })?,
            text: or_sentinel(Some(&text[whole.end()..end])),
        });
    }
    Ok((base, addenda))
}

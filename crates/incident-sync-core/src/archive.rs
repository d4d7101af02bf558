use time::OffsetDateTime;

use crate::codes::ReportType;
use crate::model::{HistoricalQuestion, History, Report};
use crate::reconcile::{apply, StalePolicy};

/// Switch `report` to `new_type`, archiving the outgoing type's questions first.
///
/// The history entry is keyed by the *outgoing* type. Prisoner involvement is cleared
/// because roles are type specific, staff involvement is kept and status is left alone.
/// Returns `false` without touching the report when the type is unchanged.
pub fn archive_type_change(
    report: &mut Report,
    new_type: ReportType,
    changed_at: OffsetDateTime,
    changed_by: &str,
) -> bool {
    if report.report_type == new_type {
        return false;
    }

    let entry = History {
        report_type: report.report_type,
        changed_at,
        changed_by: changed_by.to_string(),
        questions: report.questions.iter().map(HistoricalQuestion::from).collect(),
    };
    apply(&mut report.history, vec![entry], StalePolicy::Keep);

    report.questions.clear();
    report.prisoners_involved.clear();
    report.report_type = new_type;
    true
}

#[cfg(test)]
mod tests {
    use time::Duration;

    use super::*;
    use crate::codes::{InformationSource, PrisonerRole, ReportStatus, StaffRole};
    use crate::model::{
        EventId, PrisonerInvolvement, Question, ReportId, Response, StaffInvolvement,
    };

    fn at(offset: i64) -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_700_000_000 + offset)
    }

    fn question(code: &str, sequence: u32) -> Question {
        Question {
            code: code.to_string(),
            sequence,
            question: format!("Was there {code}?"),
            additional_information: None,
            responses: vec![Response {
                code: format!("{code}-A"),
                sequence: 0,
                response: "yes".to_string(),
                response_date: Some(at(5)),
                additional_information: Some("detail".to_string()),
                recorded_by: "officer".to_string(),
                recorded_at: at(5),
            }],
        }
    }

    fn damage_report() -> Report {
        Report {
            id: ReportId::new(),
            reference: "1000".to_string(),
            event_id: EventId::new(),
            report_type: ReportType::Damage,
            status: ReportStatus::AwaitingReview,
            location: "MDI".to_string(),
            title: "Broken window".to_string(),
            description: "A window was broken".to_string(),
            incident_date_and_time: at(0),
            reported_by: "officer".to_string(),
            reported_at: at(1),
            created_at: at(1),
            modified_at: at(1),
            modified_by: "officer".to_string(),
            source: InformationSource::Legacy,
            modified_in: InformationSource::Legacy,
            status_history: Vec::new(),
            staff_involved: vec![StaffInvolvement {
                sequence: 0,
                staff_username: "alice".to_string(),
                first_name: "Alice".to_string(),
                last_name: "Smith".to_string(),
                staff_role: StaffRole::Witness,
                comment: None,
            }],
            prisoners_involved: vec![PrisonerInvolvement {
                sequence: 0,
                prisoner_number: "A1234AA".to_string(),
                first_name: "John".to_string(),
                last_name: "Doe".to_string(),
                prisoner_role: PrisonerRole::Perpetrator,
                outcome: None,
                comment: None,
            }],
            correction_requests: Vec::new(),
            description_addenda: Vec::new(),
            questions: vec![question("Q1", 0), question("Q2", 1)],
            history: Vec::new(),
        }
    }

    #[test]
    fn type_change_archives_outgoing_questions() {
        let mut report = damage_report();
        let original_questions = report.questions.clone();

        assert!(archive_type_change(&mut report, ReportType::Assault, at(60), "sync"));

        assert_eq!(report.report_type, ReportType::Assault);
        assert!(report.questions.is_empty());
        assert!(report.prisoners_involved.is_empty());
        assert_eq!(report.staff_involved.len(), 1);
        assert_eq!(report.status, ReportStatus::AwaitingReview);

        assert_eq!(report.history.len(), 1);
        let entry = &report.history[0];
        assert_eq!(entry.report_type, ReportType::Damage);
        assert_eq!(entry.changed_at, at(60));
        assert_eq!(entry.questions.len(), 2);
        let expected = original_questions.iter().map(HistoricalQuestion::from).collect::<Vec<_>>();
        assert_eq!(entry.questions, expected);
        assert_eq!(entry.questions[0].responses[0].response, "yes");
    }

    #[test]
    fn unchanged_type_creates_no_history() {
        let mut report = damage_report();
        let before = report.clone();

        assert!(!archive_type_change(&mut report, ReportType::Damage, at(60), "sync"));
        assert_eq!(report, before);
    }

    #[test]
    fn successive_changes_accumulate_history_entries() {
        let mut report = damage_report();
        assert!(archive_type_change(&mut report, ReportType::Assault, at(60), "sync"));
        report.questions.push(question("AQ1", 0));
        assert!(archive_type_change(&mut report, ReportType::Find, at(120), "sync"));

        assert_eq!(report.history.len(), 2);
        assert_eq!(report.history[0].report_type, ReportType::Damage);
        assert_eq!(report.history[1].report_type, ReportType::Assault);
        assert_eq!(report.history[1].questions[0].code, "AQ1");
    }
}

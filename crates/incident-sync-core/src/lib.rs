//! Domain model and reconciliation rules for incident reports shared between the legacy
//! system of record and the primary service.
//!
//! Everything here is pure: no I/O, no clocks. Callers pass timestamps and code tables in.

pub mod archive;
pub mod codes;
pub mod error;
pub mod keys;
pub mod model;
pub mod normalize;
pub mod provenance;
pub mod reconcile;
pub mod related;
pub mod sync;

pub use archive::archive_type_change;
pub use codes::{
    InformationSource, PrisonerOutcome, PrisonerRole, ReportStatus, ReportType, StaffRole,
};
pub use error::{
    IndexOutOfRange, NormalizeError, ProvenanceConflict, ReconcileError, SequenceExhausted,
};
pub use keys::{CodedKey, HistoryKey, Keyed, SequenceKey};
pub use model::{
    CorrectionRequest, DescriptionAddendum, Event, EventId, HistoricalQuestion,
    HistoricalResponse, History, PrisonerInvolvement, Question, Report, ReportBasic, ReportId,
    Response, StaffInvolvement, StatusHistory,
};
pub use normalize::{normalize, CodeMappings, LegacyReport, NormalizedReport, NO_DETAILS_GIVEN};
pub use provenance::ensure_legacy_may_update;
pub use reconcile::{ensure_unique_keys, reconcile, ReconcileSummary, StalePolicy};
pub use related::{
    add_related, draft_report, event_for_report, next_sequence, remove_related, update_related,
    Change, CorrectionRequestDraft, DescriptionAddendumDraft, NewReport,
    PrisonerInvolvementDraft, Sequenced, StaffInvolvementDraft,
};
pub use sync::{create_from_snapshot, merge_event, merge_snapshot, SnapshotSummary};

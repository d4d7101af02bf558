use crate::codes::InformationSource;
use crate::error::ProvenanceConflict;
use crate::model::Report;

/// A legacy snapshot may only be applied while the legacy source was the last writer.
///
/// # Errors
/// Returns [`ProvenanceConflict`] when the report was last modified by any other source.
pub fn ensure_legacy_may_update(report: &Report) -> Result<(), ProvenanceConflict> {
    if report.modified_in == InformationSource::Legacy {
        Ok(())
    } else {
        Err(ProvenanceConflict { report_id: report.id, modified_in: report.modified_in })
    }
}

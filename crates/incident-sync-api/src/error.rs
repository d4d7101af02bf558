use incident_sync_core::{
    IndexOutOfRange, NormalizeError, ProvenanceConflict, ReconcileError, ReportId,
    SequenceExhausted,
};

/// Every failure an API operation can surface, grouped by how a caller should react.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("{entity} {id} was not found")]
    NotFound { entity: &'static str, id: String },
    #[error("report reference {reference} already exists")]
    AlreadyExists { reference: String },
    #[error(transparent)]
    ProvenanceConflict(#[from] ProvenanceConflict),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    IndexOutOfRange(#[from] IndexOutOfRange),
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

impl SyncError {
    /// Stable machine-readable name of the error class.
    #[must_use]
    pub fn category(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::AlreadyExists { .. } => "already_exists",
            Self::ProvenanceConflict(_) => "provenance_conflict",
            Self::InvalidRequest(_) => "invalid_request",
            Self::IndexOutOfRange(_) => "index_out_of_range",
            Self::Unexpected(_) => "unexpected",
        }
    }

    pub(crate) fn report_not_found(id: ReportId) -> Self {
        Self::NotFound { entity: "report", id: id.to_string() }
    }
}

impl From<NormalizeError> for SyncError {
    fn from(err: NormalizeError) -> Self {
        Self::InvalidRequest(err.to_string())
    }
}

impl From<ReconcileError> for SyncError {
    fn from(err: ReconcileError) -> Self {
        Self::InvalidRequest(err.to_string())
    }
}

impl From<SequenceExhausted> for SyncError {
    fn from(err: SequenceExhausted) -> Self {
        Self::InvalidRequest(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use incident_sync_core::InformationSource;

    use super::*;

    #[test]
    fn categories_are_stable() {
        let conflict = SyncError::from(ProvenanceConflict {
            report_id: ReportId::new(),
            modified_in: InformationSource::Primary,
        });
        assert_eq!(conflict.category(), "provenance_conflict");
        assert_eq!(SyncError::report_not_found(ReportId::new()).category(), "not_found");
        assert_eq!(
            SyncError::from(ReconcileError::DuplicateKey {
                collection: "staff_involved",
                key: "SequenceKey(0)".to_string(),
            })
            .category(),
            "invalid_request"
        );
        assert_eq!(
            SyncError::from(SequenceExhausted { collection: "staff_involved", last: u32::MAX })
                .category(),
            "invalid_request"
        );
        assert_eq!(SyncError::from(anyhow::anyhow!("disk full")).category(), "unexpected");
    }
}

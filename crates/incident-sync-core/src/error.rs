use crate::codes::InformationSource;
use crate::model::ReportId;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ReconcileError {
    #[error("duplicate natural key {key} in {collection}")]
    DuplicateKey { collection: &'static str, key: String },
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum NormalizeError {
    #[error("unrecognised legacy {table} code: {code}")]
    UnknownCode { table: &'static str, code: String },
    #[error("invalid legacy field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
    #[error(transparent)]
    Key(#[from] ReconcileError),
}

/// A legacy-sourced write was attempted on a report last modified elsewhere.
#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
#[error("report {report_id} was last modified in {modified_in}; refusing legacy update")]
pub struct ProvenanceConflict {
    pub report_id: ReportId,
    pub modified_in: InformationSource,
}

/// A related object was addressed by a 1-based position past the end of its collection.
#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
#[error("{collection} index {index} is out of range (size {size})")]
pub struct IndexOutOfRange {
    pub collection: &'static str,
    pub index: usize,
    pub size: usize,
}

/// A collection's last sequence number leaves no room for another record.
#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
#[error("{collection} has no sequence left after {last}")]
pub struct SequenceExhausted {
    pub collection: &'static str,
    pub last: u32,
}

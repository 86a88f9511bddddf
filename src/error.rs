//! Error types for the subsetting engine.

use thiserror::Error;

/// Numeric wire codes carried by exception records.
pub mod codes {
    pub const ERROR: i32 = -1;
    pub const TIMEOUT: i32 = -2;
    pub const RESOURCE_DOES_NOT_EXIST: i32 = -3;
    pub const EMPTY_SUBSET: i32 = -4;
    pub const PARSE_ERROR: i32 = -5;
    pub const INVALID_PARAMETER: i32 = -6;
    pub const DATA_INVARIANT: i32 = -7;
    pub const POST_FAILURE: i32 = -8;
}

/// Severity levels carried by exception records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Debug = 0,
    Info = 1,
    Warning = 2,
    Error = 3,
    Critical = 4,
}

/// Errors raised by the storage-facing array interface.
#[derive(Error, Debug, Clone)]
pub enum StorageError {
    #[error("dataset not found: {0}")]
    NotFound(String),

    #[error("read failed for {dataset}: {reason}")]
    ReadFailed { dataset: String, reason: String },

    #[error("requested column {column} out of {num_cols} in {dataset}")]
    BadColumn {
        dataset: String,
        column: usize,
        num_cols: usize,
    },
}

/// Errors raised by the per-beam subsetting pipeline.
///
/// Beam-scope errors abort that beam only; they surface as one exception
/// record in the output stream and the worker exits cleanly.
#[derive(Error, Debug)]
pub enum SubsetError {
    #[error("read of {dataset} timed out after {timeout_ms} ms")]
    Timeout { dataset: String, timeout_ms: u64 },

    #[error("resource does not exist: {0}")]
    ResourceDoesNotExist(String),

    #[error("empty spatial region")]
    EmptySubset,

    #[error("unable to parse {field} from resource {resource}: {text}")]
    Parse {
        resource: String,
        field: &'static str,
        text: String,
    },

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("data invariant violated: {0}")]
    DataInvariant(String),

    #[error("failed to post record: {0}")]
    PostFailure(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl SubsetError {
    /// Wire code stamped into the exception record.
    pub fn code(&self) -> i32 {
        match self {
            SubsetError::Timeout { .. } => codes::TIMEOUT,
            SubsetError::ResourceDoesNotExist(_) => codes::RESOURCE_DOES_NOT_EXIST,
            SubsetError::EmptySubset => codes::EMPTY_SUBSET,
            SubsetError::Parse { .. } => codes::PARSE_ERROR,
            SubsetError::InvalidParameter(_) => codes::INVALID_PARAMETER,
            SubsetError::DataInvariant(_) => codes::DATA_INVARIANT,
            SubsetError::PostFailure(_) => codes::POST_FAILURE,
            SubsetError::Storage(StorageError::NotFound(_)) => codes::RESOURCE_DOES_NOT_EXIST,
            SubsetError::Storage(_) => codes::ERROR,
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            SubsetError::EmptySubset => Severity::Debug,
            SubsetError::Timeout { .. } => Severity::Error,
            SubsetError::PostFailure(_) => Severity::Error,
            _ => Severity::Critical,
        }
    }
}

pub type Result<T> = std::result::Result<T, SubsetError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        assert_eq!(SubsetError::EmptySubset.code(), codes::EMPTY_SUBSET);
        assert_eq!(
            SubsetError::Timeout {
                dataset: "x".into(),
                timeout_ms: 10
            }
            .code(),
            codes::TIMEOUT
        );
        assert_eq!(
            SubsetError::Storage(StorageError::NotFound("d".into())).code(),
            codes::RESOURCE_DOES_NOT_EXIST
        );
    }

    #[test]
    fn test_severity() {
        assert_eq!(SubsetError::EmptySubset.severity(), Severity::Debug);
        assert_eq!(
            SubsetError::DataInvariant("bad".into()).severity(),
            Severity::Critical
        );
    }
}
